//! Map bridge: general VM tables and host [`Dictionary`]s.

use variant_bridge_core::{Dictionary, print_error};
use variant_bridge_vm::{Thread, VmType};

use crate::error::BridgeResult;
use crate::stack::{StackGuard, expect_index, reserve};
use crate::variant::{push_host_value, to_host_value};

/// Convert every key/value pair of the table at `idx`.
#[cfg_attr(feature = "profiling", profiling::function)]
pub fn to_map(thread: &Thread, idx: i32) -> Dictionary {
    let mut out = Dictionary::new();
    if !expect_index(thread, idx, "to_map") || thread.type_of(idx) != VmType::Table {
        return out;
    }
    if reserve(thread, 2).is_err() {
        print_error("to_map: stack overflow");
        return out;
    }
    let idx = thread.abs_index(idx);
    let _guard = StackGuard::new(thread);
    thread.push_nil();
    loop {
        match thread.next(idx) {
            Ok(true) => {}
            Ok(false) => return out,
            Err(e) => {
                print_error(format!("to_map: {}", e));
                return out;
            }
        }
        let key = to_host_value(thread, -2);
        let value = to_host_value(thread, -1);
        out.insert(key, value);
        thread.pop(1);
    }
}

/// Push `map` as a new table, setting every entry raw.
#[cfg_attr(feature = "profiling", profiling::function)]
pub fn push_map(thread: &Thread, map: &Dictionary) -> BridgeResult<()> {
    reserve(thread, 3)?;
    let guard = StackGuard::new(thread);
    thread.create_table(0, map.len());
    for (key, value) in map.iter() {
        push_host_value(thread, key)?;
        push_host_value(thread, value)?;
        thread.raw_set(-3)?;
    }
    guard.commit();
    Ok(())
}

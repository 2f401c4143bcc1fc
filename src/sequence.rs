//! Sequence bridge: VM tables with keys `1..=n` and host [`Array`]s.

use variant_bridge_core::{Array, print_error};
use variant_bridge_vm::{Thread, Value, VmType};

use crate::error::BridgeResult;
use crate::stack::{StackGuard, expect_index, reserve};
use crate::variant::{push_host_value, to_host_value};

/// Whether key number `expected` of a native-order walk keeps the table a
/// sequence: keys must be integral numbers counting up from 1.
fn is_sequence_key(key: &Value, expected: u64) -> bool {
    match key {
        Value::Number(n) => n.round() == *n && *n == expected as f64,
        _ => false,
    }
}

/// Whether the table at `idx` has exactly the keys `1..=n` in native order.
///
/// Empty tables count as sequences.
#[cfg_attr(feature = "profiling", profiling::function)]
pub fn is_sequence(thread: &Thread, idx: i32) -> bool {
    if !expect_index(thread, idx, "is_sequence") || thread.type_of(idx) != VmType::Table {
        return false;
    }
    if reserve(thread, 2).is_err() {
        print_error("is_sequence: stack overflow");
        return false;
    }
    let idx = thread.abs_index(idx);
    let _guard = StackGuard::new(thread);
    let mut expected = 1;
    thread.push_nil();
    loop {
        match thread.next(idx) {
            Ok(true) => {}
            Ok(false) => return true,
            Err(e) => {
                print_error(format!("is_sequence: {}", e));
                return false;
            }
        }
        if !is_sequence_key(&thread.value_at(-2), expected) {
            return false;
        }
        expected += 1;
        thread.pop(1);
    }
}

/// Convert the table at `idx` to an [`Array`].
///
/// Returns the elements gathered so far and `false` as soon as a key breaks
/// the sequence shape. Elements convert through [`to_host_value`].
#[cfg_attr(feature = "profiling", profiling::function)]
pub fn to_sequence(thread: &Thread, idx: i32) -> (Array, bool) {
    let mut out = Array::new();
    if !expect_index(thread, idx, "to_sequence") {
        return (out, false);
    }
    if thread.type_of(idx) != VmType::Table {
        return (out, false);
    }
    if reserve(thread, 2).is_err() {
        print_error("to_sequence: stack overflow");
        return (out, false);
    }
    let idx = thread.abs_index(idx);
    let _guard = StackGuard::new(thread);
    let mut expected = 1;
    thread.push_nil();
    loop {
        match thread.next(idx) {
            Ok(true) => {}
            Ok(false) => return (out, true),
            Err(e) => {
                print_error(format!("to_sequence: {}", e));
                return (out, false);
            }
        }
        if !is_sequence_key(&thread.value_at(-2), expected) {
            return (out, false);
        }
        out.push(to_host_value(thread, -1));
        expected += 1;
        thread.pop(1);
    }
}

/// Push `array` as a new table with keys `1..=len`.
#[cfg_attr(feature = "profiling", profiling::function)]
pub fn push_sequence(thread: &Thread, array: &Array) -> BridgeResult<()> {
    reserve(thread, 2)?;
    let guard = StackGuard::new(thread);
    thread.create_table(array.len(), 0);
    for (i, item) in array.iter().enumerate() {
        push_host_value(thread, item)?;
        thread.raw_set_i(-2, i as i64 + 1)?;
    }
    guard.commit();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use variant_bridge_core::Variant;
    use variant_bridge_vm::Vm;

    fn table_with_keys(vm: &Vm, keys: &[Value]) {
        let t = vm.new_table();
        for key in keys {
            drop(t.borrow_mut().set(key.clone(), Value::Boolean(true)).unwrap());
        }
    }

    #[test]
    fn dense_tables_are_sequences() {
        let vm = Vm::new();
        table_with_keys(&vm, &[Value::Number(1.0), Value::Number(2.0), Value::Number(3.0)]);
        assert!(is_sequence(&vm, -1));
        assert_eq!(vm.get_top(), 1);
    }

    #[test]
    fn empty_table_is_a_sequence_by_convention() {
        let vm = Vm::new();
        vm.new_table();
        assert!(is_sequence(&vm, 1));
        let (items, ok) = to_sequence(&vm, 1);
        assert!(ok);
        assert!(items.is_empty());
    }

    #[test]
    fn gaps_and_foreign_keys_are_not_sequences() {
        let vm = Vm::new();
        table_with_keys(&vm, &[Value::Number(1.0), Value::Number(3.0)]);
        assert!(!is_sequence(&vm, -1));
        table_with_keys(&vm, &[Value::Number(1.5)]);
        assert!(!is_sequence(&vm, -1));
        table_with_keys(&vm, &[Value::Number(1.0), Value::string("x")]);
        assert!(!is_sequence(&vm, -1));
        table_with_keys(&vm, &[Value::Number(2.0)]);
        assert!(!is_sequence(&vm, -1));
        assert_eq!(vm.get_top(), 4);
    }

    #[test]
    fn non_tables_are_not_sequences() {
        let vm = Vm::new();
        vm.push_number(1.0);
        assert!(!is_sequence(&vm, 1));
        assert!(!is_sequence(&vm, 5));
    }

    #[test]
    fn to_sequence_stops_at_first_bad_key() {
        let vm = Vm::new();
        let t = vm.new_table();
        drop(t.borrow_mut().set_int(1, Value::string("a")));
        drop(t.borrow_mut().set_str("k", Value::string("b")));
        let (items, ok) = to_sequence(&vm, 1);
        assert!(!ok);
        assert_eq!(items.len(), 1);
        assert_eq!(vm.get_top(), 1);
    }

    #[test]
    fn push_then_read_preserves_order() {
        let vm = Vm::new();
        let inner: Array = vec![Variant::from(true)].into();
        let array: Array = vec![Variant::from(10), Variant::from("x"), Variant::from(inner), Variant::from(Array::new())].into();
        push_sequence(&vm, &array).unwrap();
        assert_eq!(vm.raw_len(-1), 4);
        let (back, ok) = to_sequence(&vm, -1);
        assert!(ok);
        assert_eq!(back, array);
    }
}

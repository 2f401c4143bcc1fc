//! Stack safety helpers.
//!
//! Every bridge entry point validates its index with [`check_index`] and
//! reserves headroom with [`reserve`] before pushing anything.
//! [`StackGuard`] restores the stack top on early exits so a failed
//! conversion never leaves partial pushes behind.

use std::rc::Rc;

use variant_bridge_core::print_error;
use variant_bridge_vm::{NativeFunction, REGISTRY_INDEX, TableRef, Thread, Value, VmError};

use crate::error::{BridgeError, BridgeResult};

/// True for pseudo-indices, positive indices up to the top and negative
/// indices above [`REGISTRY_INDEX`] whose magnitude does not exceed the top.
/// Zero is never valid.
pub fn is_valid_index(thread: &Thread, idx: i32) -> bool {
    if Thread::is_pseudo(idx) {
        return true;
    }
    let top = thread.get_top();
    match idx {
        0 => false,
        i if i > 0 => i <= top,
        i if i > REGISTRY_INDEX => -i <= top,
        _ => false,
    }
}

pub fn check_index(thread: &Thread, idx: i32) -> BridgeResult<()> {
    if is_valid_index(thread, idx) {
        Ok(())
    } else {
        Err(BridgeError::InvalidIndex(idx))
    }
}

/// Validate `idx`, reporting a violation through the host message facility.
pub(crate) fn expect_index(thread: &Thread, idx: i32, operation: &str) -> bool {
    let valid = is_valid_index(thread, idx);
    if !valid {
        print_error(format!("{}: invalid stack index {}", operation, idx));
    }
    valid
}

/// Ensure `n` more values can be pushed.
pub fn reserve(thread: &Thread, n: usize) -> BridgeResult<()> {
    match i32::try_from(n) {
        Ok(slots) if thread.check_stack(slots) => Ok(()),
        _ => Err(BridgeError::StackExhausted { requested: n }),
    }
}

/// Restores the stack top on drop unless committed.
pub struct StackGuard<'a> {
    thread: &'a Thread,
    top: i32,
    armed: bool,
}

impl<'a> StackGuard<'a> {
    pub fn new(thread: &'a Thread) -> Self {
        Self {
            thread,
            top: thread.get_top(),
            armed: true,
        }
    }

    /// Top recorded when the guard was created.
    pub fn top(&self) -> i32 {
        self.top
    }

    /// Keep whatever was pushed since the guard was created.
    pub fn commit(mut self) {
        self.armed = false;
    }
}

impl Drop for StackGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.thread.get_top() > self.top {
            self.thread.set_top(self.top);
        }
    }
}

/// Metamethod table: event name and handler.
pub(crate) type MetaMethods = &'static [(&'static str, fn(&Thread) -> Result<usize, VmError>)];

/// Look up (or create and fill) the registry metatable `name`.
///
/// Bridge metatables are locked: scripts see `__metatable` instead of the
/// table itself.
pub(crate) fn bridge_metatable(thread: &Thread, name: &str, methods: MetaMethods) -> BridgeResult<TableRef> {
    reserve(thread, 1)?;
    let created = thread.new_metatable(name);
    let table = match thread.pop_value() {
        Value::Table(t) => t,
        other => return Err(BridgeError::UnsupportedType(other.type_of().name())),
    };
    if created {
        fill_metatable(&table, name, methods);
    }
    Ok(table)
}

fn fill_metatable(table: &TableRef, name: &str, methods: MetaMethods) {
    let mut displaced = Vec::new();
    {
        let mut t = table.borrow_mut();
        for &(event, handler) in methods {
            displaced.extend(t.set_str(event, Value::Function(NativeFunction::new(Some(event), handler))));
        }
        displaced.extend(t.set_str("__metatable", Value::string(name)));
        let short = name.rsplit('.').next().unwrap_or(name);
        displaced.extend(t.set_str("__type", Value::string(short)));
    }
    drop(displaced);
}

/// Registry metatable `name`, if it exists.
pub(crate) fn find_metatable(thread: &Thread, name: &str) -> Option<TableRef> {
    if reserve(thread, 1).is_err() {
        return None;
    }
    thread.get_named_metatable(name);
    match thread.pop_value() {
        Value::Table(t) => Some(t),
        _ => None,
    }
}

pub(crate) fn same_table(a: Option<&TableRef>, b: Option<&TableRef>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Rc::ptr_eq(a, b),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use variant_bridge_vm::{GLOBALS_INDEX, Vm, VmOptions};

    #[test]
    fn index_validity() {
        let vm = Vm::new();
        vm.push_nil();
        vm.push_nil();
        assert!(is_valid_index(&vm, 1));
        assert!(is_valid_index(&vm, 2));
        assert!(!is_valid_index(&vm, 3));
        assert!(is_valid_index(&vm, -2));
        assert!(!is_valid_index(&vm, -3));
        assert!(!is_valid_index(&vm, 0));
        assert!(is_valid_index(&vm, REGISTRY_INDEX));
        assert!(is_valid_index(&vm, GLOBALS_INDEX));
        assert!(!is_valid_index(&vm, i32::MIN));
    }

    #[test]
    fn deep_negative_indices_stop_at_the_registry() {
        let vm = Vm::new();
        for _ in 0..10_005 {
            vm.push_nil();
        }
        assert!(is_valid_index(&vm, REGISTRY_INDEX + 1));
        assert!(!is_valid_index(&vm, REGISTRY_INDEX - 1));
        assert!(!is_valid_index(&vm, -10_005));
        assert!(check_index(&vm, -10_001).is_err());
        assert!(vm.get(-10_001).is_none());
    }

    #[test]
    fn reserve_fails_past_limit() {
        let vm = Vm::with_options(VmOptions {
            max_stack_slots: 8,
            ..VmOptions::default()
        });
        assert!(reserve(&vm, 8).is_ok());
        assert!(matches!(
            reserve(&vm, 9),
            Err(BridgeError::StackExhausted { requested: 9 })
        ));
        assert!(reserve(&vm, usize::MAX).is_err());
    }

    #[test]
    fn guard_restores_top_unless_committed() {
        let vm = Vm::new();
        vm.push_nil();
        {
            let _guard = StackGuard::new(&vm);
            vm.push_nil();
            vm.push_nil();
        }
        assert_eq!(vm.get_top(), 1);
        let guard = StackGuard::new(&vm);
        vm.push_nil();
        guard.commit();
        assert_eq!(vm.get_top(), 2);
    }

    #[test]
    fn bridge_metatables_are_created_once_and_locked() {
        let vm = Vm::new();
        let a = bridge_metatable(&vm, "test.Meta", &[]).unwrap();
        let b = bridge_metatable(&vm, "test.Meta", &[]).unwrap();
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(a.borrow().get_str("__metatable"), Value::string("test.Meta"));
        assert!(same_table(find_metatable(&vm, "test.Meta").as_ref(), Some(&a)));
        assert!(find_metatable(&vm, "test.Missing").is_none());
        assert_eq!(vm.get_top(), 0);
    }
}

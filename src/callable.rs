//! Invocable bridge.
//!
//! VM functions reach the host as [`LuaCallable`]s, which pin the function
//! in the VM registry. Host [`Callable`]s reach the VM as userdata whose
//! `__call` converts arguments and forwards to the callable. A
//! [`LuaCallable`] pushed back into its own VM unwraps to the original
//! function instead of nesting wrappers.

use std::any::Any;
use std::cell::RefCell;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use rustc_hash::{FxHashMap, FxHasher};
use variant_bridge_core::{CallError, Callable, CallableCustom, ObjectDb, ObjectId, ObjectRef, Variant, print_error};
use variant_bridge_vm::{REF_NIL, Thread, UserData, Value, VmError, VmType, WeakVm};

use crate::error::BridgeResult;
use crate::session::{VmSession, find_session, session_for_thread};
use crate::stack::{MetaMethods, StackGuard, bridge_metatable, expect_index, find_metatable, reserve, same_table};
use crate::variant::{push_host_value, to_host_value};

/// Registry name of the host callable metatable.
pub const CALLABLE_METATABLE: &str = "variant_bridge.Callable";

// ============================================================================
// VM function -> host
// ============================================================================

/// Registry references held for wrapped functions, one per function,
/// counted by the wrappers sharing it.
#[derive(Default)]
struct ClosureRefs {
    entries: RefCell<FxHashMap<usize, (i32, usize)>>,
}

impl ClosureRefs {
    fn acquire(&self, thread: &Thread, idx: i32, identity: usize) -> i32 {
        if let Some(entry) = self.entries.borrow_mut().get_mut(&identity) {
            entry.1 += 1;
            return entry.0;
        }
        let reference = thread.reference(idx);
        if reference != REF_NIL {
            self.entries.borrow_mut().insert(identity, (reference, 1));
        }
        reference
    }

    /// Drop one use. Returns the reference to release once unused.
    fn release(&self, identity: usize) -> Option<i32> {
        let mut entries = self.entries.borrow_mut();
        let entry = entries.get_mut(&identity)?;
        entry.1 -= 1;
        if entry.1 > 0 {
            return None;
        }
        entries.remove(&identity).map(|(reference, _)| reference)
    }
}

/// How a wrapper reaches its session.
enum SessionHandle {
    /// An ad hoc session created to anchor the wrapper.
    Strong(ObjectRef),
    /// The session that already wraps the VM.
    Weak(ObjectId),
}

impl SessionHandle {
    fn id(&self) -> ObjectId {
        match self {
            SessionHandle::Strong(object) => object.id(),
            SessionHandle::Weak(id) => *id,
        }
    }

    fn session(&self) -> Option<Rc<VmSession>> {
        match self {
            SessionHandle::Strong(object) => object.cast(),
            SessionHandle::Weak(id) => ObjectDb::get_as(*id),
        }
    }
}

/// A VM function held by the host.
///
/// Identity is `(VM, registry reference)`: wrapping the same function twice
/// yields equal wrappers.
pub struct LuaCallable {
    session: SessionHandle,
    vm: WeakVm,
    vm_id: u64,
    identity: usize,
    reference: i32,
    name: String,
}

impl LuaCallable {
    /// Wrap the function at `idx`. `None` if the value is not a function.
    pub fn wrap(thread: &Thread, idx: i32) -> Option<Self> {
        if !expect_index(thread, idx, "LuaCallable::wrap") {
            return None;
        }
        let value = thread.value_at(idx);
        let Value::Function(function) = &value else {
            return None;
        };
        let identity = value.identity()?;
        let name = function.name().unwrap_or("anonymous").to_owned();
        let session = match find_session(thread) {
            Some(id) => SessionHandle::Weak(id),
            None => SessionHandle::Strong(session_for_thread(&thread.main_thread()?)?),
        };
        let reference = thread.extension::<ClosureRefs>().acquire(thread, idx, identity);
        if reference == REF_NIL {
            return None;
        }
        Some(Self {
            session,
            vm: thread.downgrade_vm(),
            vm_id: thread.vm_id(),
            identity,
            reference,
            name,
        })
    }

    pub fn reference(&self) -> i32 {
        self.reference
    }

    pub fn vm_id(&self) -> u64 {
        self.vm_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn key(&self) -> (u64, i32) {
        (self.vm_id, self.reference)
    }

    fn thread(&self) -> Result<Thread, CallError> {
        self.session
            .session()
            .filter(|s| s.is_valid())
            .and_then(|s| s.thread())
            .filter(|t| !t.is_closed())
            .ok_or(CallError::InstanceIsNull)
    }
}

impl CallableCustom for LuaCallable {
    fn hash_value(&self) -> u64 {
        let mut hasher = FxHasher::default();
        self.key().hash(&mut hasher);
        hasher.finish()
    }

    fn display_text(&self) -> String {
        format!("LuaCallable({})", self.name)
    }

    fn equals(&self, other: &dyn CallableCustom) -> bool {
        other
            .as_any()
            .downcast_ref::<LuaCallable>()
            .is_some_and(|o| o.key() == self.key())
    }

    fn less_than(&self, other: &dyn CallableCustom) -> bool {
        other
            .as_any()
            .downcast_ref::<LuaCallable>()
            .is_some_and(|o| self.key() < o.key())
    }

    fn object_id(&self) -> ObjectId {
        self.session.id()
    }

    fn is_valid(&self) -> bool {
        self.thread().is_ok()
    }

    /// Script errors are logged and yield `Nil`. Only the first result is
    /// kept.
    #[cfg_attr(feature = "profiling", profiling::function)]
    fn call(&self, args: &[Variant]) -> Result<Variant, CallError> {
        let thread = self.thread()?;
        reserve(&thread, args.len() + 1).map_err(|e| CallError::failed(e.to_string()))?;
        let _guard = StackGuard::new(&thread);
        if thread.get_ref(self.reference) != VmType::Function {
            return Err(CallError::InvalidMethod);
        }
        for arg in args {
            push_host_value(&thread, arg).map_err(|e| CallError::failed(e.to_string()))?;
        }
        let nargs = i32::try_from(args.len()).map_err(|_| CallError::failed("too many arguments"))?;
        match thread.pcall(nargs, 1) {
            Ok(()) => Ok(to_host_value(&thread, -1)),
            Err(e) => {
                print_error(format!("{}: {}", self.display_text(), e));
                Ok(Variant::Nil)
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for LuaCallable {
    fn drop(&mut self) {
        let released = self
            .vm
            .extension::<ClosureRefs>()
            .and_then(|refs| refs.release(self.identity));
        if let Some(reference) = released {
            self.vm.unref(reference);
        }
    }
}

impl std::fmt::Debug for LuaCallable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LuaCallable")
            .field("name", &self.name)
            .field("vm_id", &self.vm_id)
            .field("reference", &self.reference)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Host callable -> VM
// ============================================================================

/// Userdata payload for a host callable.
#[derive(Debug, Clone)]
pub(crate) struct HostCallable(pub Callable);

/// Push `callable` as something the VM can call.
///
/// A [`LuaCallable`] of this VM pushes its original function.
#[cfg_attr(feature = "profiling", profiling::function)]
pub fn push_callable(thread: &Thread, callable: &Callable) -> BridgeResult<()> {
    reserve(thread, 2)?;
    if let Some(lua) = callable.custom_as::<LuaCallable>() {
        if lua.vm_id == thread.vm_id() && !thread.is_closed() {
            if thread.get_ref(lua.reference) == VmType::Function {
                return Ok(());
            }
            thread.pop(1);
        }
    }
    let metatable = bridge_metatable(thread, CALLABLE_METATABLE, CALLABLE_METHODS)?;
    let guard = StackGuard::new(thread);
    thread.new_userdata(HostCallable(callable.clone()));
    thread.push(Value::Table(metatable));
    thread.set_metatable(-2)?;
    guard.commit();
    Ok(())
}

/// Convert the VM function or host callable userdata at `idx`.
#[cfg_attr(feature = "profiling", profiling::function)]
pub fn to_callable(thread: &Thread, idx: i32) -> Option<Callable> {
    if !expect_index(thread, idx, "to_callable") {
        return None;
    }
    match thread.value_at(idx) {
        Value::Function(_) => LuaCallable::wrap(thread, idx).map(Callable::from_custom),
        Value::UserData(ud) => userdata_callable(thread, &ud),
        _ => None,
    }
}

pub(crate) fn userdata_callable(thread: &Thread, ud: &UserData) -> Option<Callable> {
    if !ud.is::<HostCallable>() {
        return None;
    }
    let metatable = find_metatable(thread, CALLABLE_METATABLE);
    if !same_table(ud.metatable().as_ref(), metatable.as_ref()) {
        return None;
    }
    ud.get::<HostCallable>().map(|h| h.0)
}

const CALLABLE_METHODS: MetaMethods = &[
    ("__call", callable_call),
    ("__tostring", callable_tostring),
    ("__eq", callable_eq),
    ("__concat", callable_concat),
];

fn payload(t: &Thread, idx: i32) -> Option<Callable> {
    t.to_userdata(idx)?.get::<HostCallable>().map(|h| h.0)
}

fn callable_call(t: &Thread) -> Result<usize, VmError> {
    let callable = payload(t, 1).ok_or_else(|| t.type_error(1, "Callable"))?;
    let top = t.get_top();
    let given = usize::try_from(top - 1).unwrap_or(0);
    if let Some(error) = callable.argument_count().and_then(|expected| CallError::arity(expected, given)) {
        return Err(VmError::runtime(format!("{}: {}", callable.display_text(), error)));
    }
    let args: Vec<Variant> = (2..=top).map(|i| to_host_value(t, i)).collect();
    match callable.call(&args) {
        Ok(result) => {
            push_host_value(t, &result)?;
            Ok(1)
        }
        Err(error) => Err(VmError::runtime(format!("{}: {}", callable.display_text(), error))),
    }
}

fn callable_tostring(t: &Thread) -> Result<usize, VmError> {
    let callable = payload(t, 1).ok_or_else(|| t.type_error(1, "Callable"))?;
    t.push_string(&callable.display_text());
    Ok(1)
}

fn callable_eq(t: &Thread) -> Result<usize, VmError> {
    let equal = match (payload(t, 1), payload(t, 2)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    };
    t.push_boolean(equal);
    Ok(1)
}

fn callable_concat(t: &Thread) -> Result<usize, VmError> {
    let mut text = t.to_display_string(1)?;
    text.push_str(&t.to_display_string(2)?);
    t.push_string(&text);
    Ok(1)
}

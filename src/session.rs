//! The host-side VM session object.
//!
//! A [`VmSession`] is a reference-counted host object wrapping one VM
//! thread. The session created by [`VmSession::new`] owns its VM; sessions
//! made by [`VmSession::bind`] or [`VmSession::new_thread`] only hold a
//! thread of a VM owned elsewhere. The owning session records its object id
//! in the main thread's data slot so the bridge can find it from any thread
//! of the VM. A thread with no live session records the bound session made
//! for it in the same slot, so it keeps one identity while that is held.

use std::cell::{Cell, RefCell};

use variant_bridge_core::{
    CallError, HostObject, ObjectDb, ObjectId, ObjectRef, StringName, Variant, print_error,
};
use variant_bridge_vm::{LibraryFlags, Thread, Vm, VmError, VmOptions, VmType};

use crate::atom_cache::{AtomCache, NO_ATOM};
use crate::error::{BridgeError, BridgeResult};
use crate::stack::{StackGuard, reserve};
use crate::variant::{push_host_value, to_host_value};

/// Per-VM session state shared by every session of that VM.
struct SessionState {
    valid: Cell<bool>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self { valid: Cell::new(true) }
    }
}

pub struct VmSession {
    vm: RefCell<Option<Vm>>,
    thread: RefCell<Option<Thread>>,
}

impl VmSession {
    /// Create a VM and the session owning it.
    ///
    /// The VM's panic handler invalidates the session; its string atom hook
    /// feeds the process-wide [`AtomCache`].
    pub fn new(options: VmOptions) -> ObjectRef {
        let vm = Vm::with_options(options);
        let main = vm.main_thread().clone();
        let weak = main.downgrade_vm();
        main.set_panic_handler(move |error: &VmError| {
            print_error(format!("VM panic: {}", error));
            if let Some(state) = weak.extension::<SessionState>() {
                state.valid.set(false);
            }
        });
        main.set_user_atom(|bytes: &[u8]| AtomCache::singleton().map_or(NO_ATOM, |cache| cache.create_atom(bytes)));
        let session = ObjectDb::instantiate(VmSession {
            vm: RefCell::new(Some(vm)),
            thread: RefCell::new(Some(main.clone())),
        });
        main.set_thread_data(session.id().to_raw());
        tracing::debug!(target: "variant_bridge", session = %session.id(), vm = main.vm_id(), "VM session created");
        session
    }

    /// A session bound to `thread` without owning its VM.
    pub fn bind(thread: Thread) -> ObjectRef {
        ObjectDb::instantiate(VmSession {
            vm: RefCell::new(None),
            thread: RefCell::new(Some(thread)),
        })
    }

    /// The VM's thread, or `None` once closed.
    pub fn thread(&self) -> Option<Thread> {
        self.thread.borrow().clone()
    }

    /// Whether this session owns its VM.
    pub fn owns_vm(&self) -> bool {
        self.vm.borrow().is_some()
    }

    /// False after [`close`](Self::close), after the VM closed and after a
    /// VM panic.
    pub fn is_valid(&self) -> bool {
        let Some(thread) = self.thread() else {
            return false;
        };
        !thread.is_closed() && thread.extension::<SessionState>().valid.get()
    }

    fn require_thread(&self) -> BridgeResult<Thread> {
        self.thread()
            .filter(|_| self.is_valid())
            .ok_or(BridgeError::SessionClosed)
    }

    pub fn open_libs(&self, flags: LibraryFlags) -> BridgeResult<()> {
        self.require_thread()?.open_libs(flags)?;
        Ok(())
    }

    /// Close the session. An owning session closes its VM.
    pub fn close(&self) {
        let vm = self.vm.borrow_mut().take();
        let thread = self.thread.borrow_mut().take();
        if let Some(vm) = vm {
            tracing::debug!(target: "variant_bridge", vm = vm.vm_id(), "VM session closed");
            vm.close();
        }
        drop(thread);
    }

    /// Spawn a VM thread and return a session bound to it.
    pub fn new_thread(&self) -> BridgeResult<ObjectRef> {
        let thread = self.require_thread()?;
        reserve(&thread, 1)?;
        let child = thread.new_thread();
        thread.pop(1);
        let session = VmSession::bind(child.clone());
        child.set_thread_data(session.id().to_raw());
        Ok(session)
    }

    pub fn set_global(&self, name: &str, value: &Variant) -> BridgeResult<()> {
        let thread = self.require_thread()?;
        reserve(&thread, 1)?;
        let guard = StackGuard::new(&thread);
        push_host_value(&thread, value)?;
        thread.set_global(name)?;
        guard.commit();
        Ok(())
    }

    /// Global `name` converted to a host value. Errors are reported and
    /// yield `Nil`.
    pub fn get_global(&self, name: &str) -> Variant {
        let thread = match self.require_thread() {
            Ok(thread) => thread,
            Err(e) => {
                print_error(format!("get_global: {}", e));
                return Variant::Nil;
            }
        };
        if reserve(&thread, 1).is_err() {
            print_error("get_global: stack overflow");
            return Variant::Nil;
        }
        let _guard = StackGuard::new(&thread);
        match thread.get_global(name) {
            Ok(_) => to_host_value(&thread, -1),
            Err(e) => {
                print_error(format!("get_global: {}", e));
                Variant::Nil
            }
        }
    }

    /// Register a native function as global `name`.
    pub fn load_function<F>(&self, name: &str, f: F) -> BridgeResult<()>
    where
        F: Fn(&Thread) -> Result<usize, VmError> + 'static,
    {
        let thread = self.require_thread()?;
        reserve(&thread, 1)?;
        thread.push_function(name, f);
        thread.set_global(name)?;
        Ok(())
    }

    /// Call global function `name` with `args`, returning its first result.
    ///
    /// Unlike calls made through a wrapped VM function, script errors are
    /// returned to the host as [`CallError::Failed`].
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn call_function(&self, name: &str, args: &[Variant]) -> Result<Variant, CallError> {
        let thread = self.require_thread().map_err(|_| CallError::InstanceIsNull)?;
        reserve(&thread, args.len() + 1).map_err(|e| CallError::failed(e.to_string()))?;
        let _guard = StackGuard::new(&thread);
        match thread.get_global(name) {
            Ok(VmType::Function) => {}
            Ok(_) => return Err(CallError::InvalidMethod),
            Err(e) => return Err(CallError::failed(e.to_string())),
        }
        for arg in args {
            push_host_value(&thread, arg).map_err(|e| CallError::failed(e.to_string()))?;
        }
        let nargs = i32::try_from(args.len()).map_err(|_| CallError::failed("too many arguments"))?;
        thread
            .pcall(nargs, 1)
            .map_err(|e| CallError::failed(e.to_string()))?;
        Ok(to_host_value(&thread, -1))
    }
}

impl HostObject for VmSession {
    fn class_name(&self) -> &str {
        "VmSession"
    }

    fn get(&self, key: &Variant) -> Option<Variant> {
        match key.as_str()? {
            "valid" => Some(Variant::Bool(self.is_valid())),
            _ => None,
        }
    }

    fn has_method(&self, method: &StringName) -> bool {
        matches!(
            method.as_str(),
            "is_valid" | "close" | "get_global" | "set_global" | "call_function" | "new_thread"
        )
    }

    fn call(&self, method: &StringName, args: &[Variant]) -> Result<Variant, CallError> {
        match method.as_str() {
            "is_valid" => Ok(Variant::Bool(self.is_valid())),
            "close" => {
                self.close();
                Ok(Variant::Nil)
            }
            "get_global" => Ok(self.get_global(string_arg(args, 0)?)),
            "set_global" => {
                let value = args.get(1).ok_or(CallError::TooFewArguments { expected: 2, given: args.len() })?;
                self.set_global(string_arg(args, 0)?, value)
                    .map_err(|e| CallError::failed(e.to_string()))?;
                Ok(Variant::Nil)
            }
            "call_function" => self.call_function(string_arg(args, 0)?, &args[1..]),
            "new_thread" => self
                .new_thread()
                .map(Variant::Object)
                .map_err(|e| CallError::failed(e.to_string())),
            _ => Err(CallError::InvalidMethod),
        }
    }
}

fn string_arg(args: &[Variant], index: usize) -> Result<&str, CallError> {
    let arg = args.get(index).ok_or(CallError::TooFewArguments {
        expected: index + 1,
        given: args.len(),
    })?;
    arg.as_str().ok_or(CallError::InvalidArgument {
        index,
        expected: "String",
        found: arg.type_name(),
    })
}

/// Id of the session owning `thread`'s VM, if one exists and is alive.
pub(crate) fn find_session(thread: &Thread) -> Option<ObjectId> {
    let main = thread.main_thread()?;
    let id = ObjectId::from_raw(main.thread_data());
    let session = ObjectDb::get_as::<VmSession>(id)?;
    (session.owns_vm() && session.thread().is_some_and(|t| t.same_vm(thread))).then_some(id)
}

/// The session object for `thread`, reusing the one recorded in its data
/// slot when it still wraps this thread.
pub fn session_for_thread(thread: &Thread) -> Option<ObjectRef> {
    let id = ObjectId::from_raw(thread.thread_data());
    let recorded = ObjectDb::get_as::<VmSession>(id)
        .and_then(|s| s.thread())
        .is_some_and(|t| t.identity() == thread.identity());
    if recorded {
        if let Some(session) = ObjectRef::new(id) {
            return Some(session);
        }
    }
    if thread.is_closed() {
        return None;
    }
    let session = VmSession::bind(thread.clone());
    thread.set_thread_data(session.id().to_raw());
    Some(session)
}

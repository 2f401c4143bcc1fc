//! VM state: the shared global state and the per-thread stacks.
//!
//! The API follows the shape of the Lua C API. Values are addressed by stack
//! index: positive indices count from the bottom of the current frame
//! (1 is the first argument of a running native function), negative indices
//! count down from the top, and the pseudo-indices [`REGISTRY_INDEX`] and
//! [`GLOBALS_INDEX`] name the registry and globals tables.
//!
//! Everything is single-threaded and reference counted. Values removed from
//! the stack or from tables are always dropped after the owning `RefCell`
//! borrow is released, because dropping a userdata runs its destructor and
//! destructors may call back into the VM.

use std::any::{Any, TypeId};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::ops::Deref;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::VmError;
use crate::function::{FunctionRef, NativeFunction};
use crate::table::Table;
use crate::userdata::{UNTAGGED, UTAG_LIMIT, UserData, UserDataDtor};
use crate::value::{BufferRef, LightUserData, TableRef, Value, VmString, VmType};

/// Pseudo-index of the registry table.
pub const REGISTRY_INDEX: i32 = -10000;
/// Pseudo-index of the globals table.
pub const GLOBALS_INDEX: i32 = -10002;
/// `nresults` value requesting every result.
pub const MULTRET: i32 = -1;
/// Reference returned for nil values; never a valid registry slot.
pub const REF_NIL: i32 = -1;

/// Resource limits for a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmOptions {
    /// Maximum number of stack slots a thread may reserve.
    pub max_stack_slots: usize,
    /// Maximum nesting of native calls.
    pub max_call_depth: usize,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self {
            max_stack_slots: 1_000_000,
            max_call_depth: 200,
        }
    }
}

type PanicFn = dyn Fn(&VmError);
type UserAtomFn = dyn Fn(&[u8]) -> i16;

static NEXT_VM_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Global state
// ============================================================================

/// State shared by every thread of one VM.
pub struct GlobalState {
    id: u64,
    options: VmOptions,
    pub(crate) registry: TableRef,
    pub(crate) globals: TableRef,
    pub(crate) string_metatable: RefCell<Option<TableRef>>,
    free_refs: RefCell<Vec<i32>>,
    next_ref: Cell<i32>,
    tag_dtors: RefCell<FxHashMap<u8, Rc<UserDataDtor>>>,
    tag_metatables: RefCell<FxHashMap<u8, TableRef>>,
    panic: RefCell<Option<Rc<PanicFn>>>,
    user_atom: RefCell<Option<Rc<UserAtomFn>>>,
    extensions: RefCell<FxHashMap<TypeId, Rc<dyn Any>>>,
    main: RefCell<Weak<ThreadState>>,
    threads: RefCell<Vec<Weak<ThreadState>>>,
    pub(crate) call_depth: Cell<usize>,
    closed: Cell<bool>,
}

impl GlobalState {
    fn new(options: VmOptions) -> Self {
        Self {
            id: NEXT_VM_ID.fetch_add(1, Ordering::Relaxed),
            options,
            registry: Rc::new(RefCell::new(Table::new())),
            globals: Rc::new(RefCell::new(Table::new())),
            string_metatable: RefCell::new(None),
            free_refs: RefCell::new(Vec::new()),
            next_ref: Cell::new(1),
            tag_dtors: RefCell::new(FxHashMap::default()),
            tag_metatables: RefCell::new(FxHashMap::default()),
            panic: RefCell::new(None),
            user_atom: RefCell::new(None),
            extensions: RefCell::new(FxHashMap::default()),
            main: RefCell::new(Weak::new()),
            threads: RefCell::new(Vec::new()),
            call_depth: Cell::new(0),
            closed: Cell::new(false),
        }
    }

    pub(crate) fn userdata_dtor(&self, tag: u8) -> Option<Rc<UserDataDtor>> {
        if tag == UNTAGGED {
            return None;
        }
        self.tag_dtors.try_borrow().ok()?.get(&tag).cloned()
    }

    fn unref(&self, r: i32) -> bool {
        if r <= 0 || self.closed.get() {
            return false;
        }
        if self.registry.borrow().get_int(r as i64).is_nil() {
            return false;
        }
        let displaced = self.registry.borrow_mut().set_int(r as i64, Value::Nil);
        drop(displaced);
        self.free_refs.borrow_mut().push(r);
        true
    }

    fn extension<T: Default + 'static>(&self) -> Rc<T> {
        let existing = self.extensions.borrow().get(&TypeId::of::<T>()).cloned();
        if let Some(ext) = existing.and_then(|e| e.downcast::<T>().ok()) {
            return ext;
        }
        let ext = Rc::new(T::default());
        self.extensions
            .borrow_mut()
            .insert(TypeId::of::<T>(), ext.clone() as Rc<dyn Any>);
        ext
    }

    fn raise_panic(&self, error: &VmError) {
        let handler = self.panic.borrow().clone();
        match handler {
            Some(handler) => handler(error),
            None => tracing::error!(target: "variant_bridge_vm", vm = self.id, "unprotected error: {}", error),
        }
    }

    /// Tear the VM down: empty every reachable table so reference cycles
    /// are broken, then drop all values so userdata destructors run.
    fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        let mut queue: Vec<Value> = Vec::new();
        queue.extend(self.registry.borrow_mut().take_contents());
        queue.extend(self.globals.borrow_mut().take_contents());
        queue.extend(self.string_metatable.take().map(Value::Table));
        queue.extend(self.tag_metatables.take().into_values().map(Value::Table));
        let mut threads = self.threads.take();
        threads.push(self.main.borrow().clone());
        for thread in threads.iter().filter_map(Weak::upgrade) {
            queue.extend(take_stack(&thread));
        }
        let extensions = self.extensions.take();

        let mut seen = FxHashSet::default();
        let mut bin = Vec::new();
        while let Some(value) = queue.pop() {
            let first_visit = value.identity().is_some_and(|id| seen.insert(id));
            if first_visit {
                match &value {
                    Value::Table(t) => {
                        if let Ok(mut t) = t.try_borrow_mut() {
                            queue.extend(t.take_contents());
                        }
                    }
                    Value::UserData(u) => queue.extend(u.set_metatable(None).map(Value::Table)),
                    Value::Thread(th) => queue.extend(take_stack(&th.0)),
                    _ => {}
                }
            }
            bin.push(value);
        }
        tracing::debug!(target: "variant_bridge_vm", vm = self.id, values = bin.len(), "closing VM");
        drop(bin);
        drop(extensions);
        drop(self.tag_dtors.take());
        drop(self.panic.take());
        drop(self.user_atom.take());
    }
}

fn take_stack(thread: &ThreadState) -> Vec<Value> {
    thread
        .stack
        .try_borrow_mut()
        .map(|mut s| std::mem::take(&mut *s))
        .unwrap_or_default()
}

impl fmt::Debug for GlobalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalState")
            .field("id", &self.id)
            .field("closed", &self.closed.get())
            .finish_non_exhaustive()
    }
}

/// A non-owning handle to a VM, usable after every thread handle is gone.
#[derive(Clone)]
pub struct WeakVm(Weak<GlobalState>);

impl WeakVm {
    pub fn is_open(&self) -> bool {
        self.0.upgrade().is_some_and(|g| !g.closed.get())
    }

    /// Release a registry reference. No-op once the VM is closed.
    pub fn unref(&self, r: i32) -> bool {
        self.0.upgrade().is_some_and(|g| g.unref(r))
    }

    pub fn main_thread(&self) -> Option<Thread> {
        let g = self.0.upgrade()?;
        let main = g.main.borrow().upgrade()?;
        Some(Thread(main))
    }

    pub fn extension<T: Default + 'static>(&self) -> Option<Rc<T>> {
        let g = self.0.upgrade()?;
        (!g.closed.get()).then(|| g.extension::<T>())
    }
}

impl fmt::Debug for WeakVm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WeakVm").field(&self.is_open()).finish()
    }
}

// ============================================================================
// Threads
// ============================================================================

/// Lifecycle of a thread used as a coroutine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    Ready,
    Running,
    Finished,
    Errored,
}

pub(crate) struct ThreadState {
    pub(crate) global: Rc<GlobalState>,
    pub(crate) stack: RefCell<Vec<Value>>,
    frames: RefCell<Vec<usize>>,
    data: Cell<u64>,
    status: Cell<ThreadStatus>,
}

/// A handle to a VM thread: one value stack plus its call frames.
///
/// Cloning the handle does not create a new thread.
#[derive(Clone)]
pub struct Thread(pub(crate) Rc<ThreadState>);

enum Slot {
    Stack(usize),
    Registry,
    Globals,
}

impl Thread {
    fn with_global(global: Rc<GlobalState>) -> Self {
        Thread(Rc::new(ThreadState {
            global,
            stack: RefCell::new(Vec::new()),
            frames: RefCell::new(Vec::new()),
            data: Cell::new(0),
            status: Cell::new(ThreadStatus::Ready),
        }))
    }

    pub(crate) fn global(&self) -> &GlobalState {
        &self.0.global
    }

    // ------------------------------------------------------------------
    // Identity
    // ------------------------------------------------------------------

    /// Unique id of the VM this thread belongs to.
    pub fn vm_id(&self) -> u64 {
        self.0.global.id
    }

    pub fn same_vm(&self, other: &Thread) -> bool {
        Rc::ptr_eq(&self.0.global, &other.0.global)
    }

    pub fn identity(&self) -> usize {
        Rc::as_ptr(&self.0) as *const () as usize
    }

    pub fn options(&self) -> VmOptions {
        self.0.global.options
    }

    pub fn is_closed(&self) -> bool {
        self.0.global.closed.get()
    }

    pub fn downgrade_vm(&self) -> WeakVm {
        WeakVm(Rc::downgrade(&self.0.global))
    }

    pub fn main_thread(&self) -> Option<Thread> {
        self.0.global.main.borrow().upgrade().map(Thread)
    }

    pub fn is_main_thread(&self) -> bool {
        std::ptr::eq(self.0.global.main.borrow().as_ptr(), Rc::as_ptr(&self.0))
    }

    /// Opaque per-thread word reserved for the embedder.
    pub fn thread_data(&self) -> u64 {
        self.0.data.get()
    }

    pub fn set_thread_data(&self, data: u64) {
        self.0.data.set(data);
    }

    pub fn status(&self) -> ThreadStatus {
        self.0.status.get()
    }

    /// Per-VM extension slot of type `T`, created on first use.
    pub fn extension<T: Default + 'static>(&self) -> Rc<T> {
        self.0.global.extension::<T>()
    }

    /// Install the handler invoked when an error escapes an unprotected call.
    pub fn set_panic_handler(&self, handler: impl Fn(&VmError) + 'static) {
        *self.0.global.panic.borrow_mut() = Some(Rc::new(handler));
    }

    /// Install the hook assigning atoms to newly created strings.
    pub fn set_user_atom(&self, hook: impl Fn(&[u8]) -> i16 + 'static) {
        *self.0.global.user_atom.borrow_mut() = Some(Rc::new(hook));
    }

    // ------------------------------------------------------------------
    // Index resolution
    // ------------------------------------------------------------------

    fn base(&self) -> usize {
        self.0.frames.borrow().last().copied().unwrap_or(0)
    }

    fn len(&self) -> usize {
        self.0.stack.borrow().len()
    }

    pub fn is_pseudo(idx: i32) -> bool {
        idx == REGISTRY_INDEX || idx == GLOBALS_INDEX
    }

    fn slot(&self, idx: i32) -> Option<Slot> {
        match idx {
            REGISTRY_INDEX => Some(Slot::Registry),
            GLOBALS_INDEX => Some(Slot::Globals),
            0 => None,
            i if i > 0 => {
                let pos = self.base() + i as usize - 1;
                (pos < self.len()).then_some(Slot::Stack(pos))
            }
            i if i > REGISTRY_INDEX => {
                let len = self.len();
                let pos = len.checked_sub(i.unsigned_abs() as usize)?;
                (pos >= self.base()).then_some(Slot::Stack(pos))
            }
            _ => None,
        }
    }

    fn stack_pos(&self, idx: i32) -> Result<usize, VmError> {
        match self.slot(idx) {
            Some(Slot::Stack(pos)) => Ok(pos),
            _ => Err(VmError::InvalidIndex(idx)),
        }
    }

    /// The value at `idx`, or `None` for an invalid index.
    pub fn get(&self, idx: i32) -> Option<Value> {
        match self.slot(idx)? {
            Slot::Stack(pos) => self.0.stack.borrow().get(pos).cloned(),
            Slot::Registry => Some(Value::Table(self.0.global.registry.clone())),
            Slot::Globals => Some(Value::Table(self.0.global.globals.clone())),
        }
    }

    /// The value at `idx`, nil for an invalid index.
    pub fn value_at(&self, idx: i32) -> Value {
        self.get(idx).unwrap_or_default()
    }

    fn stack_value(&self, pos: usize) -> Value {
        self.0.stack.borrow().get(pos).cloned().unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Basic stack manipulation
    // ------------------------------------------------------------------

    /// Number of values in the current frame.
    pub fn get_top(&self) -> i32 {
        (self.len().saturating_sub(self.base())) as i32
    }

    /// Set the top: non-negative values are frame-relative counts, negative
    /// values are relative to the current top. Grows with nils.
    pub fn set_top(&self, idx: i32) {
        let base = self.base();
        let len = self.len();
        let new_len = if idx >= 0 {
            base + idx as usize
        } else {
            (len as i64 + idx as i64 + 1).max(base as i64) as usize
        };
        let removed: Vec<Value> = {
            let mut stack = self.0.stack.borrow_mut();
            if new_len <= stack.len() {
                stack.split_off(new_len)
            } else {
                stack.resize(new_len, Value::Nil);
                Vec::new()
            }
        };
        drop(removed);
    }

    pub fn pop(&self, n: i32) {
        self.set_top(-n - 1);
    }

    /// Pop the top value and return it.
    pub fn pop_value(&self) -> Value {
        if self.get_top() == 0 {
            return Value::Nil;
        }
        let value = self.0.stack.borrow_mut().pop();
        value.unwrap_or_default()
    }

    /// Convert a relative index into an absolute one.
    pub fn abs_index(&self, idx: i32) -> i32 {
        if idx > 0 || Self::is_pseudo(idx) {
            idx
        } else {
            self.get_top() + idx + 1
        }
    }

    /// Ensure `n` more slots can be pushed without exceeding the limit.
    pub fn check_stack(&self, n: i32) -> bool {
        n >= 0 && self.len() + n as usize <= self.0.global.options.max_stack_slots
    }

    pub fn push(&self, value: Value) {
        self.0.stack.borrow_mut().push(value);
    }

    /// Push a copy of the value at `idx`.
    pub fn push_value(&self, idx: i32) {
        let value = self.value_at(idx);
        self.push(value);
    }

    pub fn push_nil(&self) {
        self.push(Value::Nil);
    }

    pub fn push_boolean(&self, b: bool) {
        self.push(Value::Boolean(b));
    }

    pub fn push_number(&self, n: f64) {
        self.push(Value::Number(n));
    }

    pub fn push_integer(&self, n: i64) {
        self.push(Value::Number(n as f64));
    }

    pub fn push_vector(&self, x: f32, y: f32, z: f32) {
        self.push(Value::Vector([x, y, z]));
    }

    /// Create a string, consulting the user-atom hook.
    pub fn new_string(&self, bytes: &[u8]) -> VmString {
        let hook = self.0.global.user_atom.borrow().clone();
        let atom = hook.map_or(-1, |h| h(bytes));
        VmString::with_atom(bytes, atom)
    }

    pub fn push_bytes(&self, bytes: &[u8]) {
        let s = self.new_string(bytes);
        self.push(Value::String(s));
    }

    pub fn push_string(&self, s: &str) {
        self.push_bytes(s.as_bytes());
    }

    pub fn push_light_userdata(&self, ptr: usize, tag: u8) {
        self.push(Value::LightUserData(LightUserData { ptr, tag }));
    }

    pub fn push_buffer(&self, bytes: &[u8]) -> BufferRef {
        let buffer = Rc::new(RefCell::new(bytes.to_vec()));
        self.push(Value::Buffer(buffer.clone()));
        buffer
    }

    /// Push this thread onto its own stack. Returns true for the main thread.
    pub fn push_thread(&self) -> bool {
        self.push(Value::Thread(self.clone()));
        self.is_main_thread()
    }

    pub fn push_function<F>(&self, name: &str, f: F)
    where
        F: Fn(&Thread) -> Result<usize, VmError> + 'static,
    {
        self.push(Value::Function(NativeFunction::new(Some(name), f)));
    }

    pub fn new_table(&self) -> TableRef {
        self.create_table(0, 0)
    }

    /// Push a table pre-sized for `narr` array and `nrec` hash entries.
    pub fn create_table(&self, narr: usize, nrec: usize) -> TableRef {
        let table = Rc::new(RefCell::new(Table::with_capacity(narr, nrec)));
        self.push(Value::Table(table.clone()));
        table
    }

    /// Move the top value into position `idx`, shifting values up.
    pub fn insert(&self, idx: i32) -> Result<(), VmError> {
        let pos = self.stack_pos(idx)?;
        let mut stack = self.0.stack.borrow_mut();
        if let Some(top) = stack.pop() {
            stack.insert(pos, top);
        }
        Ok(())
    }

    /// Remove the value at `idx`, shifting values down.
    pub fn remove(&self, idx: i32) -> Result<(), VmError> {
        let pos = self.stack_pos(idx)?;
        let removed = self.0.stack.borrow_mut().remove(pos);
        drop(removed);
        Ok(())
    }

    /// Pop the top value into position `idx`.
    pub fn replace(&self, idx: i32) -> Result<(), VmError> {
        let pos = self.stack_pos(idx)?;
        let value = self.pop_value();
        let old = {
            let mut stack = self.0.stack.borrow_mut();
            match stack.get_mut(pos) {
                Some(slot) => std::mem::replace(slot, value),
                None => value,
            }
        };
        drop(old);
        Ok(())
    }

    /// Move the top `n` values of this thread onto `to`.
    pub fn xmove(&self, to: &Thread, n: i32) -> Result<(), VmError> {
        if !self.same_vm(to) {
            return Err(VmError::runtime("cannot move values between different VMs"));
        }
        if n < 0 || n > self.get_top() {
            return Err(VmError::InvalidIndex(n));
        }
        let moved = {
            let mut stack = self.0.stack.borrow_mut();
            let at = stack.len() - n as usize;
            stack.split_off(at)
        };
        to.0.stack.borrow_mut().extend(moved);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Type queries and conversions
    // ------------------------------------------------------------------

    pub fn type_of(&self, idx: i32) -> VmType {
        self.get(idx).map_or(VmType::None, |v| v.type_of())
    }

    pub fn type_name_at(&self, idx: i32) -> &'static str {
        self.type_of(idx).name()
    }

    pub fn is_nil(&self, idx: i32) -> bool {
        matches!(self.type_of(idx), VmType::Nil | VmType::None)
    }

    pub fn is_table(&self, idx: i32) -> bool {
        self.type_of(idx) == VmType::Table
    }

    pub fn is_function(&self, idx: i32) -> bool {
        self.type_of(idx) == VmType::Function
    }

    pub fn to_boolean(&self, idx: i32) -> bool {
        self.value_at(idx).is_truthy()
    }

    pub fn to_number(&self, idx: i32) -> Option<f64> {
        self.value_at(idx).to_number()
    }

    pub fn to_vector(&self, idx: i32) -> Option<[f32; 3]> {
        match self.value_at(idx) {
            Value::Vector(v) => Some(v),
            _ => None,
        }
    }

    /// String at `idx`; numbers convert to their string form.
    pub fn to_vm_string(&self, idx: i32) -> Option<VmString> {
        match self.value_at(idx) {
            Value::String(s) => Some(s),
            Value::Number(n) => Some(self.new_string(crate::value::format_number(n).as_bytes())),
            _ => None,
        }
    }

    /// String at `idx` together with its atom. Only actual strings qualify.
    pub fn to_string_atom(&self, idx: i32) -> Option<(VmString, i16)> {
        match self.value_at(idx) {
            Value::String(s) => {
                let atom = s.atom();
                Some((s, atom))
            }
            _ => None,
        }
    }

    pub fn to_table(&self, idx: i32) -> Option<TableRef> {
        match self.value_at(idx) {
            Value::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn to_function(&self, idx: i32) -> Option<FunctionRef> {
        match self.value_at(idx) {
            Value::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn to_userdata(&self, idx: i32) -> Option<Rc<UserData>> {
        match self.value_at(idx) {
            Value::UserData(u) => Some(u),
            _ => None,
        }
    }

    pub fn to_light_userdata(&self, idx: i32) -> Option<LightUserData> {
        match self.value_at(idx) {
            Value::LightUserData(l) => Some(l),
            _ => None,
        }
    }

    pub fn to_thread(&self, idx: i32) -> Option<Thread> {
        match self.value_at(idx) {
            Value::Thread(t) => Some(t),
            _ => None,
        }
    }

    pub fn to_buffer(&self, idx: i32) -> Option<BufferRef> {
        match self.value_at(idx) {
            Value::Buffer(b) => Some(b),
            _ => None,
        }
    }

    pub fn raw_equal(&self, a: i32, b: i32) -> bool {
        match (self.get(a), self.get(b)) {
            (Some(a), Some(b)) => a.raw_equal(&b),
            _ => false,
        }
    }

    // ------------------------------------------------------------------
    // Userdata
    // ------------------------------------------------------------------

    fn push_userdata(&self, tag: u8, payload: Box<dyn Any>, dtor: Option<Rc<UserDataDtor>>) -> Rc<UserData> {
        let ud = Rc::new(UserData::new(tag, payload, dtor, Rc::downgrade(&self.0.global)));
        self.push(Value::UserData(ud.clone()));
        ud
    }

    /// Push an untagged userdata without a destructor.
    pub fn new_userdata<T: Any>(&self, payload: T) -> Rc<UserData> {
        self.push_userdata(UNTAGGED, Box::new(payload), None)
    }

    /// Push an untagged userdata whose destructor runs `dtor` on the payload.
    pub fn new_userdata_with_dtor<T: Any>(&self, payload: T, dtor: impl Fn(&mut T) + 'static) -> Rc<UserData> {
        let dtor: Rc<UserDataDtor> = Rc::new(move |p: &mut dyn Any| {
            if let Some(t) = p.downcast_mut::<T>() {
                dtor(t);
            }
        });
        self.push_userdata(UNTAGGED, Box::new(payload), Some(dtor))
    }

    /// Push a tagged userdata. The tag's registered destructor applies.
    pub fn new_userdata_tagged<T: Any>(&self, tag: u8, payload: T) -> Rc<UserData> {
        self.push_userdata(tag, Box::new(payload), None)
    }

    /// Push a tagged userdata with the tag's registered metatable attached.
    pub fn new_userdata_tagged_with_metatable<T: Any>(&self, tag: u8, payload: T) -> Rc<UserData> {
        let ud = self.new_userdata_tagged(tag, payload);
        ud.set_metatable(self.userdata_metatable(tag));
        ud
    }

    /// Register (or clear) the destructor for every userdata with `tag`.
    pub fn set_userdata_dtor(&self, tag: u8, dtor: Option<Rc<UserDataDtor>>) -> Result<(), VmError> {
        if tag == UNTAGGED || tag >= UTAG_LIMIT {
            return Err(VmError::runtime(format!("invalid userdata tag {}", tag)));
        }
        let old = {
            let mut dtors = self.0.global.tag_dtors.borrow_mut();
            match dtor {
                Some(d) => dtors.insert(tag, d),
                None => dtors.remove(&tag),
            }
        };
        drop(old);
        Ok(())
    }

    pub fn has_userdata_dtor(&self, tag: u8) -> bool {
        self.0.global.userdata_dtor(tag).is_some()
    }

    /// The destructor registered for `tag`, if any.
    pub fn userdata_dtor(&self, tag: u8) -> Option<Rc<UserDataDtor>> {
        self.0.global.userdata_dtor(tag)
    }

    /// Pop a table and register it as the metatable for `tag`.
    pub fn set_userdata_metatable(&self, tag: u8) -> Result<(), VmError> {
        if tag == UNTAGGED || tag >= UTAG_LIMIT {
            return Err(VmError::runtime(format!("invalid userdata tag {}", tag)));
        }
        match self.pop_value() {
            Value::Table(t) => {
                let old = self.0.global.tag_metatables.borrow_mut().insert(tag, t);
                drop(old);
                Ok(())
            }
            other => Err(VmError::runtime(format!(
                "userdata metatable must be a table, got {}",
                other.type_of()
            ))),
        }
    }

    /// The metatable registered for `tag`, without touching the stack.
    pub fn userdata_metatable(&self, tag: u8) -> Option<TableRef> {
        self.0.global.tag_metatables.borrow().get(&tag).cloned()
    }

    /// Push the metatable registered for `tag` (nil if none).
    pub fn get_userdata_metatable(&self, tag: u8) -> VmType {
        let metatable = self.userdata_metatable(tag);
        let value = metatable.map_or(Value::Nil, Value::Table);
        let ty = value.type_of();
        self.push(value);
        ty
    }

    // ------------------------------------------------------------------
    // Registry references
    // ------------------------------------------------------------------

    /// Pin the value at `idx` in the registry. Nil yields [`REF_NIL`].
    pub fn reference(&self, idx: i32) -> i32 {
        let value = self.value_at(idx);
        if value.is_nil() {
            return REF_NIL;
        }
        let g = &self.0.global;
        let reused = g.free_refs.borrow_mut().pop();
        let r = reused.unwrap_or_else(|| {
            let r = g.next_ref.get();
            g.next_ref.set(r + 1);
            r
        });
        let displaced = g.registry.borrow_mut().set_int(r as i64, value);
        drop(displaced);
        r
    }

    pub fn unref(&self, r: i32) -> bool {
        self.0.global.unref(r)
    }

    /// Push the value pinned under `r`.
    pub fn get_ref(&self, r: i32) -> VmType {
        let value = if r > 0 {
            self.0.global.registry.borrow().get_int(r as i64)
        } else {
            Value::Nil
        };
        let ty = value.type_of();
        self.push(value);
        ty
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    fn func_slot(&self, nargs: i32) -> Result<usize, VmError> {
        let len = self.len();
        let needed = nargs.max(0) as usize + 1;
        if nargs < 0 || len < self.base() + needed {
            return Err(VmError::InvalidIndex(-(nargs + 1)));
        }
        Ok(len - needed)
    }

    /// Call the value at `func` with every value above it as arguments.
    pub(crate) fn call_at(&self, func: usize, nresults: i32) -> Result<(), VmError> {
        let g = &self.0.global;
        if g.closed.get() {
            return Err(VmError::Closed);
        }
        if g.call_depth.get() >= g.options.max_call_depth {
            return Err(VmError::CallDepth);
        }
        if self.len() > g.options.max_stack_slots {
            return Err(VmError::StackOverflow);
        }

        let callee = self.stack_value(func);
        let f = match callee {
            Value::Function(f) => f,
            other => match self.metamethod(&other, "__call") {
                Some(Value::Function(f)) => {
                    self.0.stack.borrow_mut().insert(func, Value::Function(f.clone()));
                    f
                }
                _ => {
                    self.truncate(func);
                    return Err(VmError::runtime(format!("attempt to call a {} value", other.type_of())));
                }
            },
        };

        self.0.frames.borrow_mut().push(func + 1);
        g.call_depth.set(g.call_depth.get() + 1);
        let result = f.invoke(self);
        g.call_depth.set(g.call_depth.get() - 1);
        self.0.frames.borrow_mut().pop();

        match result {
            Ok(nret) => {
                let garbage = {
                    let mut stack = self.0.stack.borrow_mut();
                    let len = stack.len();
                    let from = func.min(len);
                    let nret = nret.min(len.saturating_sub(func + 1));
                    let mut results = stack.split_off(len - nret);
                    let mut garbage = stack.split_off(from);
                    if nresults >= 0 {
                        let wanted = nresults as usize;
                        if results.len() > wanted {
                            garbage.extend(results.split_off(wanted));
                        }
                        results.resize(wanted, Value::Nil);
                    }
                    stack.extend(results);
                    garbage
                };
                drop(garbage);
                Ok(())
            }
            Err(e) => {
                self.truncate(func);
                Err(e)
            }
        }
    }

    fn truncate(&self, len: usize) {
        let removed = {
            let mut stack = self.0.stack.borrow_mut();
            let at = len.min(stack.len());
            stack.split_off(at)
        };
        drop(removed);
    }

    /// Unprotected call. Errors propagate to the caller; an error escaping
    /// the outermost call also invokes the panic handler.
    pub fn call(&self, nargs: i32, nresults: i32) -> Result<(), VmError> {
        let func = self.func_slot(nargs)?;
        let outermost = self.0.global.call_depth.get() == 0;
        let result = self.call_at(func, nresults);
        if let Err(e) = &result {
            if outermost {
                self.0.global.raise_panic(e);
            }
        }
        result
    }

    /// Protected call. On error the stack holds the error value in place of
    /// the function and its arguments.
    pub fn pcall(&self, nargs: i32, nresults: i32) -> Result<(), VmError> {
        let func = self.func_slot(nargs)?;
        self.call_at(func, nresults).inspect_err(|e| {
            self.push(e.to_value());
        })
    }

    /// Call `f` with `args`, returning its first result.
    pub(crate) fn call_value(&self, f: Value, args: &[Value]) -> Result<Value, VmError> {
        let func = self.len();
        self.push(f);
        for arg in args {
            self.push(arg.clone());
        }
        self.call_at(func, 1)?;
        Ok(self.pop_value())
    }

    // ------------------------------------------------------------------
    // Threads
    // ------------------------------------------------------------------

    /// Create a thread sharing this VM's globals and registry, and push it.
    pub fn new_thread(&self) -> Thread {
        let thread = Thread::with_global(self.0.global.clone());
        {
            let mut threads = self.0.global.threads.borrow_mut();
            threads.retain(|w| w.strong_count() > 0);
            threads.push(Rc::downgrade(&thread.0));
        }
        self.push(Value::Thread(thread.clone()));
        thread
    }

    /// Run this thread's entry function (below the top `nargs` values) to
    /// completion. Returns the number of results left on the thread's stack.
    pub fn resume(&self, nargs: i32) -> Result<i32, VmError> {
        match self.status() {
            ThreadStatus::Ready => {}
            ThreadStatus::Running => return Err(VmError::runtime("cannot resume non-suspended coroutine")),
            ThreadStatus::Finished | ThreadStatus::Errored => {
                return Err(VmError::runtime("cannot resume dead coroutine"));
            }
        }
        let func = self.func_slot(nargs)?;
        self.0.status.set(ThreadStatus::Running);
        match self.call_at(func, MULTRET) {
            Ok(()) => {
                self.0.status.set(ThreadStatus::Finished);
                Ok(self.get_top())
            }
            Err(e) => {
                self.0.status.set(ThreadStatus::Errored);
                self.push(e.to_value());
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // Argument checking helpers for native functions
    // ------------------------------------------------------------------

    pub fn arg_error(&self, arg: i32, message: &str) -> VmError {
        VmError::runtime(format!("invalid argument #{} ({})", arg, message))
    }

    pub fn type_error(&self, arg: i32, expected: &str) -> VmError {
        self.arg_error(arg, &format!("{} expected, got {}", expected, self.type_name_at(arg)))
    }

    pub fn check_any(&self, arg: i32) -> Result<Value, VmError> {
        self.get(arg).ok_or_else(|| self.arg_error(arg, "value expected"))
    }

    pub fn check_number(&self, arg: i32) -> Result<f64, VmError> {
        self.to_number(arg).ok_or_else(|| self.type_error(arg, "number"))
    }

    pub fn check_string(&self, arg: i32) -> Result<VmString, VmError> {
        self.to_vm_string(arg).ok_or_else(|| self.type_error(arg, "string"))
    }

    pub fn check_table(&self, arg: i32) -> Result<TableRef, VmError> {
        self.to_table(arg).ok_or_else(|| self.type_error(arg, "table"))
    }

    pub fn opt_number(&self, arg: i32, default: f64) -> Result<f64, VmError> {
        if self.is_nil(arg) { Ok(default) } else { self.check_number(arg) }
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("vm", &self.vm_id())
            .field("top", &self.get_top())
            .field("status", &self.status())
            .finish()
    }
}

// ============================================================================
// VM owner
// ============================================================================

/// Owner of a VM. Dropping it (or calling [`Vm::close`]) closes the VM;
/// other thread handles stay usable as values but calls fail with
/// [`VmError::Closed`].
pub struct Vm {
    main: Thread,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_options(VmOptions::default())
    }

    pub fn with_options(options: VmOptions) -> Self {
        let global = Rc::new(GlobalState::new(options));
        let main = Thread::with_global(global.clone());
        *global.main.borrow_mut() = Rc::downgrade(&main.0);
        tracing::debug!(target: "variant_bridge_vm", vm = global.id, "created VM");
        Self { main }
    }

    pub fn main_thread(&self) -> &Thread {
        &self.main
    }

    pub fn close(&self) {
        self.main.0.global.close();
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for Vm {
    type Target = Thread;

    fn deref(&self) -> &Thread {
        &self.main
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Vm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Vm").field(&self.main).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn index_resolution() {
        let vm = Vm::new();
        vm.push_number(1.0);
        vm.push_number(2.0);
        assert_eq!(vm.get_top(), 2);
        assert_eq!(vm.to_number(1), Some(1.0));
        assert_eq!(vm.to_number(-1), Some(2.0));
        assert_eq!(vm.type_of(3), VmType::None);
        assert_eq!(vm.type_of(0), VmType::None);
        assert_eq!(vm.type_of(-3), VmType::None);
        assert_eq!(vm.type_of(REGISTRY_INDEX), VmType::Table);
        assert_eq!(vm.abs_index(-1), 2);
    }

    #[test]
    fn set_top_grows_and_shrinks() {
        let vm = Vm::new();
        vm.set_top(3);
        assert_eq!(vm.get_top(), 3);
        assert!(vm.is_nil(3));
        vm.pop(2);
        assert_eq!(vm.get_top(), 1);
        vm.set_top(0);
        assert_eq!(vm.get_top(), 0);
    }

    #[test]
    fn insert_remove_replace() {
        let vm = Vm::new();
        for n in [1.0, 2.0, 3.0] {
            vm.push_number(n);
        }
        vm.insert(1).unwrap();
        assert_eq!(vm.to_number(1), Some(3.0));
        vm.remove(1).unwrap();
        assert_eq!(vm.to_number(1), Some(1.0));
        vm.push_number(9.0);
        vm.replace(1).unwrap();
        assert_eq!(vm.to_number(1), Some(9.0));
        assert_eq!(vm.get_top(), 2);
        assert!(vm.insert(7).is_err());
    }

    #[test]
    fn check_stack_respects_limit() {
        let vm = Vm::with_options(VmOptions {
            max_stack_slots: 4,
            ..VmOptions::default()
        });
        assert!(vm.check_stack(4));
        vm.push_nil();
        assert!(!vm.check_stack(4));
        assert!(!vm.check_stack(-1));
    }

    #[test]
    fn calls_see_only_their_frame() {
        let vm = Vm::new();
        vm.push_number(100.0);
        vm.push_function("sum", |t: &Thread| {
            let a = t.check_number(1)?;
            let b = t.check_number(2)?;
            assert_eq!(t.get_top(), 2);
            t.push_number(a + b);
            Ok(1)
        });
        vm.push_number(2.0);
        vm.push_number(3.0);
        vm.call(2, 1).unwrap();
        assert_eq!(vm.get_top(), 2);
        assert_eq!(vm.to_number(-1), Some(5.0));
    }

    #[test]
    fn results_are_adjusted() {
        let vm = Vm::new();
        vm.push_function("three", |t: &Thread| {
            t.push_number(1.0);
            t.push_number(2.0);
            t.push_number(3.0);
            Ok(3)
        });
        vm.call(0, 1).unwrap();
        assert_eq!(vm.get_top(), 1);
        assert_eq!(vm.to_number(1), Some(1.0));

        vm.set_top(0);
        vm.push_function("none", |_: &Thread| Ok(0));
        vm.call(0, 2).unwrap();
        assert_eq!(vm.get_top(), 2);
        assert!(vm.is_nil(1));

        vm.set_top(0);
        vm.push_function("three", |t: &Thread| {
            t.push_number(1.0);
            t.push_number(2.0);
            Ok(2)
        });
        vm.call(0, MULTRET).unwrap();
        assert_eq!(vm.get_top(), 2);
    }

    #[test]
    fn pcall_leaves_error_value() {
        let vm = Vm::new();
        vm.push_function("fail", |_: &Thread| Err(VmError::runtime("nope")));
        vm.push_number(1.0);
        assert!(vm.pcall(1, 0).is_err());
        assert_eq!(vm.get_top(), 1);
        assert_eq!(vm.to_vm_string(-1).map(|s| s.to_string_lossy()), Some("nope".into()));
    }

    #[test]
    fn unprotected_error_reaches_panic_handler() {
        let vm = Vm::new();
        let panicked = Rc::new(Cell::new(false));
        let flag = panicked.clone();
        vm.set_panic_handler(move |_| flag.set(true));

        vm.push_function("inner", |t: &Thread| {
            t.push_function("fail", |_: &Thread| Err(VmError::runtime("deep")));
            // Errors inside a running call only propagate.
            assert!(t.call(0, 0).is_err());
            Ok(0)
        });
        vm.call(0, 0).unwrap();
        assert!(!panicked.get());

        vm.push_function("fail", |_: &Thread| Err(VmError::runtime("top")));
        assert!(vm.call(0, 0).is_err());
        assert!(panicked.get());
    }

    #[test]
    fn call_depth_is_limited() {
        fn recurse(t: &Thread) -> Result<usize, VmError> {
            t.push_function("recurse", recurse);
            t.call(0, 0)?;
            Ok(0)
        }
        let vm = Vm::with_options(VmOptions {
            max_call_depth: 10,
            ..VmOptions::default()
        });
        vm.push_function("recurse", recurse);
        assert!(matches!(vm.pcall(0, 0), Err(VmError::CallDepth)));
        assert_eq!(vm.global().call_depth.get(), 0);
    }

    #[test]
    fn calling_non_functions_fails() {
        let vm = Vm::new();
        vm.push_number(1.0);
        let err = vm.pcall(0, 0).unwrap_err();
        assert_eq!(err.to_string(), "attempt to call a number value");
    }

    #[test]
    fn registry_references() {
        let vm = Vm::new();
        vm.push_string("pinned");
        let r = vm.reference(-1);
        vm.pop(1);
        assert!(r > 0);
        assert_eq!(vm.get_ref(r), VmType::String);
        vm.pop(1);
        assert!(vm.unref(r));
        assert!(!vm.unref(r));
        assert_eq!(vm.get_ref(r), VmType::Nil);
        vm.push_nil();
        assert_eq!(vm.reference(-1), REF_NIL);
    }

    #[test]
    fn userdata_dtors_run_once() {
        let vm = Vm::new();
        let count = Rc::new(Cell::new(0));
        let c = count.clone();
        vm.new_userdata_with_dtor(5u32, move |v: &mut u32| {
            assert_eq!(*v, 5);
            c.set(c.get() + 1);
        });
        vm.pop(1);
        assert_eq!(count.get(), 1);
        vm.close();
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn tag_dtors_apply_to_tagged_userdata() {
        let vm = Vm::new();
        let count = Rc::new(Cell::new(0));
        let c = count.clone();
        vm.set_userdata_dtor(
            7,
            Some(Rc::new(move |_: &mut dyn Any| c.set(c.get() + 1))),
        )
        .unwrap();
        assert!(vm.has_userdata_dtor(7));
        vm.new_userdata_tagged(7, ());
        vm.new_userdata(());
        vm.pop(2);
        assert_eq!(count.get(), 1);
        assert!(vm.set_userdata_dtor(UNTAGGED, None).is_err());
    }

    #[test]
    fn close_breaks_cycles_and_runs_dtors() {
        let count = Rc::new(Cell::new(0));
        {
            let vm = Vm::new();
            let t = vm.new_table();
            let c = count.clone();
            vm.new_userdata_with_dtor((), move |_| c.set(c.get() + 1));
            let ud = vm.pop_value();
            t.borrow_mut().set_int(1, Value::Table(t.clone()));
            t.borrow_mut().set_int(2, ud);
            let r = vm.reference(-1);
            assert!(r > 0);
            vm.pop(1);
            assert_eq!(count.get(), 0);
        }
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn closed_vm_rejects_calls() {
        let vm = Vm::new();
        let thread = vm.new_thread();
        vm.close();
        assert!(thread.is_closed());
        thread.push_function("f", |_: &Thread| Ok(0));
        assert!(matches!(thread.pcall(0, 0), Err(VmError::Closed)));
        assert!(!vm.downgrade_vm().is_open());
    }

    #[test]
    fn threads_share_globals_and_resume_once() {
        let vm = Vm::new();
        let co = vm.new_thread();
        assert!(!co.is_main_thread());
        assert!(vm.is_main_thread());
        assert!(co.same_vm(&vm));

        co.push_function("double", |t: &Thread| {
            let n = t.check_number(1)?;
            t.push_number(n * 2.0);
            Ok(1)
        });
        co.push_number(21.0);
        assert_eq!(co.resume(1).unwrap(), 1);
        assert_eq!(co.to_number(-1), Some(42.0));
        assert_eq!(co.status(), ThreadStatus::Finished);
        assert!(co.resume(0).is_err());

        co.xmove(&vm, 1).unwrap();
        assert_eq!(vm.to_number(-1), Some(42.0));
    }

    #[test]
    fn thread_data_and_extensions() {
        #[derive(Default)]
        struct Counter(Cell<u32>);

        let vm = Vm::new();
        let co = vm.new_thread();
        vm.set_thread_data(42);
        assert_eq!(vm.thread_data(), 42);
        assert_eq!(co.thread_data(), 0);

        vm.extension::<Counter>().0.set(3);
        assert_eq!(co.extension::<Counter>().0.get(), 3);
    }

    #[test]
    fn user_atom_hook_tags_strings() {
        let vm = Vm::new();
        vm.set_user_atom(|bytes| if bytes == b"known" { 7 } else { -1 });
        vm.push_string("known");
        vm.push_string("other");
        assert_eq!(vm.to_string_atom(-2).map(|(_, a)| a), Some(7));
        assert_eq!(vm.to_string_atom(-1).map(|(_, a)| a), Some(-1));
        vm.push_number(1.0);
        assert!(vm.to_string_atom(-1).is_none());
    }
}

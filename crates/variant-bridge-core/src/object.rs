//! Host object registry.
//!
//! Objects live in a generational arena owned by the current host thread.
//! Every object is addressed by a stable 64-bit [`ObjectId`]; when an object
//! is destroyed its slot is reused under a new generation, so stale ids
//! resolve to `None` instead of to whatever took the slot.
//!
//! Two lifetime regimes coexist:
//!
//! - **Manually managed** objects ([`ObjectDb::register`]) live until
//!   [`ObjectDb::free`] is called.
//! - **Reference-counted** objects ([`ObjectDb::instantiate`]) live while
//!   their count is non-zero. [`ObjectRef`] is the owning handle; the VM side
//!   holds counts through [`ObjectDb::init_ref`] / [`ObjectDb::unreference`].

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use crate::error::CallError;
use crate::string_name::StringName;
use crate::variant::Variant;

// ============================================================================
// Object identity
// ============================================================================

/// Stable 64-bit identity of a host object.
///
/// Layout: `generation << 32 | (slot index + 1)`. Zero is the null identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ObjectId(u64);

impl ObjectId {
    pub const NULL: ObjectId = ObjectId(0);

    fn new(index: u32, generation: u32) -> Self {
        ObjectId(((generation as u64) << 32) | (index as u64 + 1))
    }

    pub const fn from_raw(raw: u64) -> Self {
        ObjectId(raw)
    }

    pub const fn to_raw(self) -> u64 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    fn slot(self) -> Option<(usize, u32)> {
        let low = (self.0 & 0xFFFF_FFFF) as u32;
        if low == 0 {
            return None;
        }
        Some(((low - 1) as usize, (self.0 >> 32) as u32))
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({:#x})", self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Host object interface
// ============================================================================

/// Behaviour every registered host object provides.
///
/// Only `class_name` is required; the keyed access and method call hooks
/// default to "not supported".
pub trait HostObject: 'static {
    fn class_name(&self) -> &str;

    fn to_display_string(&self, id: ObjectId) -> String {
        format!("<{}#{}>", self.class_name(), id)
    }

    /// Property read by key.
    fn get(&self, _key: &Variant) -> Option<Variant> {
        None
    }

    /// Property write by key. Returns false if the key is not writable.
    fn set(&self, _key: &Variant, _value: &Variant) -> bool {
        false
    }

    fn has_method(&self, _method: &StringName) -> bool {
        false
    }

    fn call(&self, _method: &StringName, _args: &[Variant]) -> Result<Variant, CallError> {
        Err(CallError::InvalidMethod)
    }
}

// ============================================================================
// Registry
// ============================================================================

struct ObjectSlot {
    generation: u32,
    object: Option<Rc<dyn HostObject>>,
    any: Option<Rc<dyn Any>>,
    ref_count: u32,
    ref_counted: bool,
}

/// Handles pulled out of a slot on destruction.
///
/// They are dropped only after the registry borrow is released, so an
/// object's destructor may itself use the registry.
struct Removed(Option<Rc<dyn HostObject>>, Option<Rc<dyn Any>>);

/// The per-thread object registry.
///
/// All access goes through the associated functions, which borrow the
/// thread-local instance only for the duration of a single slot operation.
pub struct ObjectDb {
    slots: Vec<ObjectSlot>,
    free_list: Vec<u32>,
}

thread_local! {
    static OBJECT_DB: RefCell<ObjectDb> = RefCell::new(ObjectDb {
        slots: Vec::new(),
        free_list: Vec::new(),
    });
}

impl ObjectDb {
    fn with<R>(f: impl FnOnce(&mut ObjectDb) -> R) -> Option<R> {
        OBJECT_DB.try_with(|db| f(&mut db.borrow_mut())).ok()
    }

    fn insert(&mut self, object: Rc<dyn HostObject>, any: Rc<dyn Any>, ref_counted: bool) -> ObjectId {
        if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            slot.object = Some(object);
            slot.any = Some(any);
            slot.ref_count = 0;
            slot.ref_counted = ref_counted;
            ObjectId::new(index, slot.generation)
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(ObjectSlot {
                generation: 0,
                object: Some(object),
                any: Some(any),
                ref_count: 0,
                ref_counted,
            });
            ObjectId::new(index, 0)
        }
    }

    fn slot(&self, id: ObjectId) -> Option<&ObjectSlot> {
        let (index, generation) = id.slot()?;
        let slot = self.slots.get(index)?;
        (slot.generation == generation && slot.object.is_some()).then_some(slot)
    }

    fn slot_mut(&mut self, id: ObjectId) -> Option<&mut ObjectSlot> {
        let (index, generation) = id.slot()?;
        let slot = self.slots.get_mut(index)?;
        (slot.generation == generation && slot.object.is_some()).then_some(slot)
    }

    fn remove(&mut self, id: ObjectId) -> Option<Removed> {
        let (index, _) = id.slot()?;
        let slot = self.slot_mut(id)?;
        let removed = Removed(slot.object.take(), slot.any.take());
        slot.generation = slot.generation.wrapping_add(1);
        slot.ref_count = 0;
        self.free_list.push(index as u32);
        Some(removed)
    }

    fn make<T: HostObject>(object: T) -> (Rc<dyn HostObject>, Rc<dyn Any>) {
        let rc = Rc::new(object);
        let any: Rc<dyn Any> = rc.clone();
        (rc, any)
    }

    /// Register a manually managed object. It lives until [`ObjectDb::free`].
    pub fn register<T: HostObject>(object: T) -> ObjectId {
        let (object, any) = Self::make(object);
        Self::with(|db| db.insert(object, any, false)).unwrap_or(ObjectId::NULL)
    }

    /// Register a reference-counted object and return its first owning reference.
    pub fn instantiate<T: HostObject>(object: T) -> ObjectRef {
        let (object, any) = Self::make(object);
        let id = Self::with(|db| {
            let id = db.insert(object, any, true);
            if let Some(slot) = db.slot_mut(id) {
                slot.ref_count = 1;
            }
            id
        })
        .unwrap_or(ObjectId::NULL);
        ObjectRef {
            id,
            counted: !id.is_null(),
        }
    }

    /// Resolve an identity to a live object.
    pub fn get(id: ObjectId) -> Option<Rc<dyn HostObject>> {
        Self::with(|db| db.slot(id).and_then(|s| s.object.clone())).flatten()
    }

    /// Resolve an identity to a live object of concrete type `T`.
    pub fn get_as<T: HostObject>(id: ObjectId) -> Option<Rc<T>> {
        let any = Self::with(|db| db.slot(id).and_then(|s| s.any.clone())).flatten()?;
        any.downcast::<T>().ok()
    }

    pub fn is_alive(id: ObjectId) -> bool {
        Self::with(|db| db.slot(id).is_some()).unwrap_or(false)
    }

    /// Whether the object participates in reference counting. `None` if destroyed.
    pub fn is_ref_counted(id: ObjectId) -> Option<bool> {
        Self::with(|db| db.slot(id).map(|s| s.ref_counted)).flatten()
    }

    pub fn ref_count(id: ObjectId) -> Option<u32> {
        Self::with(|db| db.slot(id).filter(|s| s.ref_counted).map(|s| s.ref_count)).flatten()
    }

    /// Acquire one reference. Fails for destroyed or manually managed objects.
    pub fn init_ref(id: ObjectId) -> bool {
        Self::with(|db| match db.slot_mut(id) {
            Some(slot) if slot.ref_counted && slot.ref_count > 0 => {
                slot.ref_count = slot.ref_count.saturating_add(1);
                true
            }
            _ => false,
        })
        .unwrap_or(false)
    }

    /// Release one reference, destroying the object when the count reaches zero.
    ///
    /// Returns true if the object was destroyed.
    pub fn unreference(id: ObjectId) -> bool {
        let removed = Self::with(|db| {
            let slot = db.slot_mut(id)?;
            if !slot.ref_counted {
                return None;
            }
            slot.ref_count = slot.ref_count.saturating_sub(1);
            if slot.ref_count == 0 {
                db.remove(id)
            } else {
                None
            }
        })
        .flatten();
        let freed = removed.is_some();
        drop(removed);
        freed
    }

    /// Destroy an object immediately regardless of its reference count.
    pub fn free(id: ObjectId) -> bool {
        let removed = Self::with(|db| db.remove(id)).flatten();
        let freed = removed.is_some();
        drop(removed);
        freed
    }

    /// Number of live objects on this thread.
    pub fn live_count() -> usize {
        Self::with(|db| db.slots.iter().filter(|s| s.object.is_some()).count()).unwrap_or(0)
    }
}

impl fmt::Debug for ObjectDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectDb")
            .field("slot_count", &self.slots.len())
            .field("free_count", &self.free_list.len())
            .finish()
    }
}

// ============================================================================
// Owning handle
// ============================================================================

/// A handle to a host object.
///
/// For reference-counted objects the handle owns one count: cloning acquires
/// another, dropping releases it. Manually managed objects are referenced
/// without ownership.
pub struct ObjectRef {
    id: ObjectId,
    counted: bool,
}

impl ObjectRef {
    /// Reference a live object, acquiring a count if it is reference counted.
    pub fn new(id: ObjectId) -> Option<Self> {
        match ObjectDb::is_ref_counted(id)? {
            true => ObjectDb::init_ref(id).then_some(ObjectRef { id, counted: true }),
            false => Some(ObjectRef { id, counted: false }),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Whether this handle keeps the object alive.
    pub fn is_owning(&self) -> bool {
        self.counted
    }

    pub fn is_alive(&self) -> bool {
        ObjectDb::is_alive(self.id)
    }

    pub fn get(&self) -> Option<Rc<dyn HostObject>> {
        ObjectDb::get(self.id)
    }

    pub fn cast<T: HostObject>(&self) -> Option<Rc<T>> {
        ObjectDb::get_as::<T>(self.id)
    }
}

impl Clone for ObjectRef {
    fn clone(&self) -> Self {
        let counted = self.counted && ObjectDb::init_ref(self.id);
        ObjectRef {
            id: self.id,
            counted,
        }
    }
}

impl Drop for ObjectRef {
    fn drop(&mut self) {
        if self.counted {
            ObjectDb::unreference(self.id);
        }
    }
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ObjectRef {}

impl Hash for ObjectRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectRef")
            .field("id", &self.id)
            .field("counted", &self.counted)
            .finish()
    }
}

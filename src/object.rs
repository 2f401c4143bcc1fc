//! Object identity bridge.
//!
//! Host objects cross into the VM by [`ObjectId`]. Three representations
//! exist:
//!
//! - full userdata with the shared object metatable ([`push_object`]),
//! - full userdata with a per-tag destructor and metatable
//!   ([`push_object_tagged`]),
//! - light userdata carrying the raw id ([`push_object_light`]).
//!
//! A full userdata holding a reference-counted object owns one reference,
//! released when the VM collects the userdata. Conversion back resolves the
//! id against the live object registry, so a freed object reads as `None`.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use rustc_hash::FxHashMap;
use variant_bridge_core::{Callable, HostObject, ObjectDb, ObjectId, ObjectRef, StringName, Variant};
use variant_bridge_vm::{Thread, UNTAGGED, UserData, UserDataDtor, Value, VmError};

use crate::callable::push_callable;
use crate::error::{BridgeError, BridgeResult};
use crate::stack::{
    MetaMethods, StackGuard, bridge_metatable, expect_index, find_metatable, reserve, same_table,
};
use crate::variant::{push_host_value, to_host_value};

/// Registry name of the shared object metatable.
pub const OBJECT_METATABLE: &str = "variant_bridge.Object";

/// Userdata payload for a host object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectHandle {
    pub id: ObjectId,
    /// Whether this handle holds one reference on the object.
    pub owning: bool,
}

impl ObjectHandle {
    fn release(&mut self) {
        if self.owning {
            self.owning = false;
            ObjectDb::unreference(self.id);
        }
    }
}

fn release_tagged(payload: &mut dyn Any) {
    if let Some(handle) = payload.downcast_mut::<ObjectHandle>() {
        handle.release();
    }
}

/// Per-VM record of the tag destructors installed by the bridge.
#[derive(Default)]
struct TagReleases {
    installed: RefCell<FxHashMap<u8, Rc<UserDataDtor>>>,
}

/// Make sure userdata with `tag` release their object reference.
///
/// A destructor the host registered for the tag keeps running after the
/// release.
fn install_tag_release(thread: &Thread, tag: u8) -> BridgeResult<()> {
    let current = thread.userdata_dtor(tag);
    let releases = thread.extension::<TagReleases>();
    let ours = releases.installed.borrow().get(&tag).cloned();
    if let (Some(current), Some(ours)) = (&current, &ours) {
        if Rc::ptr_eq(current, ours) {
            return Ok(());
        }
    }
    let dtor: Rc<UserDataDtor> = match current {
        Some(previous) => Rc::new(move |payload: &mut dyn Any| {
            release_tagged(payload);
            previous(payload);
        }),
        None => Rc::new(release_tagged),
    };
    thread.set_userdata_dtor(tag, Some(dtor.clone()))?;
    releases.installed.borrow_mut().insert(tag, dtor);
    Ok(())
}

/// Take a reference on `id` if it is reference counted.
///
/// `None` if the object is gone or its count could not be raised.
fn acquire(id: ObjectId) -> Option<ObjectHandle> {
    let owning = match ObjectDb::is_ref_counted(id)? {
        true => ObjectDb::init_ref(id).then_some(true)?,
        false => false,
    };
    Some(ObjectHandle { id, owning })
}

/// Push `id` as a full userdata with the shared object metatable.
///
/// A dead object, or one whose reference cannot be acquired, pushes nil.
#[cfg_attr(feature = "profiling", profiling::function)]
pub fn push_object(thread: &Thread, id: ObjectId) -> BridgeResult<()> {
    reserve(thread, 2)?;
    let metatable = bridge_metatable(thread, OBJECT_METATABLE, OBJECT_METHODS)?;
    let Some(handle) = acquire(id) else {
        thread.push_nil();
        return Ok(());
    };
    let guard = StackGuard::new(thread);
    if handle.owning {
        thread.new_userdata_with_dtor(handle, ObjectHandle::release);
    } else {
        thread.new_userdata(handle);
    }
    thread.push(Value::Table(metatable));
    thread.set_metatable(-2)?;
    guard.commit();
    Ok(())
}

/// Push `id` as a tagged userdata.
///
/// The bridge's release is installed as the tag's destructor on first use,
/// ahead of any destructor the host registered; the metatable is whatever
/// the host registered for the tag with
/// [`Thread::set_userdata_metatable`]. [`UNTAGGED`] falls back to
/// [`push_object`].
#[cfg_attr(feature = "profiling", profiling::function)]
pub fn push_object_tagged(thread: &Thread, id: ObjectId, tag: u8) -> BridgeResult<()> {
    if tag == UNTAGGED {
        return push_object(thread, id);
    }
    reserve(thread, 1)?;
    install_tag_release(thread, tag)?;
    match acquire(id) {
        Some(handle) => {
            thread.new_userdata_tagged_with_metatable(tag, handle);
        }
        None => thread.push_nil(),
    }
    Ok(())
}

/// Push `id` as light userdata. No reference is taken.
pub fn push_object_light(thread: &Thread, id: ObjectId, tag: u8) -> BridgeResult<()> {
    reserve(thread, 1)?;
    let ptr = usize::try_from(id.to_raw()).map_err(|_| BridgeError::UnsupportedType("object id"))?;
    thread.push_light_userdata(ptr, tag);
    Ok(())
}

/// Resolve the object at `idx`.
///
/// Full userdata must carry the bridge's object metatable (shared or
/// per-tag); light userdata is taken at face value. Returns `None` for
/// other values and for objects that no longer exist.
#[cfg_attr(feature = "profiling", profiling::function)]
pub fn to_object(thread: &Thread, idx: i32) -> Option<ObjectRef> {
    if !expect_index(thread, idx, "to_object") {
        return None;
    }
    match thread.value_at(idx) {
        Value::LightUserData(light) => ObjectRef::new(ObjectId::from_raw(light.ptr as u64)),
        Value::UserData(ud) => userdata_object(thread, &ud),
        _ => None,
    }
}

pub(crate) fn userdata_object(thread: &Thread, ud: &UserData) -> Option<ObjectRef> {
    let handle = ud.get::<ObjectHandle>()?;
    let expected = match ud.tag() {
        UNTAGGED => find_metatable(thread, OBJECT_METATABLE),
        tag => thread.userdata_metatable(tag),
    };
    let actual = ud.metatable();
    let matches = match ud.tag() {
        UNTAGGED => same_table(actual.as_ref(), expected.as_ref()),
        _ => actual.is_none() && expected.is_none() || same_table(actual.as_ref(), expected.as_ref()),
    };
    if !matches {
        return None;
    }
    ObjectRef::new(handle.id)
}

/// Id behind an object userdata or light userdata, without liveness checks.
fn raw_id(thread: &Thread, idx: i32) -> Option<ObjectId> {
    match thread.value_at(idx) {
        Value::LightUserData(light) => Some(ObjectId::from_raw(light.ptr as u64)),
        Value::UserData(ud) => ud.get::<ObjectHandle>().map(|h| h.id),
        _ => None,
    }
}

fn live_object(thread: &Thread) -> Result<(ObjectId, Rc<dyn HostObject>), VmError> {
    let id = raw_id(thread, 1).ok_or_else(|| thread.type_error(1, "Object"))?;
    let object = ObjectDb::get(id).ok_or_else(|| VmError::runtime("attempt to use a freed object"))?;
    Ok((id, object))
}

// ============================================================================
// Metamethods
// ============================================================================

const OBJECT_METHODS: MetaMethods = &[
    ("__tostring", object_tostring),
    ("__concat", object_concat),
    ("__eq", object_eq),
    ("__lt", object_lt),
    ("__le", object_le),
    ("__index", object_index),
    ("__newindex", object_newindex),
];

fn object_tostring(t: &Thread) -> Result<usize, VmError> {
    let id = raw_id(t, 1).ok_or_else(|| t.type_error(1, "Object"))?;
    let text = match ObjectDb::get(id) {
        Some(object) => object.to_display_string(id),
        None => "<Freed Object>".to_owned(),
    };
    t.push_string(&text);
    Ok(1)
}

fn object_concat(t: &Thread) -> Result<usize, VmError> {
    let mut text = t.to_display_string(1)?;
    text.push_str(&t.to_display_string(2)?);
    t.push_string(&text);
    Ok(1)
}

fn object_eq(t: &Thread) -> Result<usize, VmError> {
    let equal = match (raw_id(t, 1), raw_id(t, 2)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    };
    t.push_boolean(equal);
    Ok(1)
}

fn ordered_ids(t: &Thread) -> Result<(u64, u64), VmError> {
    match (raw_id(t, 1), raw_id(t, 2)) {
        (Some(a), Some(b)) => Ok((a.to_raw(), b.to_raw())),
        _ => Err(VmError::runtime(format!(
            "attempt to compare {} with {}",
            t.type_name_at(1),
            t.type_name_at(2)
        ))),
    }
}

fn object_lt(t: &Thread) -> Result<usize, VmError> {
    let (a, b) = ordered_ids(t)?;
    t.push_boolean(a < b);
    Ok(1)
}

fn object_le(t: &Thread) -> Result<usize, VmError> {
    let (a, b) = ordered_ids(t)?;
    t.push_boolean(a <= b);
    Ok(1)
}

/// Properties first, then methods as bound callables, else nil.
fn object_index(t: &Thread) -> Result<usize, VmError> {
    let (id, object) = live_object(t)?;
    let key = to_host_value(t, 2);
    if let Some(value) = object.get(&key) {
        drop(object);
        push_host_value(t, &value)?;
        return Ok(1);
    }
    if let Some(name) = key.as_str().map(StringName::new) {
        if object.has_method(&name) {
            drop(object);
            push_callable(t, &Callable::from_method(id, name))?;
            return Ok(1);
        }
    }
    t.push_nil();
    Ok(1)
}

fn object_newindex(t: &Thread) -> Result<usize, VmError> {
    let (_, object) = live_object(t)?;
    let key = to_host_value(t, 2);
    let value = to_host_value(t, 3);
    if object.set(&key, &value) {
        Ok(0)
    } else {
        Err(VmError::runtime(format!(
            "cannot set '{}' on {}",
            key,
            object.class_name()
        )))
    }
}

/// Convenience for hosts: push an object reference as a [`Variant`].
pub fn push_object_ref(thread: &Thread, object: &ObjectRef) -> BridgeResult<()> {
    push_host_value(thread, &Variant::Object(object.clone()))
}

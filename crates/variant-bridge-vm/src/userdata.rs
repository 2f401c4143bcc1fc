//! Full userdata: a host payload owned by the VM.

use std::any::Any;
use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::rc::{Rc, Weak};

use crate::state::GlobalState;
use crate::value::TableRef;

/// Destructor run on a userdata payload when the VM releases it.
pub type UserDataDtor = dyn Fn(&mut dyn Any);

/// Tag assigned to userdata created without an explicit tag.
pub const UNTAGGED: u8 = 0;

/// Highest tag usable with per-tag destructors and metatables.
pub const UTAG_LIMIT: u8 = 128;

/// A VM-owned block holding a host payload.
///
/// The destructor runs exactly once, when the last VM reference is dropped
/// (or when the VM closes). A per-instance destructor takes precedence over
/// the per-tag destructor registered for the userdata's tag.
pub struct UserData {
    tag: u8,
    payload: RefCell<Option<Box<dyn Any>>>,
    metatable: RefCell<Option<TableRef>>,
    dtor: Option<Rc<UserDataDtor>>,
    global: Weak<GlobalState>,
}

impl UserData {
    pub(crate) fn new(
        tag: u8,
        payload: Box<dyn Any>,
        dtor: Option<Rc<UserDataDtor>>,
        global: Weak<GlobalState>,
    ) -> Self {
        Self {
            tag,
            payload: RefCell::new(Some(payload)),
            metatable: RefCell::new(None),
            dtor,
            global,
        }
    }

    pub fn tag(&self) -> u8 {
        self.tag
    }

    /// True if the payload is a `T`.
    pub fn is<T: Any>(&self) -> bool {
        self.payload.borrow().as_ref().is_some_and(|p| p.is::<T>())
    }

    /// Borrow the payload as a `T`.
    pub fn borrow<T: Any>(&self) -> Option<Ref<'_, T>> {
        Ref::filter_map(self.payload.borrow(), |p| p.as_ref().and_then(|b| b.downcast_ref::<T>())).ok()
    }

    /// Mutably borrow the payload as a `T`.
    pub fn borrow_mut<T: Any>(&self) -> Option<RefMut<'_, T>> {
        RefMut::filter_map(self.payload.borrow_mut(), |p| p.as_mut().and_then(|b| b.downcast_mut::<T>())).ok()
    }

    /// Clone the payload out, releasing the borrow before returning.
    pub fn get<T: Any + Clone>(&self) -> Option<T> {
        self.borrow::<T>().map(|r| r.clone())
    }

    pub fn metatable(&self) -> Option<TableRef> {
        self.metatable.borrow().clone()
    }

    pub(crate) fn set_metatable(&self, metatable: Option<TableRef>) -> Option<TableRef> {
        self.metatable.replace(metatable)
    }
}

impl Drop for UserData {
    fn drop(&mut self) {
        let Some(mut payload) = self.payload.get_mut().take() else {
            return;
        };
        let dtor = self
            .dtor
            .take()
            .or_else(|| self.global.upgrade().and_then(|g| g.userdata_dtor(self.tag)));
        if let Some(dtor) = dtor {
            dtor(payload.as_mut());
        }
    }
}

impl fmt::Debug for UserData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserData")
            .field("tag", &self.tag)
            .field("has_metatable", &self.metatable.borrow().is_some())
            .finish_non_exhaustive()
    }
}

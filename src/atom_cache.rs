//! Process-wide string atom cache.
//!
//! A fixed-size, append-only interning table. A name hashes to exactly one
//! slot; the first name to land in a slot claims it for the lifetime of the
//! cache and its slot index becomes its atom. A different name hashing to a
//! claimed slot gets no atom (`-1`) and callers fall back to uncached
//! behaviour. Slots are never evicted, so a name or byte buffer handed out
//! stays valid for as long as the caller holds it.
//!
//! The table sits behind a single mutex held only for one slot read-or-claim.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use variant_bridge_core::StringName;
use xxhash_rust::xxh64::xxh64;

/// Slot count of the process-wide cache.
pub const ATOM_TABLE_SIZE: usize = 4096;

/// Atom value meaning "no atom".
pub const NO_ATOM: i16 = -1;

const MAX_TABLE_SIZE: usize = i16::MAX as usize + 1;

struct AtomSlot {
    name: StringName,
    utf8: Option<Arc<[u8]>>,
}

pub struct AtomCache {
    slots: Mutex<Vec<Option<AtomSlot>>>,
    mask: usize,
}

static SINGLETON: RwLock<Option<Arc<AtomCache>>> = RwLock::new(None);

impl AtomCache {
    /// Create a cache with `size` slots, rounded up to a power of two and
    /// clamped to the range atoms can address.
    pub fn with_capacity(size: usize) -> Self {
        let size = size.clamp(1, MAX_TABLE_SIZE).next_power_of_two();
        let mut slots = Vec::with_capacity(size);
        slots.resize_with(size, || None);
        Self {
            slots: Mutex::new(slots),
            mask: size - 1,
        }
    }

    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    fn slot_for(&self, bytes: &[u8]) -> usize {
        xxh64(bytes, 0) as usize & self.mask
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Option<AtomSlot>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Atom for `bytes`, claiming a free slot if needed.
    ///
    /// Returns [`NO_ATOM`] for empty or non-UTF-8 input and on a collision
    /// with a different name.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn create_atom(&self, bytes: &[u8]) -> i16 {
        if bytes.is_empty() {
            return NO_ATOM;
        }
        let Ok(text) = std::str::from_utf8(bytes) else {
            return NO_ATOM;
        };
        let index = self.slot_for(bytes);
        let mut slots = self.lock();
        match &slots[index] {
            Some(slot) if slot.name.as_str() == text => index as i16,
            Some(_) => NO_ATOM,
            None => {
                slots[index] = Some(AtomSlot {
                    name: StringName::new(text),
                    utf8: None,
                });
                index as i16
            }
        }
    }

    /// Name interned under `atom`, if any.
    pub fn name_for_atom(&self, atom: i16) -> Option<StringName> {
        let index = usize::try_from(atom).ok().filter(|&i| i <= self.mask)?;
        self.lock()[index].as_ref().map(|slot| slot.name.clone())
    }

    /// UTF-8 bytes of `name`, encoded once and cached in the name's slot.
    ///
    /// On a collision the bytes are still produced but not cached.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn char_string_for(&self, name: &StringName) -> Arc<[u8]> {
        let bytes = name.as_str().as_bytes();
        if bytes.is_empty() {
            return Arc::from(bytes);
        }
        let index = self.slot_for(bytes);
        let mut slots = self.lock();
        let slot = slots[index].get_or_insert_with(|| AtomSlot {
            name: name.clone(),
            utf8: None,
        });
        if slot.name != *name {
            return Arc::from(bytes);
        }
        slot.utf8.get_or_insert_with(|| Arc::from(bytes)).clone()
    }

    /// The process-wide cache, if the module is initialized.
    pub fn singleton() -> Option<Arc<AtomCache>> {
        SINGLETON.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Install the process-wide cache. Returns false if one already exists.
    pub(crate) fn install() -> bool {
        let mut singleton = SINGLETON.write().unwrap_or_else(PoisonError::into_inner);
        if singleton.is_some() {
            return false;
        }
        *singleton = Some(Arc::new(AtomCache::with_capacity(ATOM_TABLE_SIZE)));
        true
    }

    /// Remove the process-wide cache. Outstanding handles keep it alive.
    pub(crate) fn uninstall() -> bool {
        SINGLETON.write().unwrap_or_else(PoisonError::into_inner).take().is_some()
    }
}

impl std::fmt::Debug for AtomCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let used = self.lock().iter().filter(|s| s.is_some()).count();
        f.debug_struct("AtomCache")
            .field("capacity", &self.capacity())
            .field("used", &used)
            .finish()
    }
}

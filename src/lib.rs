//! Bidirectional marshalling between host [`Variant`]s and the values of an
//! embedded Lua-family VM.
//!
//! The entry points are [`to_host_value`] and [`push_host_value`]; the
//! container, object and invocable bridges they dispatch to are public for
//! callers that already know the shape they expect.
//!
//! ```
//! use variant_bridge::{push_host_value, to_host_value};
//! use variant_bridge_core::{Dictionary, Variant};
//! use variant_bridge_vm::Vm;
//!
//! variant_bridge::initialize();
//! let vm = Vm::new();
//! let mut map = Dictionary::new();
//! map.insert("name", "Alice");
//! map.insert("count", 3);
//! push_host_value(&vm, &Variant::from(map.clone())).unwrap();
//! assert_eq!(to_host_value(&vm, -1), Variant::from(map));
//! ```

pub mod atom_cache;
pub mod callable;
pub mod error;
pub mod map;
pub mod object;
pub mod sequence;
pub mod session;
pub mod stack;
pub mod variant;
pub mod weak_callable;

pub use atom_cache::{ATOM_TABLE_SIZE, AtomCache, NO_ATOM};
pub use callable::{CALLABLE_METATABLE, LuaCallable, push_callable, to_callable};
pub use error::{BridgeError, BridgeResult};
pub use map::{push_map, to_map};
pub use object::{
    OBJECT_METATABLE, ObjectHandle, push_object, push_object_light, push_object_ref, push_object_tagged,
    to_object,
};
pub use sequence::{is_sequence, push_sequence, to_sequence};
pub use session::{VmSession, session_for_thread};
pub use stack::{StackGuard, check_index, is_valid_index, reserve};
pub use variant::{
    HostValue, MAX_CONVERSION_DEPTH, TO_VARIANT_EVENT, VARIANT_METATABLE, push_host_value, push_opaque,
    to_host_value, to_host_value_as, to_opaque,
};
pub use weak_callable::WeaklyBoundCallable;

/// Install the process-wide services. Returns false if already initialized.
pub fn initialize() -> bool {
    let installed = AtomCache::install();
    if installed {
        tracing::debug!(target: "variant_bridge", "initialized");
    }
    installed
}

/// Tear down the process-wide services. Returns false if not initialized.
pub fn uninitialize() -> bool {
    let removed = AtomCache::uninstall();
    if removed {
        tracing::debug!(target: "variant_bridge", "uninitialized");
    }
    removed
}

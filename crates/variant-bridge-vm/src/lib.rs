//! A small Lua-family virtual machine with a C-API-shaped stack interface.
//!
//! The VM runs native functions only: every function value is a Rust closure
//! that reads its arguments from the stack of the [`Thread`] it runs on and
//! pushes its results. On top of that it provides what an embedding bridge
//! needs: tables with metatables, a registry with integer references, tagged
//! userdata with destructors, light userdata, vectors, buffers, threads,
//! protected calls, a panic handler and a string atom hook.
//!
//! # Example
//!
//! ```
//! use variant_bridge_vm::{LibraryFlags, Thread, Vm};
//!
//! let vm = Vm::new();
//! vm.open_libs(LibraryFlags::ALL).unwrap();
//! vm.push_function("add", |t: &Thread| {
//!     let sum = t.check_number(1)? + t.check_number(2)?;
//!     t.push_number(sum);
//!     Ok(1)
//! });
//! vm.push_number(2.0);
//! vm.push_number(3.0);
//! vm.pcall(2, 1).unwrap();
//! assert_eq!(vm.to_number(-1), Some(5.0));
//! ```

pub mod error;
pub mod function;
pub mod meta;
pub mod state;
pub mod stdlib;
pub mod table;
pub mod userdata;
pub mod value;

pub use error::VmError;
pub use function::{FunctionRef, NativeCallable, NativeFunction};
pub use meta::{ArithOp, CompareOp, MAX_META_CHAIN};
pub use state::{
    GLOBALS_INDEX, MULTRET, REF_NIL, REGISTRY_INDEX, Thread, ThreadStatus, Vm, VmOptions, WeakVm,
};
pub use stdlib::LibraryFlags;
pub use table::Table;
pub use userdata::{UNTAGGED, UTAG_LIMIT, UserData, UserDataDtor};
pub use value::{BufferRef, LightUserData, TableRef, Value, VmString, VmType, format_number};

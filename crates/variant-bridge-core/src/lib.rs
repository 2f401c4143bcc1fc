//! Host value model for the variant bridge.
//!
//! This crate defines the dynamically typed [`Variant`] together with the
//! containers, object registry and invocables it can carry:
//!
//! - [`Variant`] / [`VariantType`]: the tagged host value
//! - [`Array`] and [`Dictionary`]: host sequences and maps
//! - [`ObjectDb`] / [`ObjectRef`] / [`HostObject`]: identity-addressed objects
//! - [`Callable`] / [`CallableCustom`]: host invocables
//! - [`ops`]: operator evaluation used by the VM metamethods
//! - [`messages`]: error/warning reporting
//!
//! Nothing here knows about the VM; the bridge crate builds on top of it.

pub mod array;
pub mod callable;
pub mod convert;
pub mod dictionary;
pub mod error;
mod iter;
mod keyed;
pub mod math;
pub mod messages;
pub mod object;
pub mod ops;
pub mod string_name;
pub mod variant;

pub use array::Array;
pub use callable::{Callable, CallableCustom, CallableFn};
pub use convert::{FromVariant, IntoVariant};
pub use dictionary::Dictionary;
pub use error::{CallError, ConversionError};
pub use math::{Color, Vector2, Vector3};
pub use messages::{print_error, print_info, print_warning, Message, MessageCapture, MessageType};
pub use object::{HostObject, ObjectDb, ObjectId, ObjectRef};
pub use ops::{evaluate, VariantOperator};
pub use string_name::StringName;
pub use variant::{Variant, VariantType};

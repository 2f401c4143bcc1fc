//! Conversion traits between Rust values and [`Variant`].
//!
//! - [`FromVariant`]: extract a Rust value from a variant
//! - [`IntoVariant`]: wrap a Rust value as a variant
//!
//! ```ignore
//! let v = 42i32.into_variant();
//! let back: i32 = i32::from_variant(&v)?;
//! ```

use crate::array::Array;
use crate::callable::Callable;
use crate::dictionary::Dictionary;
use crate::error::ConversionError;
use crate::math::{Color, Vector2, Vector3};
use crate::object::ObjectRef;
use crate::string_name::StringName;
use crate::variant::Variant;

/// Extract a value from a [`Variant`].
pub trait FromVariant: Sized {
    fn from_variant(v: &Variant) -> Result<Self, ConversionError>;
}

/// Convert a value into a [`Variant`].
pub trait IntoVariant {
    fn into_variant(self) -> Variant;
}

impl<T: Into<Variant>> IntoVariant for T {
    fn into_variant(self) -> Variant {
        self.into()
    }
}

fn mismatch(expected: &'static str, v: &Variant) -> ConversionError {
    ConversionError::TypeMismatch {
        expected,
        actual: v.type_name(),
    }
}

// ============================================================================
// Integer implementations
// ============================================================================

macro_rules! impl_from_variant_int {
    ($($ty:ty),*) => {
        $(
            impl FromVariant for $ty {
                fn from_variant(v: &Variant) -> Result<Self, ConversionError> {
                    match v {
                        Variant::Int(i) => <$ty>::try_from(*i).map_err(|_| ConversionError::IntegerOverflow {
                            value: *i,
                            target_type: stringify!($ty),
                        }),
                        _ => Err(mismatch("int", v)),
                    }
                }
            }
        )*
    };
}

impl_from_variant_int!(i8, i16, i32, i64, u8, u16, u32, u64);

// ============================================================================
// Everything else
// ============================================================================

impl FromVariant for f64 {
    /// Accepts both `Int` and `Float`.
    fn from_variant(v: &Variant) -> Result<Self, ConversionError> {
        v.as_float().ok_or_else(|| mismatch("float", v))
    }
}

impl FromVariant for f32 {
    fn from_variant(v: &Variant) -> Result<Self, ConversionError> {
        f64::from_variant(v).map(|f| f as f32)
    }
}

impl FromVariant for bool {
    fn from_variant(v: &Variant) -> Result<Self, ConversionError> {
        v.as_bool().ok_or_else(|| mismatch("bool", v))
    }
}

impl FromVariant for String {
    /// Accepts both `String` and `StringName`.
    fn from_variant(v: &Variant) -> Result<Self, ConversionError> {
        v.as_str().map(str::to_string).ok_or_else(|| mismatch("String", v))
    }
}

impl FromVariant for StringName {
    fn from_variant(v: &Variant) -> Result<Self, ConversionError> {
        match v {
            Variant::StringName(n) => Ok(n.clone()),
            Variant::String(s) => Ok(StringName::new(s)),
            _ => Err(mismatch("StringName", v)),
        }
    }
}

impl FromVariant for Variant {
    fn from_variant(v: &Variant) -> Result<Self, ConversionError> {
        Ok(v.clone())
    }
}

impl FromVariant for () {
    fn from_variant(_: &Variant) -> Result<Self, ConversionError> {
        Ok(())
    }
}

impl From<()> for Variant {
    fn from(_: ()) -> Self {
        Variant::Nil
    }
}

macro_rules! impl_from_variant_clone {
    ($($ty:ty => $variant:ident, $name:literal),* $(,)?) => {
        $(
            impl FromVariant for $ty {
                fn from_variant(v: &Variant) -> Result<Self, ConversionError> {
                    match v {
                        Variant::$variant(x) => Ok(x.clone()),
                        _ => Err(mismatch($name, v)),
                    }
                }
            }
        )*
    };
}

impl_from_variant_clone! {
    Vector2 => Vector2, "Vector2",
    Vector3 => Vector3, "Vector3",
    Color => Color, "Color",
    Vec<u8> => PackedByteArray, "PackedByteArray",
    Vec<String> => PackedStringArray, "PackedStringArray",
    Array => Array, "Array",
    Dictionary => Dictionary, "Dictionary",
    ObjectRef => Object, "Object",
    Callable => Callable, "Callable",
}

impl<T: FromVariant> FromVariant for Option<T> {
    /// `Nil` maps to `None`.
    fn from_variant(v: &Variant) -> Result<Self, ConversionError> {
        match v {
            Variant::Nil => Ok(None),
            _ => T::from_variant(v).map(Some),
        }
    }
}

//! The host's dynamically typed value.

use std::fmt;
use std::hash::{Hash, Hasher};

use num_enum::{IntoPrimitive, TryFromPrimitive};
use ordered_float::OrderedFloat;

use crate::array::Array;
use crate::callable::Callable;
use crate::dictionary::Dictionary;
use crate::math::{Color, Vector2, Vector3};
use crate::object::{ObjectDb, ObjectRef};
use crate::string_name::StringName;

/// Tag of a [`Variant`].
///
/// The numeric value is stable and is what crosses into the VM when a type
/// hint has to be passed as a plain number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum VariantType {
    Nil = 0,
    Bool = 1,
    Int = 2,
    Float = 3,
    String = 4,
    StringName = 5,
    Vector2 = 6,
    Vector3 = 7,
    Color = 8,
    PackedByteArray = 9,
    PackedStringArray = 10,
    Array = 11,
    Dictionary = 12,
    Object = 13,
    Callable = 14,
}

impl VariantType {
    pub fn name(self) -> &'static str {
        match self {
            VariantType::Nil => "Nil",
            VariantType::Bool => "bool",
            VariantType::Int => "int",
            VariantType::Float => "float",
            VariantType::String => "String",
            VariantType::StringName => "StringName",
            VariantType::Vector2 => "Vector2",
            VariantType::Vector3 => "Vector3",
            VariantType::Color => "Color",
            VariantType::PackedByteArray => "PackedByteArray",
            VariantType::PackedStringArray => "PackedStringArray",
            VariantType::Array => "Array",
            VariantType::Dictionary => "Dictionary",
            VariantType::Object => "Object",
            VariantType::Callable => "Callable",
        }
    }
}

impl fmt::Display for VariantType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A dynamically typed host value.
///
/// The tag fully determines the active member; every accessor matches on the
/// tag instead of reinterpreting storage.
#[derive(Clone, Default)]
pub enum Variant {
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    StringName(StringName),
    Vector2(Vector2),
    Vector3(Vector3),
    Color(Color),
    PackedByteArray(Vec<u8>),
    PackedStringArray(Vec<String>),
    Array(Array),
    Dictionary(Dictionary),
    Object(ObjectRef),
    Callable(Callable),
}

impl Variant {
    pub fn get_type(&self) -> VariantType {
        match self {
            Variant::Nil => VariantType::Nil,
            Variant::Bool(_) => VariantType::Bool,
            Variant::Int(_) => VariantType::Int,
            Variant::Float(_) => VariantType::Float,
            Variant::String(_) => VariantType::String,
            Variant::StringName(_) => VariantType::StringName,
            Variant::Vector2(_) => VariantType::Vector2,
            Variant::Vector3(_) => VariantType::Vector3,
            Variant::Color(_) => VariantType::Color,
            Variant::PackedByteArray(_) => VariantType::PackedByteArray,
            Variant::PackedStringArray(_) => VariantType::PackedStringArray,
            Variant::Array(_) => VariantType::Array,
            Variant::Dictionary(_) => VariantType::Dictionary,
            Variant::Object(_) => VariantType::Object,
            Variant::Callable(_) => VariantType::Callable,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.get_type().name()
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Variant::Nil)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Variant::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Variant::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric value of an `Int` or `Float`.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Variant::Int(i) => Some(*i as f64),
            Variant::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Text of a `String` or `StringName`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Variant::String(s) => Some(s),
            Variant::StringName(n) => Some(n.as_str()),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Array> {
        match self {
            Variant::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_dictionary(&self) -> Option<&Dictionary> {
        match self {
            Variant::Dictionary(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Variant::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_callable(&self) -> Option<&Callable> {
        match self {
            Variant::Callable(c) => Some(c),
            _ => None,
        }
    }

    /// Host truthiness: nil, false, zero and empty containers are false.
    pub fn booleanize(&self) -> bool {
        match self {
            Variant::Nil => false,
            Variant::Bool(b) => *b,
            Variant::Int(i) => *i != 0,
            Variant::Float(f) => *f != 0.0,
            Variant::String(s) => !s.is_empty(),
            Variant::StringName(n) => !n.is_empty(),
            Variant::Array(a) => !a.is_empty(),
            Variant::Dictionary(d) => !d.is_empty(),
            Variant::Object(o) => o.is_alive(),
            Variant::Callable(c) => !c.is_null(),
            _ => true,
        }
    }
}

// ============================================================================
// Equality and hashing
// ============================================================================

fn f32_key(v: f32) -> OrderedFloat<f32> {
    OrderedFloat(v)
}

impl PartialEq for Variant {
    /// Structural equality. Tags must match, except that `String` and
    /// `StringName` with the same text are equal. Floats compare with
    /// `OrderedFloat` semantics so equality stays reflexive for NaN.
    fn eq(&self, other: &Self) -> bool {
        use Variant::*;
        match (self, other) {
            (Nil, Nil) => true,
            (Bool(a), Bool(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (Float(a), Float(b)) => OrderedFloat(*a) == OrderedFloat(*b),
            (String(_) | StringName(_), String(_) | StringName(_)) => self.as_str() == other.as_str(),
            (Vector2(a), Vector2(b)) => f32_key(a.x) == f32_key(b.x) && f32_key(a.y) == f32_key(b.y),
            (Vector3(a), Vector3(b)) => {
                f32_key(a.x) == f32_key(b.x) && f32_key(a.y) == f32_key(b.y) && f32_key(a.z) == f32_key(b.z)
            }
            (Color(a), Color(b)) => {
                f32_key(a.r) == f32_key(b.r)
                    && f32_key(a.g) == f32_key(b.g)
                    && f32_key(a.b) == f32_key(b.b)
                    && f32_key(a.a) == f32_key(b.a)
            }
            (PackedByteArray(a), PackedByteArray(b)) => a == b,
            (PackedStringArray(a), PackedStringArray(b)) => a == b,
            (Array(a), Array(b)) => a == b,
            (Dictionary(a), Dictionary(b)) => a == b,
            (Object(a), Object(b)) => a == b,
            (Callable(a), Callable(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Variant {}

impl Hash for Variant {
    fn hash<H: Hasher>(&self, state: &mut H) {
        use Variant::*;
        // String and StringName share a discriminant so equal texts hash alike.
        match self {
            String(_) | StringName(_) => VariantType::String.hash(state),
            other => other.get_type().hash(state),
        }
        match self {
            Nil => {}
            Bool(b) => b.hash(state),
            Int(i) => i.hash(state),
            Float(f) => OrderedFloat(*f).hash(state),
            String(s) => s.as_str().hash(state),
            StringName(n) => n.as_str().hash(state),
            Vector2(v) => {
                f32_key(v.x).hash(state);
                f32_key(v.y).hash(state);
            }
            Vector3(v) => {
                f32_key(v.x).hash(state);
                f32_key(v.y).hash(state);
                f32_key(v.z).hash(state);
            }
            Color(c) => {
                f32_key(c.r).hash(state);
                f32_key(c.g).hash(state);
                f32_key(c.b).hash(state);
                f32_key(c.a).hash(state);
            }
            PackedByteArray(b) => b.hash(state),
            PackedStringArray(s) => s.hash(state),
            Array(a) => a.hash(state),
            Dictionary(d) => d.hash(state),
            Object(o) => o.hash(state),
            Callable(c) => c.hash(state),
        }
    }
}

// ============================================================================
// Formatting
// ============================================================================

impl fmt::Display for Variant {
    /// Host stringification, as used by `__tostring` and string concatenation.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variant::Nil => f.write_str("null"),
            Variant::Bool(b) => write!(f, "{}", b),
            Variant::Int(i) => write!(f, "{}", i),
            Variant::Float(v) => {
                if v.is_finite() && v.fract() == 0.0 {
                    write!(f, "{:.1}", v)
                } else {
                    write!(f, "{}", v)
                }
            }
            Variant::String(s) => f.write_str(s),
            Variant::StringName(n) => f.write_str(n.as_str()),
            Variant::Vector2(v) => write!(f, "{}", v),
            Variant::Vector3(v) => write!(f, "{}", v),
            Variant::Color(c) => write!(f, "{}", c),
            Variant::PackedByteArray(b) => write!(f, "{:?}", b),
            Variant::PackedStringArray(s) => write!(f, "{:?}", s),
            Variant::Array(a) => write!(f, "{}", a),
            Variant::Dictionary(d) => write!(f, "{}", d),
            Variant::Object(o) => match ObjectDb::get(o.id()) {
                Some(object) => f.write_str(&object.to_display_string(o.id())),
                None => f.write_str("<Freed Object>"),
            },
            Variant::Callable(c) => f.write_str(&c.display_text()),
        }
    }
}

impl fmt::Debug for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variant::Nil => f.write_str("Nil"),
            Variant::Bool(b) => write!(f, "Bool({})", b),
            Variant::Int(i) => write!(f, "Int({})", i),
            Variant::Float(v) => write!(f, "Float({})", v),
            Variant::String(s) => write!(f, "String({:?})", s),
            Variant::StringName(n) => write!(f, "StringName({:?})", n.as_str()),
            Variant::Vector2(v) => write!(f, "Vector2{}", v),
            Variant::Vector3(v) => write!(f, "Vector3{}", v),
            Variant::Color(c) => write!(f, "Color{}", c),
            Variant::PackedByteArray(b) => write!(f, "PackedByteArray({:?})", b),
            Variant::PackedStringArray(s) => write!(f, "PackedStringArray({:?})", s),
            Variant::Array(a) => write!(f, "Array({:?})", a.as_slice()),
            Variant::Dictionary(d) => f.debug_map().entries(d.iter()).finish(),
            Variant::Object(o) => write!(f, "Object({:?})", o.id()),
            Variant::Callable(c) => write!(f, "Callable({})", c.display_text()),
        }
    }
}

// ============================================================================
// Conversions from Rust values
// ============================================================================

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Variant {
                fn from(v: $ty) -> Self {
                    Variant::$variant(v.into())
                }
            }
        )*
    };
}

impl_from! {
    bool => Bool,
    i8 => Int,
    i16 => Int,
    i32 => Int,
    i64 => Int,
    u8 => Int,
    u16 => Int,
    u32 => Int,
    f32 => Float,
    f64 => Float,
    String => String,
    StringName => StringName,
    Vector2 => Vector2,
    Vector3 => Vector3,
    Color => Color,
    Vec<u8> => PackedByteArray,
    Vec<String> => PackedStringArray,
    Array => Array,
    Dictionary => Dictionary,
    ObjectRef => Object,
    Callable => Callable,
}

impl From<&str> for Variant {
    fn from(s: &str) -> Self {
        Variant::String(s.to_string())
    }
}

impl From<Vec<Variant>> for Variant {
    fn from(items: Vec<Variant>) -> Self {
        Variant::Array(Array::from(items))
    }
}

impl<T: Into<Variant>> From<Option<T>> for Variant {
    fn from(v: Option<T>) -> Self {
        v.map_or(Variant::Nil, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHasher;

    fn hash_of(v: &Variant) -> u64 {
        let mut h = FxHasher::default();
        v.hash(&mut h);
        h.finish()
    }

    #[test]
    fn type_names() {
        assert_eq!(Variant::Nil.type_name(), "Nil");
        assert_eq!(Variant::from(1).type_name(), "int");
        assert_eq!(Variant::from(1.5).type_name(), "float");
        assert_eq!(Variant::from("x").type_name(), "String");
        assert_eq!(Variant::from(Vector2::ZERO).type_name(), "Vector2");
    }

    #[test]
    fn type_tag_round_trips_through_u8() {
        let raw: u8 = VariantType::Dictionary.into();
        assert_eq!(VariantType::try_from(raw).ok(), Some(VariantType::Dictionary));
        assert!(VariantType::try_from(200u8).is_err());
    }

    #[test]
    fn int_and_float_are_distinct_keys() {
        assert_ne!(Variant::Int(1), Variant::Float(1.0));
    }

    #[test]
    fn string_and_name_compare_and_hash_alike() {
        let s = Variant::from("speed");
        let n = Variant::from(StringName::new("speed"));
        assert_eq!(s, n);
        assert_eq!(hash_of(&s), hash_of(&n));
    }

    #[test]
    fn nan_equals_itself() {
        let nan = Variant::Float(f64::NAN);
        assert_eq!(nan, nan.clone());
    }

    #[test]
    fn display() {
        assert_eq!(Variant::Nil.to_string(), "null");
        assert_eq!(Variant::Float(2.0).to_string(), "2.0");
        assert_eq!(Variant::Float(2.5).to_string(), "2.5");
        assert_eq!(Variant::from(vec![Variant::Int(1), Variant::from("a")]).to_string(), "[1, a]");
    }

    #[test]
    fn option_conversion() {
        assert!(Variant::from(None::<i32>).is_nil());
        assert_eq!(Variant::from(Some(3)), Variant::Int(3));
    }

    #[test]
    fn booleanize() {
        assert!(!Variant::Nil.booleanize());
        assert!(!Variant::Int(0).booleanize());
        assert!(Variant::from("x").booleanize());
        assert!(!Variant::from(Array::new()).booleanize());
    }
}

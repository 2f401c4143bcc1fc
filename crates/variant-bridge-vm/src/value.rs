//! VM values.

use std::cell::RefCell;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::function::FunctionRef;
use crate::state::Thread;
use crate::table::Table;
use crate::userdata::UserData;

/// Type tag of a stack value. `None` is reported for invalid indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(i8)]
pub enum VmType {
    None = -1,
    Nil = 0,
    Boolean = 1,
    LightUserData = 2,
    Number = 3,
    Vector = 4,
    String = 5,
    Table = 6,
    Function = 7,
    UserData = 8,
    Thread = 9,
    Buffer = 10,
}

impl VmType {
    pub fn name(self) -> &'static str {
        match self {
            VmType::None => "no value",
            VmType::Nil => "nil",
            VmType::Boolean => "boolean",
            VmType::LightUserData | VmType::UserData => "userdata",
            VmType::Number => "number",
            VmType::Vector => "vector",
            VmType::String => "string",
            VmType::Table => "table",
            VmType::Function => "function",
            VmType::Thread => "thread",
            VmType::Buffer => "buffer",
        }
    }
}

impl fmt::Display for VmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Strings
// ============================================================================

/// An immutable VM byte string.
///
/// Strings created through a [`Thread`] carry the atom the user-atom hook
/// assigned at creation (`-1` when no hook is installed or it declined).
#[derive(Clone)]
pub struct VmString {
    bytes: Rc<[u8]>,
    atom: i16,
}

impl VmString {
    pub fn new(bytes: &[u8]) -> Self {
        Self::with_atom(bytes, -1)
    }

    pub(crate) fn with_atom(bytes: &[u8], atom: i16) -> Self {
        Self {
            bytes: Rc::from(bytes),
            atom,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn to_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.bytes).ok()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }

    pub fn atom(&self) -> i16 {
        self.atom
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl PartialEq for VmString {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.bytes, &other.bytes) || self.bytes == other.bytes
    }
}

impl Eq for VmString {}

impl Hash for VmString {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bytes.hash(state);
    }
}

impl fmt::Debug for VmString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.to_string_lossy())
    }
}

// ============================================================================
// Values
// ============================================================================

/// A raw pointer-sized payload with a tag and no backing block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LightUserData {
    pub ptr: usize,
    pub tag: u8,
}

pub type TableRef = Rc<RefCell<Table>>;
pub type BufferRef = Rc<RefCell<Vec<u8>>>;

/// A VM value.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Nil,
    Boolean(bool),
    Number(f64),
    Vector([f32; 3]),
    String(VmString),
    Table(TableRef),
    Function(FunctionRef),
    UserData(Rc<UserData>),
    LightUserData(LightUserData),
    Thread(Thread),
    Buffer(BufferRef),
}

impl Value {
    pub fn string(s: &str) -> Self {
        Value::String(VmString::new(s.as_bytes()))
    }

    pub fn type_of(&self) -> VmType {
        match self {
            Value::Nil => VmType::Nil,
            Value::Boolean(_) => VmType::Boolean,
            Value::Number(_) => VmType::Number,
            Value::Vector(_) => VmType::Vector,
            Value::String(_) => VmType::String,
            Value::Table(_) => VmType::Table,
            Value::Function(_) => VmType::Function,
            Value::UserData(_) => VmType::UserData,
            Value::LightUserData(_) => VmType::LightUserData,
            Value::Thread(_) => VmType::Thread,
            Value::Buffer(_) => VmType::Buffer,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Lua truthiness: only nil and false are false.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Boolean(false))
    }

    /// Numeric value, coercing numeric strings.
    pub fn to_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::String(s) => s.to_str()?.trim().parse().ok(),
            _ => None,
        }
    }

    /// Address of the referenced object for reference types.
    pub fn identity(&self) -> Option<usize> {
        Some(match self {
            Value::Table(t) => Rc::as_ptr(t) as *const () as usize,
            Value::Function(f) => Rc::as_ptr(f) as *const () as usize,
            Value::UserData(u) => Rc::as_ptr(u) as *const () as usize,
            Value::Thread(t) => t.identity(),
            Value::Buffer(b) => Rc::as_ptr(b) as *const () as usize,
            _ => return None,
        })
    }

    /// Primitive equality without metamethods.
    pub fn raw_equal(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Vector(a), Value::Vector(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::LightUserData(a), Value::LightUserData(b)) => a == b,
            _ => match (self.identity(), other.identity()) {
                (Some(a), Some(b)) => a == b && self.type_of() == other.type_of(),
                _ => false,
            },
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.raw_equal(other)
    }
}

/// Format a number the way `tostring` does: integral values without a
/// fractional part.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        "nan".to_string()
    } else if n.is_infinite() {
        let sign = if n > 0.0 { "" } else { "-" };
        format!("{}inf", sign)
    } else if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

impl fmt::Display for Value {
    /// Default string form, ignoring `__tostring`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => f.write_str("nil"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Number(n) => f.write_str(&format_number(*n)),
            Value::Vector(v) => write!(
                f,
                "{}, {}, {}",
                format_number(v[0] as f64),
                format_number(v[1] as f64),
                format_number(v[2] as f64)
            ),
            Value::String(s) => f.write_str(&s.to_string_lossy()),
            Value::LightUserData(l) => write!(f, "userdata: {:#018x}", l.ptr),
            other => write!(
                f,
                "{}: {:#018x}",
                other.type_of().name(),
                other.identity().unwrap_or_default()
            ),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "String({:?})", s),
            other => write!(f, "{}({})", other.type_of().name(), other),
        }
    }
}

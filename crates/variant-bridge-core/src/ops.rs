//! Host operator evaluation.
//!
//! [`evaluate`] implements the host's arithmetic and comparison rules for
//! pairs of [`Variant`]s. It returns `None` when the operator is not defined
//! for the operand types (or for integer division by zero), which callers
//! surface as a script error.

use std::cmp::Ordering;
use std::fmt;

use crate::math::{Color, Vector2, Vector3};
use crate::variant::Variant;

/// Operators the host can evaluate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VariantOperator {
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Add,
    Subtract,
    Multiply,
    Divide,
    Module,
    Power,
    Negate,
}

impl VariantOperator {
    pub fn symbol(self) -> &'static str {
        match self {
            VariantOperator::Equal => "==",
            VariantOperator::NotEqual => "!=",
            VariantOperator::Less => "<",
            VariantOperator::LessEqual => "<=",
            VariantOperator::Greater => ">",
            VariantOperator::GreaterEqual => ">=",
            VariantOperator::Add => "+",
            VariantOperator::Subtract => "-",
            VariantOperator::Multiply => "*",
            VariantOperator::Divide => "/",
            VariantOperator::Module => "%",
            VariantOperator::Power => "**",
            VariantOperator::Negate => "unary-",
        }
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            VariantOperator::Equal
                | VariantOperator::NotEqual
                | VariantOperator::Less
                | VariantOperator::LessEqual
                | VariantOperator::Greater
                | VariantOperator::GreaterEqual
        )
    }
}

impl fmt::Display for VariantOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Evaluate `a op b`. For [`VariantOperator::Negate`] `b` is ignored.
pub fn evaluate(op: VariantOperator, a: &Variant, b: &Variant) -> Option<Variant> {
    use VariantOperator::*;
    match op {
        Equal => Some(Variant::Bool(loose_eq(a, b))),
        NotEqual => Some(Variant::Bool(!loose_eq(a, b))),
        Less => compare(a, b).map(|o| Variant::Bool(o == Ordering::Less)),
        LessEqual => compare(a, b).map(|o| Variant::Bool(o != Ordering::Greater)),
        Greater => compare(a, b).map(|o| Variant::Bool(o == Ordering::Greater)),
        GreaterEqual => compare(a, b).map(|o| Variant::Bool(o != Ordering::Less)),
        Negate => negate(a),
        Add => add(a, b),
        Subtract | Multiply | Divide | Module | Power => arith(op, a, b),
    }
}

/// Equality with numeric promotion: `Int(1) == Float(1.0)`.
pub fn loose_eq(a: &Variant, b: &Variant) -> bool {
    match (a, b) {
        (Variant::Int(x), Variant::Float(y)) | (Variant::Float(y), Variant::Int(x)) => (*x as f64) == *y,
        (Variant::Float(x), Variant::Float(y)) => x == y,
        _ => a == b,
    }
}

/// Ordering for numbers, strings and vectors. `None` if unordered.
pub fn compare(a: &Variant, b: &Variant) -> Option<Ordering> {
    match (a, b) {
        (Variant::Int(x), Variant::Int(y)) => Some(x.cmp(y)),
        (Variant::Int(_) | Variant::Float(_), Variant::Int(_) | Variant::Float(_)) => {
            a.as_float()?.partial_cmp(&b.as_float()?)
        }
        (Variant::String(_) | Variant::StringName(_), Variant::String(_) | Variant::StringName(_)) => {
            Some(a.as_str()?.cmp(b.as_str()?))
        }
        (Variant::Vector2(x), Variant::Vector2(y)) => x.to_array().partial_cmp(&y.to_array()),
        (Variant::Vector3(x), Variant::Vector3(y)) => x.to_array().partial_cmp(&y.to_array()),
        _ => None,
    }
}

fn negate(a: &Variant) -> Option<Variant> {
    Some(match a {
        Variant::Int(i) => Variant::Int(i.wrapping_neg()),
        Variant::Float(f) => Variant::Float(-f),
        Variant::Vector2(v) => Variant::Vector2(-*v),
        Variant::Vector3(v) => Variant::Vector3(-*v),
        Variant::Color(c) => Variant::Color(-*c),
        _ => return None,
    })
}

fn add(a: &Variant, b: &Variant) -> Option<Variant> {
    match (a, b) {
        (Variant::String(_) | Variant::StringName(_), Variant::String(_) | Variant::StringName(_)) => {
            Some(Variant::String(format!("{}{}", a.as_str()?, b.as_str()?)))
        }
        (Variant::Array(x), Variant::Array(y)) => Some(Variant::Array(x.iter().chain(y.iter()).cloned().collect())),
        (Variant::PackedByteArray(x), Variant::PackedByteArray(y)) => {
            Some(Variant::PackedByteArray([x.as_slice(), y.as_slice()].concat()))
        }
        (Variant::PackedStringArray(x), Variant::PackedStringArray(y)) => {
            Some(Variant::PackedStringArray([x.as_slice(), y.as_slice()].concat()))
        }
        _ => arith(VariantOperator::Add, a, b),
    }
}

/// Component-wise vector ops with vector or scalar right-hand sides.
trait Componentwise: Copy {
    fn map2(self, other: Self, f: impl Fn(f32, f32) -> f32) -> Self;
    fn splat(v: f32) -> Self;
}

impl Componentwise for Vector2 {
    fn map2(self, o: Self, f: impl Fn(f32, f32) -> f32) -> Self {
        Vector2::new(f(self.x, o.x), f(self.y, o.y))
    }
    fn splat(v: f32) -> Self {
        Vector2::new(v, v)
    }
}

impl Componentwise for Vector3 {
    fn map2(self, o: Self, f: impl Fn(f32, f32) -> f32) -> Self {
        Vector3::new(f(self.x, o.x), f(self.y, o.y), f(self.z, o.z))
    }
    fn splat(v: f32) -> Self {
        Vector3::new(v, v, v)
    }
}

impl Componentwise for Color {
    fn map2(self, o: Self, f: impl Fn(f32, f32) -> f32) -> Self {
        Color::rgba(f(self.r, o.r), f(self.g, o.g), f(self.b, o.b), f(self.a, o.a))
    }
    fn splat(v: f32) -> Self {
        Color::rgba(v, v, v, v)
    }
}

fn float_op(op: VariantOperator) -> Option<fn(f64, f64) -> f64> {
    let f: fn(f64, f64) -> f64 = match op {
        VariantOperator::Add => |x, y| x + y,
        VariantOperator::Subtract => |x, y| x - y,
        VariantOperator::Multiply => |x, y| x * y,
        VariantOperator::Divide => |x, y| x / y,
        VariantOperator::Module => |x, y| x % y,
        VariantOperator::Power => f64::powf,
        _ => return None,
    };
    Some(f)
}

fn int_op(op: VariantOperator, x: i64, y: i64) -> Option<Variant> {
    Some(Variant::Int(match op {
        VariantOperator::Add => x.wrapping_add(y),
        VariantOperator::Subtract => x.wrapping_sub(y),
        VariantOperator::Multiply => x.wrapping_mul(y),
        VariantOperator::Divide => x.checked_div(y)?,
        VariantOperator::Module => x.checked_rem(y)?,
        VariantOperator::Power => match u32::try_from(y) {
            Ok(exp) => x.wrapping_pow(exp),
            Err(_) => return Some(Variant::Float((x as f64).powf(y as f64))),
        },
        _ => return None,
    }))
}

fn vector_op<V: Componentwise>(op: VariantOperator, a: V, b: V) -> Option<V> {
    if matches!(op, VariantOperator::Module | VariantOperator::Power) {
        return None;
    }
    let f = float_op(op)?;
    Some(a.map2(b, |x, y| f(x as f64, y as f64) as f32))
}

fn arith(op: VariantOperator, a: &Variant, b: &Variant) -> Option<Variant> {
    use Variant as V;
    let scalar = |v: &Variant| v.as_float().map(|f| f as f32);
    match (a, b) {
        (V::Int(x), V::Int(y)) => int_op(op, *x, *y),
        (V::Int(_) | V::Float(_), V::Int(_) | V::Float(_)) => {
            Some(V::Float(float_op(op)?(a.as_float()?, b.as_float()?)))
        }
        (V::Vector2(x), V::Vector2(y)) => vector_op(op, *x, *y).map(V::Vector2),
        (V::Vector3(x), V::Vector3(y)) => vector_op(op, *x, *y).map(V::Vector3),
        (V::Color(x), V::Color(y)) => vector_op(op, *x, *y).map(V::Color),
        (V::Vector2(x), s) if matches!(op, VariantOperator::Multiply | VariantOperator::Divide) => {
            vector_op(op, *x, Vector2::splat(scalar(s)?)).map(V::Vector2)
        }
        (V::Vector3(x), s) if matches!(op, VariantOperator::Multiply | VariantOperator::Divide) => {
            vector_op(op, *x, Vector3::splat(scalar(s)?)).map(V::Vector3)
        }
        (V::Color(x), s) if matches!(op, VariantOperator::Multiply | VariantOperator::Divide) => {
            vector_op(op, *x, Color::splat(scalar(s)?)).map(V::Color)
        }
        (s, V::Vector2(y)) if op == VariantOperator::Multiply => Some(V::Vector2(*y * scalar(s)?)),
        (s, V::Vector3(y)) if op == VariantOperator::Multiply => Some(V::Vector3(*y * scalar(s)?)),
        (s, V::Color(y)) if op == VariantOperator::Multiply => Some(V::Color(*y * scalar(s)?)),
        _ => None,
    }
}

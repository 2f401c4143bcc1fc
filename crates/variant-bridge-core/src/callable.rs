//! First-class host invocables.
//!
//! A [`Callable`] is either null, a method bound to a registered object, or
//! a custom implementation of [`CallableCustom`]. Custom callables define
//! their own identity: two custom callables are equal when they have the
//! same concrete type and `equals` says so.

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use rustc_hash::FxHasher;

use crate::error::CallError;
use crate::object::{ObjectDb, ObjectId};
use crate::string_name::StringName;
use crate::variant::Variant;

/// A user-defined invocable.
pub trait CallableCustom: Any {
    /// Stable hash consistent with [`equals`](Self::equals).
    fn hash_value(&self) -> u64;

    fn display_text(&self) -> String;

    /// Identity comparison against another custom callable of the same
    /// concrete type.
    fn equals(&self, other: &dyn CallableCustom) -> bool;

    /// Total order against another custom callable of the same concrete type.
    fn less_than(&self, other: &dyn CallableCustom) -> bool;

    /// Object the callable is bound to, if any.
    fn object_id(&self) -> ObjectId {
        ObjectId::NULL
    }

    fn is_valid(&self) -> bool {
        true
    }

    /// Fixed argument count, or `None` for variadic.
    fn argument_count(&self) -> Option<usize> {
        None
    }

    fn call(&self, args: &[Variant]) -> Result<Variant, CallError>;

    fn as_any(&self) -> &dyn Any;
}

/// A host invocable value.
#[derive(Clone, Default)]
pub enum Callable {
    #[default]
    Null,
    Method {
        object: ObjectId,
        method: StringName,
    },
    Custom(Rc<dyn CallableCustom>),
}

impl Callable {
    pub fn from_method(object: ObjectId, method: impl Into<StringName>) -> Self {
        Callable::Method {
            object,
            method: method.into(),
        }
    }

    pub fn from_custom<C: CallableCustom>(custom: C) -> Self {
        Callable::Custom(Rc::new(custom))
    }

    /// Wrap a Rust closure as a variadic callable.
    pub fn from_fn<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&[Variant]) -> Result<Variant, CallError> + 'static,
    {
        Self::from_custom(CallableFn::new(name, f))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Callable::Null)
    }

    pub fn is_custom(&self) -> bool {
        matches!(self, Callable::Custom(_))
    }

    /// Whether a call could currently succeed.
    pub fn is_valid(&self) -> bool {
        match self {
            Callable::Null => false,
            Callable::Method { object, method } => ObjectDb::get(*object).is_some_and(|o| o.has_method(method)),
            Callable::Custom(c) => c.is_valid(),
        }
    }

    pub fn as_custom(&self) -> Option<&Rc<dyn CallableCustom>> {
        match self {
            Callable::Custom(c) => Some(c),
            _ => None,
        }
    }

    /// Downcast a custom callable to its concrete type.
    pub fn custom_as<T: CallableCustom>(&self) -> Option<&T> {
        self.as_custom()?.as_any().downcast_ref::<T>()
    }

    pub fn object_id(&self) -> ObjectId {
        match self {
            Callable::Null => ObjectId::NULL,
            Callable::Method { object, .. } => *object,
            Callable::Custom(c) => c.object_id(),
        }
    }

    pub fn method_name(&self) -> Option<&StringName> {
        match self {
            Callable::Method { method, .. } => Some(method),
            _ => None,
        }
    }

    pub fn argument_count(&self) -> Option<usize> {
        match self {
            Callable::Custom(c) => c.argument_count(),
            _ => None,
        }
    }

    pub fn call(&self, args: &[Variant]) -> Result<Variant, CallError> {
        match self {
            Callable::Null => Err(CallError::InvalidMethod),
            Callable::Method { object, method } => {
                let target = ObjectDb::get(*object).ok_or(CallError::InstanceIsNull)?;
                target.call(method, args)
            }
            Callable::Custom(c) => c.call(args),
        }
    }

    pub fn hash_value(&self) -> u64 {
        match self {
            Callable::Null => 0,
            Callable::Method { object, method } => {
                let mut h = FxHasher::default();
                object.hash(&mut h);
                method.hash(&mut h);
                h.finish()
            }
            Callable::Custom(c) => c.hash_value(),
        }
    }

    pub fn display_text(&self) -> String {
        match self {
            Callable::Null => "null::null".to_string(),
            Callable::Method { object, method } => match ObjectDb::get(*object) {
                Some(o) => format!("{}::{}", o.class_name(), method),
                None => format!("<freed>::{}", method),
            },
            Callable::Custom(c) => c.display_text(),
        }
    }

    fn kind_rank(&self) -> u8 {
        match self {
            Callable::Null => 0,
            Callable::Method { .. } => 1,
            Callable::Custom(_) => 2,
        }
    }

    /// Total order used for sorting callables.
    pub fn less_than(&self, other: &Callable) -> bool {
        match (self, other) {
            (Callable::Method { object: a, method: m }, Callable::Method { object: b, method: n }) => {
                (a, m) < (b, n)
            }
            (Callable::Custom(a), Callable::Custom(b)) => {
                if same_type(&**a, &**b) {
                    a.less_than(&**b)
                } else {
                    a.hash_value() < b.hash_value()
                }
            }
            _ => self.kind_rank() < other.kind_rank(),
        }
    }
}

fn same_type(a: &dyn CallableCustom, b: &dyn CallableCustom) -> bool {
    a.as_any().type_id() == b.as_any().type_id()
}

impl PartialEq for Callable {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Callable::Null, Callable::Null) => true,
            (Callable::Method { object: a, method: m }, Callable::Method { object: b, method: n }) => {
                a == b && m == n
            }
            (Callable::Custom(a), Callable::Custom(b)) => {
                Rc::ptr_eq(a, b) || (same_type(&**a, &**b) && a.equals(&**b))
            }
            _ => false,
        }
    }
}

impl Eq for Callable {}

impl Hash for Callable {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash_value());
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callable({})", self.display_text())
    }
}

// ============================================================================
// Closure-backed callable
// ============================================================================

type CallableFnInner = dyn Fn(&[Variant]) -> Result<Variant, CallError>;

/// A custom callable backed by a Rust closure.
///
/// Identity is the closure allocation: clones of the same `CallableFn`
/// compare equal, two separately built ones never do.
#[derive(Clone)]
pub struct CallableFn {
    name: String,
    arity: Option<usize>,
    func: Rc<CallableFnInner>,
}

impl CallableFn {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&[Variant]) -> Result<Variant, CallError> + 'static,
    {
        Self {
            name: name.into(),
            arity: None,
            func: Rc::new(f),
        }
    }

    /// A callable that rejects any argument count other than `arity`.
    pub fn with_arity<F>(name: impl Into<String>, arity: usize, f: F) -> Self
    where
        F: Fn(&[Variant]) -> Result<Variant, CallError> + 'static,
    {
        Self {
            arity: Some(arity),
            ..Self::new(name, f)
        }
    }

    fn address(&self) -> usize {
        Rc::as_ptr(&self.func) as *const () as usize
    }
}

impl CallableCustom for CallableFn {
    fn hash_value(&self) -> u64 {
        self.address() as u64
    }

    fn display_text(&self) -> String {
        self.name.clone()
    }

    fn equals(&self, other: &dyn CallableCustom) -> bool {
        other
            .as_any()
            .downcast_ref::<CallableFn>()
            .is_some_and(|o| Rc::ptr_eq(&self.func, &o.func))
    }

    fn less_than(&self, other: &dyn CallableCustom) -> bool {
        other
            .as_any()
            .downcast_ref::<CallableFn>()
            .is_some_and(|o| self.address() < o.address())
    }

    fn argument_count(&self) -> Option<usize> {
        self.arity
    }

    fn call(&self, args: &[Variant]) -> Result<Variant, CallError> {
        if let Some(err) = self.arity.and_then(|n| CallError::arity(n, args.len())) {
            return Err(err);
        }
        (self.func)(args)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::HostObject;

    #[test]
    fn null_callable() {
        let c = Callable::default();
        assert!(c.is_null());
        assert!(!c.is_valid());
        assert_eq!(c.call(&[]), Err(CallError::InvalidMethod));
    }

    #[test]
    fn closure_identity() {
        let a = Callable::from_fn("a", |_| Ok(Variant::Nil));
        let b = Callable::from_fn("a", |_| Ok(Variant::Nil));
        assert_eq!(a, a.clone());
        assert_ne!(a, b);

        let shared = CallableFn::new("s", |_| Ok(Variant::Nil));
        assert_eq!(
            Callable::from_custom(shared.clone()),
            Callable::from_custom(shared)
        );
    }

    #[test]
    fn arity_is_enforced() {
        let c = Callable::from_custom(CallableFn::with_arity("add", 2, |args| {
            Ok(Variant::Int(args[0].as_int().unwrap_or(0) + args[1].as_int().unwrap_or(0)))
        }));
        assert_eq!(c.argument_count(), Some(2));
        assert_eq!(c.call(&[Variant::Int(2), Variant::Int(3)]), Ok(Variant::Int(5)));
        assert!(matches!(c.call(&[]), Err(CallError::TooFewArguments { .. })));
    }

    struct Greeter;

    impl HostObject for Greeter {
        fn class_name(&self) -> &str {
            "Greeter"
        }

        fn has_method(&self, method: &StringName) -> bool {
            method.as_str() == "greet"
        }

        fn call(&self, method: &StringName, _args: &[Variant]) -> Result<Variant, CallError> {
            match method.as_str() {
                "greet" => Ok(Variant::from("hi")),
                _ => Err(CallError::InvalidMethod),
            }
        }
    }

    #[test]
    fn method_callable_follows_object_lifetime() {
        let id = ObjectDb::register(Greeter);
        let c = Callable::from_method(id, "greet");
        assert!(c.is_valid());
        assert_eq!(c.display_text(), "Greeter::greet");
        assert_eq!(c.call(&[]), Ok(Variant::from("hi")));

        ObjectDb::free(id);
        assert!(!c.is_valid());
        assert_eq!(c.call(&[]), Err(CallError::InstanceIsNull));
    }
}

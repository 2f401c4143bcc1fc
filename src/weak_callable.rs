//! Callables bound weakly to a host object.

use std::any::Any;
use std::hash::{Hash, Hasher};

use rustc_hash::FxHasher;
use variant_bridge_core::{CallError, Callable, CallableCustom, ObjectId, ObjectRef, Variant};

/// Calls `inner` with the bound object prepended to the arguments.
///
/// The binding does not keep the object alive. Once the object is gone the
/// first argument is `Nil` instead.
#[derive(Debug, Clone)]
pub struct WeaklyBoundCallable {
    inner: Callable,
    bound: ObjectId,
}

impl WeaklyBoundCallable {
    pub fn new(inner: Callable, bound: ObjectId) -> Self {
        Self { inner, bound }
    }

    /// Wrap `inner` bound to `bound` as a [`Callable`].
    pub fn bind(inner: Callable, bound: ObjectId) -> Callable {
        Callable::from_custom(Self::new(inner, bound))
    }

    pub fn inner(&self) -> &Callable {
        &self.inner
    }

    pub fn bound(&self) -> ObjectId {
        self.bound
    }

    fn resolve(&self) -> Variant {
        ObjectRef::new(self.bound).map_or(Variant::Nil, Variant::Object)
    }
}

impl CallableCustom for WeaklyBoundCallable {
    fn hash_value(&self) -> u64 {
        let mut hasher = FxHasher::default();
        self.bound.hash(&mut hasher);
        self.inner.hash_value().hash(&mut hasher);
        hasher.finish()
    }

    fn display_text(&self) -> String {
        format!("{} (bound to {})", self.inner.display_text(), self.bound)
    }

    fn equals(&self, other: &dyn CallableCustom) -> bool {
        other
            .as_any()
            .downcast_ref::<WeaklyBoundCallable>()
            .is_some_and(|o| o.bound == self.bound && o.inner == self.inner)
    }

    /// Bound identity first, then the inner callable.
    fn less_than(&self, other: &dyn CallableCustom) -> bool {
        let Some(other) = other.as_any().downcast_ref::<WeaklyBoundCallable>() else {
            return false;
        };
        if self.bound != other.bound {
            return self.bound.to_raw() < other.bound.to_raw();
        }
        self.inner.less_than(&other.inner)
    }

    fn object_id(&self) -> ObjectId {
        self.bound
    }

    fn is_valid(&self) -> bool {
        self.inner.is_valid()
    }

    fn argument_count(&self) -> Option<usize> {
        self.inner.argument_count().map(|n| n.saturating_sub(1))
    }

    fn call(&self, args: &[Variant]) -> Result<Variant, CallError> {
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(self.resolve());
        full.extend_from_slice(args);
        self.inner.call(&full)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use variant_bridge_core::{CallableFn, HostObject, ObjectDb};

    struct Target;

    impl HostObject for Target {
        fn class_name(&self) -> &str {
            "Target"
        }
    }

    fn first_arg_type() -> Callable {
        Callable::from_custom(CallableFn::new("first", |args: &[Variant]| {
            Ok(Variant::from(args.first().map_or("none", |a| a.type_name())))
        }))
    }

    #[test]
    fn prepends_the_live_object() {
        let target = ObjectDb::instantiate(Target);
        let bound = WeaklyBoundCallable::bind(first_arg_type(), target.id());
        assert_eq!(bound.call(&[Variant::Int(1)]), Ok(Variant::from("Object")));
    }

    #[test]
    fn dead_object_becomes_nil_without_error() {
        let target = ObjectDb::instantiate(Target);
        let id = target.id();
        let bound = WeaklyBoundCallable::bind(first_arg_type(), id);
        drop(target);
        assert!(!ObjectDb::is_alive(id));
        assert_eq!(bound.call(&[]), Ok(Variant::from("Nil")));
    }

    #[test]
    fn does_not_keep_the_object_alive() {
        let target = ObjectDb::instantiate(Target);
        let id = target.id();
        let _bound = WeaklyBoundCallable::bind(first_arg_type(), id);
        assert_eq!(ObjectDb::ref_count(id), Some(1));
    }

    #[test]
    fn equality_and_order() {
        let a = ObjectDb::instantiate(Target);
        let b = ObjectDb::instantiate(Target);
        let inner = first_arg_type();
        let x = WeaklyBoundCallable::bind(inner.clone(), a.id());
        let y = WeaklyBoundCallable::bind(inner.clone(), a.id());
        let z = WeaklyBoundCallable::bind(inner, b.id());
        assert_eq!(x, y);
        assert_eq!(x.hash_value(), y.hash_value());
        assert_ne!(x, z);
        assert_eq!(x.less_than(&z), a.id().to_raw() < b.id().to_raw());
    }

    #[test]
    fn arity_accounts_for_the_bound_slot() {
        let inner = Callable::from_custom(CallableFn::with_arity("two", 2, |_: &[Variant]| Ok(Variant::Nil)));
        let bound = WeaklyBoundCallable::bind(inner, ObjectId::NULL);
        assert_eq!(bound.argument_count(), Some(1));
        assert!(bound.call(&[Variant::Int(1)]).is_ok());
    }
}

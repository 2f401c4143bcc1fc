//! Generic value bridge.
//!
//! [`to_host_value`] and [`push_host_value`] dispatch on the value's type and
//! delegate containers, objects and invocables to their bridges. Host values
//! with no VM counterpart cross as opaque userdata carrying a [`HostValue`];
//! its metatable forwards operators, keyed access and iteration back to the
//! host through [`evaluate`] and the keyed/iteration helpers on [`Variant`].
//!
//! A value may override its own conversion with a `__tovariant` metamethod.

use std::cell::RefCell;
use std::rc::Rc;

use rustc_hash::FxHashSet;
use variant_bridge_core::{
    StringName, Variant, VariantOperator, VariantType, Vector3, evaluate, print_error,
};
use variant_bridge_vm::{Thread, UserData, Value, VmError, VmString};

use crate::atom_cache::AtomCache;
use crate::callable::{push_callable, to_callable, userdata_callable};
use crate::error::{BridgeError, BridgeResult};
use crate::map::{push_map, to_map};
use crate::object::{push_object, to_object, userdata_object};
use crate::sequence::{push_sequence, to_sequence};
use crate::session::{VmSession, session_for_thread};
use crate::stack::{MetaMethods, StackGuard, bridge_metatable, expect_index, find_metatable, reserve, same_table};

/// Registry name of the opaque host value metatable.
pub const VARIANT_METATABLE: &str = "variant_bridge.Variant";

/// Metamethod consulted before the built-in conversion rules.
pub const TO_VARIANT_EVENT: &str = "__tovariant";

/// Deepest container nesting a single conversion follows.
pub const MAX_CONVERSION_DEPTH: usize = 128;

/// Payload of an opaque host value userdata.
#[derive(Debug, Clone)]
pub struct HostValue(pub Variant);

// ============================================================================
// Conversion scope
// ============================================================================

#[derive(Default)]
struct ConversionScope {
    depth: usize,
    tables: FxHashSet<usize>,
    overrides: FxHashSet<usize>,
}

thread_local! {
    static SCOPE: RefCell<ConversionScope> = RefCell::new(ConversionScope::default());
}

struct DepthGuard;

impl DepthGuard {
    fn enter() -> Option<Self> {
        SCOPE
            .try_with(|scope| {
                let mut scope = scope.borrow_mut();
                if scope.depth >= MAX_CONVERSION_DEPTH {
                    return None;
                }
                scope.depth += 1;
                Some(DepthGuard)
            })
            .ok()
            .flatten()
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        let _ = SCOPE.try_with(|scope| scope.borrow_mut().depth -= 1);
    }
}

#[derive(Clone, Copy)]
enum Visit {
    Table,
    Override,
}

impl Visit {
    fn set(self, scope: &mut ConversionScope) -> &mut FxHashSet<usize> {
        match self {
            Visit::Table => &mut scope.tables,
            Visit::Override => &mut scope.overrides,
        }
    }
}

/// Marks a value as being converted; `enter` fails if it already is.
struct VisitGuard {
    kind: Visit,
    id: usize,
}

impl VisitGuard {
    fn enter(kind: Visit, id: usize) -> Option<Self> {
        SCOPE
            .try_with(|scope| {
                let mut scope = scope.borrow_mut();
                kind.set(&mut scope).insert(id).then_some(VisitGuard { kind, id })
            })
            .ok()
            .flatten()
    }
}

impl Drop for VisitGuard {
    fn drop(&mut self) {
        let _ = SCOPE.try_with(|scope| {
            self.kind.set(&mut scope.borrow_mut()).remove(&self.id);
        });
    }
}

// ============================================================================
// VM -> host
// ============================================================================

/// Convert the value at `idx` to a [`Variant`].
///
/// Invalid indices, nesting deeper than [`MAX_CONVERSION_DEPTH`] and cyclic
/// tables are reported and yield `Nil`. The stack is left unchanged.
#[cfg_attr(feature = "profiling", profiling::function)]
pub fn to_host_value(thread: &Thread, idx: i32) -> Variant {
    to_host_value_as(thread, idx, None)
}

/// Like [`to_host_value`], passing `hint` to a `__tovariant` override.
pub fn to_host_value_as(thread: &Thread, idx: i32, hint: Option<VariantType>) -> Variant {
    if !expect_index(thread, idx, "to_host_value") {
        return Variant::Nil;
    }
    let Some(_depth) = DepthGuard::enter() else {
        print_error("to_host_value: value nesting too deep");
        return Variant::Nil;
    };
    let idx = thread.abs_index(idx);
    if let Some(converted) = convert_with_override(thread, idx, hint) {
        return converted;
    }
    convert_builtin(thread, idx)
}

fn convert_with_override(thread: &Thread, idx: i32, hint: Option<VariantType>) -> Option<Variant> {
    let value = thread.value_at(idx);
    let id = value.identity()?;
    let handler = thread.metamethod(&value, TO_VARIANT_EVENT)?;
    // Re-entry for the same value falls through to the built-in rules.
    let _visit = VisitGuard::enter(Visit::Override, id)?;
    match handler {
        Value::Function(_) => {
            if reserve(thread, 3).is_err() {
                print_error("__tovariant: stack overflow");
                return Some(Variant::Nil);
            }
            let _guard = StackGuard::new(thread);
            thread.push(handler);
            thread.push_value(idx);
            match hint {
                Some(t) => thread.push_number(f64::from(u8::from(t))),
                None => thread.push_nil(),
            }
            match thread.pcall(2, 1) {
                Ok(()) => Some(to_host_value(thread, -1)),
                Err(e) => {
                    print_error(format!("__tovariant: {}", e));
                    Some(Variant::Nil)
                }
            }
        }
        Value::UserData(ref ud) => {
            let callable = userdata_callable(thread, ud)?;
            if !callable.is_valid() {
                return None;
            }
            let hint = hint.map_or(Variant::Nil, |t| Variant::Int(i64::from(u8::from(t))));
            let args = [convert_builtin(thread, idx), hint];
            match callable.call(&args) {
                Ok(v) => Some(v),
                Err(e) => {
                    print_error(format!("__tovariant: {}", e));
                    Some(Variant::Nil)
                }
            }
        }
        _ => None,
    }
}

fn convert_builtin(thread: &Thread, idx: i32) -> Variant {
    match thread.value_at(idx) {
        Value::Nil => Variant::Nil,
        Value::Boolean(b) => Variant::Bool(b),
        Value::Number(n) => number_to_variant(n),
        Value::Vector(v) => Variant::Vector3(Vector3::new(v[0], v[1], v[2])),
        Value::String(s) => string_to_variant(&s),
        Value::LightUserData(_) => to_object(thread, idx).map(Variant::Object).unwrap_or_default(),
        Value::Table(t) => {
            let Some(_visit) = VisitGuard::enter(Visit::Table, Rc::as_ptr(&t) as *const () as usize) else {
                print_error("to_host_value: cyclic table converts to Nil");
                return Variant::Nil;
            };
            match to_sequence(thread, idx) {
                (array, true) => Variant::Array(array),
                _ => Variant::Dictionary(to_map(thread, idx)),
            }
        }
        Value::Function(_) => to_callable(thread, idx).map(Variant::Callable).unwrap_or_default(),
        Value::UserData(ud) => userdata_to_variant(thread, &ud),
        Value::Thread(t) => session_for_thread(&t).map(Variant::Object).unwrap_or_default(),
        Value::Buffer(b) => Variant::PackedByteArray(b.borrow().clone()),
    }
}

/// Integral numbers inside the `i64` range become `Int`, everything else
/// stays `Float`.
fn number_to_variant(n: f64) -> Variant {
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    if n.is_finite() && n.round() == n && (-LIMIT..LIMIT).contains(&n) {
        Variant::Int(n as i64)
    } else {
        Variant::Float(n)
    }
}

fn string_to_variant(s: &VmString) -> Variant {
    let atom = s.atom();
    if atom >= 0 {
        // The cache may have been reinstalled since the string was created.
        let name = AtomCache::singleton()
            .and_then(|cache| cache.name_for_atom(atom))
            .filter(|name| name.as_str().as_bytes() == s.as_bytes());
        if let Some(name) = name {
            return Variant::String(name.as_str().to_owned());
        }
    }
    Variant::String(s.to_string_lossy())
}

fn userdata_to_variant(thread: &Thread, ud: &UserData) -> Variant {
    if let Some(value) = opaque_value(thread, ud) {
        return value;
    }
    if let Some(object) = userdata_object(thread, ud) {
        return Variant::Object(object);
    }
    if let Some(callable) = userdata_callable(thread, ud) {
        return Variant::Callable(callable);
    }
    Variant::Nil
}

fn opaque_value(thread: &Thread, ud: &UserData) -> Option<Variant> {
    if !ud.is::<HostValue>() {
        return None;
    }
    let metatable = find_metatable(thread, VARIANT_METATABLE);
    if !same_table(ud.metatable().as_ref(), metatable.as_ref()) {
        return None;
    }
    ud.get::<HostValue>().map(|h| h.0)
}

// ============================================================================
// host -> VM
// ============================================================================

/// Push `value` onto the stack.
///
/// On error nothing is left on the stack.
///
/// # Panics
///
/// Pushing a [`VmSession`] object into a different VM is a host programming
/// error and panics.
#[cfg_attr(feature = "profiling", profiling::function)]
pub fn push_host_value(thread: &Thread, value: &Variant) -> BridgeResult<()> {
    reserve(thread, 1)?;
    let Some(_depth) = DepthGuard::enter() else {
        return Err(BridgeError::Vm(VmError::runtime("push_host_value: value nesting too deep")));
    };
    match value {
        Variant::Nil => thread.push_nil(),
        Variant::Bool(b) => thread.push_boolean(*b),
        Variant::Int(i) => thread.push_number(*i as f64),
        Variant::Float(f) => thread.push_number(*f),
        Variant::String(s) => thread.push_string(s),
        Variant::StringName(name) => push_string_name(thread, name),
        Variant::Vector3(v) => thread.push_vector(v.x, v.y, v.z),
        Variant::PackedByteArray(bytes) => {
            thread.push_buffer(bytes);
        }
        Variant::Array(array) => push_sequence(thread, array)?,
        Variant::Dictionary(map) => push_map(thread, map)?,
        Variant::Callable(callable) => push_callable(thread, callable)?,
        Variant::Object(object) => match object.cast::<VmSession>() {
            Some(session) => {
                let target = session.thread().ok_or(BridgeError::SessionClosed)?;
                assert!(
                    target.same_vm(thread),
                    "cannot push a VM session into a different VM"
                );
                thread.push(Value::Thread(target));
            }
            None => push_object(thread, object.id())?,
        },
        other => push_opaque(thread, other.clone())?,
    }
    Ok(())
}

fn push_string_name(thread: &Thread, name: &StringName) {
    match AtomCache::singleton() {
        Some(cache) => thread.push_bytes(&cache.char_string_for(name)),
        None => thread.push_string(name.as_str()),
    }
}

/// Push `value` as an opaque userdata with the host value metatable.
pub fn push_opaque(thread: &Thread, value: Variant) -> BridgeResult<()> {
    reserve(thread, 2)?;
    let metatable = bridge_metatable(thread, VARIANT_METATABLE, VARIANT_METHODS)?;
    let guard = StackGuard::new(thread);
    thread.new_userdata(HostValue(value));
    thread.push(Value::Table(metatable));
    thread.set_metatable(-2)?;
    guard.commit();
    Ok(())
}

// ============================================================================
// Metamethods
// ============================================================================

const VARIANT_METHODS: MetaMethods = &[
    ("__tostring", variant_tostring),
    ("__concat", variant_concat),
    ("__add", variant_add),
    ("__sub", variant_sub),
    ("__mul", variant_mul),
    ("__div", variant_div),
    ("__mod", variant_mod),
    ("__pow", variant_pow),
    ("__unm", variant_unm),
    ("__eq", variant_eq),
    ("__lt", variant_lt),
    ("__le", variant_le),
    ("__index", variant_index),
    ("__newindex", variant_newindex),
    ("__iter", variant_iter),
];

fn binary(t: &Thread, op: VariantOperator) -> Result<usize, VmError> {
    let a = to_host_value(t, 1);
    let b = to_host_value(t, 2);
    match evaluate(op, &a, &b) {
        Some(result) => {
            push_host_value(t, &result)?;
            Ok(1)
        }
        None => Err(VmError::runtime(format!(
            "invalid operator '{}' between {} and {}",
            op.symbol(),
            a.type_name(),
            b.type_name()
        ))),
    }
}

fn variant_add(t: &Thread) -> Result<usize, VmError> {
    binary(t, VariantOperator::Add)
}

fn variant_sub(t: &Thread) -> Result<usize, VmError> {
    binary(t, VariantOperator::Subtract)
}

fn variant_mul(t: &Thread) -> Result<usize, VmError> {
    binary(t, VariantOperator::Multiply)
}

fn variant_div(t: &Thread) -> Result<usize, VmError> {
    binary(t, VariantOperator::Divide)
}

fn variant_mod(t: &Thread) -> Result<usize, VmError> {
    binary(t, VariantOperator::Module)
}

fn variant_pow(t: &Thread) -> Result<usize, VmError> {
    binary(t, VariantOperator::Power)
}

fn variant_unm(t: &Thread) -> Result<usize, VmError> {
    let a = to_host_value(t, 1);
    match evaluate(VariantOperator::Negate, &a, &Variant::Nil) {
        Some(result) => {
            push_host_value(t, &result)?;
            Ok(1)
        }
        None => Err(VmError::runtime(format!(
            "invalid operator '{}' on {}",
            VariantOperator::Negate.symbol(),
            a.type_name()
        ))),
    }
}

fn comparison(t: &Thread, op: VariantOperator) -> Result<usize, VmError> {
    let a = to_host_value(t, 1);
    let b = to_host_value(t, 2);
    let result = match evaluate(op, &a, &b) {
        Some(result) => result.booleanize(),
        None if op == VariantOperator::Equal => false,
        None => {
            return Err(VmError::runtime(format!(
                "invalid operator '{}' between {} and {}",
                op.symbol(),
                a.type_name(),
                b.type_name()
            )));
        }
    };
    t.push_boolean(result);
    Ok(1)
}

fn variant_eq(t: &Thread) -> Result<usize, VmError> {
    comparison(t, VariantOperator::Equal)
}

fn variant_lt(t: &Thread) -> Result<usize, VmError> {
    comparison(t, VariantOperator::Less)
}

fn variant_le(t: &Thread) -> Result<usize, VmError> {
    comparison(t, VariantOperator::LessEqual)
}

fn variant_tostring(t: &Thread) -> Result<usize, VmError> {
    let text = to_host_value(t, 1).to_string();
    t.push_string(&text);
    Ok(1)
}

/// Strings and numbers keep their script spelling; anything else uses the
/// host's display form.
fn concat_operand(t: &Thread, idx: i32) -> Result<String, VmError> {
    match t.value_at(idx) {
        Value::String(_) | Value::Number(_) => t.to_display_string(idx),
        _ => Ok(to_host_value(t, idx).to_string()),
    }
}

fn variant_concat(t: &Thread) -> Result<usize, VmError> {
    let mut text = concat_operand(t, 1)?;
    text.push_str(&concat_operand(t, 2)?);
    t.push_string(&text);
    Ok(1)
}

fn self_value(t: &Thread) -> Result<Variant, VmError> {
    t.to_userdata(1)
        .and_then(|ud| ud.get::<HostValue>())
        .map(|h| h.0)
        .ok_or_else(|| t.type_error(1, "Variant"))
}

fn variant_index(t: &Thread) -> Result<usize, VmError> {
    let value = self_value(t)?;
    let key = to_host_value(t, 2);
    match value.get_keyed(&key) {
        Some(result) => {
            push_host_value(t, &result)?;
            Ok(1)
        }
        None => Err(VmError::runtime(format!(
            "cannot index {} with {} '{}'",
            value.type_name(),
            key.type_name(),
            key
        ))),
    }
}

fn variant_newindex(t: &Thread) -> Result<usize, VmError> {
    let ud = t.to_userdata(1).ok_or_else(|| t.type_error(1, "Variant"))?;
    let key = to_host_value(t, 2);
    let value = to_host_value(t, 3);
    let (stored, type_name) = match ud.borrow_mut::<HostValue>() {
        Some(mut host) => {
            let type_name = host.0.type_name();
            (host.0.set_keyed(&key, value), type_name)
        }
        None => return Err(t.type_error(1, "Variant")),
    };
    if stored {
        Ok(0)
    } else {
        Err(VmError::runtime(format!(
            "cannot set {} '{}' on {}",
            key.type_name(),
            key,
            type_name
        )))
    }
}

/// Iteration cursor over a host value.
struct HostIter {
    value: Variant,
    state: Option<Variant>,
    started: bool,
    counter: i64,
}

impl HostIter {
    fn advance(&mut self) -> Option<(i64, Variant)> {
        if !self.started {
            self.started = true;
            self.state = self.value.iter_init();
        } else if let Some(state) = self.state.as_mut() {
            if !self.value.iter_next(state) {
                self.state = None;
            }
        }
        let item = self.value.iter_get(self.state.as_ref()?)?;
        self.counter += 1;
        Some((self.counter, item))
    }
}

/// Returns a stepping function yielding `(counter, element)` pairs.
fn variant_iter(t: &Thread) -> Result<usize, VmError> {
    let value = self_value(t)?;
    if !value.is_iterable() {
        return Err(VmError::runtime(format!("cannot iterate over {}", value.type_name())));
    }
    let cursor = Rc::new(RefCell::new(HostIter {
        value,
        state: None,
        started: false,
        counter: 0,
    }));
    t.push_function("__iter_next", move |t: &Thread| {
        let next = cursor.borrow_mut().advance();
        match next {
            Some((counter, item)) => {
                t.push_number(counter as f64);
                push_host_value(t, &item)?;
                Ok(2)
            }
            None => {
                t.push_nil();
                Ok(1)
            }
        }
    });
    Ok(1)
}

/// The host value behind an opaque userdata, for callers that need it
/// without a full conversion.
pub fn to_opaque(thread: &Thread, idx: i32) -> Option<Variant> {
    if !expect_index(thread, idx, "to_opaque") {
        return None;
    }
    let ud = thread.to_userdata(idx)?;
    opaque_value(thread, &ud)
}

#[cfg(test)]
mod tests {
    use super::*;
    use variant_bridge_core::{Array, Callable, CallableFn, Color, Dictionary, MessageCapture, Vector2};
    use variant_bridge_vm::{LibraryFlags, Vm, VmType};

    fn round_trip(vm: &Vm, value: &Variant) -> Variant {
        push_host_value(vm, value).unwrap();
        let back = to_host_value(vm, -1);
        vm.pop(1);
        back
    }

    #[test]
    fn primitives_round_trip() {
        let vm = Vm::new();
        for value in [
            Variant::Nil,
            Variant::Bool(true),
            Variant::Int(-42),
            Variant::Float(1.5),
            Variant::from("hello"),
            Variant::Vector3(Vector3::new(1.0, 2.0, 3.0)),
            Variant::PackedByteArray(vec![0, 1, 255]),
        ] {
            assert_eq!(round_trip(&vm, &value), value);
        }
        assert_eq!(vm.get_top(), 0);
    }

    #[test]
    fn integral_floats_come_back_as_int() {
        let vm = Vm::new();
        assert_eq!(round_trip(&vm, &Variant::Float(2.0)), Variant::Int(2));
        vm.push_number(f64::INFINITY);
        assert_eq!(to_host_value(&vm, -1), Variant::Float(f64::INFINITY));
        vm.push_number(1e300);
        assert!(matches!(to_host_value(&vm, -1), Variant::Float(_)));
    }

    #[test]
    fn string_names_arrive_as_strings() {
        let vm = Vm::new();
        let name = Variant::StringName(StringName::new("position"));
        push_host_value(&vm, &name).unwrap();
        assert_eq!(vm.type_of(-1), VmType::String);
        assert_eq!(to_host_value(&vm, -1), Variant::from("position"));
    }

    #[test]
    fn types_without_vm_counterpart_are_opaque() {
        let vm = Vm::new();
        let value = Variant::Vector2(Vector2::new(1.0, 2.0));
        push_host_value(&vm, &value).unwrap();
        assert_eq!(vm.type_of(-1), VmType::UserData);
        assert_eq!(to_opaque(&vm, -1), Some(value.clone()));
        assert_eq!(to_host_value(&vm, -1), value);
    }

    #[test]
    fn invalid_index_reports_and_yields_nil() {
        let vm = Vm::new();
        let capture = MessageCapture::start();
        assert_eq!(to_host_value(&vm, 3), Variant::Nil);
        assert!(capture.contains("invalid stack index 3"));
    }

    #[test]
    fn cyclic_tables_convert_without_recursing_forever() {
        let vm = Vm::new();
        let t = vm.new_table();
        drop(t.borrow_mut().set_int(1, Value::Table(t.clone())));
        drop(t.borrow_mut().set_int(2, Value::Table(t.clone())));
        let capture = MessageCapture::start();
        let value = to_host_value(&vm, -1);
        let items = value.as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items.get(0), Some(&Variant::Nil));
        assert!(capture.contains("cyclic table"));
    }

    #[test]
    fn shared_subtables_are_not_cycles() {
        let vm = Vm::new();
        let inner = Array::from(vec![Variant::Int(1)]);
        let outer = Array::from(vec![Variant::from(inner.clone()), Variant::from(inner.clone())]);
        push_host_value(&vm, &Variant::from(outer.clone())).unwrap();
        assert_eq!(to_host_value(&vm, -1), Variant::from(outer));
    }

    #[test]
    fn tovariant_function_override() {
        let vm = Vm::new();
        let t = vm.new_table();
        let meta = vm.new_table();
        vm.push_function("__tovariant", |t: &Thread| {
            t.push_string("converted");
            Ok(1)
        });
        vm.set_field(-2, TO_VARIANT_EVENT).unwrap();
        vm.set_metatable(-2).unwrap();
        assert!(t.borrow().metatable().is_some_and(|m| Rc::ptr_eq(&m, &meta)));
        assert_eq!(to_host_value(&vm, -1), Variant::from("converted"));
        assert_eq!(vm.get_top(), 1);
    }

    #[test]
    fn tovariant_host_callable_override_sees_builtin_value() {
        let vm = Vm::new();
        vm.create_table(1, 0);
        vm.push_number(7.0);
        vm.raw_set_i(-2, 1).unwrap();
        vm.new_table();
        let handler = Callable::from_custom(CallableFn::new("len", |args: &[Variant]| {
            Ok(Variant::Int(args[0].as_array().map_or(-1, |a| a.len() as i64)))
        }));
        push_callable(&vm, &handler).unwrap();
        vm.set_field(-2, TO_VARIANT_EVENT).unwrap();
        vm.set_metatable(-2).unwrap();
        assert_eq!(to_host_value(&vm, -1), Variant::Int(1));
    }

    #[test]
    fn tovariant_errors_yield_nil() {
        let vm = Vm::new();
        vm.new_table();
        vm.new_table();
        vm.push_function("__tovariant", |_: &Thread| Err(VmError::runtime("nope")));
        vm.set_field(-2, TO_VARIANT_EVENT).unwrap();
        vm.set_metatable(-2).unwrap();
        let capture = MessageCapture::start();
        assert_eq!(to_host_value(&vm, -1), Variant::Nil);
        assert!(capture.contains("nope"));
        assert_eq!(vm.get_top(), 1);
    }

    #[test]
    fn opaque_arithmetic_and_comparison() {
        let vm = Vm::new();
        let a = Variant::Vector2(Vector2::new(1.0, 2.0));
        let b = Variant::Vector2(Vector2::new(3.0, 4.0));
        push_host_value(&vm, &a).unwrap();
        push_host_value(&vm, &b).unwrap();
        vm.arith(variant_bridge_vm::ArithOp::Add).unwrap();
        assert_eq!(to_host_value(&vm, -1), Variant::Vector2(Vector2::new(4.0, 6.0)));
        vm.pop(1);

        push_host_value(&vm, &a).unwrap();
        push_host_value(&vm, &a).unwrap();
        assert!(vm.equal(-1, -2).unwrap());
        vm.pop(2);

        push_host_value(&vm, &a).unwrap();
        push_host_value(&vm, &Variant::from("text")).unwrap();
        let err = vm.arith(variant_bridge_vm::ArithOp::Mul).unwrap_err();
        assert!(err.to_string().contains("between Vector2 and String"));
    }

    #[test]
    fn opaque_keyed_access() {
        let vm = Vm::new();
        push_host_value(&vm, &Variant::Color(Color::rgba(0.5, 0.25, 1.0, 1.0))).unwrap();
        vm.get_field(-1, "g").unwrap();
        assert_eq!(vm.to_number(-1), Some(0.25));
        vm.pop(1);
        vm.push_number(0.0);
        vm.set_field(-2, "r").unwrap();
        assert_eq!(
            to_host_value(&vm, -1),
            Variant::Color(Color::rgba(0.0, 0.25, 1.0, 1.0))
        );
        let err = vm.get_field(-1, "nope").unwrap_err();
        assert!(err.to_string().contains("cannot index Color"));
    }

    #[test]
    fn opaque_iteration_counts_from_one() {
        let vm = Vm::new();
        vm.open_libs(LibraryFlags::ALL).unwrap();
        let strings = Variant::PackedStringArray(vec!["a".into(), "b".into()]);
        push_host_value(&vm, &strings).unwrap();
        vm.get_metafield(-1, "__iter");
        vm.push_value(-2);
        vm.call(1, 1).unwrap();
        let step = vm.value_at(-1);
        let mut seen = Vec::new();
        loop {
            vm.push(step.clone());
            vm.call(0, 2).unwrap();
            if vm.is_nil(-2) {
                vm.pop(2);
                break;
            }
            seen.push((to_host_value(&vm, -2), to_host_value(&vm, -1)));
            vm.pop(2);
        }
        assert_eq!(
            seen,
            vec![
                (Variant::Int(1), Variant::from("a")),
                (Variant::Int(2), Variant::from("b")),
            ]
        );
    }

    #[test]
    fn opaque_tostring_and_concat() {
        let vm = Vm::new();
        push_host_value(&vm, &Variant::Vector2(Vector2::new(1.0, 2.0))).unwrap();
        let text = vm.to_display_string(-1).unwrap();
        vm.push_string("v=");
        vm.push_value(-2);
        vm.concat(2).unwrap();
        assert_eq!(vm.to_display_string(-1).unwrap(), format!("v={}", text));
    }

    #[test]
    fn maps_round_trip_through_generic_bridge() {
        let vm = Vm::new();
        let mut map = Dictionary::new();
        map.insert("name", "Alice");
        map.insert("count", 3);
        assert_eq!(round_trip(&vm, &Variant::from(map.clone())), Variant::from(map));
    }
}

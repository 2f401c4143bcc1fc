//! Table access, operators and metatables.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::VmError;
use crate::state::Thread;
use crate::table::Table;
use crate::value::{TableRef, Value, VmType, format_number};

/// Longest `__index`/`__newindex` chain followed before giving up.
pub const MAX_META_CHAIN: usize = 100;

/// Arithmetic operators understood by [`Thread::arith`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    IDiv,
    Mod,
    Pow,
    Unm,
}

impl ArithOp {
    pub fn event(self) -> &'static str {
        match self {
            ArithOp::Add => "__add",
            ArithOp::Sub => "__sub",
            ArithOp::Mul => "__mul",
            ArithOp::Div => "__div",
            ArithOp::IDiv => "__idiv",
            ArithOp::Mod => "__mod",
            ArithOp::Pow => "__pow",
            ArithOp::Unm => "__unm",
        }
    }

    fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            ArithOp::Add => a + b,
            ArithOp::Sub => a - b,
            ArithOp::Mul => a * b,
            ArithOp::Div => a / b,
            ArithOp::IDiv => (a / b).floor(),
            ArithOp::Mod => a - (a / b).floor() * b,
            ArithOp::Pow => a.powf(b),
            ArithOp::Unm => -a,
        }
    }
}

/// Comparison operators understood by [`Thread::compare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Lt,
    Le,
}

fn vector_arith(op: ArithOp, a: &Value, b: &Value) -> Option<Value> {
    let lanes = |x: [f32; 3], y: [f32; 3]| {
        Value::Vector([0, 1, 2].map(|i| op.apply(x[i] as f64, y[i] as f64) as f32))
    };
    match (a, b) {
        (Value::Vector(x), _) if op == ArithOp::Unm => Some(Value::Vector(x.map(|c| -c))),
        (Value::Vector(x), Value::Vector(y)) if op != ArithOp::Pow => Some(lanes(*x, *y)),
        (Value::Vector(x), Value::Number(n)) if matches!(op, ArithOp::Mul | ArithOp::Div | ArithOp::IDiv) => {
            Some(lanes(*x, [*n as f32; 3]))
        }
        (Value::Number(n), Value::Vector(y)) if matches!(op, ArithOp::Mul | ArithOp::Div | ArithOp::IDiv) => {
            Some(lanes([*n as f32; 3], *y))
        }
        _ => None,
    }
}

fn is_string_like(v: &Value) -> bool {
    matches!(v, Value::String(_) | Value::Number(_))
}

fn string_bytes(v: &Value) -> Vec<u8> {
    match v {
        Value::String(s) => s.as_bytes().to_vec(),
        Value::Number(n) => format_number(*n).into_bytes(),
        _ => Vec::new(),
    }
}

fn vector_field(v: &[f32; 3], key: &Value) -> Option<Value> {
    let Value::String(s) = key else { return None };
    let lane = match s.as_bytes() {
        b"x" | b"X" => 0,
        b"y" | b"Y" => 1,
        b"z" | b"Z" => 2,
        _ => return None,
    };
    Some(Value::Number(v[lane] as f64))
}

impl Thread {
    // ------------------------------------------------------------------
    // Metatables
    // ------------------------------------------------------------------

    /// Metatable of a value. Strings share one metatable per VM.
    pub fn metatable_of(&self, value: &Value) -> Option<TableRef> {
        match value {
            Value::Table(t) => t.borrow().metatable(),
            Value::UserData(u) => u.metatable(),
            Value::String(_) => self.global().string_metatable.borrow().clone(),
            _ => None,
        }
    }

    /// Non-nil metatable field `event` of `value`.
    pub fn metamethod(&self, value: &Value, event: &str) -> Option<Value> {
        let metatable = self.metatable_of(value)?;
        let handler = metatable.borrow().get_str(event);
        (!handler.is_nil()).then_some(handler)
    }

    /// Push the metatable of the value at `idx`. Returns false (pushing
    /// nothing) if it has none.
    pub fn get_metatable(&self, idx: i32) -> bool {
        match self.metatable_of(&self.value_at(idx)) {
            Some(mt) => {
                self.push(Value::Table(mt));
                true
            }
            None => false,
        }
    }

    /// Pop a table (or nil) and make it the metatable of the value at `idx`.
    pub fn set_metatable(&self, idx: i32) -> Result<(), VmError> {
        let target = self.get(idx).ok_or(VmError::InvalidIndex(idx))?;
        let metatable = match self.pop_value() {
            Value::Table(t) => Some(t),
            Value::Nil => None,
            other => {
                return Err(VmError::runtime(format!(
                    "metatable must be a table or nil, got {}",
                    other.type_of()
                )));
            }
        };
        let old = match &target {
            Value::Table(t) => t.borrow_mut().set_metatable(metatable),
            Value::UserData(u) => u.set_metatable(metatable),
            Value::String(_) => self.global().string_metatable.replace(metatable),
            other => {
                return Err(VmError::runtime(format!("cannot set metatable of a {} value", other.type_of())));
            }
        };
        drop(old);
        Ok(())
    }

    /// Push the registry metatable named `name`, creating it if missing.
    /// Returns true if it was created.
    pub fn new_metatable(&self, name: &str) -> bool {
        let existing = self.global().registry.borrow().get_str(name);
        if !existing.is_nil() {
            self.push(existing);
            return false;
        }
        let table: TableRef = Rc::new(RefCell::new(Table::new()));
        let displaced = table.borrow_mut().set_str("__name", Value::string(name));
        drop(displaced);
        let displaced = self.global().registry.borrow_mut().set_str(name, Value::Table(table.clone()));
        drop(displaced);
        self.push(Value::Table(table));
        true
    }

    /// Push the registry metatable named `name` (nil if absent).
    pub fn get_named_metatable(&self, name: &str) -> VmType {
        let value = self.global().registry.borrow().get_str(name);
        let ty = value.type_of();
        self.push(value);
        ty
    }

    /// Push metatable field `event` of the value at `idx`. Returns
    /// `VmType::Nil` and pushes nothing if there is no such field.
    pub fn get_metafield(&self, idx: i32, event: &str) -> VmType {
        match self.metamethod(&self.value_at(idx), event) {
            Some(handler) => {
                let ty = handler.type_of();
                self.push(handler);
                ty
            }
            None => VmType::Nil,
        }
    }

    // ------------------------------------------------------------------
    // Indexing
    // ------------------------------------------------------------------

    /// `object[key]`, honouring `__index`.
    pub fn index(&self, object: &Value, key: &Value) -> Result<Value, VmError> {
        let mut current = object.clone();
        for _ in 0..MAX_META_CHAIN {
            let handler = match &current {
                Value::Table(t) => {
                    let raw = t.borrow().get(key);
                    if !raw.is_nil() {
                        return Ok(raw);
                    }
                    match self.metamethod(&current, "__index") {
                        Some(handler) => handler,
                        None => return Ok(Value::Nil),
                    }
                }
                Value::Vector(v) => {
                    return vector_field(v, key)
                        .ok_or_else(|| VmError::runtime(format!("attempt to index vector with '{}'", key)));
                }
                other => match self.metamethod(other, "__index") {
                    Some(handler) => handler,
                    None => {
                        return Err(VmError::runtime(format!("attempt to index a {} value", other.type_of())));
                    }
                },
            };
            if let Value::Function(_) = handler {
                return self.call_value(handler, &[current, key.clone()]);
            }
            current = handler;
        }
        Err(VmError::runtime("'__index' chain too long; possible loop"))
    }

    /// `object[key] = value`, honouring `__newindex`.
    pub fn new_index(&self, object: &Value, key: Value, value: Value) -> Result<(), VmError> {
        let mut current = object.clone();
        for _ in 0..MAX_META_CHAIN {
            let handler = match &current {
                Value::Table(t) => {
                    let present = !t.borrow().get(&key).is_nil();
                    let handler = if present { None } else { self.metamethod(&current, "__newindex") };
                    match handler {
                        Some(handler) => handler,
                        None => {
                            let displaced = t.borrow_mut().set(key, value)?;
                            drop(displaced);
                            return Ok(());
                        }
                    }
                }
                other => match self.metamethod(other, "__newindex") {
                    Some(handler) => handler,
                    None => {
                        return Err(VmError::runtime(format!("attempt to index a {} value", other.type_of())));
                    }
                },
            };
            if let Value::Function(_) = handler {
                self.call_value(handler, &[current, key, value])?;
                return Ok(());
            }
            current = handler;
        }
        Err(VmError::runtime("'__newindex' chain too long; possible loop"))
    }

    /// Pop a key and push `t[key]` for the value `t` at `idx`.
    pub fn get_table(&self, idx: i32) -> Result<VmType, VmError> {
        let object = self.get(idx).ok_or(VmError::InvalidIndex(idx))?;
        let key = self.pop_value();
        let value = self.index(&object, &key)?;
        let ty = value.type_of();
        self.push(value);
        Ok(ty)
    }

    /// Push `t[name]` for the value `t` at `idx`.
    pub fn get_field(&self, idx: i32, name: &str) -> Result<VmType, VmError> {
        let object = self.get(idx).ok_or(VmError::InvalidIndex(idx))?;
        let key = Value::String(self.new_string(name.as_bytes()));
        let value = self.index(&object, &key)?;
        let ty = value.type_of();
        self.push(value);
        Ok(ty)
    }

    /// Pop a value and a key (key below value) and assign `t[key] = value`.
    pub fn set_table(&self, idx: i32) -> Result<(), VmError> {
        let object = self.get(idx).ok_or(VmError::InvalidIndex(idx))?;
        let value = self.pop_value();
        let key = self.pop_value();
        self.new_index(&object, key, value)
    }

    /// Pop a value and assign `t[name] = value`.
    pub fn set_field(&self, idx: i32, name: &str) -> Result<(), VmError> {
        let object = self.get(idx).ok_or(VmError::InvalidIndex(idx))?;
        let value = self.pop_value();
        let key = Value::String(self.new_string(name.as_bytes()));
        self.new_index(&object, key, value)
    }

    fn table_at(&self, idx: i32) -> Result<TableRef, VmError> {
        match self.get(idx) {
            Some(Value::Table(t)) => Ok(t),
            Some(other) => Err(VmError::runtime(format!("table expected, got {}", other.type_of()))),
            None => Err(VmError::InvalidIndex(idx)),
        }
    }

    /// Pop a key and push the raw value `t[key]`.
    pub fn raw_get(&self, idx: i32) -> Result<VmType, VmError> {
        let table = self.table_at(idx)?;
        let key = self.pop_value();
        let value = table.borrow().get(&key);
        let ty = value.type_of();
        self.push(value);
        Ok(ty)
    }

    /// Push the raw value `t[n]`.
    pub fn raw_get_i(&self, idx: i32, n: i64) -> Result<VmType, VmError> {
        let table = self.table_at(idx)?;
        let value = table.borrow().get_int(n);
        let ty = value.type_of();
        self.push(value);
        Ok(ty)
    }

    /// Push the raw value `t[name]`.
    pub fn raw_get_field(&self, idx: i32, name: &str) -> Result<VmType, VmError> {
        let table = self.table_at(idx)?;
        let value = table.borrow().get_str(name);
        let ty = value.type_of();
        self.push(value);
        Ok(ty)
    }

    /// Pop a value and a key and assign them raw.
    pub fn raw_set(&self, idx: i32) -> Result<(), VmError> {
        let table = self.table_at(idx)?;
        let value = self.pop_value();
        let key = self.pop_value();
        let displaced = table.borrow_mut().set(key, value)?;
        drop(displaced);
        Ok(())
    }

    /// Pop a value and assign it raw to `t[n]`.
    pub fn raw_set_i(&self, idx: i32, n: i64) -> Result<(), VmError> {
        let table = self.table_at(idx)?;
        let value = self.pop_value();
        let displaced = table.borrow_mut().set_int(n, value);
        drop(displaced);
        Ok(())
    }

    /// Pop a value and assign it raw to `t[name]`.
    pub fn raw_set_field(&self, idx: i32, name: &str) -> Result<(), VmError> {
        let table = self.table_at(idx)?;
        let value = self.pop_value();
        let key = Value::String(self.new_string(name.as_bytes()));
        let displaced = table.borrow_mut().set(key, value)?;
        drop(displaced);
        Ok(())
    }

    /// Length without metamethods: table border, string or buffer bytes.
    pub fn raw_len(&self, idx: i32) -> usize {
        match self.value_at(idx) {
            Value::Table(t) => t.borrow().len(),
            Value::String(s) => s.len(),
            Value::Buffer(b) => b.borrow().len(),
            _ => 0,
        }
    }

    /// Pop a key and push the next key/value pair of the table at `idx`.
    /// Returns false, pushing nothing, at the end of the traversal.
    pub fn next(&self, idx: i32) -> Result<bool, VmError> {
        let table = self.table_at(idx)?;
        let key = self.pop_value();
        let entry = table.borrow().next(&key)?;
        drop(key);
        match entry {
            Some((k, v)) => {
                self.push(k);
                self.push(v);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn get_global(&self, name: &str) -> Result<VmType, VmError> {
        let globals = Value::Table(self.global().globals.clone());
        let key = Value::String(self.new_string(name.as_bytes()));
        let value = self.index(&globals, &key)?;
        let ty = value.type_of();
        self.push(value);
        Ok(ty)
    }

    /// Pop a value into global `name`.
    pub fn set_global(&self, name: &str) -> Result<(), VmError> {
        let globals = Value::Table(self.global().globals.clone());
        let value = self.pop_value();
        let key = Value::String(self.new_string(name.as_bytes()));
        self.new_index(&globals, key, value)
    }

    // ------------------------------------------------------------------
    // Operators
    // ------------------------------------------------------------------

    /// Apply `op` to the top two values (top value for `Unm`), replacing
    /// them with the result.
    pub fn arith(&self, op: ArithOp) -> Result<(), VmError> {
        let operands = if op == ArithOp::Unm { 1 } else { 2 };
        if self.get_top() < operands {
            return Err(VmError::InvalidIndex(-operands));
        }
        let b = self.value_at(-1);
        let a = if op == ArithOp::Unm { b.clone() } else { self.value_at(-2) };
        let result = self.arith_values(op, &a, &b)?;
        self.pop(operands);
        self.push(result);
        Ok(())
    }

    pub fn arith_values(&self, op: ArithOp, a: &Value, b: &Value) -> Result<Value, VmError> {
        if let Some(v) = vector_arith(op, a, b) {
            return Ok(v);
        }
        if let (Some(x), Some(y)) = (a.to_number(), b.to_number()) {
            return Ok(Value::Number(op.apply(x, y)));
        }
        let handler = self.metamethod(a, op.event()).or_else(|| self.metamethod(b, op.event()));
        match handler {
            Some(handler) => self.call_value(handler, &[a.clone(), b.clone()]),
            None => {
                let culprit = if a.to_number().is_none() { a } else { b };
                Err(VmError::runtime(format!(
                    "attempt to perform arithmetic on a {} value",
                    culprit.type_of()
                )))
            }
        }
    }

    /// Equality honouring `__eq` for tables and userdata.
    pub fn values_equal(&self, a: &Value, b: &Value) -> Result<bool, VmError> {
        if a.raw_equal(b) {
            return Ok(true);
        }
        let comparable = matches!(
            (a, b),
            (Value::Table(_), Value::Table(_)) | (Value::UserData(_), Value::UserData(_))
        );
        if !comparable {
            return Ok(false);
        }
        match self.metamethod(a, "__eq").or_else(|| self.metamethod(b, "__eq")) {
            Some(handler) => Ok(self.call_value(handler, &[a.clone(), b.clone()])?.is_truthy()),
            None => Ok(false),
        }
    }

    fn values_order(&self, a: &Value, b: &Value, op: CompareOp) -> Result<bool, VmError> {
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => {
                return Ok(if op == CompareOp::Lt { x < y } else { x <= y });
            }
            (Value::String(x), Value::String(y)) => {
                let (x, y) = (x.as_bytes(), y.as_bytes());
                return Ok(if op == CompareOp::Lt { x < y } else { x <= y });
            }
            _ => {}
        }
        let event = if op == CompareOp::Lt { "__lt" } else { "__le" };
        match self.metamethod(a, event).or_else(|| self.metamethod(b, event)) {
            Some(handler) => Ok(self.call_value(handler, &[a.clone(), b.clone()])?.is_truthy()),
            None => Err(VmError::runtime(format!(
                "attempt to compare {} {} {}",
                a.type_of(),
                if op == CompareOp::Lt { "<" } else { "<=" },
                b.type_of()
            ))),
        }
    }

    /// Compare the values at two indices. Invalid indices compare false.
    pub fn compare(&self, i1: i32, i2: i32, op: CompareOp) -> Result<bool, VmError> {
        let (Some(a), Some(b)) = (self.get(i1), self.get(i2)) else {
            return Ok(false);
        };
        match op {
            CompareOp::Eq => self.values_equal(&a, &b),
            CompareOp::Lt | CompareOp::Le => self.values_order(&a, &b, op),
        }
    }

    pub fn equal(&self, i1: i32, i2: i32) -> Result<bool, VmError> {
        self.compare(i1, i2, CompareOp::Eq)
    }

    pub fn less_than(&self, i1: i32, i2: i32) -> Result<bool, VmError> {
        self.compare(i1, i2, CompareOp::Lt)
    }

    /// Concatenate the top `n` values, right to left, replacing them with
    /// the result.
    pub fn concat(&self, n: i32) -> Result<(), VmError> {
        if n <= 0 {
            self.push_string("");
            return Ok(());
        }
        if self.get_top() < n {
            return Err(VmError::InvalidIndex(-n));
        }
        let mut acc = self.value_at(-1);
        for i in 2..=n {
            let lhs = self.value_at(-i);
            acc = self.concat_values(&lhs, &acc)?;
        }
        self.pop(n);
        self.push(acc);
        Ok(())
    }

    pub fn concat_values(&self, a: &Value, b: &Value) -> Result<Value, VmError> {
        if is_string_like(a) && is_string_like(b) {
            let mut bytes = string_bytes(a);
            bytes.extend(string_bytes(b));
            return Ok(Value::String(self.new_string(&bytes)));
        }
        match self.metamethod(a, "__concat").or_else(|| self.metamethod(b, "__concat")) {
            Some(handler) => self.call_value(handler, &[a.clone(), b.clone()]),
            None => {
                let culprit = if is_string_like(a) { b } else { a };
                Err(VmError::runtime(format!(
                    "attempt to concatenate a {} value",
                    culprit.type_of()
                )))
            }
        }
    }

    /// String form of the value at `idx`, honouring `__tostring` and `__name`.
    pub fn to_display_string(&self, idx: i32) -> Result<String, VmError> {
        self.display_value(&self.value_at(idx))
    }

    pub fn display_value(&self, value: &Value) -> Result<String, VmError> {
        if let Some(handler) = self.metamethod(value, "__tostring") {
            return match self.call_value(handler, &[value.clone()])? {
                Value::String(s) => Ok(s.to_string_lossy()),
                Value::Number(n) => Ok(format_number(n)),
                _ => Err(VmError::runtime("'__tostring' must return a string")),
            };
        }
        if let Some(Value::String(name)) = self.metamethod(value, "__name") {
            if let Some(id) = value.identity() {
                return Ok(format!("{}: {:#018x}", name.to_string_lossy(), id));
            }
        }
        Ok(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Vm;

    fn table_with_meta(vm: &Vm) -> (TableRef, TableRef) {
        let t = vm.new_table();
        let mt = vm.new_table();
        vm.set_metatable(-2).unwrap();
        vm.pop(1);
        (t, mt)
    }

    #[test]
    fn fields_round_trip() {
        let vm = Vm::new();
        vm.new_table();
        vm.push_number(5.0);
        vm.set_field(-2, "five").unwrap();
        assert_eq!(vm.get_field(-1, "five").unwrap(), VmType::Number);
        assert_eq!(vm.to_number(-1), Some(5.0));
        vm.pop(1);
        assert_eq!(vm.raw_get_field(-1, "missing").unwrap(), VmType::Nil);
    }

    #[test]
    fn index_follows_table_chain() {
        let vm = Vm::new();
        let (t, mt) = table_with_meta(&vm);
        let fallback = Rc::new(RefCell::new(Table::new()));
        drop(fallback.borrow_mut().set_str("inherited", Value::Number(1.0)));
        drop(mt.borrow_mut().set_str("__index", Value::Table(fallback)));
        let v = vm.index(&Value::Table(t), &Value::string("inherited")).unwrap();
        assert_eq!(v, Value::Number(1.0));
    }

    #[test]
    fn index_calls_function_handler() {
        let vm = Vm::new();
        let (t, mt) = table_with_meta(&vm);
        let f = crate::function::NativeFunction::new(Some("__index"), |t: &Thread| {
            let key = t.check_string(2)?;
            t.push_string(&format!("got {}", key.to_string_lossy()));
            Ok(1)
        });
        drop(mt.borrow_mut().set_str("__index", Value::Function(f)));
        let v = vm.index(&Value::Table(t), &Value::string("k")).unwrap();
        assert_eq!(v, Value::string("got k"));
    }

    #[test]
    fn index_loops_are_detected() {
        let vm = Vm::new();
        let (t, mt) = table_with_meta(&vm);
        drop(mt.borrow_mut().set_str("__index", Value::Table(t.clone())));
        let err = vm.index(&Value::Table(t.clone()), &Value::string("x")).unwrap_err();
        assert!(err.to_string().contains("possible loop"));
        drop(t.borrow_mut().set_metatable(None));
    }

    #[test]
    fn indexing_primitives_fails() {
        let vm = Vm::new();
        let err = vm.index(&Value::Number(1.0), &Value::string("x")).unwrap_err();
        assert_eq!(err.to_string(), "attempt to index a number value");
        let v = vm.index(&Value::Vector([1.0, 2.0, 3.0]), &Value::string("y")).unwrap();
        assert_eq!(v, Value::Number(2.0));
    }

    #[test]
    fn newindex_handler_intercepts_absent_keys() {
        let vm = Vm::new();
        let (t, mt) = table_with_meta(&vm);
        let sink = Rc::new(RefCell::new(Table::new()));
        drop(mt.borrow_mut().set_str("__newindex", Value::Table(sink.clone())));
        vm.new_index(&Value::Table(t.clone()), Value::string("a"), Value::Number(1.0))
            .unwrap();
        assert!(t.borrow().get_str("a").is_nil());
        assert_eq!(sink.borrow().get_str("a"), Value::Number(1.0));
    }

    #[test]
    fn globals() {
        let vm = Vm::new();
        vm.push_boolean(true);
        vm.set_global("flag").unwrap();
        assert_eq!(vm.get_global("flag").unwrap(), VmType::Boolean);
        assert_eq!(vm.get_global("nothing").unwrap(), VmType::Nil);
    }

    #[test]
    fn next_walks_array_then_hash() {
        let vm = Vm::new();
        let t = vm.new_table();
        drop(t.borrow_mut().set_int(1, Value::Number(10.0)));
        drop(t.borrow_mut().set_str("k", Value::Number(20.0)));
        vm.push_nil();
        let mut seen = Vec::new();
        while vm.next(1).unwrap() {
            seen.push(vm.to_number(-1).unwrap_or_default());
            vm.pop(1);
        }
        assert_eq!(seen, vec![10.0, 20.0]);
        assert_eq!(vm.get_top(), 1);
    }

    #[test]
    fn arithmetic() {
        let vm = Vm::new();
        vm.push_number(7.0);
        vm.push_string("2");
        vm.arith(ArithOp::Mod).unwrap();
        assert_eq!(vm.to_number(-1), Some(1.0));
        vm.push_number(-7.0);
        vm.push_number(2.0);
        vm.arith(ArithOp::IDiv).unwrap();
        assert_eq!(vm.to_number(-1), Some(-4.0));
        vm.push_vector(1.0, 2.0, 3.0);
        vm.push_number(2.0);
        vm.arith(ArithOp::Mul).unwrap();
        assert_eq!(vm.to_vector(-1), Some([2.0, 4.0, 6.0]));
        vm.arith(ArithOp::Unm).unwrap();
        assert_eq!(vm.to_vector(-1), Some([-2.0, -4.0, -6.0]));
        vm.push_boolean(true);
        assert!(vm.arith(ArithOp::Add).is_err());
    }

    #[test]
    fn arithmetic_metamethods() {
        let vm = Vm::new();
        let (t, mt) = table_with_meta(&vm);
        let add = crate::function::NativeFunction::new(Some("__add"), |t: &Thread| {
            t.push_number(t.to_number(2).unwrap_or(0.0) + 100.0);
            Ok(1)
        });
        drop(mt.borrow_mut().set_str("__add", Value::Function(add)));
        let v = vm.arith_values(ArithOp::Add, &Value::Table(t), &Value::Number(1.0)).unwrap();
        assert_eq!(v, Value::Number(101.0));
    }

    #[test]
    fn comparisons() {
        let vm = Vm::new();
        vm.push_number(1.0);
        vm.push_number(2.0);
        assert!(vm.less_than(1, 2).unwrap());
        assert!(!vm.equal(1, 2).unwrap());
        vm.push_string("a");
        vm.push_string("b");
        assert!(vm.compare(3, 4, CompareOp::Le).unwrap());
        assert!(vm.less_than(1, 3).is_err());
        assert!(!vm.equal(1, 9).unwrap());
    }

    #[test]
    fn eq_metamethod_only_for_same_kind() {
        let vm = Vm::new();
        let (a, mt) = table_with_meta(&vm);
        let b = Rc::new(RefCell::new(Table::new()));
        drop(b.borrow_mut().set_metatable(Some(mt.clone())));
        let eq = crate::function::NativeFunction::new(Some("__eq"), |t: &Thread| {
            t.push_boolean(true);
            Ok(1)
        });
        drop(mt.borrow_mut().set_str("__eq", Value::Function(eq)));
        assert!(vm.values_equal(&Value::Table(a.clone()), &Value::Table(b)).unwrap());
        assert!(!vm.values_equal(&Value::Table(a), &Value::Number(1.0)).unwrap());
    }

    #[test]
    fn concatenation() {
        let vm = Vm::new();
        vm.push_string("a");
        vm.push_number(1.0);
        vm.push_string("b");
        vm.concat(3).unwrap();
        assert_eq!(vm.get_top(), 1);
        assert_eq!(vm.to_display_string(-1).unwrap(), "a1b");
        vm.push_nil();
        let err = vm.concat(2).unwrap_err();
        assert_eq!(err.to_string(), "attempt to concatenate a nil value");
    }

    #[test]
    fn display_uses_tostring_and_name() {
        let vm = Vm::new();
        let (t, mt) = table_with_meta(&vm);
        drop(mt.borrow_mut().set_str("__name", Value::string("Thing")));
        let shown = vm.display_value(&Value::Table(t.clone())).unwrap();
        assert!(shown.starts_with("Thing: 0x"));
        let f = crate::function::NativeFunction::new(Some("__tostring"), |t: &Thread| {
            t.push_string("custom");
            Ok(1)
        });
        drop(mt.borrow_mut().set_str("__tostring", Value::Function(f)));
        assert_eq!(vm.display_value(&Value::Table(t)).unwrap(), "custom");
    }

    #[test]
    fn named_metatables() {
        let vm = Vm::new();
        assert!(vm.new_metatable("Widget"));
        assert!(!vm.new_metatable("Widget"));
        assert!(vm.raw_equal(-1, -2));
        vm.pop(2);
        assert_eq!(vm.get_named_metatable("Widget"), VmType::Table);
        assert_eq!(vm.get_named_metatable("Nope"), VmType::Nil);
    }

    #[test]
    fn call_metamethod() {
        let vm = Vm::new();
        let (t, mt) = table_with_meta(&vm);
        let call = crate::function::NativeFunction::new(Some("__call"), |t: &Thread| {
            // Receives the table followed by the original arguments.
            assert_eq!(t.type_of(1), VmType::Table);
            t.push_number(t.to_number(2).unwrap_or(0.0) * 2.0);
            Ok(1)
        });
        drop(mt.borrow_mut().set_str("__call", Value::Function(call)));
        vm.push(Value::Table(t));
        vm.push_number(21.0);
        vm.pcall(1, 1).unwrap();
        assert_eq!(vm.to_number(-1), Some(42.0));
    }
}

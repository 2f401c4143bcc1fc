//! VM tables.
//!
//! A table keeps positive integer keys `1..=n` in a dense array part and
//! every other key in an insertion-ordered hash part. Native iteration
//! ([`Table::next`]) walks the array part first, then the hash part in
//! insertion order, skipping nil values.
//!
//! Mutating operations never drop a value while the table is borrowed:
//! displaced values are handed back to the caller, who drops them once the
//! `RefCell` borrow is released. Dropping a value can run a userdata
//! destructor, which may re-enter the VM.

use std::fmt;

use ordered_float::OrderedFloat;
use rustc_hash::FxHashMap;

use crate::error::VmError;
use crate::value::{LightUserData, TableRef, Value, VmString, VmType};

/// Values removed from a table by a mutation, to be dropped by the caller.
pub type Displaced = Vec<Value>;

#[derive(Clone, PartialEq, Eq, Hash)]
enum TableKey {
    Boolean(bool),
    Number(OrderedFloat<f64>),
    Vector([OrderedFloat<f32>; 3]),
    String(VmString),
    LightUserData(LightUserData),
    Ref(VmType, usize),
}

impl TableKey {
    fn from_value(key: &Value) -> Result<Self, VmError> {
        Ok(match key {
            Value::Nil => return Err(VmError::runtime("table index is nil")),
            Value::Boolean(b) => TableKey::Boolean(*b),
            Value::Number(n) if n.is_nan() => return Err(VmError::runtime("table index is NaN")),
            // Adding zero folds -0.0 into 0.0.
            Value::Number(n) => TableKey::Number(OrderedFloat(*n + 0.0)),
            Value::Vector(v) => TableKey::Vector(v.map(OrderedFloat)),
            Value::String(s) => TableKey::String(s.clone()),
            Value::LightUserData(l) => TableKey::LightUserData(*l),
            other => TableKey::Ref(other.type_of(), other.identity().unwrap_or_default()),
        })
    }
}

/// Zero-based array slot for an integral key in `1..`.
fn array_slot(key: &Value) -> Option<usize> {
    match key {
        Value::Number(n) if n.fract() == 0.0 && *n >= 1.0 && *n <= u32::MAX as f64 => Some(*n as usize - 1),
        _ => None,
    }
}

/// A VM table.
#[derive(Default)]
pub struct Table {
    array: Vec<Value>,
    hash: Vec<(Value, Value)>,
    index: FxHashMap<TableKey, usize>,
    dead: usize,
    metatable: Option<TableRef>,
}

const COMPACT_THRESHOLD: usize = 8;

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-size for `narr` array entries and `nrec` hash entries.
    pub fn with_capacity(narr: usize, nrec: usize) -> Self {
        Self {
            array: Vec::with_capacity(narr),
            hash: Vec::with_capacity(nrec),
            index: FxHashMap::with_capacity_and_hasher(nrec, Default::default()),
            ..Self::default()
        }
    }

    /// Raw read. Missing keys read as nil.
    pub fn get(&self, key: &Value) -> Value {
        if let Some(i) = array_slot(key) {
            if let Some(v) = self.array.get(i) {
                return v.clone();
            }
        }
        let Ok(k) = TableKey::from_value(key) else {
            return Value::Nil;
        };
        self.index
            .get(&k)
            .map(|&pos| self.hash[pos].1.clone())
            .unwrap_or_default()
    }

    pub fn get_int(&self, i: i64) -> Value {
        self.get(&Value::Number(i as f64))
    }

    pub fn get_str(&self, key: &str) -> Value {
        self.get(&Value::string(key))
    }

    /// Raw write. Fails for nil and NaN keys.
    pub fn set(&mut self, key: Value, value: Value) -> Result<Displaced, VmError> {
        if let Some(i) = array_slot(&key) {
            if i < self.array.len() {
                let old = std::mem::replace(&mut self.array[i], value);
                while self.array.last().is_some_and(Value::is_nil) {
                    self.array.pop();
                }
                return Ok(vec![old]);
            }
            if i == self.array.len() && !value.is_nil() {
                self.array.push(value);
                self.migrate_from_hash();
                return Ok(Vec::new());
            }
        }

        let k = TableKey::from_value(&key)?;
        if let Some(&pos) = self.index.get(&k) {
            let old = std::mem::replace(&mut self.hash[pos].1, value);
            match (old.is_nil(), self.hash[pos].1.is_nil()) {
                (true, false) => self.dead -= 1,
                (false, true) => self.dead += 1,
                _ => {}
            }
            return Ok(vec![old, key]);
        }
        if value.is_nil() {
            return Ok(vec![key]);
        }

        let displaced = if self.dead > COMPACT_THRESHOLD && self.dead * 2 > self.hash.len() {
            self.compact()
        } else {
            Vec::new()
        };
        self.index.insert(k, self.hash.len());
        self.hash.push((key, value));
        Ok(displaced)
    }

    pub fn set_int(&mut self, i: i64, value: Value) -> Displaced {
        // Integer keys are never nil or NaN.
        self.set(Value::Number(i as f64), value).unwrap_or_default()
    }

    pub fn set_str(&mut self, key: &str, value: Value) -> Displaced {
        self.set(Value::string(key), value).unwrap_or_default()
    }

    /// Move `n+1, n+2, ...` from the hash part onto the end of the array part.
    fn migrate_from_hash(&mut self) {
        loop {
            let next_key = TableKey::Number(OrderedFloat((self.array.len() + 1) as f64));
            let Some(pos) = self.index.remove(&next_key) else {
                return;
            };
            let value = std::mem::take(&mut self.hash[pos].1);
            if value.is_nil() {
                // Already a dead entry; nothing to move.
                return;
            }
            self.dead += 1;
            self.array.push(value);
        }
    }

    /// Drop dead hash entries and rebuild the index.
    fn compact(&mut self) -> Displaced {
        let mut displaced = Vec::new();
        let mut live = Vec::with_capacity(self.hash.len() - self.dead);
        for (k, v) in self.hash.drain(..) {
            if v.is_nil() {
                displaced.push(k);
            } else {
                live.push((k, v));
            }
        }
        self.hash = live;
        self.index.clear();
        for (pos, (k, _)) in self.hash.iter().enumerate() {
            if let Ok(key) = TableKey::from_value(k) {
                self.index.insert(key, pos);
            }
        }
        self.dead = 0;
        displaced
    }

    /// Border length (`#t`) of the array part.
    pub fn len(&self) -> usize {
        self.array.len()
    }

    /// True if no key holds a non-nil value.
    pub fn is_empty(&self) -> bool {
        self.array.is_empty() && self.hash.len() == self.dead
    }

    /// The entry following `key` in native order, or `None` at the end.
    /// A nil key starts the traversal.
    pub fn next(&self, key: &Value) -> Result<Option<(Value, Value)>, VmError> {
        let hash_start = match key {
            Value::Nil => return Ok(self.scan_array(0).or_else(|| self.scan_hash(0))),
            _ => match array_slot(key) {
                Some(i) if i < self.array.len() => {
                    return Ok(self.scan_array(i + 1).or_else(|| self.scan_hash(0)));
                }
                slot => {
                    let k = TableKey::from_value(key)?;
                    match (self.index.get(&k), slot) {
                        (Some(&pos), _) => pos + 1,
                        // An array key whose slot was trimmed during traversal.
                        (None, Some(_)) => 0,
                        (None, None) => return Err(VmError::runtime("invalid key to 'next'")),
                    }
                }
            },
        };
        Ok(self.scan_hash(hash_start))
    }

    fn scan_array(&self, from: usize) -> Option<(Value, Value)> {
        (from..self.array.len())
            .find(|&i| !self.array[i].is_nil())
            .map(|i| (Value::Number((i + 1) as f64), self.array[i].clone()))
    }

    fn scan_hash(&self, from: usize) -> Option<(Value, Value)> {
        self.hash
            .iter()
            .skip(from)
            .find(|(_, v)| !v.is_nil())
            .map(|(k, v)| (k.clone(), v.clone()))
    }

    pub fn metatable(&self) -> Option<TableRef> {
        self.metatable.clone()
    }

    /// Replace the metatable, returning the previous one.
    pub fn set_metatable(&mut self, metatable: Option<TableRef>) -> Option<TableRef> {
        std::mem::replace(&mut self.metatable, metatable)
    }

    /// Empty the table, returning every value it held.
    pub(crate) fn take_contents(&mut self) -> Displaced {
        let mut out: Displaced = self.array.drain(..).collect();
        for (k, v) in self.hash.drain(..) {
            out.push(k);
            out.push(v);
        }
        self.index.clear();
        self.dead = 0;
        out.extend(self.metatable.take().map(Value::Table));
        out
    }
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("array_len", &self.array.len())
            .field("hash_len", &(self.hash.len() - self.dead))
            .field("has_metatable", &self.metatable.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn num(n: f64) -> Value {
        Value::Number(n)
    }

    fn keys(t: &Table) -> Vec<Value> {
        let mut out = Vec::new();
        let mut key = Value::Nil;
        while let Ok(Some((k, _))) = t.next(&key) {
            out.push(k.clone());
            key = k;
        }
        out
    }

    #[test]
    fn sequential_keys_use_array_part() {
        let mut t = Table::new();
        for i in 1..=3 {
            t.set_int(i, num(i as f64 * 10.0));
        }
        assert_eq!(t.len(), 3);
        assert_eq!(t.get_int(2), num(20.0));
        assert_eq!(keys(&t), vec![num(1.0), num(2.0), num(3.0)]);
    }

    #[test]
    fn out_of_order_keys_migrate() {
        let mut t = Table::new();
        t.set_int(2, Value::string("b"));
        assert_eq!(t.len(), 0);
        t.set_int(1, Value::string("a"));
        assert_eq!(t.len(), 2);
        assert_eq!(keys(&t), vec![num(1.0), num(2.0)]);
    }

    #[test]
    fn gaps_stay_in_hash_part() {
        let mut t = Table::new();
        t.set_int(1, Value::string("a"));
        t.set_int(3, Value::string("c"));
        assert_eq!(t.len(), 1);
        assert_eq!(keys(&t), vec![num(1.0), num(3.0)]);
    }

    #[test]
    fn hash_part_keeps_insertion_order() {
        let mut t = Table::new();
        t.set_str("z", num(1.0));
        t.set_str("a", num(2.0));
        t.set_str("m", num(3.0));
        assert_eq!(keys(&t), vec![Value::string("z"), Value::string("a"), Value::string("m")]);
    }

    #[test]
    fn nil_and_nan_keys_are_rejected() {
        let mut t = Table::new();
        assert!(t.set(Value::Nil, num(1.0)).is_err());
        assert!(t.set(num(f64::NAN), num(1.0)).is_err());
        assert!(t.get(&Value::Nil).is_nil());
    }

    #[test]
    fn negative_zero_is_zero() {
        let mut t = Table::new();
        t.set(num(-0.0), Value::Boolean(true)).unwrap();
        assert_eq!(t.get(&num(0.0)), Value::Boolean(true));
    }

    #[test]
    fn clearing_during_traversal() {
        let mut t = Table::new();
        for k in ["a", "b", "c"] {
            t.set_str(k, Value::Boolean(true));
        }
        let mut key = Value::Nil;
        let mut seen = 0;
        while let Ok(Some((k, _))) = t.next(&key) {
            t.set(k.clone(), Value::Nil).unwrap();
            key = k;
            seen += 1;
        }
        assert_eq!(seen, 3);
        assert!(t.is_empty());
    }

    #[test]
    fn invalid_next_key() {
        let t = Table::new();
        assert!(t.next(&Value::string("missing")).is_err());
    }

    #[test]
    fn dead_entries_are_compacted() {
        let mut t = Table::new();
        for i in 0..32 {
            t.set_str(&format!("k{i}"), num(i as f64));
        }
        for i in 0..30 {
            t.set_str(&format!("k{i}"), Value::Nil);
        }
        t.set_str("fresh", num(1.0));
        assert_eq!(keys(&t).len(), 3);
        assert_eq!(t.get_str("k31"), num(31.0));
    }

    #[test]
    fn trailing_nils_shrink_border() {
        let mut t = Table::new();
        for i in 1..=3 {
            t.set_int(i, num(1.0));
        }
        t.set_int(3, Value::Nil);
        assert_eq!(t.len(), 2);
        t.set_int(3, num(1.0));
        assert_eq!(t.len(), 3);
    }
}

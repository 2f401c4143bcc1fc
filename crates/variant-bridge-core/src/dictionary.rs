//! Insertion-ordered host map.

use std::fmt;
use std::hash::{Hash, Hasher};

use rustc_hash::{FxHashMap, FxHasher};

use crate::variant::Variant;

/// A map from [`Variant`] keys to [`Variant`] values.
///
/// Iteration follows insertion order. Equality and hashing ignore order.
#[derive(Clone, Default)]
pub struct Dictionary {
    entries: Vec<(Variant, Variant)>,
    index: FxHashMap<Variant, usize>,
}

impl Dictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            index: FxHashMap::with_capacity_and_hasher(capacity, Default::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &Variant) -> Option<&Variant> {
        self.index.get(key).map(|&i| &self.entries[i].1)
    }

    pub fn get_mut(&mut self, key: &Variant) -> Option<&mut Variant> {
        let i = *self.index.get(key)?;
        Some(&mut self.entries[i].1)
    }

    pub fn contains_key(&self, key: &Variant) -> bool {
        self.index.contains_key(key)
    }

    /// Insert or overwrite. Returns the previous value for the key.
    pub fn insert(&mut self, key: impl Into<Variant>, value: impl Into<Variant>) -> Option<Variant> {
        let key = key.into();
        let value = value.into();
        if let Some(&i) = self.index.get(&key) {
            return Some(std::mem::replace(&mut self.entries[i].1, value));
        }
        self.index.insert(key.clone(), self.entries.len());
        self.entries.push((key, value));
        None
    }

    pub fn remove(&mut self, key: &Variant) -> Option<Variant> {
        let i = self.index.remove(key)?;
        let (_, value) = self.entries.remove(i);
        for slot in self.index.values_mut() {
            if *slot > i {
                *slot -= 1;
            }
        }
        Some(value)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }

    /// Entry at insertion position `i`.
    pub fn get_index(&self, i: usize) -> Option<(&Variant, &Variant)> {
        self.entries.get(i).map(|(k, v)| (k, v))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Variant, &Variant)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &Variant> {
        self.entries.iter().map(|(k, _)| k)
    }

    pub fn values(&self) -> impl Iterator<Item = &Variant> {
        self.entries.iter().map(|(_, v)| v)
    }
}

impl PartialEq for Dictionary {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().all(|(k, v)| other.get(k) == Some(v))
    }
}

impl Eq for Dictionary {}

impl Hash for Dictionary {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let mut combined = 0u64;
        for (k, v) in &self.entries {
            let mut h = FxHasher::default();
            k.hash(&mut h);
            v.hash(&mut h);
            combined = combined.wrapping_add(h.finish());
        }
        self.entries.len().hash(state);
        combined.hash(state);
    }
}

impl<K: Into<Variant>, V: Into<Variant>> FromIterator<(K, V)> for Dictionary {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut dict = Dictionary::new();
        for (k, v) in iter {
            dict.insert(k, v);
        }
        dict
    }
}

impl fmt::Debug for Dictionary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl fmt::Display for Dictionary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("{  }");
        }
        f.write_str("{ ")?;
        for (i, (k, v)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match k {
                Variant::String(_) | Variant::StringName(_) => write!(f, "{:?}: {}", k.to_string(), v)?,
                _ => write!(f, "{}: {}", k, v)?,
            }
        }
        f.write_str(" }")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_overwrites_in_place() {
        let mut d = Dictionary::new();
        assert_eq!(d.insert("a", 1), None);
        d.insert("b", 2);
        assert_eq!(d.insert("a", 3), Some(Variant::Int(1)));
        let keys: Vec<_> = d.keys().cloned().collect();
        assert_eq!(keys, vec![Variant::from("a"), Variant::from("b")]);
    }

    #[test]
    fn remove_keeps_index_consistent() {
        let mut d: Dictionary = [("a", 1), ("b", 2), ("c", 3)].into_iter().collect();
        assert_eq!(d.remove(&Variant::from("a")), Some(Variant::Int(1)));
        assert_eq!(d.get(&Variant::from("c")), Some(&Variant::Int(3)));
        assert_eq!(d.get_index(0).map(|(k, _)| k.clone()), Some(Variant::from("b")));
    }

    #[test]
    fn equality_ignores_order() {
        let a: Dictionary = [("x", 1), ("y", 2)].into_iter().collect();
        let b: Dictionary = [("y", 2), ("x", 1)].into_iter().collect();
        assert_eq!(a, b);
        assert_eq!(Variant::from(a), Variant::from(b));
    }

    #[test]
    fn display() {
        let d: Dictionary = [("name", Variant::from("Alice"))].into_iter().collect();
        assert_eq!(d.to_string(), "{ \"name\": Alice }");
        assert_eq!(Dictionary::new().to_string(), "{  }");
    }
}

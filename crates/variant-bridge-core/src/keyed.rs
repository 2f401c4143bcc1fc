//! Keyed read/write on variants (`v[key]`, `v.key`).

use crate::variant::Variant;

fn axis_index(key: &Variant, names: &[&str]) -> Option<i64> {
    match key {
        Variant::Int(i) => Some(*i),
        _ => names.iter().position(|n| Some(*n) == key.as_str()).map(|i| i as i64),
    }
}

/// Resolve a possibly negative sequence index against `len`.
fn sequence_index(key: &Variant, len: usize) -> Option<usize> {
    let i = key.as_int()?;
    let resolved = if i < 0 { i.checked_add(len as i64)? } else { i };
    usize::try_from(resolved).ok().filter(|&i| i < len)
}

impl Variant {
    /// Read `self[key]`. `None` if the key is absent or the type is not keyed.
    pub fn get_keyed(&self, key: &Variant) -> Option<Variant> {
        match self {
            Variant::Vector2(v) => v.axis(axis_index(key, &["x", "y"])?).map(|f| Variant::Float(f as f64)),
            Variant::Vector3(v) => v.axis(axis_index(key, &["x", "y", "z"])?).map(|f| Variant::Float(f as f64)),
            Variant::Color(c) => c
                .channel(axis_index(key, &["r", "g", "b", "a"])?)
                .map(|f| Variant::Float(f as f64)),
            Variant::Array(a) => a.get(sequence_index(key, a.len())?).cloned(),
            Variant::PackedByteArray(b) => b.get(sequence_index(key, b.len())?).map(|&x| Variant::Int(x as i64)),
            Variant::PackedStringArray(s) => s.get(sequence_index(key, s.len())?).map(|x| Variant::from(x.as_str())),
            Variant::String(s) => {
                let i = sequence_index(key, s.chars().count())?;
                s.chars().nth(i).map(|c| Variant::String(c.to_string()))
            }
            Variant::Dictionary(d) => d.get(key).cloned(),
            Variant::Object(o) => o.get()?.get(key),
            _ => None,
        }
    }

    /// Write `self[key] = value`. Returns false if the write is not valid.
    pub fn set_keyed(&mut self, key: &Variant, value: Variant) -> bool {
        let component = value.as_float().map(|f| f as f32);
        match self {
            Variant::Vector2(v) => match (axis_index(key, &["x", "y"]), component) {
                (Some(i), Some(f)) => v.set_axis(i, f),
                _ => false,
            },
            Variant::Vector3(v) => match (axis_index(key, &["x", "y", "z"]), component) {
                (Some(i), Some(f)) => v.set_axis(i, f),
                _ => false,
            },
            Variant::Color(c) => match (axis_index(key, &["r", "g", "b", "a"]), component) {
                (Some(i), Some(f)) => c.set_channel(i, f),
                _ => false,
            },
            Variant::Array(a) => match sequence_index(key, a.len()) {
                Some(i) => a.set(i, value),
                None => false,
            },
            Variant::PackedByteArray(b) => {
                let byte = value.as_int().and_then(|i| u8::try_from(i).ok());
                match (sequence_index(key, b.len()), byte) {
                    (Some(i), Some(x)) => {
                        b[i] = x;
                        true
                    }
                    _ => false,
                }
            }
            Variant::PackedStringArray(s) => match (sequence_index(key, s.len()), value.as_str()) {
                (Some(i), Some(text)) => {
                    s[i] = text.to_string();
                    true
                }
                _ => false,
            },
            Variant::Dictionary(d) => {
                d.insert(key.clone(), value);
                true
            }
            Variant::Object(o) => o.get().is_some_and(|obj| obj.set(key, &value)),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dictionary::Dictionary;
    use crate::math::Vector3;

    #[test]
    fn vector_components() {
        let mut v = Variant::Vector3(Vector3::new(1.0, 2.0, 3.0));
        assert_eq!(v.get_keyed(&"y".into()), Some(Variant::Float(2.0)));
        assert_eq!(v.get_keyed(&Variant::Int(2)), Some(Variant::Float(3.0)));
        assert_eq!(v.get_keyed(&"w".into()), None);
        assert!(v.set_keyed(&"x".into(), Variant::Int(9)));
        assert_eq!(v.get_keyed(&"x".into()), Some(Variant::Float(9.0)));
        assert!(!v.set_keyed(&"x".into(), "nope".into()));
    }

    #[test]
    fn array_indexing_allows_negative() {
        let mut a = Variant::from(vec![Variant::Int(1), Variant::Int(2)]);
        assert_eq!(a.get_keyed(&Variant::Int(-1)), Some(Variant::Int(2)));
        assert_eq!(a.get_keyed(&Variant::Int(2)), None);
        assert!(a.set_keyed(&Variant::Int(0), "first".into()));
        assert!(!a.set_keyed(&Variant::Int(5), Variant::Nil));
    }

    #[test]
    fn dictionary_insert_on_write() {
        let mut d = Variant::from(Dictionary::new());
        assert_eq!(d.get_keyed(&"k".into()), None);
        assert!(d.set_keyed(&"k".into(), Variant::Int(1)));
        assert_eq!(d.get_keyed(&"k".into()), Some(Variant::Int(1)));
    }

    #[test]
    fn bytes_reject_out_of_range_values() {
        let mut b = Variant::PackedByteArray(vec![0, 0]);
        assert!(b.set_keyed(&Variant::Int(1), Variant::Int(255)));
        assert!(!b.set_keyed(&Variant::Int(1), Variant::Int(256)));
    }

    #[test]
    fn plain_values_are_not_keyed() {
        let mut n = Variant::Int(3);
        assert_eq!(n.get_keyed(&Variant::Int(0)), None);
        assert!(!n.set_keyed(&Variant::Int(0), Variant::Nil));
    }
}

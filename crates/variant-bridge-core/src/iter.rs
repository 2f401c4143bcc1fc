//! The host iteration protocol.
//!
//! Iteration is driven by an opaque state variant: [`Variant::iter_init`]
//! produces the first state, [`Variant::iter_next`] advances it, and
//! [`Variant::iter_get`] reads the element at a state. Integers iterate the
//! range `0..n`, sequences and strings yield their elements, dictionaries
//! yield their keys in insertion order.

use crate::variant::Variant;

impl Variant {
    pub fn is_iterable(&self) -> bool {
        matches!(
            self,
            Variant::Int(_)
                | Variant::String(_)
                | Variant::PackedByteArray(_)
                | Variant::PackedStringArray(_)
                | Variant::Array(_)
                | Variant::Dictionary(_)
        )
    }

    fn iter_len(&self) -> Option<usize> {
        Some(match self {
            Variant::Int(n) => usize::try_from(*n).unwrap_or(0),
            Variant::String(s) => s.chars().count(),
            Variant::PackedByteArray(b) => b.len(),
            Variant::PackedStringArray(s) => s.len(),
            Variant::Array(a) => a.len(),
            Variant::Dictionary(d) => d.len(),
            _ => return None,
        })
    }

    /// First iteration state, or `None` when empty or not iterable.
    pub fn iter_init(&self) -> Option<Variant> {
        (self.iter_len()? > 0).then_some(Variant::Int(0))
    }

    /// Advance `state`. Returns false when iteration is finished.
    pub fn iter_next(&self, state: &mut Variant) -> bool {
        let (Some(len), Some(i)) = (self.iter_len(), state.as_int()) else {
            return false;
        };
        let next = i.saturating_add(1);
        if usize::try_from(next).is_ok_and(|n| n < len) {
            *state = Variant::Int(next);
            true
        } else {
            false
        }
    }

    /// Element at `state`.
    pub fn iter_get(&self, state: &Variant) -> Option<Variant> {
        let i = usize::try_from(state.as_int()?).ok()?;
        match self {
            Variant::Int(_) => Some(Variant::Int(i as i64)).filter(|_| i < self.iter_len().unwrap_or(0)),
            Variant::String(s) => s.chars().nth(i).map(|c| Variant::String(c.to_string())),
            Variant::PackedByteArray(b) => b.get(i).map(|&x| Variant::Int(x as i64)),
            Variant::PackedStringArray(s) => s.get(i).map(|x| Variant::from(x.as_str())),
            Variant::Array(a) => a.get(i).cloned(),
            Variant::Dictionary(d) => d.get_index(i).map(|(k, _)| k.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dictionary::Dictionary;

    fn collect(v: &Variant) -> Vec<Variant> {
        let mut out = Vec::new();
        let Some(mut state) = v.iter_init() else {
            return out;
        };
        loop {
            out.extend(v.iter_get(&state));
            if !v.iter_next(&mut state) {
                return out;
            }
        }
    }

    #[test]
    fn integer_range() {
        assert_eq!(collect(&Variant::Int(3)), vec![Variant::Int(0), Variant::Int(1), Variant::Int(2)]);
        assert!(collect(&Variant::Int(-1)).is_empty());
    }

    #[test]
    fn array_elements() {
        let a = Variant::from(vec![Variant::from("a"), Variant::from("b")]);
        assert_eq!(collect(&a), vec![Variant::from("a"), Variant::from("b")]);
    }

    #[test]
    fn dictionary_keys_in_order() {
        let d: Dictionary = [("b", 1), ("a", 2)].into_iter().collect();
        assert_eq!(collect(&Variant::from(d)), vec![Variant::from("b"), Variant::from("a")]);
    }

    #[test]
    fn non_iterables() {
        assert!(!Variant::Float(1.0).is_iterable());
        assert!(Variant::Float(1.0).iter_init().is_none());
        assert!(Variant::from(Vec::<Variant>::new()).iter_init().is_none());
    }
}

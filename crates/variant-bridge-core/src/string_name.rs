//! Interned-style immutable names.

use std::borrow::Borrow;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// An immutable, cheaply clonable name.
///
/// Clones share one allocation, so equality first compares pointers and only
/// falls back to content comparison for names built independently. A
/// `StringName` is `Send + Sync`, which lets process-wide caches hand them
/// out to any host thread.
#[derive(Clone)]
pub struct StringName(Arc<str>);

impl StringName {
    pub fn new(name: &str) -> Self {
        Self(Arc::from(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if both names share the same allocation.
    pub fn ptr_eq(&self, other: &StringName) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Default for StringName {
    fn default() -> Self {
        Self::new("")
    }
}

impl PartialEq for StringName {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || *self.0 == *other.0
    }
}

impl Eq for StringName {}

impl PartialOrd for StringName {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for StringName {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl Hash for StringName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl Borrow<str> for StringName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for StringName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for StringName {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

impl fmt::Debug for StringName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "&{:?}", &*self.0)
    }
}

impl fmt::Display for StringName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_storage() {
        let a = StringName::new("position");
        let b = a.clone();
        assert!(a.ptr_eq(&b));
    }

    #[test]
    fn independent_names_compare_by_content() {
        let a = StringName::new("position");
        let b = StringName::from(String::from("position"));
        assert!(!a.ptr_eq(&b));
        assert_eq!(a, b);
    }

    #[test]
    fn debug_marks_names() {
        assert_eq!(format!("{:?}", StringName::new("x")), "&\"x\"");
    }
}

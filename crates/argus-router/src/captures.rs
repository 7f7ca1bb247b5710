//! Positional wildcard captures.
//!
//! Captured values are stored in a small vector so the common case of one
//! to four wildcards never allocates the container on the heap.

use smallvec::SmallVec;

/// Maximum number of captures stored inline.
const INLINE_CAPTURES: usize = 4;

/// Text matched by each wildcard of a pattern, in pattern order.
///
/// # Example
///
/// ```rust
/// use argus_router::Captures;
///
/// let mut captures = Captures::new();
/// captures.push("cam1");
/// captures.push("42");
///
/// assert_eq!(captures.get(0), Some("cam1"));
/// assert_eq!(captures.get(1), Some("42"));
/// assert_eq!(captures.get(2), None);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Captures {
    inner: SmallVec<[String; INLINE_CAPTURES]>,
}

impl Captures {
    /// Creates an empty capture set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a captured value.
    pub fn push(&mut self, value: impl Into<String>) {
        self.inner.push(value.into());
    }

    /// Returns the capture at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&str> {
        self.inner.get(index).map(String::as_str)
    }

    /// Returns the number of captures.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns true if nothing was captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns an iterator over the captures.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.inner.iter().map(String::as_str)
    }

    /// Drops every capture past `len`.
    pub(crate) fn truncate(&mut self, len: usize) {
        self.inner.truncate(len);
    }

    /// Consumes the set into a plain vector.
    #[must_use]
    pub fn into_vec(self) -> Vec<String> {
        self.inner.into_vec()
    }
}

impl FromIterator<String> for Captures {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self {
            inner: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_captures_new() {
        let captures = Captures::new();
        assert!(captures.is_empty());
        assert_eq!(captures.len(), 0);
    }

    #[test]
    fn test_captures_order() {
        let mut captures = Captures::new();
        captures.push("a");
        captures.push("b");
        let all: Vec<_> = captures.iter().collect();
        assert_eq!(all, vec!["a", "b"]);
    }

    #[test]
    fn test_captures_truncate() {
        let mut captures: Captures = ["x", "y", "z"].iter().map(|s| (*s).to_string()).collect();
        captures.truncate(1);
        assert_eq!(captures.into_vec(), vec!["x".to_string()]);
    }

    #[test]
    fn test_captures_spill_past_inline() {
        let mut captures = Captures::new();
        for i in 0..10 {
            captures.push(format!("v{i}"));
        }
        assert_eq!(captures.len(), 10);
        assert_eq!(captures.get(7), Some("v7"));
    }
}

//! Interned Names
//!
//! Render-graph resources, attachments and named pipelines are identified by
//! short strings that are compared and hashed constantly. This module interns
//! them into integer-backed [`Name`]s so comparisons and map lookups are O(1)
//! and keys carry no heap pointers.

use std::fmt;

use lasso::{Spur, ThreadedRodeo};
use once_cell::sync::Lazy;

/// Global string interner instance (thread-safe).
static INTERNER: Lazy<ThreadedRodeo> = Lazy::new(ThreadedRodeo::new);

/// An interned, copyable string identifier.
///
/// Two `Name`s constructed from equal strings are equal, and equality is an
/// integer comparison. `Name` is the key type for render-graph resources and
/// the named pipeline registries.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Name(Spur);

impl Name {
    /// Interns `s` and returns its `Name`.
    ///
    /// If the string already exists in the intern pool, the existing symbol
    /// is returned; otherwise the string is added to the pool.
    #[must_use]
    pub fn new(s: &str) -> Self {
        Self(INTERNER.get_or_intern(s))
    }

    /// Resolves the name back to its string.
    #[must_use]
    #[inline]
    pub fn as_str(&self) -> &'static str {
        INTERNER.resolve(&self.0)
    }
}

impl From<&str> for Name {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Name({})", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_strings_intern_to_equal_names() {
        let a = Name::new("depth");
        let b = Name::from("depth");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "depth");
    }

    #[test]
    fn distinct_strings_intern_to_distinct_names() {
        assert_ne!(Name::new("color"), Name::new("color_ms"));
    }
}

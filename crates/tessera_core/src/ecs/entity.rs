//! # Entity Handles
//!
//! Entities are opaque non-negative integers handed in by the caller.
//! Allocation and recycling live outside this crate; storage only uses the
//! handle as a row key.

use std::fmt;

/// Opaque entity handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Entity(u64);

impl Entity {
    /// Null/invalid entity.
    pub const NULL: Self = Self(u64::MAX);

    /// Wraps a raw handle.
    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw handle.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Checks if this handle is null/invalid.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == u64::MAX
    }
}

impl Default for Entity {
    fn default() -> Self {
        Self::NULL
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("entity(null)")
        } else {
            write!(f, "entity({})", self.0)
        }
    }
}

impl From<u64> for Entity {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

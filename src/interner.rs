//! String interning for graph node keys
//!
//! Every key in a node table is an interned `Arc<str>`: one allocation per
//! unique key, O(1) cloning, and cheap hashing when the same key circulates
//! through merged graphs.

use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;

/// Global key interner (thread-safe, lock-free)
static INTERNER: Lazy<Interner> = Lazy::new(Interner::new);

/// Thread-safe string interner using DashMap
pub struct Interner {
    keys: DashMap<Arc<str>, ()>,
}

impl Interner {
    pub fn new() -> Self {
        Self {
            keys: DashMap::new(),
        }
    }

    /// Intern a key, returning a shared `Arc<str>`.
    ///
    /// If the key was already interned, returns the existing Arc.
    pub fn intern(&self, s: &str) -> Arc<str> {
        let key: Arc<str> = Arc::from(s);

        if let Some(existing) = self.keys.get(&key) {
            return Arc::clone(existing.key());
        }

        self.keys.insert(Arc::clone(&key), ());
        key
    }
}

impl Default for Interner {
    fn default() -> Self {
        Self::new()
    }
}

/// Intern a key through the global interner.
#[inline]
pub fn intern(s: &str) -> Arc<str> {
    INTERNER.intern(s)
}

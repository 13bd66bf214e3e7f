//! Case- and space-insensitive object names.
//!
//! The cube server treats `"Business Unit"`, `"businessunit"` and
//! `"BUSINESS UNIT"` as the same dimension, hierarchy or element. Every
//! comparison of such names in cubist goes through [`normalize_name`].

use std::fmt;
use std::hash::{Hash, Hasher};

/// Lowercase the name and drop all whitespace.
pub fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Compare two names the way the server does.
pub fn names_equal(a: &str, b: &str) -> bool {
    // Fast path avoids allocation for the common exact match
    a == b || normalize_name(a) == normalize_name(b)
}

/// A name that remembers its original spelling but compares and hashes
/// on its normalized form.
#[derive(Clone)]
pub struct NameKey {
    original: String,
    normalized: String,
}

impl NameKey {
    pub fn new(name: impl Into<String>) -> Self {
        let original = name.into();
        let normalized = normalize_name(&original);
        Self {
            original,
            normalized,
        }
    }

    /// The spelling the key was created with.
    pub fn as_str(&self) -> &str {
        &self.original
    }

    /// The normalized form used for comparison.
    pub fn normalized(&self) -> &str {
        &self.normalized
    }
}

impl PartialEq for NameKey {
    fn eq(&self, other: &Self) -> bool {
        self.normalized == other.normalized
    }
}

impl Eq for NameKey {}

impl Hash for NameKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.normalized.hash(state);
    }
}

impl fmt::Debug for NameKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.original)
    }
}

impl fmt::Display for NameKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.original)
    }
}

impl From<&str> for NameKey {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for NameKey {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

//! Rekon core types: object identity and sync outcomes.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Failure to derive an [`ObjectKey`] from object metadata or a rendered key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("object has no metadata.name")]
    MissingName,
    #[error("unexpected key format: {0:?}")]
    Malformed(String),
}

/// Identity of a tracked object within its collection.
///
/// Rendered as `namespace/name`, or just `name` for cluster-scoped objects.
/// An empty namespace is normalized to `None` so that both spellings of a
/// cluster-scoped key hash identically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    /// Key in `namespace`; an empty namespace yields a cluster-scoped key.
    pub fn namespaced(namespace: &str, name: &str) -> Self {
        Self { namespace: Some(namespace).filter(|ns| !ns.is_empty()).map(str::to_string), name: name.to_string() }
    }

    pub fn cluster(name: &str) -> Self {
        Self { namespace: None, name: name.to_string() }
    }

    /// Build a key from `metadata.namespace` / `metadata.name`.
    pub fn from_meta(namespace: Option<&str>, name: Option<&str>) -> Result<Self, KeyError> {
        let name = match name {
            Some(n) if !n.is_empty() => n,
            _ => return Err(KeyError::MissingName),
        };
        if name.contains('/') {
            return Err(KeyError::Malformed(name.to_string()));
        }
        let namespace = namespace.filter(|ns| !ns.is_empty());
        if namespace.is_some_and(|ns| ns.contains('/')) {
            return Err(KeyError::Malformed(format!("{}/{}", namespace.unwrap_or_default(), name)));
        }
        Ok(Self { namespace: namespace.map(|s| s.to_string()), name: name.to_string() })
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

impl FromStr for ObjectKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [name] if !name.is_empty() => Ok(Self::cluster(name)),
            [ns, name] if !name.is_empty() => Self::from_meta(Some(ns), Some(name)),
            _ => Err(KeyError::Malformed(s.to_string())),
        }
    }
}

/// Successful result of a single sync attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncOutcome {
    /// Observed state matches desired state (or the object is gone); forget the key.
    Synced,
    /// Not yet actionable; retry later with backoff without counting as an error.
    Requeue,
}

pub mod prelude {
    pub use super::{KeyError, ObjectKey, SyncOutcome};
}

//! Reconcile keys.
//!
//! The work queue carries plain `namespace/name` strings. Decomposing a string
//! back into a [`ReconcileKey`] happens once, at the start of a reconciliation,
//! so a malformed entry is detected before any remote call is made.

use crate::error::{OperatorError, OperatorResult};
use kube::Resource;
use std::fmt;
use std::str::FromStr;

/// Identity of one managed Deployment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReconcileKey {
    namespace: String,
    name: String,
}

impl ReconcileKey {
    /// Create a key from its parts.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Split a queue entry of the form `namespace/name`.
    ///
    /// Anything else (no separator, an empty segment, or more than one
    /// separator) is rejected with [`OperatorError::MalformedKey`].
    pub fn parse(raw: &str) -> OperatorResult<Self> {
        match raw.split_once('/') {
            Some((namespace, name))
                if !namespace.is_empty() && !name.is_empty() && !name.contains('/') =>
            {
                Ok(Self::new(namespace, name))
            }
            _ => Err(OperatorError::MalformedKey(raw.to_string())),
        }
    }

    /// Namespace of the managed resource.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Name of the managed resource.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ReconcileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for ReconcileKey {
    type Err = OperatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Queue key for an object: `namespace/name`, or just `name` when the object
/// carries no namespace.
pub fn object_key<K: Resource>(obj: &K) -> String {
    let meta = obj.meta();
    let name = meta.name.as_deref().unwrap_or_default();
    match meta.namespace.as_deref() {
        Some(namespace) if !namespace.is_empty() => format!("{namespace}/{name}"),
        _ => name.to_string(),
    }
}

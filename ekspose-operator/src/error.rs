//! Error types for the ekspose controller.

use thiserror::Error;

/// Errors that can occur during controller operations.
#[derive(Debug, Error)]
pub enum OperatorError {
    /// A queue key that does not decompose into `namespace/name`.
    #[error("Malformed reconcile key {0:?}: expected <namespace>/<name>")]
    MalformedKey(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The local cache never finished its initial listing.
    #[error("Cache for {0} did not sync before shutdown")]
    CacheNotSynced(String),
}

/// Result type for controller operations.
pub type OperatorResult<T> = Result<T, OperatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_offending_value() {
        assert_eq!(
            OperatorError::MalformedKey("a/b/c".into()).to_string(),
            "Malformed reconcile key \"a/b/c\": expected <namespace>/<name>"
        );
        assert_eq!(
            OperatorError::CacheNotSynced("Deployments".into()).to_string(),
            "Cache for Deployments did not sync before shutdown"
        );
    }
}

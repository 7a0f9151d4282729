//! Error types for lease store operations.
//!
//! Backends map their transport-specific failures onto these variants so the
//! protocol engine can tell a lost revision race apart from an unreachable store.

use thiserror::Error;

/// Top-level error type for the lease-store crate.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection or transport-level failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Operation did not complete in time; its outcome is unknown.
    #[error("timeout: {0}")]
    Timeout(String),

    /// A version-checked write found a different revision than expected
    /// (or, for a create, found an existing record).
    #[error("revision mismatch on key '{key}'")]
    RevisionMismatch { key: String },

    /// A merge-write targeted a record that does not exist.
    #[error("no record for key '{key}'")]
    NotFound { key: String },

    /// Codec error during serialization or deserialization.
    #[error("codec error: {0}")]
    Codec(String),

    /// Configuration error (e.g. missing credentials for a security mode).
    #[error("configuration error: {0}")]
    Config(String),

    /// The store client is not connected.
    #[error("not connected: {0}")]
    NotConnected(String),
}

impl StoreError {
    /// Returns true if a concurrent writer won the race for this key.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::RevisionMismatch { .. })
    }
}

/// Shorthand result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_revision_mismatch_is_a_conflict() {
        assert!(StoreError::RevisionMismatch { key: "k".into() }.is_conflict());
        assert!(!StoreError::Transport("conn reset".into()).is_conflict());
        assert!(!StoreError::NotConnected("no conn".into()).is_conflict());
        assert!(!StoreError::NotFound { key: "k".into() }.is_conflict());
    }

    #[test]
    fn test_error_display() {
        let err = StoreError::RevisionMismatch {
            key: "sessions/alice".into(),
        };
        assert_eq!(err.to_string(), "revision mismatch on key 'sessions/alice'");
    }
}

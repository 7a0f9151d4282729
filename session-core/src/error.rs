//! Error taxonomy for the lease protocol and the session built on it.

use chrono::{DateTime, Utc};
use lease_store::{HolderInfo, StoreError};
use thiserror::Error;

use crate::identity::AuthError;

/// Outcome of a lease protocol operation that did not go the caller's way.
#[derive(Debug, Error)]
pub enum LeaseError {
    /// Another session holds an unexpired lease on the account.
    #[error("lease held by another session ({holder_info}) until {expires_at}")]
    Conflict {
        holder_info: HolderInfo,
        expires_at: DateTime<Utc>,
    },

    /// A renewal could not be confirmed. Soft: retried on the next beat and
    /// only escalated once the eviction watcher observes the takeover.
    #[error("lease is no longer owned by this session")]
    Lost,

    /// The store failed or its answer is unknown. Never treated as success.
    #[error("lease store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),
}

impl LeaseError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, LeaseError::Conflict { .. })
    }
}

impl From<StoreError> for LeaseError {
    fn from(err: StoreError) -> Self {
        LeaseError::StoreUnavailable(err)
    }
}

/// Errors surfaced to whoever drives sign-in and sign-out.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The account is signed in elsewhere; local authentication was rolled back.
    #[error("this account is already signed in on another device ({holder_info})")]
    AlreadySignedInElsewhere { holder_info: HolderInfo },

    /// Sign-in could not be confirmed; local authentication was rolled back.
    #[error("session service unavailable, please retry: {0}")]
    Unavailable(#[source] LeaseError),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl From<LeaseError> for SessionError {
    fn from(err: LeaseError) -> Self {
        match err {
            LeaseError::Conflict { holder_info, .. } => {
                SessionError::AlreadySignedInElsewhere { holder_info }
            }
            other => SessionError::Unavailable(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_error_classification() {
        let conflict = LeaseError::Conflict {
            holder_info: "laptop".into(),
            expires_at: Utc::now(),
        };
        assert!(conflict.is_conflict());
        assert!(!LeaseError::Lost.is_conflict());
        assert!(!LeaseError::from(StoreError::Timeout("slow".into())).is_conflict());
    }

    #[test]
    fn test_conflict_becomes_signed_in_elsewhere() {
        let err: SessionError = LeaseError::Conflict {
            holder_info: "laptop".into(),
            expires_at: Utc::now(),
        }
        .into();
        match err {
            SessionError::AlreadySignedInElsewhere { holder_info } => {
                assert_eq!(holder_info.as_str(), "laptop")
            }
            other => panic!("unexpected {other:?}"),
        }

        let err: SessionError = LeaseError::StoreUnavailable(StoreError::NotConnected(
            "down".into(),
        ))
        .into();
        assert!(matches!(err, SessionError::Unavailable(_)));
        assert!(err.to_string().contains("please retry"));
    }
}

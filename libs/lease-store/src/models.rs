//! Typed lease record and the identifiers it carries.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::{StoreError, StoreResult};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Opaque account identifier produced by authentication; the record key.
    AccountId
);
string_id!(
    /// Per-attempt session identifier; the only thing mutual exclusion compares.
    SessionToken
);
string_id!(
    /// Descriptive per-device metadata. Never used for ownership checks.
    HolderInfo
);

impl SessionToken {
    /// Fresh random token for a new sign-in attempt.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// Store-assigned version of a record, bumped on every committed write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(pub u64);

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A value together with the revision it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub value: T,
    pub revision: Revision,
}

/// The single record guarding an account's session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseRecord {
    pub owner_account_id: AccountId,
    pub session_token: SessionToken,
    pub holder_info: HolderInfo,
    /// Stamped by the store on commit; whatever the writer puts here is replaced.
    pub last_renewed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LeaseRecord {
    pub fn new(
        owner_account_id: AccountId,
        session_token: SessionToken,
        holder_info: HolderInfo,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            owner_account_id,
            session_token,
            holder_info,
            last_renewed_at: now,
            expires_at,
        }
    }

    pub fn is_owned_by(&self, token: &SessionToken) -> bool {
        &self.session_token == token
    }

    /// Expired once `expires_at + grace` lies strictly before `now`.
    pub fn is_expired(&self, now: DateTime<Utc>, grace: chrono::Duration) -> bool {
        self.expires_at + grace < now
    }

    /// Apply a merge-write. Token and expiry always change together.
    pub fn apply(&mut self, patch: &LeasePatch) {
        self.session_token = patch.session_token.clone();
        self.expires_at = patch.expires_at;
    }
}

/// Partial update written by a renewal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeasePatch {
    pub session_token: SessionToken,
    pub expires_at: DateTime<Utc>,
}

/// encode a payload as JSON bytes
pub fn encode<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| StoreError::Codec(format!("encode failed: {e}")))
}

/// decode a payload from JSON bytes
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Codec(format!("decode failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> LeaseRecord {
        let now = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        LeaseRecord::new(
            "alice".into(),
            "tok-1".into(),
            "device-1".into(),
            now,
            now + chrono::Duration::seconds(60),
        )
    }

    #[test]
    fn test_wire_field_names() {
        let json: serde_json::Value = serde_json::from_slice(&encode(&sample()).unwrap()).unwrap();
        assert_eq!(json["ownerAccountId"], "alice");
        assert_eq!(json["sessionToken"], "tok-1");
        assert_eq!(json["holderInfo"], "device-1");
        assert_eq!(json["expiresAt"], "2026-01-01T00:01:00Z");
        assert!(json.get("lastRenewedAt").is_some());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = decode::<LeaseRecord>(b"{\"sessionToken\": 3}").unwrap_err();
        assert!(matches!(err, StoreError::Codec(_)));
    }

    #[test]
    fn test_expiry_is_strict() {
        let record = sample();
        let grace = chrono::Duration::zero();
        assert!(!record.is_expired(record.expires_at, grace));
        assert!(record.is_expired(record.expires_at + chrono::Duration::milliseconds(1), grace));
        assert!(!record.is_expired(
            record.expires_at + chrono::Duration::seconds(1),
            chrono::Duration::seconds(2)
        ));
    }

    #[test]
    fn test_apply_patch_moves_token_and_expiry_together() {
        let mut record = sample();
        let later = record.expires_at + chrono::Duration::seconds(20);
        record.apply(&LeasePatch {
            session_token: "tok-1".into(),
            expires_at: later,
        });
        assert_eq!(record.expires_at, later);
        assert!(record.is_owned_by(&"tok-1".into()));
        assert_eq!(record.holder_info.as_str(), "device-1");
    }

    #[test]
    fn test_generated_tokens_are_unique() {
        assert_ne!(SessionToken::generate(), SessionToken::generate());
    }
}

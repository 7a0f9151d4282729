//! # lease-store
//!
//! Storage seam for single-active-session leases. One record per account,
//! keyed by account id, with version-checked writes and a change feed.
//!
//! This library provides:
//! - **Typed models** for the lease record and its identifiers.
//! - **`LeaseStore` trait** with point reads, version-checked create/update/
//!   merge/delete, a change feed and the store's time reference.
//! - **Optimistic transactions** ([`transact`]) layered on the version checks.
//! - **Backends**: an in-memory store and a JetStream KV store.
//!
//! Every write a backend commits bumps the record's [`Revision`], and the
//! version checks are linearizable per key. That is all the protocol engine
//! relies on for mutual exclusion.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

pub mod clock;
pub mod error;
pub mod memory;
pub mod models;
pub mod nats;
pub mod txn;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use models::{AccountId, HolderInfo, LeasePatch, LeaseRecord, Revision, SessionToken, Versioned};
pub use nats::NatsLeaseStore;
pub use txn::{Committed, TxnError, TxnOp, transact};

/// State of a lease record as delivered by a change feed; `None` means absent.
pub type LeaseSnapshot = Option<Versioned<LeaseRecord>>;

/// Change feed for one account's record. The current state comes first, then
/// at least the latest state after each committed write.
pub type LeaseFeed = BoxStream<'static, StoreResult<LeaseSnapshot>>;

#[async_trait]
pub trait LeaseStore: Send + Sync + std::fmt::Debug + 'static {
    /// Point read.
    async fn get(&self, account: &AccountId) -> StoreResult<LeaseSnapshot>;

    /// Insert a record. Fails with [`StoreError::RevisionMismatch`] if one exists.
    async fn create(&self, account: &AccountId, record: &LeaseRecord) -> StoreResult<Revision>;

    /// Replace the record if it is still at `expected`.
    async fn update(
        &self,
        account: &AccountId,
        record: &LeaseRecord,
        expected: Revision,
    ) -> StoreResult<Revision>;

    /// Apply a partial update if the record is still at `expected`.
    async fn merge(
        &self,
        account: &AccountId,
        patch: &LeasePatch,
        expected: Revision,
    ) -> StoreResult<Revision>;

    /// Remove the record if it is still at `expected`.
    async fn delete(&self, account: &AccountId, expected: Revision) -> StoreResult<()>;

    /// Subscribe to changes of one account's record.
    async fn subscribe(&self, account: &AccountId) -> StoreResult<LeaseFeed>;

    /// The store's notion of "now". All expiry math uses this, never the
    /// caller's local clock.
    async fn server_time(&self) -> StoreResult<DateTime<Utc>>;
}

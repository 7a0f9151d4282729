#![allow(dead_code)]

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use config::{LeasePolicy, RetryPolicy};
use lease_store::{
    AccountId, LeaseFeed, LeasePatch, LeaseRecord, LeaseSnapshot, LeaseStore, ManualClock,
    MemoryStore, Revision, SessionToken, StoreResult,
};
use session_core::{
    LeaseEngine, SessionManager,
    identity::{Credentials, StaticDeviceIdentity, TrustedAuthenticator},
};

pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

pub fn secs(n: i64) -> chrono::Duration {
    chrono::Duration::seconds(n)
}

/// ttl 60s, heartbeat 20s, no grace
pub fn policy() -> LeasePolicy {
    LeasePolicy::new(Duration::from_secs(60), Duration::from_secs(20)).unwrap()
}

pub fn engine(store: Arc<dyn LeaseStore>) -> LeaseEngine {
    LeaseEngine::new(store, policy(), RetryPolicy::default())
}

/// A store whose clock the test controls, starting at `epoch()`.
pub fn manual_store() -> (Arc<MemoryStore>, ManualClock) {
    let clock = ManualClock::new(epoch());
    (Arc::new(MemoryStore::with_clock(clock.clone())), clock)
}

/// One device: its own identity provider and device id.
#[derive(Debug)]
pub struct Device {
    pub manager: SessionManager,
    pub auth: Arc<TrustedAuthenticator>,
}

impl Device {
    pub fn new(store: Arc<MemoryStore>, name: &str) -> Self {
        Self::with_store(store, name)
    }

    pub fn with_store(store: Arc<dyn LeaseStore>, name: &str) -> Self {
        let auth = Arc::new(TrustedAuthenticator::new());
        let manager = SessionManager::new(
            engine(store),
            auth.clone(),
            Arc::new(StaticDeviceIdentity::new(name)),
        );
        Self { manager, auth }
    }
}

pub fn login(account: &str) -> Credentials {
    Credentials::new(account, "")
}

/// Delays every merge and records how many run at once.
#[derive(Debug)]
pub struct SlowMerges {
    pub inner: MemoryStore,
    pub delay: Duration,
    pub started: AtomicU32,
    in_flight: AtomicU32,
    pub max_in_flight: AtomicU32,
}

impl SlowMerges {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: MemoryStore::new(),
            delay,
            started: AtomicU32::new(0),
            in_flight: AtomicU32::new(0),
            max_in_flight: AtomicU32::new(0),
        }
    }
}

/// decrements the in-flight count even when the merge is cancelled
struct InFlight<'a>(&'a AtomicU32);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl LeaseStore for SlowMerges {
    async fn get(&self, account: &AccountId) -> StoreResult<LeaseSnapshot> {
        self.inner.get(account).await
    }
    async fn create(&self, account: &AccountId, record: &LeaseRecord) -> StoreResult<Revision> {
        self.inner.create(account, record).await
    }
    async fn update(
        &self,
        account: &AccountId,
        record: &LeaseRecord,
        expected: Revision,
    ) -> StoreResult<Revision> {
        self.inner.update(account, record, expected).await
    }
    async fn merge(
        &self,
        account: &AccountId,
        patch: &LeasePatch,
        expected: Revision,
    ) -> StoreResult<Revision> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);
        tokio::time::sleep(self.delay).await;
        self.inner.merge(account, patch, expected).await
    }
    async fn delete(&self, account: &AccountId, expected: Revision) -> StoreResult<()> {
        self.inner.delete(account, expected).await
    }
    async fn subscribe(&self, account: &AccountId) -> StoreResult<LeaseFeed> {
        self.inner.subscribe(account).await
    }
    async fn server_time(&self) -> StoreResult<DateTime<Utc>> {
        self.inner.server_time().await
    }
}

/// Counts reads and remembers which token every merge renewed.
#[derive(Debug)]
pub struct CountingStore {
    pub inner: MemoryStore,
    pub gets: AtomicU32,
    pub merged: Mutex<Vec<SessionToken>>,
}

impl CountingStore {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            gets: AtomicU32::new(0),
            merged: Mutex::new(Vec::new()),
        }
    }

    pub fn merged_tokens(&self) -> Vec<SessionToken> {
        self.merged.lock().unwrap().clone()
    }
}

#[async_trait]
impl LeaseStore for CountingStore {
    async fn get(&self, account: &AccountId) -> StoreResult<LeaseSnapshot> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get(account).await
    }
    async fn create(&self, account: &AccountId, record: &LeaseRecord) -> StoreResult<Revision> {
        self.inner.create(account, record).await
    }
    async fn update(
        &self,
        account: &AccountId,
        record: &LeaseRecord,
        expected: Revision,
    ) -> StoreResult<Revision> {
        self.inner.update(account, record, expected).await
    }
    async fn merge(
        &self,
        account: &AccountId,
        patch: &LeasePatch,
        expected: Revision,
    ) -> StoreResult<Revision> {
        self.merged.lock().unwrap().push(patch.session_token.clone());
        self.inner.merge(account, patch, expected).await
    }
    async fn delete(&self, account: &AccountId, expected: Revision) -> StoreResult<()> {
        self.inner.delete(account, expected).await
    }
    async fn subscribe(&self, account: &AccountId) -> StoreResult<LeaseFeed> {
        self.inner.subscribe(account).await
    }
    async fn server_time(&self) -> StoreResult<DateTime<Utc>> {
        self.inner.server_time().await
    }
}

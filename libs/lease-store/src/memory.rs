use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::trace;

use crate::{
    LeaseFeed, LeaseSnapshot, LeaseStore,
    clock::{Clock, SystemClock},
    error::{StoreError, StoreResult},
    models::{AccountId, LeasePatch, LeaseRecord, Revision, Versioned},
};

/// Process-local lease store. Clones share the same records.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, Default)]
struct Inner {
    last_revision: u64,
    slots: HashMap<AccountId, Slot>,
}

#[derive(Debug)]
struct Slot {
    current: LeaseSnapshot,
    feed: watch::Sender<LeaseSnapshot>,
}

impl Slot {
    fn empty() -> Self {
        let (feed, _) = watch::channel(None);
        Self {
            current: None,
            feed,
        }
    }

    fn publish(&mut self, next: LeaseSnapshot) {
        self.current = next.clone();
        self.feed.send_replace(next);
    }
}

impl Inner {
    fn slot(&mut self, account: &AccountId) -> &mut Slot {
        self.slots
            .entry(account.clone())
            .or_insert_with(Slot::empty)
    }

    fn next_revision(&mut self) -> Revision {
        self.last_revision += 1;
        Revision(self.last_revision)
    }
}

fn mismatch(account: &AccountId) -> StoreError {
    StoreError::RevisionMismatch {
        key: account.to_string(),
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    /// Use `clock` as the store's server time.
    pub fn with_clock<C: Clock>(clock: C) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            clock: Arc::new(clock),
        }
    }

    fn commit(
        &self,
        account: &AccountId,
        mut record: LeaseRecord,
        expected: Option<Revision>,
    ) -> StoreResult<Revision> {
        let mut guard = self.inner.lock().expect("memory store lock poisoned");
        let current = guard
            .slots
            .get(account)
            .and_then(|slot| slot.current.as_ref())
            .map(|c| c.revision);
        if current != expected {
            return Err(mismatch(account));
        }
        record.last_renewed_at = self.clock.now();
        let revision = guard.next_revision();
        trace!(%account, %revision, "memory store commit");
        guard.slot(account).publish(Some(Versioned {
            value: record,
            revision,
        }));
        Ok(revision)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LeaseStore for MemoryStore {
    async fn get(&self, account: &AccountId) -> StoreResult<LeaseSnapshot> {
        let guard = self.inner.lock().expect("memory store lock poisoned");
        Ok(guard
            .slots
            .get(account)
            .and_then(|slot| slot.current.clone()))
    }

    async fn create(&self, account: &AccountId, record: &LeaseRecord) -> StoreResult<Revision> {
        self.commit(account, record.clone(), None)
    }

    async fn update(
        &self,
        account: &AccountId,
        record: &LeaseRecord,
        expected: Revision,
    ) -> StoreResult<Revision> {
        self.commit(account, record.clone(), Some(expected))
    }

    async fn merge(
        &self,
        account: &AccountId,
        patch: &LeasePatch,
        expected: Revision,
    ) -> StoreResult<Revision> {
        let mut record = {
            let guard = self.inner.lock().expect("memory store lock poisoned");
            match guard.slots.get(account).and_then(|s| s.current.as_ref()) {
                None => {
                    return Err(StoreError::NotFound {
                        key: account.to_string(),
                    });
                }
                Some(current) if current.revision != expected => return Err(mismatch(account)),
                Some(current) => current.value.clone(),
            }
        };
        record.apply(patch);
        // commit re-checks the revision under the lock
        self.commit(account, record, Some(expected))
    }

    async fn delete(&self, account: &AccountId, expected: Revision) -> StoreResult<()> {
        let mut guard = self.inner.lock().expect("memory store lock poisoned");
        let Some(slot) = guard.slots.get_mut(account) else {
            return Err(mismatch(account));
        };
        if !slot
            .current
            .as_ref()
            .is_some_and(|current| current.revision == expected)
        {
            return Err(mismatch(account));
        }
        trace!(%account, %expected, "memory store delete");
        slot.publish(None);
        // nobody to tell about later writes, forget the account
        if slot.feed.receiver_count() == 0 {
            guard.slots.remove(account);
        }
        Ok(())
    }

    async fn subscribe(&self, account: &AccountId) -> StoreResult<LeaseFeed> {
        let rx = {
            let mut guard = self.inner.lock().expect("memory store lock poisoned");
            // drop empty slots whose subscribers have all gone away
            guard
                .slots
                .retain(|_, slot| slot.current.is_some() || slot.feed.receiver_count() > 0);
            guard.slot(account).feed.subscribe()
        };
        Ok(WatchStream::new(rx).map(Ok).boxed())
    }

    async fn server_time(&self) -> StoreResult<DateTime<Utc>> {
        Ok(self.clock.now())
    }
}

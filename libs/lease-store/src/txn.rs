//! Optimistic read-decide-write transactions on a single lease record.
//!
//! The store only offers version-checked single-key writes. A transaction
//! reads the record with its revision, lets the caller decide what to do,
//! and commits conditioned on that revision. Losing the race re-runs the
//! whole read-decide-write step.

use chrono::{DateTime, Utc};
use config::RetryPolicy;
use thiserror::Error;
use tracing::debug;

use crate::{
    LeaseStore,
    error::StoreError,
    models::{AccountId, LeaseRecord, Revision, Versioned},
};

/// What a transaction should do with the record it read.
#[derive(Debug)]
pub enum TxnOp<T, E> {
    /// write `record` (create if absent, replace otherwise) and report `T`
    Put(LeaseRecord, T),
    /// remove the record and report `T`; a no-op if it is already gone
    Delete(T),
    /// leave the record untouched
    Keep(T),
    /// stop without writing
    Abort(E),
}

/// Result of a committed (or intentionally empty) transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed<T> {
    pub value: T,
    /// revision after the transaction, `None` if the record is now absent
    pub revision: Option<Revision>,
}

#[derive(Debug, Error)]
pub enum TxnError<E> {
    #[error("transaction aborted by decision")]
    Aborted(E),
    #[error("transaction still contended after {attempts} attempts")]
    Contended { attempts: u32 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Run `decide` against the current record and commit its choice atomically.
///
/// `decide` may run several times; it must be a pure function of the record
/// and the store time it is given.
pub async fn transact<S, T, E, F>(
    store: &S,
    account: &AccountId,
    retry: &RetryPolicy,
    mut decide: F,
) -> Result<Committed<T>, TxnError<E>>
where
    S: LeaseStore + ?Sized,
    F: FnMut(Option<&Versioned<LeaseRecord>>, DateTime<Utc>) -> TxnOp<T, E> + Send,
    T: Send,
    E: Send,
{
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let now = store.server_time().await?;
        let current = store.get(account).await?;
        let expected = current.as_ref().map(|c| c.revision);

        let result = match decide(current.as_ref(), now) {
            TxnOp::Abort(err) => return Err(TxnError::Aborted(err)),
            TxnOp::Keep(value) => {
                return Ok(Committed {
                    value,
                    revision: expected,
                });
            }
            TxnOp::Put(record, value) => match expected {
                None => store.create(account, &record).await,
                Some(rev) => store.update(account, &record, rev).await,
            }
            .map(|rev| Committed {
                value,
                revision: Some(rev),
            }),
            TxnOp::Delete(value) => match expected {
                None => {
                    return Ok(Committed {
                        value,
                        revision: None,
                    });
                }
                Some(rev) => store.delete(account, rev).await.map(|_| Committed {
                    value,
                    revision: None,
                }),
            },
        };

        match result {
            Ok(committed) => return Ok(committed),
            Err(err) if err.is_conflict() => {
                if attempts >= retry.max_attempts {
                    return Err(TxnError::Contended { attempts });
                }
                let delay = retry.backoff(attempts);
                debug!(
                    %account,
                    attempts,
                    ?expected,
                    retry_in_ms = delay.as_millis(),
                    "lost revision race, retrying transaction"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(TxnError::Store(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicU32, Ordering},
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use chrono::Utc;

    use super::*;
    use crate::{
        LeaseFeed, LeaseSnapshot, MemoryStore, StoreResult,
        models::{LeasePatch, SessionToken},
    };

    fn retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
        }
    }

    fn record(account: &AccountId, token: &str, now: DateTime<Utc>) -> LeaseRecord {
        LeaseRecord::new(
            account.clone(),
            token.into(),
            "dev".into(),
            now,
            now + chrono::Duration::seconds(60),
        )
    }

    /// claim the record only if nobody holds it
    fn claim(
        account: AccountId,
        token: &'static str,
    ) -> impl FnMut(Option<&Versioned<LeaseRecord>>, DateTime<Utc>) -> TxnOp<(), SessionToken> + Send
    {
        move |current, now| match current {
            None => TxnOp::Put(record(&account, token, now), ()),
            Some(cur) => TxnOp::Abort(cur.value.session_token.clone()),
        }
    }

    #[tokio::test]
    async fn put_creates_then_updates() {
        let store = MemoryStore::new();
        let account = AccountId::from("alice");

        let first = transact(&store, &account, &retry(3), claim(account.clone(), "a"))
            .await
            .unwrap();
        assert!(first.revision.is_some());

        let second = transact(&store, &account, &retry(3), claim(account.clone(), "b")).await;
        match second {
            Err(TxnError::Aborted(holder)) => assert_eq!(holder.as_str(), "a"),
            other => panic!("expected abort, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn delete_on_absent_is_noop() {
        let store = MemoryStore::new();
        let account = AccountId::from("alice");
        let done = transact::<_, _, (), _>(&store, &account, &retry(3), |_, _| TxnOp::Delete(7))
            .await
            .unwrap();
        assert_eq!(done.value, 7);
        assert_eq!(done.revision, None);
    }

    #[tokio::test]
    async fn concurrent_claims_have_one_winner() {
        let store = Arc::new(MemoryStore::new());
        let account = AccountId::from("alice");
        let tokens = ["t0", "t1", "t2", "t3", "t4", "t5", "t6", "t7"];

        let handles: Vec<_> = tokens
            .into_iter()
            .map(|token| {
                let store = Arc::clone(&store);
                let account = account.clone();
                tokio::spawn(async move {
                    transact(&*store, &account, &retry(10), claim(account.clone(), token)).await
                })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    /// reports a lost race on every write
    #[derive(Debug, Default)]
    struct AlwaysContended {
        inner: MemoryStore,
        writes: AtomicU32,
    }

    #[async_trait]
    impl LeaseStore for AlwaysContended {
        async fn get(&self, account: &AccountId) -> StoreResult<LeaseSnapshot> {
            self.inner.get(account).await
        }
        async fn create(&self, account: &AccountId, _: &LeaseRecord) -> StoreResult<Revision> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::RevisionMismatch {
                key: account.to_string(),
            })
        }
        async fn update(
            &self,
            account: &AccountId,
            _: &LeaseRecord,
            _: Revision,
        ) -> StoreResult<Revision> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::RevisionMismatch {
                key: account.to_string(),
            })
        }
        async fn merge(
            &self,
            account: &AccountId,
            patch: &LeasePatch,
            expected: Revision,
        ) -> StoreResult<Revision> {
            self.inner.merge(account, patch, expected).await
        }
        async fn delete(&self, account: &AccountId, expected: Revision) -> StoreResult<()> {
            self.inner.delete(account, expected).await
        }
        async fn subscribe(&self, account: &AccountId) -> StoreResult<LeaseFeed> {
            self.inner.subscribe(account).await
        }
        async fn server_time(&self) -> StoreResult<DateTime<Utc>> {
            Ok(Utc::now())
        }
    }

    #[tokio::test]
    async fn contention_stops_after_max_attempts() {
        let store = AlwaysContended::default();
        let account = AccountId::from("alice");
        let result = transact(&store, &account, &retry(4), claim(account.clone(), "a")).await;
        assert!(matches!(result, Err(TxnError::Contended { attempts: 4 })));
        // the first write counts as an attempt
        assert_eq!(store.writes.load(Ordering::SeqCst), 4);
    }
}

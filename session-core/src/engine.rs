//! # Lease protocol
//!
//! Acquire, renew and release one account's lease on top of a [`LeaseStore`].
//! Every decision is made against the store's time and committed with a
//! revision check, so two contenders can never both believe they won.
//!
//! | current record               | acquire                        |
//! |------------------------------|--------------------------------|
//! | absent                       | create a fresh lease           |
//! | carries our token            | extend it, keep the holder     |
//! | foreign, past expiry + grace | replace it (take over)         |
//! | foreign, live                | refuse with the current holder |
//!
//! [`LeaseStore`]: lease_store::LeaseStore
use std::{
    convert::Infallible,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use config::{LeasePolicy, RetryPolicy};
use lease_store::{
    AccountId, HolderInfo, LeasePatch, LeaseRecord, LeaseSnapshot, LeaseStore, Revision,
    SessionToken, StoreError, TxnError, TxnOp, transact,
};
use tracing::{debug, info, instrument, warn};

use crate::{error::LeaseError, metrics};

/// The account a lease guards and the token this session claims it with.
/// Shared read-only between the heartbeat, the watcher and the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseIdentity {
    pub account: AccountId,
    pub token: SessionToken,
}

impl LeaseIdentity {
    pub fn new(account: impl Into<AccountId>, token: SessionToken) -> Self {
        Self {
            account: account.into(),
            token,
        }
    }
}

/// Which acquisition branch committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Created,
    Reacquired,
    TookOver { previous_holder: HolderInfo },
}

impl AcquireOutcome {
    fn label(&self) -> &'static str {
        match self {
            AcquireOutcome::Created => "created",
            AcquireOutcome::Reacquired => "reacquired",
            AcquireOutcome::TookOver { .. } => "took_over",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acquired {
    pub outcome: AcquireOutcome,
    /// revision of the record our acquisition wrote
    pub revision: Revision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    /// the record was absent or belonged to someone else; nothing was written
    NotHeld,
}

/// Whether this session currently holds its lease, and since which revision.
///
/// Writes at or below that revision predate our ownership and say nothing
/// about whether we were evicted.
#[derive(Debug, Default)]
pub struct Ownership(AtomicU64);

impl Ownership {
    pub fn mark_held(&self, since: Revision) {
        // revision 0 is never assigned by a store
        self.0.store(since.0.max(1), Ordering::Release);
    }

    /// Give up ownership. Only the first caller after `mark_held` gets `true`.
    pub fn take(&self) -> bool {
        self.0.swap(0, Ordering::AcqRel) != 0
    }

    pub fn held_since(&self) -> Option<Revision> {
        match self.0.load(Ordering::Acquire) {
            0 => None,
            rev => Some(Revision(rev)),
        }
    }

    pub fn is_held(&self) -> bool {
        self.held_since().is_some()
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

fn contended(account: &AccountId, attempts: u32) -> LeaseError {
    warn!(%account, attempts, "lease transaction still contended, giving up");
    LeaseError::StoreUnavailable(StoreError::RevisionMismatch {
        key: account.to_string(),
    })
}

fn store_failure(op: &'static str, err: StoreError) -> LeaseError {
    metrics::STORE_ERRORS.with_label_values(&[op]).inc();
    LeaseError::StoreUnavailable(err)
}

#[derive(Debug, Clone)]
pub struct LeaseEngine {
    store: Arc<dyn LeaseStore>,
    policy: LeasePolicy,
    retry: RetryPolicy,
}

impl LeaseEngine {
    pub fn new(store: Arc<dyn LeaseStore>, policy: LeasePolicy, retry: RetryPolicy) -> Self {
        Self {
            store,
            policy,
            retry,
        }
    }

    pub fn policy(&self) -> &LeasePolicy {
        &self.policy
    }

    pub fn store(&self) -> &Arc<dyn LeaseStore> {
        &self.store
    }

    /// Claim the account's lease for `lease.token`.
    ///
    /// Re-acquiring with a token that already owns the lease succeeds and only
    /// extends the expiry. A [`LeaseError::Conflict`] means a live foreign lease
    /// exists; any other error means the outcome is unknown and nothing should
    /// proceed as if it were granted.
    #[instrument(level = "debug", skip(self, lease, holder), fields(account = %lease.account))]
    pub async fn acquire(
        &self,
        lease: &LeaseIdentity,
        holder: &HolderInfo,
    ) -> Result<Acquired, LeaseError> {
        let timer = metrics::LEASE_OP_DURATION
            .with_label_values(&["acquire"])
            .start_timer();
        let ttl = to_chrono(self.policy.ttl);
        let grace = to_chrono(self.policy.takeover_grace);

        let result = transact(&*self.store, &lease.account, &self.retry, |current, now| {
            let fresh = || {
                LeaseRecord::new(
                    lease.account.clone(),
                    lease.token.clone(),
                    holder.clone(),
                    now,
                    now + ttl,
                )
            };
            match current {
                None => TxnOp::Put(fresh(), AcquireOutcome::Created),
                Some(cur) if cur.value.is_owned_by(&lease.token) => {
                    let mut extended = cur.value.clone();
                    extended.expires_at = now + ttl;
                    TxnOp::Put(extended, AcquireOutcome::Reacquired)
                }
                Some(cur) if cur.value.is_expired(now, grace) => TxnOp::Put(
                    fresh(),
                    AcquireOutcome::TookOver {
                        previous_holder: cur.value.holder_info.clone(),
                    },
                ),
                Some(cur) => TxnOp::Abort(LeaseError::Conflict {
                    holder_info: cur.value.holder_info.clone(),
                    expires_at: cur.value.expires_at,
                }),
            }
        })
        .await;
        timer.observe_duration();

        match result {
            Ok(committed) => {
                let revision = committed
                    .revision
                    .ok_or_else(|| store_failure("acquire", StoreError::NotFound {
                        key: lease.account.to_string(),
                    }))?;
                metrics::LEASE_ACQUIRED
                    .with_label_values(&[committed.value.label()])
                    .inc();
                match &committed.value {
                    AcquireOutcome::TookOver { previous_holder } => {
                        info!(%revision, %previous_holder, %holder, "took over expired lease")
                    }
                    outcome => info!(%revision, %holder, ?outcome, "lease acquired"),
                }
                Ok(Acquired {
                    outcome: committed.value,
                    revision,
                })
            }
            Err(TxnError::Aborted(err)) => {
                metrics::LEASE_CONFLICTS.inc();
                debug!(%err, "lease held elsewhere");
                Err(err)
            }
            Err(TxnError::Contended { attempts }) => Err(contended(&lease.account, attempts)),
            Err(TxnError::Store(err)) => Err(store_failure("acquire", err)),
        }
    }

    /// Extend the lease iff it still carries our token.
    ///
    /// The write is conditioned on the revision we read, so a renewal racing a
    /// takeover loses instead of overwriting the new owner.
    #[instrument(level = "debug", skip(self, lease), fields(account = %lease.account))]
    pub async fn renew(&self, lease: &LeaseIdentity) -> Result<Revision, LeaseError> {
        let now = self
            .store
            .server_time()
            .await
            .map_err(|err| store_failure("renew", err))?;
        let current = self
            .store
            .get(&lease.account)
            .await
            .map_err(|err| store_failure("renew", err))?;

        let Some(current) = current else {
            return Err(LeaseError::Lost);
        };
        if !current.value.is_owned_by(&lease.token) {
            return Err(LeaseError::Lost);
        }

        let patch = LeasePatch {
            session_token: lease.token.clone(),
            expires_at: now + to_chrono(self.policy.ttl),
        };
        match self
            .store
            .merge(&lease.account, &patch, current.revision)
            .await
        {
            Ok(revision) => {
                debug!(%revision, expires_at = %patch.expires_at, "lease renewed");
                Ok(revision)
            }
            Err(StoreError::RevisionMismatch { .. } | StoreError::NotFound { .. }) => {
                Err(LeaseError::Lost)
            }
            Err(err) => Err(store_failure("renew", err)),
        }
    }

    /// Delete the lease iff it still carries our token. Releasing a lease we no
    /// longer hold is a no-op, not an error.
    #[instrument(level = "debug", skip(self, lease), fields(account = %lease.account))]
    pub async fn release(&self, lease: &LeaseIdentity) -> Result<ReleaseOutcome, LeaseError> {
        let result = transact::<_, _, Infallible, _>(
            &*self.store,
            &lease.account,
            &self.retry,
            |current, _| match current {
                Some(cur) if cur.value.is_owned_by(&lease.token) => {
                    TxnOp::Delete(ReleaseOutcome::Released)
                }
                _ => TxnOp::Keep(ReleaseOutcome::NotHeld),
            },
        )
        .await;

        match result {
            Ok(committed) => {
                if committed.value == ReleaseOutcome::Released {
                    metrics::LEASE_RELEASED.inc();
                    info!("lease released");
                } else {
                    debug!("release skipped, lease not held by this session");
                }
                Ok(committed.value)
            }
            Err(TxnError::Aborted(never)) => match never {},
            Err(TxnError::Contended { attempts }) => Err(contended(&lease.account, attempts)),
            Err(TxnError::Store(err)) => Err(store_failure("release", err)),
        }
    }

    /// Current record for `account`, for inspection.
    pub async fn current(&self, account: &AccountId) -> Result<LeaseSnapshot, LeaseError> {
        self.store
            .get(account)
            .await
            .map_err(|err| store_failure("get", err))
    }
}

//! Eviction detection.
//!
//! Follows the account's lease record and fires once when a write we did not
//! make puts another token on it while we hold the lease. The watcher is
//! started before acquisition so a takeover that lands right after we win is
//! not missed; writes that predate our ownership are ignored.
use std::{sync::Arc, time::Duration};

use futures::{StreamExt, future::BoxFuture};
use lease_store::{AccountId, HolderInfo, LeaseSnapshot, LeaseStore, Revision, SessionToken};
use rand::Rng;
use tokio::{sync::watch, task::JoinHandle, time};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, trace, warn};

use crate::{
    engine::{LeaseIdentity, Ownership},
    identity::AccountIdentity,
    metrics,
};

const RESUBSCRIBE_BASE_DELAY: Duration = Duration::from_millis(250);
const MAX_RESUBSCRIBE_DELAY: Duration = Duration::from_secs(10);

/// add up to 25% so a fleet of watchers does not resubscribe in lockstep
fn jittered(delay: Duration) -> Duration {
    let spread = (delay.as_millis() / 4) as u64;
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchDecision {
    Ignore,
    Evicted { by: HolderInfo },
}

/// Decide what a feed notification means for the session owning `own`.
///
/// `held_since` is the revision of our acquisition, `None` while we do not
/// hold the lease. An absent record is never an eviction: it is a release,
/// or an expiry cleanup that nobody has taken over yet.
pub fn classify(
    snapshot: &LeaseSnapshot,
    own: &SessionToken,
    held_since: Option<Revision>,
) -> WatchDecision {
    let (Some(record), Some(since)) = (snapshot, held_since) else {
        return WatchDecision::Ignore;
    };
    if record.revision <= since || record.value.is_owned_by(own) {
        return WatchDecision::Ignore;
    }
    WatchDecision::Evicted {
        by: record.value.holder_info.clone(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eviction {
    pub account: AccountId,
    pub by: HolderInfo,
}

/// Why the watcher stopped on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherExit {
    Evicted(Eviction),
    /// the local identity no longer matches the watched account
    SignedOut,
}

pub type ExitHandler = Box<dyn FnOnce(WatcherExit) -> BoxFuture<'static, ()> + Send>;

/// Running watcher. Dropping the handle cancels the task.
#[derive(Debug)]
pub struct WatcherHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl WatcherHandle {
    /// Watch `lease.account`. `on_exit` runs at most once, when the watcher
    /// stops by itself; cancellation does not call it.
    pub fn spawn(
        store: Arc<dyn LeaseStore>,
        lease: Arc<LeaseIdentity>,
        ownership: Arc<Ownership>,
        identity: watch::Receiver<Option<AccountIdentity>>,
        cancel: CancellationToken,
        on_exit: ExitHandler,
    ) -> Self {
        let span = info_span!("eviction_watcher", account = %lease.account);
        let watcher = Watcher {
            store,
            lease,
            ownership,
            identity,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(
            async move {
                if let Some(exit) = watcher.run().await {
                    on_exit(exit).await;
                }
            }
            .instrument(span),
        );
        Self {
            cancel,
            task: Some(task),
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!(?err, "eviction watcher ended abnormally");
            }
        }
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Watcher {
    store: Arc<dyn LeaseStore>,
    lease: Arc<LeaseIdentity>,
    ownership: Arc<Ownership>,
    identity: watch::Receiver<Option<AccountIdentity>>,
    cancel: CancellationToken,
}

enum FeedEnd {
    Cancelled,
    Exit(WatcherExit),
    Resubscribe,
}

impl Watcher {
    async fn run(mut self) -> Option<WatcherExit> {
        let mut delay = RESUBSCRIBE_BASE_DELAY;
        loop {
            let subscribed = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                res = self.store.subscribe(&self.lease.account) => res,
            };
            match subscribed {
                Ok(feed) => {
                    delay = RESUBSCRIBE_BASE_DELAY;
                    match self.follow(feed).await {
                        FeedEnd::Cancelled => return None,
                        FeedEnd::Exit(exit) => return Some(exit),
                        FeedEnd::Resubscribe => {}
                    }
                }
                Err(err) => {
                    metrics::STORE_ERRORS.with_label_values(&["subscribe"]).inc();
                    warn!(%err, retry_in_ms = delay.as_millis(), "failed to subscribe to lease feed");
                }
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                _ = time::sleep(jittered(delay)) => {}
            }
            delay = (delay * 2).min(MAX_RESUBSCRIBE_DELAY);
        }
    }

    async fn follow(&mut self, mut feed: lease_store::LeaseFeed) -> FeedEnd {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return FeedEnd::Cancelled,
                changed = self.identity.changed() => {
                    let still_ours = changed.is_ok()
                        && self
                            .identity
                            .borrow_and_update()
                            .as_ref()
                            .is_some_and(|id| id.account_id == self.lease.account);
                    if !still_ours {
                        info!("local identity changed, stopping eviction watcher");
                        return FeedEnd::Exit(WatcherExit::SignedOut);
                    }
                }
                next = feed.next() => match next {
                    None => {
                        debug!("lease feed ended, resubscribing");
                        return FeedEnd::Resubscribe;
                    }
                    Some(Err(err)) => {
                        metrics::STORE_ERRORS.with_label_values(&["subscribe"]).inc();
                        warn!(%err, "lease feed failed, resubscribing");
                        return FeedEnd::Resubscribe;
                    }
                    Some(Ok(snapshot)) => {
                        let held_since = self.ownership.held_since();
                        match classify(&snapshot, &self.lease.token, held_since) {
                            WatchDecision::Ignore => {
                                trace!(revision = ?snapshot.as_ref().map(|s| s.revision), "lease change ignored");
                            }
                            WatchDecision::Evicted { by } => {
                                metrics::EVICTIONS.inc();
                                warn!(%by, "lease taken over by another device, session evicted");
                                return FeedEnd::Exit(WatcherExit::Evicted(Eviction {
                                    account: self.lease.account.clone(),
                                    by,
                                }));
                            }
                        }
                    }
                },
            }
        }
    }
}

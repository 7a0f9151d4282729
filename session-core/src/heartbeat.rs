//! Periodic renewal of a held lease.
//!
//! One beat at a time: the next beat is never started before the previous
//! renewal has finished or timed out. A failed beat is logged and retried on
//! the next tick; the heartbeat never decides on its own that the session is
//! over, that is the eviction watcher's call.
use std::sync::Arc;

use tokio::{
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, trace, warn};

use crate::{
    engine::{LeaseEngine, LeaseIdentity},
    metrics,
};

/// Running heartbeat. Dropping the handle cancels the task.
#[derive(Debug)]
pub struct HeartbeatHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl HeartbeatHandle {
    /// Start renewing `lease` every heartbeat interval. The first beat fires
    /// one interval from now, since acquisition has just set the expiry.
    pub fn spawn(engine: LeaseEngine, lease: Arc<LeaseIdentity>, cancel: CancellationToken) -> Self {
        let span = info_span!("heartbeat", account = %lease.account);
        let task = tokio::spawn(run(engine, lease, cancel.clone()).instrument(span));
        Self {
            cancel,
            task: Some(task),
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancel and wait for the task to exit. No renewal is written after this
    /// returns.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!(?err, "heartbeat task ended abnormally");
            }
        }
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(engine: LeaseEngine, lease: Arc<LeaseIdentity>, cancel: CancellationToken) {
    let period = engine.policy().heartbeat_interval;
    let renew_timeout = engine.policy().renew_timeout;
    let ttl = engine.policy().ttl;

    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_confirmed = Instant::now();
    let mut misses = 0u32;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let beat = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            res = time::timeout(renew_timeout, engine.renew(&lease)) => res,
        };

        match beat {
            Ok(Ok(revision)) => {
                metrics::RENEW_SUCCESS.inc();
                trace!(%revision, "heartbeat");
                misses = 0;
                last_confirmed = Instant::now();
            }
            Ok(Err(err)) => {
                metrics::RENEW_FAILURES.inc();
                misses += 1;
                warn!(%err, misses, "lease renewal failed, retrying next beat");
            }
            Err(_) => {
                metrics::RENEW_FAILURES.inc();
                misses += 1;
                warn!(?renew_timeout, misses, "lease renewal timed out, retrying next beat");
            }
        }
        if misses > 0 && last_confirmed.elapsed() >= ttl {
            warn!(
                since_last_renewal = ?last_confirmed.elapsed(),
                "no renewal confirmed within the lease ttl, lease may be taken over"
            );
        }
    }
    debug!("heartbeat stopped");
}

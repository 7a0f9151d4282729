//! Sign-in, sign-out and eviction wiring for a single-active-session account.
//!
//! Sign-in authenticates, starts the eviction watcher, acquires the lease and
//! starts the heartbeat, in that order. If the lease cannot be acquired the
//! local authentication is undone before the error is returned.
use std::sync::Arc;

use futures::FutureExt;
use lease_store::{AccountId, HolderInfo, SessionToken};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
    engine::{LeaseEngine, LeaseIdentity, Ownership, ReleaseOutcome},
    error::{LeaseError, SessionError},
    heartbeat::HeartbeatHandle,
    identity::{AccountIdentity, Authenticator, Credentials, DeviceIdentity},
    metrics,
    watcher::{ExitHandler, WatcherExit, WatcherHandle},
};

/// Notifications for the UI layer of an active session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// another device took over the lease; the local identity was signed out
    Evicted { by: HolderInfo },
    /// the local identity changed underneath the session
    SignedOut,
}

#[derive(Debug, Clone)]
pub struct SessionManager {
    engine: LeaseEngine,
    auth: Arc<dyn Authenticator>,
    device: Arc<dyn DeviceIdentity>,
}

impl SessionManager {
    pub fn new(
        engine: LeaseEngine,
        auth: Arc<dyn Authenticator>,
        device: Arc<dyn DeviceIdentity>,
    ) -> Self {
        Self {
            engine,
            auth,
            device,
        }
    }

    pub fn engine(&self) -> &LeaseEngine {
        &self.engine
    }

    #[instrument(skip_all, fields(username = %credentials.username))]
    pub async fn sign_in(&self, credentials: &Credentials) -> Result<ActiveSession, SessionError> {
        let identity = self.auth.authenticate(credentials).await?;
        let lease = Arc::new(LeaseIdentity::new(
            identity.account_id.clone(),
            SessionToken::generate(),
        ));
        let holder = self.device.holder_info();
        let ownership = Arc::new(Ownership::default());
        let (events_tx, events) = mpsc::channel(4);

        let root = CancellationToken::new();
        let heartbeat_cancel = root.child_token();
        let watcher = WatcherHandle::spawn(
            Arc::clone(self.engine.store()),
            Arc::clone(&lease),
            Arc::clone(&ownership),
            self.auth.identity_changes(),
            root.child_token(),
            self.exit_handler(&lease, &ownership, heartbeat_cancel.clone(), events_tx),
        );

        let acquired = match self.engine.acquire(&lease, &holder).await {
            Ok(acquired) => acquired,
            Err(err) => {
                root.cancel();
                watcher.stop().await;
                if let Err(sign_out_err) = self.auth.sign_out().await {
                    warn!(%sign_out_err, "failed to roll back authentication");
                }
                match &err {
                    LeaseError::Conflict { holder_info, .. } => {
                        info!(%holder_info, "account already signed in elsewhere")
                    }
                    other => warn!(%other, "sign-in could not confirm the lease"),
                }
                return Err(err.into());
            }
        };
        ownership.mark_held(acquired.revision);
        let heartbeat = HeartbeatHandle::spawn(self.engine.clone(), Arc::clone(&lease), heartbeat_cancel);
        metrics::ACTIVE_SESSIONS.inc();
        info!(account = %lease.account, %holder, outcome = ?acquired.outcome, "signed in");

        Ok(ActiveSession {
            identity,
            lease,
            holder,
            engine: self.engine.clone(),
            auth: Arc::clone(&self.auth),
            ownership,
            root,
            heartbeat: Some(heartbeat),
            watcher: Some(watcher),
            events,
            closed: false,
        })
    }

    /// What the session does when its watcher stops by itself.
    fn exit_handler(
        &self,
        lease: &Arc<LeaseIdentity>,
        ownership: &Arc<Ownership>,
        heartbeat_cancel: CancellationToken,
        events: mpsc::Sender<SessionEvent>,
    ) -> ExitHandler {
        let engine = self.engine.clone();
        let auth = Arc::clone(&self.auth);
        let lease = Arc::clone(lease);
        let ownership = Arc::clone(ownership);
        Box::new(move |exit: WatcherExit| {
            async move {
                heartbeat_cancel.cancel();
                let was_held = ownership.take();
                let event = match exit {
                    WatcherExit::Evicted(eviction) => {
                        if let Err(err) = auth.sign_out().await {
                            warn!(%err, "failed to sign out evicted session");
                        }
                        SessionEvent::Evicted { by: eviction.by }
                    }
                    WatcherExit::SignedOut => {
                        if was_held {
                            if let Err(err) = engine.release(&lease).await {
                                warn!(%err, "failed to release lease after identity change");
                            }
                        }
                        SessionEvent::SignedOut
                    }
                };
                if was_held {
                    metrics::ACTIVE_SESSIONS.dec();
                }
                let _ = events.send(event).await;
            }
            .boxed()
        })
    }
}

/// A signed-in session holding the account's lease.
///
/// Dropping it without [`ActiveSession::sign_out`] stops its tasks and makes a
/// best-effort release in the background.
#[derive(Debug)]
pub struct ActiveSession {
    identity: AccountIdentity,
    lease: Arc<LeaseIdentity>,
    holder: HolderInfo,
    engine: LeaseEngine,
    auth: Arc<dyn Authenticator>,
    ownership: Arc<Ownership>,
    root: CancellationToken,
    heartbeat: Option<HeartbeatHandle>,
    watcher: Option<WatcherHandle>,
    events: mpsc::Receiver<SessionEvent>,
    closed: bool,
}

impl ActiveSession {
    pub fn identity(&self) -> &AccountIdentity {
        &self.identity
    }

    pub fn account(&self) -> &AccountId {
        &self.lease.account
    }

    pub fn token(&self) -> &SessionToken {
        &self.lease.token
    }

    pub fn holder_info(&self) -> &HolderInfo {
        &self.holder
    }

    /// false once the session was evicted or signed out underneath us
    pub fn is_held(&self) -> bool {
        self.ownership.is_held()
    }

    /// Next event, `None` once the session can produce no more.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Stop renewing, delete the lease if we still hold it, and sign out.
    #[instrument(skip_all, fields(account = %self.lease.account))]
    pub async fn sign_out(mut self) -> Result<ReleaseOutcome, SessionError> {
        self.closed = true;
        if let Some(watcher) = self.watcher.take() {
            watcher.stop().await;
        }
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.stop().await;
        }
        self.root.cancel();

        let was_held = self.ownership.take();
        let released = if was_held {
            metrics::ACTIVE_SESSIONS.dec();
            self.engine.release(&self.lease).await
        } else {
            Ok(ReleaseOutcome::NotHeld)
        };
        self.auth.sign_out().await?;
        let outcome = released?;
        info!(?outcome, "signed out");
        Ok(outcome)
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.root.cancel();
        if !self.ownership.take() {
            return;
        }
        metrics::ACTIVE_SESSIONS.dec();
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("no runtime to release dropped session, lease will expire");
            return;
        };
        let engine = self.engine.clone();
        let lease = Arc::clone(&self.lease);
        handle.spawn(async move {
            if let Err(err) = engine.release(&lease).await {
                warn!(account = %lease.account, %err, "best-effort release failed, lease will expire");
            }
        });
    }
}

//! Lease store backed by a JetStream KV bucket.
//!
//! Every account maps to one KV key. JetStream gives per-key optimistic
//! concurrency: `create` only succeeds on an absent key, `update` and
//! `delete_expect_revision` only on the expected revision. The bucket's
//! watch API is the change feed, and each entry's `created` timestamp is
//! assigned by the server, which is what `last_renewed_at` reports.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_nats::ConnectOptions;
use async_nats::jetstream::{self, kv};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use config::{NatsConfig, NatsSecurityMode};

use crate::{
    LeaseFeed, LeaseSnapshot, LeaseStore,
    error::{StoreError, StoreResult},
    models::{self, AccountId, LeasePatch, LeaseRecord, Revision, Versioned},
};

/// Default connection timeout if not configured.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default per-operation timeout if not configured.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(2000);

/// Base delay for retrying initial NATS connections.
const CONNECT_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Upper bound for retry backoff during initial NATS connect.
const MAX_CONNECT_RETRY_DELAY: Duration = Duration::from_secs(30);

const SESSION_KEY_PREFIX: &str = "sessions";
/// Single key every process overwrites to read the server clock. The bucket
/// history bounds what it keeps.
const CLOCK_KEY: &str = "clock/probe";

/// Encode an account id into the KV key alphabet. Characters outside
/// `[A-Za-z0-9_-]` become `=XX` hex escapes so distinct ids never collide.
fn encode_key_component(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_') {
            out.push(b as char);
        } else {
            out.push_str(&format!("={b:02X}"));
        }
    }
    out
}

fn session_key(account: &AccountId) -> String {
    format!(
        "{SESSION_KEY_PREFIX}/{}",
        encode_key_component(account.as_str())
    )
}

fn to_chrono(ts: time::OffsetDateTime) -> DateTime<Utc> {
    DateTime::from_timestamp(ts.unix_timestamp(), ts.nanosecond()).unwrap_or_else(Utc::now)
}

/// turn a KV entry into the snapshot the rest of the crate sees
fn snapshot_from_entry(entry: kv::Entry) -> StoreResult<LeaseSnapshot> {
    match entry.operation {
        kv::Operation::Put => {
            let mut record: LeaseRecord = models::decode(&entry.value)?;
            record.last_renewed_at = to_chrono(entry.created);
            Ok(Some(Versioned {
                value: record,
                revision: Revision(entry.revision),
            }))
        }
        kv::Operation::Delete | kv::Operation::Purge => Ok(None),
    }
}

#[derive(Debug, Clone, Copy)]
struct ClockSync {
    offset: chrono::Duration,
    synced_at: Option<Instant>,
}

/// JetStream KV implementation of [`LeaseStore`].
#[derive(Clone)]
pub struct NatsLeaseStore {
    client: async_nats::Client,
    kv: kv::Store,
    config: Arc<NatsConfig>,
    request_timeout: Duration,
    clock: Arc<RwLock<ClockSync>>,
}

impl fmt::Debug for NatsLeaseStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NatsLeaseStore")
            .field("bucket", &self.config.bucket)
            .field("servers", &self.config.servers)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl NatsLeaseStore {
    /// Connect to NATS, then open (or create) the configured KV bucket.
    pub async fn connect(config: NatsConfig) -> StoreResult<Self> {
        let client = Self::connect_client(&config).await?;
        let js = jetstream::new(client.clone());
        let kv = match js.get_key_value(config.bucket.clone()).await {
            Ok(store) => store,
            Err(get_err) => {
                debug!(bucket = %config.bucket, error = %get_err, "creating missing JetStream KV bucket");
                js.create_key_value(kv::Config {
                    bucket: config.bucket.clone(),
                    history: config.history,
                    ..Default::default()
                })
                .await
                .map_err(|create_err| {
                    StoreError::Transport(format!(
                        "failed to create JetStream KV bucket '{}': {create_err} (get error: {get_err})",
                        config.bucket
                    ))
                })?
            }
        };

        let request_timeout = config.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        info!(bucket = %config.bucket, "session lease bucket ready");
        Ok(Self {
            client,
            kv,
            request_timeout,
            clock: Arc::new(RwLock::new(ClockSync {
                offset: chrono::Duration::zero(),
                synced_at: None,
            })),
            config: Arc::new(config),
        })
    }

    /// Build connect options from the nats config, applying the selected security mode.
    async fn connect_options(config: &NatsConfig) -> StoreResult<ConnectOptions> {
        fn required<'a, T: ?Sized>(value: Option<&'a T>, what: &str) -> StoreResult<&'a T> {
            value.ok_or_else(|| StoreError::Config(format!("security mode requires '{what}'")))
        }

        let mut opts = ConnectOptions::new();
        opts = match config.security_mode {
            NatsSecurityMode::None => opts,
            NatsSecurityMode::UserPassword => {
                let user = required(config.username.as_deref(), "username")?;
                let pass = required(config.password.as_deref(), "password")?;
                opts.user_and_password(user.into(), pass.into())
            }
            NatsSecurityMode::Token => {
                opts.token(required(config.token.as_deref(), "token")?.into())
            }
            NatsSecurityMode::Nkey => {
                let seed_path = required(config.nkey_seed_path.as_deref(), "nkey_seed_path")?;
                let seed = tokio::fs::read_to_string(seed_path).await.map_err(|e| {
                    StoreError::Config(format!(
                        "failed to read nkey seed file '{}': {e}",
                        seed_path.display()
                    ))
                })?;
                opts.nkey(seed.trim().to_string())
            }
            NatsSecurityMode::Tls => {
                let cert = required(config.tls_cert_path.as_deref(), "tls_cert_path")?;
                let key = required(config.tls_key_path.as_deref(), "tls_key_path")?;
                opts.add_client_certificate(cert.to_path_buf(), key.to_path_buf())
                    .require_tls(true)
            }
            NatsSecurityMode::CredsFile => {
                let creds = required(config.creds_file_path.as_deref(), "creds_file_path")?;
                opts.credentials_file(creds).await.map_err(|e| {
                    StoreError::Config(format!(
                        "failed to load credentials file '{}': {e}",
                        creds.display()
                    ))
                })?
            }
        };

        // server-side TLS verification applies to every auth mode
        if let Some(ca_path) = &config.tls_ca_path {
            opts = opts.add_root_certificates(ca_path.clone()).require_tls(true);
        }

        Ok(opts
            .connection_timeout(config.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT))
            .retry_on_initial_connect())
    }

    async fn connect_client(config: &NatsConfig) -> StoreResult<async_nats::Client> {
        info!(
            servers = ?config.servers,
            security_mode = ?config.security_mode,
            connect_retry_max = config.connect_retry_max,
            "connecting to NATS"
        );

        let total_attempts = config.connect_retry_max.saturating_add(1);
        let mut attempt = 0u32;
        loop {
            let opts = Self::connect_options(config).await?;
            match opts.connect(config.servers.clone()).await {
                Ok(client) => {
                    info!(
                        attempt = attempt + 1,
                        total_attempts, "NATS connection established"
                    );
                    return Ok(client);
                }
                Err(err) if attempt + 1 >= total_attempts => {
                    error!(
                        attempts = total_attempts,
                        error = %err,
                        "NATS connection failed after all retry attempts"
                    );
                    return Err(StoreError::Transport(format!(
                        "NATS connection failed after {total_attempts} attempt(s): {err}"
                    )));
                }
                Err(err) => {
                    let delay = CONNECT_RETRY_BASE_DELAY
                        .saturating_mul(2u32.saturating_pow(attempt))
                        .min(MAX_CONNECT_RETRY_DELAY);
                    warn!(
                        attempt = attempt + 1,
                        total_attempts,
                        retry_in_ms = delay.as_millis(),
                        error = %err,
                        "NATS connection attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Returns true if the underlying client is currently connected.
    pub fn is_connected(&self) -> bool {
        matches!(
            self.client.connection_state(),
            async_nats::connection::State::Connected
        )
    }

    /// bound a KV round-trip by the request timeout. Fails fast while the
    /// client is reconnecting instead of queueing the request.
    async fn bounded<T, E, F>(&self, what: &str, key: &str, fut: F) -> StoreResult<T>
    where
        F: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        if !self.is_connected() {
            return Err(StoreError::NotConnected(format!(
                "KV {what} for key '{key}' skipped, client is {:?}",
                self.client.connection_state()
            )));
        }
        match tokio::time::timeout(self.request_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(StoreError::Transport(format!(
                "KV {what} failed for key '{key}': {e}"
            ))),
            Err(_) => Err(StoreError::Timeout(format!(
                "KV {what} for key '{key}' timed out after {:?}",
                self.request_timeout
            ))),
        }
    }

    async fn read_key(&self, key: &str) -> StoreResult<LeaseSnapshot> {
        match self.bounded("read", key, self.kv.entry(key.to_string())).await? {
            Some(entry) => snapshot_from_entry(entry),
            None => Ok(None),
        }
    }

    /// A version-checked write was refused. JetStream reports that as a
    /// generic error, so look at the key again: if its revision is no longer
    /// what the writer expected, someone else won; otherwise it is a real
    /// transport problem.
    async fn explain_refusal(&self, key: &str, expected: Option<Revision>, err: StoreError) -> StoreError {
        if matches!(err, StoreError::Timeout(_)) {
            return err;
        }
        match self.read_key(key).await {
            Ok(current) if current.as_ref().map(|c| c.revision) != expected => {
                StoreError::RevisionMismatch {
                    key: key.to_string(),
                }
            }
            Ok(_) => err,
            Err(read_err) => {
                debug!(key, error = %read_err, "could not re-read key after refused write");
                err
            }
        }
    }

    async fn resync_clock(&self) -> StoreResult<chrono::Duration> {
        let key = CLOCK_KEY;
        let before = Utc::now();
        self.bounded("clock probe", key, self.kv.put(key, Vec::new().into()))
            .await?;
        let entry = self
            .bounded("clock read", key, self.kv.entry(key.to_string()))
            .await?
            .ok_or_else(|| {
                StoreError::Transport(format!("clock probe '{key}' vanished before read-back"))
            })?;
        // a concurrent probe may have overwritten ours; its timestamp still
        // falls between `before` and `after`
        let after = Utc::now();

        let local_mid = before + (after - before) / 2;
        let offset = to_chrono(entry.created) - local_mid;
        debug!(offset_ms = offset.num_milliseconds(), "resynced store clock offset");
        Ok(offset)
    }
}

#[async_trait]
impl LeaseStore for NatsLeaseStore {
    async fn get(&self, account: &AccountId) -> StoreResult<LeaseSnapshot> {
        self.read_key(&session_key(account)).await
    }

    async fn create(&self, account: &AccountId, record: &LeaseRecord) -> StoreResult<Revision> {
        let key = session_key(account);
        let payload = models::encode(record)?;
        match self
            .bounded("create", &key, self.kv.create(&key, payload.into()))
            .await
        {
            Ok(rev) => Ok(Revision(rev)),
            Err(err) => Err(self.explain_refusal(&key, None, err).await),
        }
    }

    async fn update(
        &self,
        account: &AccountId,
        record: &LeaseRecord,
        expected: Revision,
    ) -> StoreResult<Revision> {
        let key = session_key(account);
        let payload = models::encode(record)?;
        match self
            .bounded(
                "update",
                &key,
                self.kv.update(&key, payload.into(), expected.0),
            )
            .await
        {
            Ok(rev) => Ok(Revision(rev)),
            Err(err) => Err(self.explain_refusal(&key, Some(expected), err).await),
        }
    }

    async fn merge(
        &self,
        account: &AccountId,
        patch: &LeasePatch,
        expected: Revision,
    ) -> StoreResult<Revision> {
        let key = session_key(account);
        let Some(current) = self.read_key(&key).await? else {
            return Err(StoreError::NotFound { key });
        };
        if current.revision != expected {
            return Err(StoreError::RevisionMismatch { key });
        }
        let mut record = current.value;
        record.apply(patch);
        self.update(account, &record, expected).await
    }

    async fn delete(&self, account: &AccountId, expected: Revision) -> StoreResult<()> {
        let key = session_key(account);
        match self
            .bounded(
                "delete",
                &key,
                self.kv.delete_expect_revision(&key, Some(expected.0)),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(err) => Err(self.explain_refusal(&key, Some(expected), err).await),
        }
    }

    async fn subscribe(&self, account: &AccountId) -> StoreResult<LeaseFeed> {
        let key = session_key(account);
        let watch = self
            .bounded("watch", &key, self.kv.watch_with_history(&key))
            .await?;
        let feed_key = key.clone();
        Ok(watch
            .map_err(move |e| {
                StoreError::Transport(format!("KV watch failed for key '{feed_key}': {e}"))
            })
            .and_then(|entry| async move { snapshot_from_entry(entry) })
            .boxed())
    }

    async fn server_time(&self) -> StoreResult<DateTime<Utc>> {
        let sync = *self.clock.read().await;
        let fresh = sync
            .synced_at
            .is_some_and(|at| at.elapsed() < self.config.clock_resync_interval);
        if fresh {
            return Ok(Utc::now() + sync.offset);
        }

        let mut guard = self.clock.write().await;
        match self.resync_clock().await {
            Ok(offset) => {
                *guard = ClockSync {
                    offset,
                    synced_at: Some(Instant::now()),
                };
                Ok(Utc::now() + offset)
            }
            // keep serving the last known offset if we had one
            Err(err) if guard.synced_at.is_some() => {
                warn!(error = %err, "store clock resync failed, keeping previous offset");
                Ok(Utc::now() + guard.offset)
            }
            Err(err) => Err(err),
        }
    }
}

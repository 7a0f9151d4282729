//! # config
//!
//! Session lease configuration. The file model lives in [`wire`]; this module
//! validates it and produces the runtime types the rest of the workspace uses.
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use tracing::{debug, warn};

pub mod wire;

pub use wire::{BackendMode, NatsSecurityMode};

/// heartbeat:ttl ratio below which a single late beat risks expiry
pub const RECOMMENDED_TTL_RATIO: u32 = 3;

/// validated session config
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    policy: LeasePolicy,
    retry: RetryPolicy,
    store: StoreConfig,
    path: Option<PathBuf>,
}

/// Timing rules for a single lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeasePolicy {
    /// lease lifetime without renewal
    pub ttl: Duration,
    /// renewal cadence, always strictly shorter than `ttl`
    pub heartbeat_interval: Duration,
    /// an expired lease is only taken over once `expires_at + takeover_grace` has passed
    pub takeover_grace: Duration,
    /// bound on a single renewal attempt
    pub renew_timeout: Duration,
}

impl LeasePolicy {
    /// Build a policy, rejecting timings that cannot survive a missed heartbeat.
    pub fn new(ttl: Duration, heartbeat_interval: Duration) -> Result<Self> {
        let policy = Self {
            ttl,
            heartbeat_interval,
            takeover_grace: Duration::ZERO,
            renew_timeout: heartbeat_interval,
        };
        policy.validate()?;
        Ok(policy)
    }

    pub fn with_takeover_grace(mut self, grace: Duration) -> Self {
        self.takeover_grace = grace;
        self
    }

    pub fn with_renew_timeout(mut self, timeout: Duration) -> Self {
        self.renew_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval.is_zero() {
            bail!("heartbeat interval must be greater than zero");
        }
        if self.heartbeat_interval >= self.ttl {
            bail!(
                "heartbeat interval ({:?}) must be shorter than the lease ttl ({:?})",
                self.heartbeat_interval,
                self.ttl
            );
        }
        if self.ttl < self.heartbeat_interval * 2 {
            bail!(
                "lease ttl ({:?}) must cover at least two heartbeat intervals ({:?}) to survive a missed beat",
                self.ttl,
                self.heartbeat_interval
            );
        }
        if self.renew_timeout.is_zero() {
            bail!("renew timeout must be greater than zero");
        }
        if self.ttl < self.heartbeat_interval * RECOMMENDED_TTL_RATIO {
            warn!(
                ttl = ?self.ttl,
                heartbeat_interval = ?self.heartbeat_interval,
                "lease ttl is less than {RECOMMENDED_TTL_RATIO}x the heartbeat interval"
            );
        }
        Ok(())
    }
}

impl Default for LeasePolicy {
    fn default() -> Self {
        let interval = Duration::from_secs(wire::default_heartbeat_interval().get() as u64);
        Self {
            ttl: Duration::from_secs(wire::default_lease_ttl().get() as u64),
            heartbeat_interval: interval,
            takeover_grace: Duration::ZERO,
            renew_timeout: interval,
        }
    }
}

/// Retry policy for optimistic transactions that lose a revision race.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts before giving up, the first one included.
    pub max_attempts: u32,
    /// Base delay between attempts (doubles every attempt).
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// delay before the given (1-based) retry
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        wire::Retry::default().into()
    }
}

impl From<wire::Retry> for RetryPolicy {
    fn from(retry: wire::Retry) -> Self {
        Self {
            max_attempts: retry.max_attempts.max(1),
            base_delay: Duration::from_millis(retry.base_delay_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StoreConfig {
    #[default]
    Memory,
    Nats(NatsConfig),
}

impl StoreConfig {
    pub fn backend_mode(&self) -> BackendMode {
        match self {
            StoreConfig::Memory => BackendMode::Memory,
            StoreConfig::Nats(_) => BackendMode::Nats,
        }
    }
}

/// Connection and bucket settings for the JetStream KV lease store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatsConfig {
    pub servers: Vec<String>,
    pub bucket: String,
    pub history: i64,
    pub security_mode: NatsSecurityMode,
    pub username: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
    pub nkey_seed_path: Option<PathBuf>,
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
    pub tls_ca_path: Option<PathBuf>,
    pub creds_file_path: Option<PathBuf>,
    pub connect_timeout: Option<Duration>,
    pub connect_retry_max: u32,
    pub request_timeout: Option<Duration>,
    pub clock_resync_interval: Duration,
}

impl TryFrom<wire::Nats> for NatsConfig {
    type Error = anyhow::Error;

    fn try_from(nats: wire::Nats) -> Result<Self> {
        if nats.servers.is_empty() {
            bail!("nats store requires at least one server url");
        }
        if nats.bucket.trim().is_empty() {
            bail!("nats store requires a non-empty bucket name");
        }
        Ok(Self {
            servers: nats.servers,
            bucket: nats.bucket,
            history: nats.history.max(1),
            security_mode: nats.security_mode,
            username: nats.username,
            password: nats.password,
            token: nats.token,
            nkey_seed_path: nats.nkey_seed_path,
            tls_cert_path: nats.tls_cert_path,
            tls_key_path: nats.tls_key_path,
            tls_ca_path: nats.tls_ca_path,
            creds_file_path: nats.creds_file_path,
            connect_timeout: nats.connect_timeout_ms.map(Duration::from_millis),
            connect_retry_max: nats.connect_retry_max,
            request_timeout: nats.request_timeout_ms.map(Duration::from_millis),
            clock_resync_interval: Duration::from_secs(nats.clock_resync_interval.get() as u64),
        })
    }
}

impl TryFrom<wire::Config> for SessionConfig {
    type Error = anyhow::Error;

    fn try_from(cfg: wire::Config) -> Result<Self> {
        let ttl = Duration::from_secs(cfg.lease_ttl.get() as u64);
        let interval = Duration::from_secs(cfg.heartbeat_interval.get() as u64);
        let mut policy = LeasePolicy::new(ttl, interval)?;
        if let Some(grace) = cfg.takeover_grace {
            policy = policy.with_takeover_grace(Duration::from_secs(grace.get() as u64));
        }
        if let Some(timeout) = cfg.renew_timeout {
            policy = policy.with_renew_timeout(Duration::from_secs(timeout.get() as u64));
        }

        let store = match cfg.store.backend {
            BackendMode::Memory => StoreConfig::Memory,
            BackendMode::Nats => StoreConfig::Nats(
                cfg.store
                    .nats
                    .context("nats backend selected but no `store.nats` section present")?
                    .try_into()?,
            ),
        };

        Ok(Self {
            policy,
            retry: cfg.retry.into(),
            store,
            path: None,
        })
    }
}

impl SessionConfig {
    /// attempts to decode the config first as JSON, then YAML, finally erroring if neither work
    pub fn parse<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("failed to find config at {}", &path.display()))?;
        let mut config = Self::parse_str(s)?;
        config.path = Some(path.to_path_buf());
        Ok(config)
    }

    /// attempts to decode the config first as JSON, then YAML, finally erroring if neither work
    pub fn parse_str<S: AsRef<str>>(s: S) -> Result<Self> {
        let s = s.as_ref();
        let wire: wire::Config = match serde_json::from_str(s) {
            Ok(cfg) => cfg,
            Err(json_err) => serde_yaml::from_str(s).with_context(|| {
                format!("config is neither valid JSON ({json_err}) nor valid YAML")
            })?,
        };
        debug!(?wire);
        wire.try_into()
    }

    pub fn policy(&self) -> &LeasePolicy {
        &self.policy
    }
    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }
    pub fn store(&self) -> &StoreConfig {
        &self.store
    }
    pub fn backend_mode(&self) -> BackendMode {
        self.store.backend_mode()
    }
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            policy: LeasePolicy::default(),
            retry: RetryPolicy::default(),
            store: StoreConfig::Memory,
            path: None,
        }
    }
}

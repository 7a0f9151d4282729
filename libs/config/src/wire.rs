//! On-disk configuration model. Everything here maps 1:1 to the YAML/JSON
//! file; validation and conversion into runtime types happens in the crate root.
use std::{num::NonZeroU32, path::PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize, de};

/// top-level config type
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    /// how long a lease stays valid without a renewal
    #[serde(
        default = "default_lease_ttl",
        deserialize_with = "deserialize_duration"
    )]
    pub lease_ttl: NonZeroU32,
    /// cadence of the renewal heartbeat
    #[serde(
        default = "default_heartbeat_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub heartbeat_interval: NonZeroU32,
    /// extra time an expired lease is still respected before takeover
    #[serde(default, deserialize_with = "deserialize_optional_duration")]
    pub takeover_grace: Option<NonZeroU32>,
    /// upper bound on a single renewal round-trip, defaults to the heartbeat interval
    #[serde(default, deserialize_with = "deserialize_optional_duration")]
    pub renew_timeout: Option<NonZeroU32>,
    #[serde(default)]
    pub retry: Retry,
    #[serde(default)]
    pub store: Store,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lease_ttl: default_lease_ttl(),
            heartbeat_interval: default_heartbeat_interval(),
            takeover_grace: None,
            renew_timeout: None,
            retry: Retry::default(),
            store: Store::default(),
        }
    }
}

/// transaction retry settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Retry {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendMode {
    /// process-local store, useful for tests and single-host setups
    #[default]
    Memory,
    /// JetStream KV bucket shared by every client
    Nats,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct Store {
    #[serde(default)]
    pub backend: BackendMode,
    pub nats: Option<Nats>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NatsSecurityMode {
    #[default]
    None,
    UserPassword,
    Token,
    Nkey,
    Tls,
    CredsFile,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Nats {
    pub servers: Vec<String>,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(default = "default_history")]
    pub history: i64,
    #[serde(default)]
    pub security_mode: NatsSecurityMode,
    pub username: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
    pub nkey_seed_path: Option<PathBuf>,
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
    pub tls_ca_path: Option<PathBuf>,
    pub creds_file_path: Option<PathBuf>,
    /// connect timeout in ms
    pub connect_timeout_ms: Option<u64>,
    #[serde(default = "default_connect_retry_max")]
    pub connect_retry_max: u32,
    /// request timeout in ms
    pub request_timeout_ms: Option<u64>,
    #[serde(
        default = "default_clock_resync",
        deserialize_with = "deserialize_duration"
    )]
    pub clock_resync_interval: NonZeroU32,
}

pub fn default_lease_ttl() -> NonZeroU32 {
    NonZeroU32::new(60).unwrap()
}

pub fn default_heartbeat_interval() -> NonZeroU32 {
    NonZeroU32::new(20).unwrap()
}

pub fn default_clock_resync() -> NonZeroU32 {
    NonZeroU32::new(300).unwrap()
}

pub const fn default_max_attempts() -> u32 {
    3
}

pub const fn default_base_delay_ms() -> u64 {
    50
}

pub const fn default_history() -> i64 {
    1
}

pub const fn default_connect_retry_max() -> u32 {
    3
}

pub fn default_bucket() -> String {
    "user_sessions".to_owned()
}

/// Parse a duration string with optional time units
/// Accepts: "60", "60s", "5m", "1h"
/// If no unit is specified, assumes seconds
fn parse_duration(s: &str) -> Result<u32> {
    let s = s.trim();
    if s.is_empty() {
        return Err(anyhow::Error::msg("empty duration string"));
    }

    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    // split units
    let (num, unit) = s.split_at(end);
    let num = num.parse::<u32>().context("invalid number")?;

    let num_seconds = match unit.trim() {
        "" | "s" => 1,
        "m" => 60,
        "h" => 3600,
        other => anyhow::bail!(
            "unknown time unit '{}', only 'h', 'm', or 's' are supported",
            other
        ),
    };

    num.checked_mul(num_seconds)
        .context("duration value overflow")
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireDuration {
    Seconds(u64),
    String(String),
}

impl WireDuration {
    fn into_nonzero<E: de::Error>(self) -> Result<NonZeroU32, E> {
        match self {
            WireDuration::Seconds(val) => NonZeroU32::new(
                u32::try_from(val).map_err(|_| E::custom("duration value too large"))?,
            )
            .ok_or_else(|| E::custom("duration cannot be zero")),
            WireDuration::String(s) => NonZeroU32::new(parse_duration(&s).map_err(E::custom)?)
                .ok_or_else(|| E::custom("duration cannot be zero")),
        }
    }
}

fn deserialize_duration<'de, D>(de: D) -> Result<NonZeroU32, D::Error>
where
    D: Deserializer<'de>,
{
    WireDuration::deserialize(de)?.into_nonzero()
}

fn deserialize_optional_duration<'de, D>(de: D) -> Result<Option<NonZeroU32>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<WireDuration>::deserialize(de)?
        .map(WireDuration::into_nonzero)
        .transpose()
}

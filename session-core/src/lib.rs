//! # session-core
//!
//! Single-active-session enforcement. An account may be signed in on one
//! device at a time; the device holding the account's lease is the one signed
//! in. Sign-in acquires the lease, a heartbeat keeps it alive, and a watcher
//! signs the session out as soon as another device takes the lease over.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    non_snake_case,
    non_upper_case_globals
)]
#![allow(clippy::cognitive_complexity)]
#![deny(rustdoc::broken_intra_doc_links)]
pub use chrono;
pub use lease_store;
pub use tokio;
pub use tracing;

pub mod config;
pub mod engine;
pub mod env;
pub mod error;
pub mod heartbeat;
pub mod identity;
pub mod metrics;
pub mod session;
pub mod watcher;

pub use engine::{AcquireOutcome, Acquired, LeaseEngine, LeaseIdentity, ReleaseOutcome};
pub use error::{LeaseError, SessionError};
pub use session::{ActiveSession, SessionEvent, SessionManager};

#![allow(missing_docs)] // proc macros dont play nicely with docstrings

//! # metrics
//!
//! counters for the lease protocol
use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, TextEncoder,
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
};

lazy_static! {
    /// successful acquisitions, labelled created/reacquired/took_over
    pub static ref LEASE_ACQUIRED: IntCounterVec = register_int_counter_vec!(
        "session_lease_acquired",
        "lease acquisitions by outcome",
        &["outcome"]
    )
    .unwrap();

    /// acquisitions refused because another session holds the lease
    pub static ref LEASE_CONFLICTS: IntCounter = register_int_counter!("session_lease_conflicts", "acquisitions refused by an unexpired lease").unwrap();

    /// heartbeat renewals that were confirmed
    pub static ref RENEW_SUCCESS: IntCounter = register_int_counter!("session_lease_renew_success", "confirmed lease renewals").unwrap();
    /// heartbeat renewals that failed or timed out
    pub static ref RENEW_FAILURES: IntCounter = register_int_counter!("session_lease_renew_failures", "failed lease renewals").unwrap();

    /// leases deleted by their owner
    pub static ref LEASE_RELEASED: IntCounter = register_int_counter!("session_lease_released", "leases released by their owner").unwrap();

    /// sessions that observed another device taking their lease
    pub static ref EVICTIONS: IntCounter = register_int_counter!("session_evictions", "sessions evicted by another device").unwrap();

    /// store calls that failed, labelled by operation
    pub static ref STORE_ERRORS: IntCounterVec = register_int_counter_vec!(
        "session_store_errors",
        "lease store failures by operation",
        &["op"]
    )
    .unwrap();

    /// sessions currently holding a lease in this process
    pub static ref ACTIVE_SESSIONS: IntGauge = register_int_gauge!("session_active", "sessions holding a lease").unwrap();

    /// round trip of lease protocol operations
    pub static ref LEASE_OP_DURATION: HistogramVec = register_histogram_vec!(
        "session_lease_op_duration",
        "lease operation duration (seconds)",
        &["op"]
    )
    .unwrap();
}

/// Render every registered metric in the prometheus text format.
pub fn render() -> anyhow::Result<String> {
    let mut buf = Vec::new();
    TextEncoder::new().encode(&prometheus::gather(), &mut buf)?;
    Ok(String::from_utf8(buf)?)
}

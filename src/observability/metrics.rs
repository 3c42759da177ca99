//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define ingress metrics (sessions, commands, envelopes, rejections)
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `smtp_sessions_active` (gauge): currently registered sessions
//! - `smtp_sessions_total` (counter): sessions admitted
//! - `smtp_commands_total` (counter): commands by verb
//! - `smtp_rejections_total` (counter): rejections by reason
//! - `smtp_envelopes_total` (counter): envelopes by outcome
//! - `smtp_envelope_bytes` (histogram): captured body sizes
//! - `smtp_starttls_total` (counter): upgrades by outcome
//! - `directory_lookups_total` (counter): directory calls by outcome
//!
//! # Design Decisions
//! - Low-overhead metric updates (atomic operations)
//! - Without an installed recorder every call is a no-op

use std::net::SocketAddr;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its scrape listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_session_opened(active: usize) {
    counter!("smtp_sessions_total").increment(1);
    gauge!("smtp_sessions_active").set(active as f64);
}

pub fn record_session_closed(active: usize) {
    gauge!("smtp_sessions_active").set(active as f64);
}

pub fn record_command(command: &'static str) {
    counter!("smtp_commands_total", "command" => command).increment(1);
}

pub fn record_rejection(reason: &'static str) {
    counter!("smtp_rejections_total", "reason" => reason).increment(1);
}

/// `outcome` is one of `accepted`, `rejected`, `too_large`, `malformed`.
pub fn record_envelope(outcome: &'static str, bytes: usize) {
    counter!("smtp_envelopes_total", "outcome" => outcome).increment(1);
    if outcome == "accepted" {
        histogram!("smtp_envelope_bytes").record(bytes as f64);
    }
}

pub fn record_starttls(outcome: &'static str) {
    counter!("smtp_starttls_total", "outcome" => outcome).increment(1);
}

pub fn record_directory_lookup(outcome: &'static str) {
    counter!("directory_lookups_total", "outcome" => outcome).increment(1);
}

//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events, per-session spans)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → Log aggregation (stdout)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Session ID flows through every event via the session span
//! - Metrics are cheap (atomic increments)
//! - The exporter is optional; metric calls are no-ops without it

pub mod logging;
pub mod metrics;

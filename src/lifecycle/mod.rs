//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → wait_for_signal resolves
//!
//! Shutdown (shutdown.rs):
//!     trigger → accept loop stops → session pool drains → exit
//! ```
//!
//! # Design Decisions
//! - Ordered shutdown: stop accept, tighten deadlines, drain, close
//! - The drain is bounded by the configured grace period

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
pub use signals::wait_for_signal;

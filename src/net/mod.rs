//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept)
//!     → connection.rs (line reads, envelope capture, deadlines)
//!     → tls.rs (STARTTLS acceptor, on demand)
//!     → Hand off to SMTP session
//!
//! Transport States:
//!     Plain → (STARTTLS) → Tls → Closed
//! ```
//!
//! # Design Decisions
//! - Reads are bounded: lines by max_line_length, bodies by max_envelope_size
//! - Capture buffers are pooled and returned on drop (buffer.rs)
//! - TLS is optional and upgraded in place

pub mod buffer;
pub mod connection;
pub mod listener;
pub mod tls;

pub use buffer::{BufferPool, PooledBuffer};
pub use connection::{Connection, ConnectionError, ConnectionSettings, DeadlineHandle, Transport};
pub use listener::{Listener, ListenerError};
pub use tls::{load_acceptor, TlsError};

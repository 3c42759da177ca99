//! SMTP protocol subsystem.
//!
//! # Data Flow
//! ```text
//! Accepted socket
//!     → pool.rs (admission ticket, registration)
//!     → session.rs (state machine over net::Connection)
//!         → command.rs (line → Command)
//!         → address.rs (path → Address)
//!         → envelope.rs (transaction, captured and decoded body)
//!         → response.rs (cached reply bytes)
//!     → pipeline (resolve, quota, encrypt), inline or via detached.rs
//!     → delivery sink
//! ```
//!
//! server.rs owns the accept loop and everything shared between sessions.

pub mod address;
pub mod command;
pub mod detached;
pub mod envelope;
pub mod pool;
pub mod response;
pub mod server;
pub mod session;

pub use address::{Address, AddressError};
pub use command::Command;
pub use detached::{DeliverySlot, DetachedDeliveries};
pub use envelope::{Attachment, Envelope, EnvelopeError, MessageContent};
pub use pool::{AdmissionTicket, DrainOutcome, PoolError, SessionGuard, SessionPool};
pub use response::{Reply, ResponseCache};
pub use server::{Server, ServerError};
pub use session::{Session, SessionContext, SessionState};

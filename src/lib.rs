//! Inbound SMTP ingress that seals accepted mail to each recipient's key.

pub mod config;
pub mod crypto;
pub mod delivery;
pub mod directory;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod pipeline;
pub mod smtp;

pub use config::schema::ServerConfig;
pub use delivery::{CollectingSink, MailSink, TracingSink};
pub use lifecycle::Shutdown;
pub use smtp::{DrainOutcome, Server, ServerError};

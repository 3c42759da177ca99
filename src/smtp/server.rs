//! SMTP server: shared state and the accept loop.
//!
//! # Responsibilities
//! - Validate configuration and load TLS material once
//! - Build the pipeline, reply cache and buffer pool shared by all sessions
//! - Accept connections, admit them through the session pool, spawn workers
//! - On shutdown stop accepting, drain the pool, then wait for detached
//!   deliveries that were already acknowledged
//!
//! # Design Decisions
//! - A ticket is acquired before `accept`, so a full pool applies
//!   backpressure at the socket
//! - One task per session; the accept loop never waits on a session

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;

use crate::config::{validate_config, ServerConfig, ValidationError};
use crate::delivery::MailSink;
use crate::directory::AccountDirectory;
use crate::net::buffer::BufferPool;
use crate::net::connection::Connection;
use crate::net::listener::{Listener, ListenerError};
use crate::net::tls::{load_acceptor, TlsError};
use crate::pipeline::Pipeline;
use crate::smtp::detached::DetachedDeliveries;
use crate::smtp::pool::{DrainOutcome, SessionPool};
use crate::smtp::response::ResponseCache;
use crate::smtp::session::SessionContext;

/// Pause after a failed accept, so a persistent error does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Initial capacity of pooled capture buffers.
const CAPTURE_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid configuration ({} problems)", .0.len())]
    Config(Vec<ValidationError>),

    #[error("TLS setup failed: {0}")]
    Tls(#[from] TlsError),

    #[error("{0}")]
    Listener(ListenerError),
}

/// A bound SMTP server, ready to run.
pub struct Server {
    listener: Listener,
    pool: Arc<SessionPool>,
    ctx: Arc<SessionContext>,
    grace: Duration,
}

impl Server {
    /// Validate `config`, build the shared session state and bind.
    pub async fn bind(
        config: ServerConfig,
        directory: Arc<dyn AccountDirectory>,
        sink: Arc<dyn MailSink>,
    ) -> Result<Self, ServerError> {
        validate_config(&config).map_err(ServerError::Config)?;

        let tls = config.tls.as_ref().map(load_acceptor).transpose()?;
        let on_handshake_failure = config
            .tls
            .as_ref()
            .map(|tls| tls.on_handshake_failure)
            .unwrap_or_default();

        let pipeline = Pipeline::standard(directory, config.directory.timeout());
        tracing::info!(middlewares = ?pipeline.middleware_names(), "Pipeline built");

        let smtp = config.smtp;
        let responses = ResponseCache::new(&smtp.hostname, smtp.max_envelope_size, tls.is_some());
        let buffers = BufferPool::new(
            smtp.pooled_buffers,
            smtp.max_envelope_size.min(CAPTURE_CAPACITY),
        );
        let pool = SessionPool::new(smtp.max_sessions);
        let listener = Listener::bind(&smtp.bind_address)
            .await
            .map_err(ServerError::Listener)?;

        tracing::info!(
            hostname = %smtp.hostname,
            max_sessions = smtp.max_sessions,
            max_envelope_size = smtp.max_envelope_size,
            starttls = tls.is_some(),
            delivery_mode = ?smtp.delivery_mode,
            "SMTP server configured"
        );

        let ctx = Arc::new(SessionContext {
            detached: DetachedDeliveries::new(smtp.max_detached_deliveries),
            smtp,
            responses,
            tls,
            on_handshake_failure,
            pipeline: Arc::new(pipeline),
            sink,
            buffers,
        });

        Ok(Self {
            listener,
            pool,
            ctx,
            grace: config.shutdown.grace(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    /// Accept until `shutdown` fires, then drain the session pool and the
    /// detached deliveries.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> DrainOutcome {
        tracing::info!(address = %self.local_addr(), "Accepting connections");

        loop {
            let ticket = tokio::select! {
                _ = shutdown.recv() => break,
                ticket = self.pool.acquire() => match ticket {
                    Ok(ticket) => ticket,
                    Err(_) => break,
                },
            };

            let (stream, peer) = tokio::select! {
                _ = shutdown.recv() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                        drop(ticket);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                },
            };

            let conn = Connection::new(stream, self.ctx.connection_settings());
            let session = self.pool.admit(ticket, conn, peer, Arc::clone(&self.ctx));
            tracing::debug!(
                session_id = %session.id(),
                peer_addr = %peer,
                active = self.pool.active(),
                "Session admitted"
            );
            tokio::spawn(session.run());
        }

        tracing::info!("Stopped accepting connections");
        drop(self.listener);
        let sessions = self.pool.shutdown(self.grace).await;
        let deliveries = self.ctx.detached.drain(self.grace).await;
        if deliveries > 0 {
            tracing::warn!(deliveries, "Detached deliveries still running after grace");
        }

        match sessions {
            DrainOutcome::Drained if deliveries == 0 => DrainOutcome::Drained,
            DrainOutcome::Drained => DrainOutcome::TimedOut {
                remaining: deliveries,
            },
            DrainOutcome::TimedOut { remaining } => DrainOutcome::TimedOut {
                remaining: remaining + deliveries,
            },
        }
    }
}

//! Per-connection protocol state machine.
//!
//! # Responsibilities
//! - Drive one connection from greeting to close
//! - Hold the in-flight transaction (sender, recipients, captured body)
//! - Answer each command from the precomputed reply cache
//! - Hand completed envelopes to the pipeline and the mail sink
//!
//! # Design Decisions
//! - Owned by exactly one task; nothing here is shared mutably
//! - Replies are queued and flushed once no further pipelined command is
//!   already buffered
//! - Protocol errors answer and keep the session in `Command`; transport
//!   errors end the session
//! - The pool slot is held by a guard field and released when the session
//!   is dropped, whatever the exit path
//!
//! # Data Flow
//! ```text
//! Greeting → Command ⇄ Data
//!               │        └─ read_envelope → parse → pipeline → sink
//!               └─ QUIT / transport error / deadline → Closed
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsAcceptor;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::{DeliveryMode, HandshakeFailurePolicy, SmtpConfig};
use crate::delivery::MailSink;
use crate::net::buffer::BufferPool;
use crate::net::connection::{Connection, ConnectionError, ConnectionSettings};
use crate::observability::metrics;
use crate::pipeline::Pipeline;
use crate::smtp::address::Address;
use crate::smtp::command::Command;
use crate::smtp::detached::DetachedDeliveries;
use crate::smtp::envelope::Envelope;
use crate::smtp::pool::SessionGuard;
use crate::smtp::response::{Reply, ResponseCache};

/// Server-wide state shared by every session.
pub struct SessionContext {
    pub smtp: SmtpConfig,
    pub responses: ResponseCache,
    /// STARTTLS acceptor; `None` when no certificate material is configured.
    pub tls: Option<TlsAcceptor>,
    pub on_handshake_failure: HandshakeFailurePolicy,
    pub pipeline: Arc<Pipeline>,
    pub sink: Arc<dyn MailSink>,
    pub buffers: Arc<BufferPool>,
    /// Background pipeline runs in detached mode.
    pub detached: DetachedDeliveries,
}

impl SessionContext {
    /// Connection limits derived from the protocol settings.
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            max_line_length: self.smtp.max_line_length,
            idle_timeout: self.smtp.idle_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Greeting,
    Command,
    Data,
    Closed,
}

/// One SMTP dialogue.
pub struct Session<S> {
    id: Uuid,
    peer: SocketAddr,
    conn: Connection<S>,
    ctx: Arc<SessionContext>,
    state: SessionState,
    envelope: Option<Envelope>,
    extended: bool,
    // Declared last so the slot is returned after the connection is gone.
    _guard: SessionGuard,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub(crate) fn new(
        guard: SessionGuard,
        conn: Connection<S>,
        peer: SocketAddr,
        ctx: Arc<SessionContext>,
    ) -> Self {
        Self {
            id: guard.id(),
            peer,
            conn,
            ctx,
            state: SessionState::Greeting,
            envelope: None,
            extended: false,
            _guard: guard,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the peer introduced itself with EHLO.
    pub fn is_extended(&self) -> bool {
        self.extended
    }

    /// Run the dialogue to completion, then close the connection.
    pub async fn run(mut self) {
        let span = tracing::info_span!("session", session_id = %self.id, peer_addr = %self.peer);
        async move {
            tracing::debug!("Session started");
            if let Err(e) = self.serve().await {
                self.end_with(e);
            }
            self.state = SessionState::Closed;
            self.conn.close().await;
            tracing::debug!("Session ended");
        }
        .instrument(span)
        .await
    }

    async fn serve(&mut self) -> Result<(), ConnectionError> {
        self.respond(Reply::Greeting);
        self.conn.flush().await?;
        self.state = SessionState::Command;

        loop {
            match self.state {
                SessionState::Greeting | SessionState::Command => self.command_cycle().await?,
                SessionState::Data => self.data_cycle().await?,
                SessionState::Closed => return Ok(()),
            }
        }
    }

    async fn command_cycle(&mut self) -> Result<(), ConnectionError> {
        let reply = match self.conn.read_line().await {
            Ok(line) => {
                let command = Command::parse(&line);
                metrics::record_command(command.name());
                tracing::trace!(command = command.name(), "Command received");
                self.execute(command).await?
            }
            Err(ConnectionError::LineTooLong(limit)) => {
                tracing::debug!(limit, "Command line too long");
                Some(Reply::LineTooLong)
            }
            Err(e) => return Err(e),
        };
        if let Some(reply) = reply {
            self.respond(reply);
        }
        self.flush_if_idle().await
    }

    /// Apply one command. `None` means the reply was already sent.
    async fn execute(&mut self, command: Command) -> Result<Option<Reply>, ConnectionError> {
        let reply = match command {
            Command::Helo(domain) => {
                tracing::debug!(helo = %domain, "HELO");
                self.reset();
                self.extended = false;
                Reply::Helo
            }
            Command::Ehlo(domain) => {
                tracing::debug!(ehlo = %domain, "EHLO");
                self.reset();
                self.extended = true;
                if self.conn.is_tls() {
                    Reply::EhloSecured
                } else {
                    Reply::Ehlo
                }
            }
            Command::MailFrom { path, size } => self.mail_from(&path, size),
            Command::RcptTo(path) => self.rcpt_to(&path),
            Command::Data => match &self.envelope {
                None => Reply::MailRequired,
                Some(envelope) if envelope.recipients.is_empty() => Reply::RcptRequired,
                Some(_) => {
                    self.state = SessionState::Data;
                    Reply::StartData
                }
            },
            Command::Rset => {
                self.reset();
                Reply::Ok
            }
            Command::Noop => Reply::Ok,
            Command::Vrfy => Reply::CannotVerify,
            Command::Help => Reply::Help,
            Command::StartTls => return self.start_tls().await,
            Command::Quit => {
                self.state = SessionState::Closed;
                Reply::Bye
            }
            Command::Unknown => Reply::Unrecognized,
        };
        Ok(Some(reply))
    }

    fn mail_from(&mut self, path: &str, size: Option<u64>) -> Reply {
        if self.envelope.is_some() {
            return Reply::NestedMail;
        }
        let sender = match Address::parse(path) {
            Ok(sender) => sender,
            Err(e) => {
                tracing::debug!(error = %e, "Invalid sender");
                return Reply::InvalidAddress;
            }
        };
        if size.is_some_and(|declared| declared > self.ctx.smtp.max_envelope_size as u64) {
            return Reply::MessageTooLarge;
        }
        self.envelope = Some(Envelope::new(self.id, sender));
        Reply::SenderOk
    }

    fn rcpt_to(&mut self, path: &str) -> Reply {
        let Some(envelope) = self.envelope.as_mut() else {
            return Reply::MailRequired;
        };
        let recipient = match Address::parse(path) {
            Ok(recipient) => recipient,
            Err(e) => {
                tracing::debug!(error = %e, "Invalid recipient");
                return Reply::InvalidAddress;
            }
        };
        if !self.ctx.smtp.serves_domain(recipient.domain()) {
            tracing::debug!(recipient = %recipient, "Relay attempt refused");
            return Reply::RelayDenied;
        }
        match envelope.add_recipient(recipient, self.ctx.smtp.max_recipients) {
            Ok(()) => Reply::RecipientOk,
            Err(_) => Reply::TooManyRecipients,
        }
    }

    async fn start_tls(&mut self) -> Result<Option<Reply>, ConnectionError> {
        self.reset();
        if self.conn.is_tls() {
            return Ok(Some(Reply::TlsAlreadyActive));
        }
        let Some(acceptor) = self.ctx.tls.clone() else {
            return Ok(Some(Reply::TlsUnavailable));
        };

        self.respond(Reply::ReadyToStartTls);
        self.conn.flush().await?;

        match self.conn.upgrade(&acceptor).await {
            Ok(()) => {
                self.extended = false;
                metrics::record_starttls("success");
                tracing::info!(
                    client_certificate = self.conn.has_client_certificate(),
                    "TLS established"
                );
            }
            Err(ConnectionError::Handshake(e)) => {
                metrics::record_starttls("failure");
                tracing::warn!(error = %e, policy = ?self.ctx.on_handshake_failure, "TLS handshake failed");
                if self.ctx.on_handshake_failure == HandshakeFailurePolicy::Close {
                    self.state = SessionState::Closed;
                }
            }
            Err(e) => return Err(e),
        }
        Ok(None)
    }

    async fn data_cycle(&mut self) -> Result<(), ConnectionError> {
        self.state = SessionState::Command;
        let captured = self
            .conn
            .read_envelope(self.ctx.smtp.max_envelope_size, &self.ctx.buffers)
            .await;

        let reply = match captured {
            Ok(raw) => match self.envelope.take() {
                Some(mut envelope) => {
                    envelope.set_body(raw, self.conn.is_tls());
                    self.deliver(envelope).await
                }
                None => Reply::MailRequired,
            },
            Err(ConnectionError::EnvelopeTooLarge(limit)) => {
                tracing::info!(limit, "Message body too large");
                metrics::record_envelope("too_large", 0);
                self.reset();
                Reply::MessageTooLarge
            }
            Err(ConnectionError::Overrun) => {
                tracing::warn!("Message body overran the drain limit, closing");
                metrics::record_envelope("too_large", 0);
                self.reset();
                self.state = SessionState::Closed;
                Reply::MessageTooLarge
            }
            Err(e) => return Err(e),
        };
        self.respond(reply);
        self.flush_if_idle().await
    }

    async fn deliver(&mut self, mut envelope: Envelope) -> Reply {
        let size = envelope.size;
        if let Err(e) = envelope.parse_body() {
            tracing::info!(envelope_id = %envelope.id, size, error = %e, "Rejecting malformed message");
            metrics::record_envelope("malformed", size);
            return Reply::MalformedMessage;
        }
        tracing::debug!(
            envelope_id = %envelope.id,
            size,
            recipients = envelope.recipients.len(),
            esmtp = self.extended,
            secure = envelope.secure,
            "Envelope captured"
        );

        match self.ctx.smtp.delivery_mode {
            DeliveryMode::Synchronous => process(&self.ctx, envelope).await,
            DeliveryMode::Detached => match self.ctx.detached.reserve().await {
                Some(slot) => {
                    let ctx = Arc::clone(&self.ctx);
                    self.ctx.detached.spawn(slot, async move {
                        process(&ctx, envelope).await;
                    });
                    Reply::Accepted
                }
                None => process(&self.ctx, envelope).await,
            },
        }
    }

    fn reset(&mut self) {
        self.envelope = None;
    }

    fn respond(&mut self, reply: Reply) {
        if reply.code() >= 400 {
            metrics::record_rejection(reply.reason());
        }
        self.conn.write(self.ctx.responses.get(reply));
    }

    /// Flush unless another pipelined command is already waiting.
    async fn flush_if_idle(&mut self) -> Result<(), ConnectionError> {
        if self.state == SessionState::Command && self.conn.has_buffered_line() {
            return Ok(());
        }
        self.conn.flush().await
    }

    fn end_with(&mut self, error: ConnectionError) {
        match error {
            ConnectionError::Timeout => {
                let draining = self.conn.deadline_handle().is_draining();
                tracing::info!(draining, "Session deadline passed");
                self.respond(if draining {
                    Reply::ShuttingDown
                } else {
                    Reply::IdleTimeout
                });
            }
            ConnectionError::Closed => tracing::debug!("Peer closed connection"),
            e => tracing::debug!(error = %e, "Session transport error"),
        }
    }
}

/// Run the pipeline and hand the result to the sink.
async fn process(ctx: &SessionContext, envelope: Envelope) -> Reply {
    let envelope_id = envelope.id;
    let size = envelope.size;

    let sealed = match ctx.pipeline.run(envelope).await {
        Ok(sealed) => sealed,
        Err(e) => {
            tracing::warn!(%envelope_id, error = %e, "Envelope rejected");
            metrics::record_envelope("rejected", size);
            return e.reply();
        }
    };

    let delivered = sealed.len();
    if let Err(e) = ctx.sink.deliver(sealed).await {
        tracing::error!(%envelope_id, error = %e, "Sink refused sealed messages");
        metrics::record_envelope("failed", size);
        return Reply::ProcessingFailed;
    }

    tracing::info!(%envelope_id, size, delivered, "Envelope accepted");
    metrics::record_envelope("accepted", size);
    Reply::Accepted
}

//! Connection adapter over one duplex byte stream.
//!
//! # Responsibilities
//! - Bounded line and delimiter reads with resynchronisation
//! - Envelope capture into pooled buffers (dot-unstuffed, size-bounded)
//! - Buffered writes flushed once per command/response cycle
//! - Idle deadlines that a shutdown can tighten from another task
//! - In-place STARTTLS upgrade that recovers the plaintext stream on failure
//!
//! # Design Decisions
//! - The read buffer is owned here, so an upgrade can discard plaintext
//!   that was pipelined behind STARTTLS
//! - Deadlines live in a watch channel; every blocking operation races the
//!   current deadline and re-arms when it changes
//! - Once a connection is draining its deadline only ever moves earlier

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

use crate::net::buffer::{BufferPool, PooledBuffer};

const READ_CHUNK: usize = 8 * 1024;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Errors raised by the connection adapter.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Socket failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The idle deadline passed.
    #[error("connection timed out")]
    Timeout,

    /// The peer closed the stream, or the connection was closed locally.
    #[error("connection closed")]
    Closed,

    /// No line terminator within the scan bound.
    #[error("line exceeds {0} bytes")]
    LineTooLong(usize),

    /// The body exceeded the maximum size; it was drained to its terminator.
    #[error("envelope exceeds {0} bytes")]
    EnvelopeTooLarge(usize),

    /// The body kept going well past the maximum; the stream is abandoned.
    #[error("envelope overran the drain limit")]
    Overrun,

    /// TLS negotiation failed. The plaintext stream is still usable.
    #[error("TLS handshake failed: {0}")]
    Handshake(io::Error),

    /// STARTTLS on an already encrypted stream.
    #[error("transport already encrypted")]
    AlreadyEncrypted,
}

impl ConnectionError {
    /// Whether the session may keep talking after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ConnectionError::LineTooLong(_)
                | ConnectionError::EnvelopeTooLarge(_)
                | ConnectionError::Handshake(_)
                | ConnectionError::AlreadyEncrypted
        )
    }
}

/// Byte stream that is either plaintext or TLS-wrapped.
pub enum Transport<S> {
    Plain(S),
    Tls(Box<TlsStream<S>>),
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for Transport<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            Transport::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for Transport<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            Transport::Plain(s) => Pin::new(s).poll_write(cx, data),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, data),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            Transport::Plain(s) => Pin::new(s).poll_flush(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            Transport::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Shared handle on a connection's idle deadline.
///
/// The session refreshes it after each read; the pool tightens it on
/// shutdown. After `tighten` the deadline can no longer be extended.
#[derive(Debug, Clone)]
pub struct DeadlineHandle {
    tx: Arc<watch::Sender<Instant>>,
    draining: Arc<AtomicBool>,
}

impl DeadlineHandle {
    fn new(timeout: Duration) -> (Self, watch::Receiver<Instant>) {
        let (tx, rx) = watch::channel(Instant::now() + timeout);
        let handle = Self {
            tx: Arc::new(tx),
            draining: Arc::new(AtomicBool::new(false)),
        };
        (handle, rx)
    }

    /// Push the deadline to `now + timeout` unless the connection is draining.
    pub fn refresh(&self, timeout: Duration) -> bool {
        let next = Instant::now() + timeout;
        let draining = &self.draining;
        self.tx.send_if_modified(|deadline| {
            if draining.load(Ordering::SeqCst) {
                return false;
            }
            *deadline = next;
            true
        })
    }

    /// Mark the connection as draining and pull the deadline in to at most
    /// `now + grace`.
    pub fn tighten(&self, grace: Duration) {
        self.draining.store(true, Ordering::SeqCst);
        let limit = Instant::now() + grace;
        self.tx.send_if_modified(|deadline| {
            if *deadline > limit {
                *deadline = limit;
                true
            } else {
                false
            }
        });
    }

    /// Whether `tighten` has been called.
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// The current deadline.
    pub fn deadline(&self) -> Instant {
        *self.tx.borrow()
    }
}

/// Static limits applied to one connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub max_line_length: usize,
    pub idle_timeout: Duration,
}

/// One peer connection: transport, buffers and deadline.
pub struct Connection<S> {
    transport: Option<Transport<S>>,
    read_buf: Vec<u8>,
    write_buf: Vec<u8>,
    settings: ConnectionSettings,
    deadline: DeadlineHandle,
    deadline_rx: watch::Receiver<Instant>,
    discarding: bool,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap a freshly accepted plaintext stream.
    pub fn new(stream: S, settings: ConnectionSettings) -> Self {
        let (deadline, deadline_rx) = DeadlineHandle::new(settings.idle_timeout);
        Self {
            transport: Some(Transport::Plain(stream)),
            read_buf: Vec::with_capacity(READ_CHUNK),
            write_buf: Vec::with_capacity(512),
            settings,
            deadline,
            deadline_rx,
            discarding: false,
        }
    }

    /// Handle for tightening this connection's deadline from elsewhere.
    pub fn deadline_handle(&self) -> DeadlineHandle {
        self.deadline.clone()
    }

    /// Whether the transport is TLS-protected.
    pub fn is_tls(&self) -> bool {
        matches!(self.transport, Some(Transport::Tls(_)))
    }

    /// Whether the TLS peer presented a verified client certificate.
    pub fn has_client_certificate(&self) -> bool {
        match &self.transport {
            Some(Transport::Tls(tls)) => tls
                .get_ref()
                .1
                .peer_certificates()
                .is_some_and(|certs| !certs.is_empty()),
            _ => false,
        }
    }

    /// Whether `close` has run.
    pub fn is_closed(&self) -> bool {
        self.transport.is_none()
    }

    /// Refresh the idle deadline to `now + timeout`.
    ///
    /// No-op once the connection is draining.
    pub fn set_deadline(&mut self, timeout: Duration) {
        self.deadline.refresh(timeout);
    }

    /// Read one line, stripping the trailing LF and an optional CR.
    pub async fn read_line(&mut self) -> Result<Vec<u8>, ConnectionError> {
        let mut line = self.read_until(b'\n').await?;
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Ok(line)
    }

    /// Read up to and including `delim`, bounded by the line length limit.
    ///
    /// On overflow the rest of the oversized line is skipped before the
    /// next read returns.
    pub async fn read_until(&mut self, delim: u8) -> Result<Vec<u8>, ConnectionError> {
        let limit = self.settings.max_line_length;
        let mut scanned = 0;
        loop {
            if let Some(offset) = self.read_buf[scanned..].iter().position(|&b| b == delim) {
                let end = scanned + offset + 1;
                if std::mem::take(&mut self.discarding) {
                    self.read_buf.drain(..end);
                    scanned = 0;
                    continue;
                }
                let line: Vec<u8> = self.read_buf.drain(..end).collect();
                if line.len() > limit {
                    return Err(ConnectionError::LineTooLong(limit));
                }
                return Ok(line);
            }
            scanned = self.read_buf.len();

            if self.read_buf.len() > limit {
                self.read_buf.clear();
                scanned = 0;
                if !self.discarding {
                    self.discarding = true;
                    return Err(ConnectionError::LineTooLong(limit));
                }
            }

            self.fill().await?;
        }
    }

    /// Capture a message body up to the `.` terminator line.
    ///
    /// The DATA command's own line break counts as the leading CRLF, so an
    /// immediate `.\r\n` yields an empty body. Lines starting with `..` are
    /// unstuffed. If the body exceeds `max_size` it is drained to its
    /// terminator and `EnvelopeTooLarge` is returned; past twice the
    /// maximum the stream is abandoned with `Overrun`.
    pub async fn read_envelope(
        &mut self,
        max_size: usize,
        pool: &Arc<BufferPool>,
    ) -> Result<PooledBuffer, ConnectionError> {
        let mut capture = pool.checkout();
        let mut overflow = false;
        let mut consumed = 0usize;
        let mut mid_line = false;
        let drain_limit = max_size.saturating_mul(2);

        loop {
            let mut start = 0;
            while let Some(offset) = self.read_buf[start..].iter().position(|&b| b == b'\n') {
                let end = start + offset + 1;
                let line = &self.read_buf[start..end];
                let continuation = std::mem::take(&mut mid_line);

                if !continuation && (line == b".\r\n" || line == b".\n") {
                    self.read_buf.drain(..end);
                    return if overflow {
                        Err(ConnectionError::EnvelopeTooLarge(max_size))
                    } else {
                        Ok(capture)
                    };
                }

                let body = if !continuation && line[0] == b'.' {
                    &line[1..]
                } else {
                    line
                };
                consumed += body.len();
                if !overflow && consumed > max_size {
                    overflow = true;
                    capture.clear();
                }
                if !overflow {
                    capture.extend_from_slice(body);
                }
                start = end;
            }
            self.read_buf.drain(..start);

            // A partial line that cannot be the terminator is accounted for
            // early so a peer cannot grow the read buffer without bound.
            let pending = self.read_buf.len();
            if pending > 3 && (overflow || consumed + pending > max_size + 1) {
                let continuation = mid_line;
                let skip = usize::from(!continuation && self.read_buf[0] == b'.');
                consumed += pending - skip;
                if !overflow {
                    overflow = true;
                    capture.clear();
                }
                self.read_buf.clear();
                mid_line = true;
            }

            if overflow && consumed > drain_limit {
                return Err(ConnectionError::Overrun);
            }

            self.fill().await?;
        }
    }

    /// Whether a complete line is already buffered, so the next read will
    /// not block.
    pub fn has_buffered_line(&self) -> bool {
        self.read_buf.contains(&b'\n')
    }

    /// Queue bytes for the next flush.
    pub fn write(&mut self, data: &[u8]) {
        self.write_buf.extend_from_slice(data);
    }

    /// Bytes queued and not yet flushed.
    pub fn pending_output(&self) -> usize {
        self.write_buf.len()
    }

    /// Write out everything queued since the last flush.
    pub async fn flush(&mut self) -> Result<(), ConnectionError> {
        if self.write_buf.is_empty() {
            return Ok(());
        }
        let Self {
            transport,
            write_buf,
            deadline_rx,
            ..
        } = self;
        let transport = transport.as_mut().ok_or(ConnectionError::Closed)?;
        until_deadline(deadline_rx, async {
            transport.write_all(&write_buf[..]).await?;
            transport.flush().await
        })
        .await??;
        write_buf.clear();
        Ok(())
    }

    /// Upgrade the plaintext stream to TLS in place.
    ///
    /// Buffered plaintext is discarded first. If the handshake fails the
    /// plaintext stream is put back and `Handshake` is returned; a timeout
    /// loses the stream and leaves the connection closed.
    pub async fn upgrade(&mut self, acceptor: &TlsAcceptor) -> Result<(), ConnectionError> {
        self.read_buf.clear();
        self.discarding = false;

        let plain = match self.transport.take() {
            Some(Transport::Plain(stream)) => stream,
            Some(tls @ Transport::Tls(_)) => {
                self.transport = Some(tls);
                return Err(ConnectionError::AlreadyEncrypted);
            }
            None => return Err(ConnectionError::Closed),
        };

        let accept = acceptor.accept(plain).into_fallible();
        match until_deadline(&mut self.deadline_rx, accept).await? {
            Ok(tls) => {
                self.transport = Some(Transport::Tls(Box::new(tls)));
                self.set_deadline(self.settings.idle_timeout);
                Ok(())
            }
            Err((e, plain)) => {
                self.transport = Some(Transport::Plain(plain));
                Err(ConnectionError::Handshake(e))
            }
        }
    }

    /// Write out queued replies and release the stream. Idempotent.
    ///
    /// Runs on its own short timer, so a final reply still goes out after
    /// the idle deadline has passed.
    pub async fn close(&mut self) {
        let Some(mut transport) = self.transport.take() else {
            return;
        };
        let pending = std::mem::take(&mut self.write_buf);
        self.read_buf.clear();

        let closing = async {
            if !pending.is_empty() {
                transport.write_all(&pending).await?;
            }
            transport.shutdown().await
        };
        match tokio::time::timeout(CLOSE_TIMEOUT, closing).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::trace!(error = %e, "Error while closing connection"),
            Err(_) => tracing::trace!("Timed out while closing connection"),
        }
    }

    async fn fill(&mut self) -> Result<usize, ConnectionError> {
        let Self {
            transport,
            read_buf,
            deadline,
            deadline_rx,
            settings,
            ..
        } = self;
        let transport = transport.as_mut().ok_or(ConnectionError::Closed)?;
        let mut chunk = [0u8; READ_CHUNK];
        let n = until_deadline(deadline_rx, transport.read(&mut chunk)).await??;
        if n == 0 {
            return Err(ConnectionError::Closed);
        }
        read_buf.extend_from_slice(&chunk[..n]);
        deadline.refresh(settings.idle_timeout);
        Ok(n)
    }
}

/// Drive `fut` until it completes or the watched deadline passes.
async fn until_deadline<F: Future>(
    deadline_rx: &mut watch::Receiver<Instant>,
    fut: F,
) -> Result<F::Output, ConnectionError> {
    tokio::pin!(fut);
    let mut watching = true;
    loop {
        let deadline = *deadline_rx.borrow_and_update();
        tokio::select! {
            out = &mut fut => return Ok(out),
            _ = tokio::time::sleep_until(deadline) => return Err(ConnectionError::Timeout),
            changed = deadline_rx.changed(), if watching => {
                if changed.is_err() {
                    watching = false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, DuplexStream};

    fn settings() -> ConnectionSettings {
        ConnectionSettings {
            max_line_length: 64,
            idle_timeout: Duration::from_secs(5),
        }
    }

    fn pair() -> (Connection<DuplexStream>, DuplexStream) {
        let (server, client) = duplex(64 * 1024);
        (Connection::new(server, settings()), client)
    }

    #[tokio::test]
    async fn reads_crlf_and_bare_lf_lines() {
        let (mut conn, mut client) = pair();
        client.write_all(b"HELO a\r\nNOOP\nQUIT\r\n").await.unwrap();

        assert_eq!(conn.read_line().await.unwrap(), b"HELO a");
        assert_eq!(conn.read_line().await.unwrap(), b"NOOP");
        assert_eq!(conn.read_line().await.unwrap(), b"QUIT");
    }

    #[tokio::test]
    async fn read_until_keeps_delimiter() {
        let (mut conn, mut client) = pair();
        client.write_all(b"abc;def").await.unwrap();
        assert_eq!(conn.read_until(b';').await.unwrap(), b"abc;");
    }

    #[tokio::test]
    async fn oversized_line_resynchronises() {
        let (mut conn, mut client) = pair();
        let long = vec![b'x'; 200];
        client.write_all(&long).await.unwrap();
        client.write_all(b"\r\nNOOP\r\n").await.unwrap();

        assert!(matches!(
            conn.read_line().await,
            Err(ConnectionError::LineTooLong(64))
        ));
        assert_eq!(conn.read_line().await.unwrap(), b"NOOP");
    }

    #[tokio::test]
    async fn eof_is_closed() {
        let (mut conn, client) = pair();
        drop(client);
        assert!(matches!(conn.read_line().await, Err(ConnectionError::Closed)));
    }

    #[tokio::test]
    async fn envelope_stops_at_terminator_and_unstuffs() {
        let (mut conn, mut client) = pair();
        let pool = BufferPool::new(4, 128);
        client
            .write_all(b"Subject: hi\r\n\r\n..leading dot\r\nbody\r\n.\r\nQUIT\r\n")
            .await
            .unwrap();

        let body = conn.read_envelope(1024, &pool).await.unwrap();
        assert_eq!(&body[..], b"Subject: hi\r\n\r\n.leading dot\r\nbody\r\n");
        assert_eq!(conn.read_line().await.unwrap(), b"QUIT");
    }

    #[tokio::test]
    async fn empty_envelope() {
        let (mut conn, mut client) = pair();
        let pool = BufferPool::new(4, 128);
        client.write_all(b".\r\n").await.unwrap();
        assert!(conn.read_envelope(1024, &pool).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn oversized_envelope_is_drained() {
        let (mut conn, mut client) = pair();
        let pool = BufferPool::new(4, 128);
        client.write_all(&[b'a'; 40]).await.unwrap();
        client.write_all(b"\r\n").await.unwrap();
        client.write_all(&[b'b'; 40]).await.unwrap();
        client.write_all(b"\r\n.\r\nNOOP\r\n").await.unwrap();

        assert!(matches!(
            conn.read_envelope(50, &pool).await,
            Err(ConnectionError::EnvelopeTooLarge(50))
        ));
        assert_eq!(conn.read_line().await.unwrap(), b"NOOP");
        assert_eq!(pool.idle(), 1);
    }

    #[tokio::test]
    async fn runaway_envelope_is_abandoned() {
        let (mut conn, mut client) = pair();
        let pool = BufferPool::new(4, 128);
        tokio::spawn(async move {
            let chunk = [b'z'; 1024];
            for _ in 0..16 {
                if client.write_all(&chunk).await.is_err() {
                    break;
                }
            }
        });

        assert!(matches!(
            conn.read_envelope(1000, &pool).await,
            Err(ConnectionError::Overrun)
        ));
    }

    #[tokio::test]
    async fn writes_are_batched_until_flush() {
        let (mut conn, mut client) = pair();
        conn.write(b"250 a\r\n");
        conn.write(b"250 b\r\n");
        assert_eq!(conn.pending_output(), 14);
        conn.flush().await.unwrap();
        assert_eq!(conn.pending_output(), 0);

        let mut buf = [0u8; 14];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"250 a\r\n250 b\r\n");
    }

    #[tokio::test(start_paused = true)]
    async fn idle_read_times_out() {
        let (mut conn, _client) = pair();
        assert!(matches!(conn.read_line().await, Err(ConnectionError::Timeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn tightened_deadline_interrupts_blocked_read() {
        let (mut conn, _client) = pair();
        let handle = conn.deadline_handle();
        let started = Instant::now();

        let reader = tokio::spawn(async move { conn.read_line().await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.tighten(Duration::from_millis(200));

        assert!(matches!(reader.await.unwrap(), Err(ConnectionError::Timeout)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn draining_deadline_is_not_extended() {
        let (mut conn, _client) = pair();
        let handle = conn.deadline_handle();
        handle.tighten(Duration::from_millis(10));
        let tightened = handle.deadline();

        conn.set_deadline(Duration::from_secs(60));
        assert!(handle.is_draining());
        assert_eq!(handle.deadline(), tightened);
    }

    #[tokio::test(start_paused = true)]
    async fn close_flushes_after_deadline_expired() {
        let (mut conn, mut client) = pair();
        assert!(matches!(conn.read_line().await, Err(ConnectionError::Timeout)));

        conn.write(b"421 bye\r\n");
        conn.close().await;

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"421 bye\r\n");
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (mut conn, _client) = pair();
        conn.write(b"221 bye\r\n");
        conn.close().await;
        conn.close().await;
        assert!(conn.is_closed());
        assert!(matches!(conn.read_line().await, Err(ConnectionError::Closed)));
    }
}

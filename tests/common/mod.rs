//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use mx_ingress::config::{ClientAuth, HandshakeFailurePolicy, ServerConfig, TlsConfig};
use mx_ingress::crypto::MailboxSecret;
use mx_ingress::directory::{AccountDirectory, AccountInfo, DirectoryError, MemoryDirectory};
use mx_ingress::net::tls::load_certs;
use mx_ingress::smtp::{Address, SessionPool};
use mx_ingress::{CollectingSink, DrainOutcome, Server, Shutdown};

pub const HOSTNAME: &str = "letter.me";

pub fn fixture(name: &str) -> String {
    format!("{}/tests/fixtures/{}", env!("CARGO_MANIFEST_DIR"), name)
}

/// Base configuration: ephemeral port, small limits.
pub fn config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.smtp.hostname = HOSTNAME.into();
    config.smtp.bind_address = "127.0.0.1:0".into();
    config.smtp.max_recipients = 5;
    config.smtp.max_envelope_size = 4096;
    config.shutdown.grace_secs = 1;
    config
}

pub fn tls_config(client_auth: ClientAuth, policy: HandshakeFailurePolicy) -> TlsConfig {
    TlsConfig {
        cert_path: fixture("server.pem"),
        key_path: fixture("server.key"),
        client_auth,
        client_ca_path: Some(fixture("ca.pem")),
        on_handshake_failure: policy,
    }
}

pub struct Mailbox {
    pub address: String,
    pub secret: MailboxSecret,
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub shutdown: Shutdown,
    pub sink: Arc<CollectingSink>,
    pub directory: Arc<MemoryDirectory>,
    pub mailboxes: Vec<Mailbox>,
    pub pool: Arc<SessionPool>,
    pub handle: JoinHandle<DrainOutcome>,
}

impl TestServer {
    pub fn secret(&self, address: &str) -> &MailboxSecret {
        &self
            .mailboxes
            .iter()
            .find(|m| m.address == address)
            .unwrap()
            .secret
    }

    /// Trigger shutdown and wait for the drain to finish.
    pub async fn stop(self) -> DrainOutcome {
        self.shutdown.trigger();
        self.handle.await.unwrap()
    }
}

/// Directory that answers after a fixed delay.
struct Delayed {
    inner: Arc<MemoryDirectory>,
    delay: Duration,
}

#[async_trait]
impl AccountDirectory for Delayed {
    async fn lookup(&self, address: &Address) -> Result<Option<AccountInfo>, DirectoryError> {
        tokio::time::sleep(self.delay).await;
        self.inner.lookup(address).await
    }
}

/// Start a server with mailboxes `b@letter.me` and `c@letter.me`.
pub async fn start_server(config: ServerConfig) -> TestServer {
    start_server_with_lookup_delay(config, Duration::ZERO).await
}

/// Like [`start_server`], with every directory lookup delayed by `delay`.
pub async fn start_server_with_lookup_delay(config: ServerConfig, delay: Duration) -> TestServer {
    let directory = Arc::new(MemoryDirectory::new());
    let mut mailboxes = Vec::new();
    for address in ["b@letter.me", "c@letter.me"] {
        let secret = MailboxSecret::generate();
        directory.insert(
            &Address::parse(address).unwrap(),
            AccountInfo {
                public_key: secret.public_key(),
                max_message_size: None,
                max_mailbox_size: None,
                current_mailbox_size: None,
                retention: Duration::from_secs(86_400),
            },
        );
        mailboxes.push(Mailbox {
            address: address.into(),
            secret,
        });
    }

    let sink = Arc::new(CollectingSink::new());
    let lookups: Arc<dyn AccountDirectory> = if delay.is_zero() {
        directory.clone()
    } else {
        Arc::new(Delayed {
            inner: directory.clone(),
            delay,
        })
    };
    let server = Server::bind(config, lookups, sink.clone())
        .await
        .unwrap();
    let addr = server.local_addr();
    let pool = Arc::clone(server.pool());

    let shutdown = Shutdown::new();
    let handle = tokio::spawn(server.run(shutdown.subscribe()));

    TestServer {
        addr,
        shutdown,
        sink,
        directory,
        mailboxes,
        pool,
        handle,
    }
}

/// Line-oriented SMTP client over any stream.
pub struct Client<S> {
    stream: BufReader<S>,
}

impl Client<TcpStream> {
    /// Connect without waiting for the greeting.
    pub async fn connect(addr: SocketAddr) -> Self {
        Self {
            stream: BufReader::new(TcpStream::connect(addr).await.unwrap()),
        }
    }

    /// Upgrade after a `220` STARTTLS reply.
    pub async fn into_tls(self, with_client_cert: bool) -> std::io::Result<Client<TlsStream<TcpStream>>> {
        let stream = connector(with_client_cert)
            .connect(ServerName::try_from("localhost").unwrap(), self.stream.into_inner())
            .await?;
        Ok(Client {
            stream: BufReader::new(stream),
        })
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Client<S> {
    /// Read one reply, joining continuation lines. Empty on EOF.
    pub async fn reply(&mut self) -> String {
        let mut text = String::new();
        loop {
            let mut line = String::new();
            match self.stream.read_line(&mut line).await {
                Ok(0) | Err(_) => return text,
                Ok(_) => {}
            }
            let last = line.as_bytes().get(3) != Some(&b'-');
            text.push_str(&line);
            if last {
                return text;
            }
        }
    }

    pub async fn write(&mut self, data: &str) {
        self.stream.get_mut().write_all(data.as_bytes()).await.unwrap();
    }

    /// Send one command line and read its reply.
    pub async fn command(&mut self, line: &str) -> String {
        self.write(&format!("{line}\r\n")).await;
        self.reply().await
    }
}

fn connector(with_client_cert: bool) -> TlsConnector {
    let mut roots = rustls::RootCertStore::empty();
    for cert in load_certs(Path::new(&fixture("ca.pem"))).unwrap() {
        roots.add(cert).unwrap();
    }
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots);
    let config = if with_client_cert {
        let certs = load_certs(Path::new(&fixture("client.pem"))).unwrap();
        let mut reader =
            std::io::BufReader::new(std::fs::File::open(fixture("client.key")).unwrap());
        let key = rustls_pemfile::private_key(&mut reader).unwrap().unwrap();
        builder.with_client_auth_cert(certs, key).unwrap()
    } else {
        builder.with_no_client_auth()
    };
    TlsConnector::from(Arc::new(config))
}

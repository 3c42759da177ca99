//! HTTP account directory client.
//!
//! Request: `POST <url>` with `{"address": "..."}`.
//! Response: `{"exists": bool, "public_key": base64?, "max_message_size"?,
//! "max_mailbox_size"?, "current_mailbox_size"?, "retention_secs"?}`.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::crypto::RecipientKey;
use crate::directory::{AccountDirectory, AccountInfo, DirectoryError};
use crate::smtp::address::Address;

const DEFAULT_RETENTION_SECS: u64 = 30 * 24 * 60 * 60;

#[derive(Debug, Serialize)]
struct LookupRequest<'a> {
    address: &'a str,
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    exists: bool,
    #[serde(default)]
    public_key: Option<String>,
    #[serde(default)]
    max_message_size: Option<u64>,
    #[serde(default)]
    max_mailbox_size: Option<u64>,
    #[serde(default)]
    current_mailbox_size: Option<u64>,
    #[serde(default)]
    retention_secs: Option<u64>,
}

/// Directory reached over HTTP with a JSON body.
#[derive(Debug, Clone)]
pub struct HttpDirectory {
    client: reqwest::Client,
    url: String,
}

impl HttpDirectory {
    /// Create a client for `url` with a per-request timeout.
    pub fn new(url: &str, timeout: Duration) -> Result<Self, DirectoryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DirectoryError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl AccountDirectory for HttpDirectory {
    async fn lookup(&self, address: &Address) -> Result<Option<AccountInfo>, DirectoryError> {
        let address = address.to_string();
        let response = self
            .client
            .post(&self.url)
            .json(&LookupRequest { address: &address })
            .send()
            .await
            .map_err(|e| DirectoryError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DirectoryError::Status(status.as_u16()));
        }

        let body: LookupResponse = response
            .json()
            .await
            .map_err(|e| DirectoryError::InvalidResponse(e.to_string()))?;
        if !body.exists {
            return Ok(None);
        }

        let encoded = body
            .public_key
            .ok_or_else(|| DirectoryError::InvalidResponse("missing public_key".into()))?;
        let public_key = RecipientKey::from_base64(&encoded)
            .map_err(|source| DirectoryError::InvalidKey { address, source })?;

        Ok(Some(AccountInfo {
            public_key,
            max_message_size: body.max_message_size,
            max_mailbox_size: body.max_mailbox_size,
            current_mailbox_size: body.current_mailbox_size,
            retention: Duration::from_secs(body.retention_secs.unwrap_or(DEFAULT_RETENTION_SECS)),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::MailboxSecret;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answer one HTTP request with `status` and `body`; return the request
    /// body that was received.
    async fn mock_directory(
        status: &'static str,
        body: String,
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/accounts/lookup", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(split) = text.find("\r\n\r\n") {
                    let length = text
                        .lines()
                        .find_map(|l| {
                            l.to_ascii_lowercase()
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if request.len() >= split + 4 + length {
                        break;
                    }
                }
            }

            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let text = String::from_utf8_lossy(&request).to_string();
            text.split("\r\n\r\n").nth(1).unwrap_or_default().to_string()
        });

        (url, handle)
    }

    fn address() -> Address {
        Address::parse("<bob@letter.me>").unwrap()
    }

    #[tokio::test]
    async fn existing_account_is_mapped() {
        let key = MailboxSecret::generate().public_key();
        let body = format!(
            r#"{{"exists":true,"public_key":"{}","max_mailbox_size":100,"current_mailbox_size":40,"retention_secs":60}}"#,
            key.to_base64()
        );
        let (url, server) = mock_directory("200 OK", body).await;

        let directory = HttpDirectory::new(&url, Duration::from_secs(2)).unwrap();
        let info = directory.lookup(&address()).await.unwrap().unwrap();

        assert_eq!(info.public_key, key);
        assert_eq!(info.max_mailbox_size, Some(100));
        assert_eq!(info.current_mailbox_size, Some(40));
        assert_eq!(info.max_message_size, None);
        assert_eq!(info.retention, Duration::from_secs(60));

        let sent = server.await.unwrap();
        assert_eq!(sent, r#"{"address":"bob@letter.me"}"#);
    }

    #[tokio::test]
    async fn missing_account_is_none() {
        let (url, _server) = mock_directory("200 OK", r#"{"exists":false}"#.into()).await;
        let directory = HttpDirectory::new(&url, Duration::from_secs(2)).unwrap();
        assert!(directory.lookup(&address()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn error_status_is_reported() {
        let (url, _server) = mock_directory("503 Service Unavailable", "{}".into()).await;
        let directory = HttpDirectory::new(&url, Duration::from_secs(2)).unwrap();
        assert!(matches!(
            directory.lookup(&address()).await,
            Err(DirectoryError::Status(503))
        ));
    }

    #[tokio::test]
    async fn existing_account_without_key_is_invalid() {
        let (url, _server) = mock_directory("200 OK", r#"{"exists":true}"#.into()).await;
        let directory = HttpDirectory::new(&url, Duration::from_secs(2)).unwrap();
        assert!(matches!(
            directory.lookup(&address()).await,
            Err(DirectoryError::InvalidResponse(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_directory_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        drop(listener);

        let directory = HttpDirectory::new(&url, Duration::from_millis(500)).unwrap();
        assert!(matches!(
            directory.lookup(&address()).await,
            Err(DirectoryError::Transport(_))
        ));
    }
}

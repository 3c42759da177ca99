//! Admission control and graceful shutdown.

use std::time::Duration;

use mx_ingress::config::DeliveryMode;
use mx_ingress::DrainOutcome;

mod common;

use common::{config, start_server, start_server_with_lookup_delay, Client};

#[tokio::test]
async fn full_pool_defers_the_next_greeting() {
    let mut cfg = config();
    cfg.smtp.max_sessions = 1;
    let server = start_server(cfg).await;

    let mut first = Client::connect(server.addr).await;
    assert!(first.reply().await.starts_with("220"));

    let mut second = Client::connect(server.addr).await;
    let waiting = tokio::time::timeout(Duration::from_millis(200), second.reply()).await;
    assert!(waiting.is_err(), "second session was admitted while the pool was full");
    assert_eq!(server.pool.active(), 1);

    assert!(first.command("QUIT").await.starts_with("221"));
    assert!(second.reply().await.starts_with("220"));
    assert!(second.command("QUIT").await.starts_with("221"));
}

#[tokio::test]
async fn shutdown_tells_idle_sessions_and_drains() {
    let server = start_server(config()).await;
    let mut client = Client::connect(server.addr).await;
    client.reply().await;
    client.command("HELO mail.local").await;
    assert_eq!(server.pool.active(), 1);

    let pool = server.pool.clone();
    let outcome = server.stop().await;
    assert_eq!(outcome, DrainOutcome::Drained);
    assert_eq!(pool.active(), 0);
    assert_eq!(
        client.reply().await,
        "421 4.3.2 letter.me Service shutting down\r\n"
    );
}

#[tokio::test]
async fn idle_timeout_closes_with_421() {
    let mut cfg = config();
    cfg.smtp.idle_timeout_secs = 1;
    let server = start_server(cfg).await;
    let mut client = Client::connect(server.addr).await;
    client.reply().await;

    let goodbye = tokio::time::timeout(Duration::from_secs(5), client.reply())
        .await
        .unwrap();
    assert_eq!(goodbye, "421 4.4.2 letter.me Idle timeout, closing connection\r\n");
    assert_eq!(client.reply().await, "");
}

async fn send_detached(server: &common::TestServer) {
    let mut client = Client::connect(server.addr).await;
    client.reply().await;
    client.command("HELO mail.local").await;
    client.command("MAIL FROM:<alice@x.com>").await;
    client.command("RCPT TO:<b@letter.me>").await;
    client.command("DATA").await;
    client.write("Subject: late\r\n\r\nbody\r\n.\r\n").await;
    assert_eq!(client.reply().await, "250 2.0.0 Message accepted\r\n");
    assert!(client.command("QUIT").await.starts_with("221"));
}

#[tokio::test]
async fn shutdown_waits_for_detached_deliveries() {
    let mut cfg = config();
    cfg.smtp.delivery_mode = DeliveryMode::Detached;
    let server = start_server_with_lookup_delay(cfg, Duration::from_millis(500)).await;
    send_detached(&server).await;

    let sink = server.sink.clone();
    assert_eq!(server.stop().await, DrainOutcome::Drained);
    assert_eq!(sink.len(), 1);
}

#[tokio::test]
async fn detached_delivery_past_grace_is_reported() {
    let mut cfg = config();
    cfg.smtp.delivery_mode = DeliveryMode::Detached;
    let server = start_server_with_lookup_delay(cfg, Duration::from_secs(5)).await;
    send_detached(&server).await;

    let sink = server.sink.clone();
    assert_eq!(server.stop().await, DrainOutcome::TimedOut { remaining: 1 });
    assert!(sink.is_empty());
}

//! End-to-end SMTP dialogues over TCP.

use mx_ingress::crypto::open;
use mx_ingress::DrainOutcome;

mod common;

use common::{config, start_server, Client};

#[tokio::test]
async fn accepted_message_is_sealed_per_recipient() {
    let server = start_server(config()).await;
    let mut client = Client::connect(server.addr).await;
    assert!(client.reply().await.starts_with("220 letter.me ESMTP ready"));

    let ehlo = client.command("EHLO mail.local").await;
    assert!(ehlo.contains("250-SIZE 4096\r\n"));
    assert!(ehlo.ends_with("250 HELP\r\n"));

    assert!(client.command("MAIL FROM:<alice@x.com>").await.starts_with("250"));
    assert!(client.command("RCPT TO:<b@letter.me>").await.starts_with("250"));
    assert!(client.command("RCPT TO:<c@letter.me>").await.starts_with("250"));
    assert!(client.command("DATA").await.starts_with("354"));
    client
        .write("Subject: Quarterly\r\n\r\nNumbers attached.\r\n..dot line\r\n.\r\n")
        .await;
    assert_eq!(client.reply().await, "250 2.0.0 Message accepted\r\n");
    assert!(client.command("QUIT").await.starts_with("221"));

    let sealed = server.sink.take();
    assert_eq!(sealed.len(), 2);
    for message in &sealed {
        let secret = server.secret(&message.to.to_string());
        assert_eq!(open(secret, &message.from).unwrap(), b"alice@x.com");
        assert_eq!(open(secret, &message.subject).unwrap(), b"Quarterly");
        let body = String::from_utf8(open(secret, &message.body).unwrap()).unwrap();
        assert!(body.contains("Numbers attached."));
        assert!(body.contains("\n.dot line"));
        assert!(message.insecure);
    }
    assert_eq!(sealed[0].envelope_id, sealed[1].envelope_id);

    assert_eq!(server.stop().await, DrainOutcome::Drained);
}

#[tokio::test]
async fn two_transactions_on_one_session() {
    let server = start_server(config()).await;
    let mut client = Client::connect(server.addr).await;
    client.reply().await;
    client.command("HELO mail.local").await;

    for subject in ["first", "second"] {
        client.command("MAIL FROM:<alice@x.com>").await;
        client.command("RCPT TO:<b@letter.me>").await;
        client.command("DATA").await;
        client.write(&format!("Subject: {subject}\r\n\r\nbody\r\n.\r\n")).await;
        assert!(client.reply().await.starts_with("250 2.0.0"));
    }
    client.command("QUIT").await;

    let sealed = server.sink.take();
    assert_eq!(sealed.len(), 2);
    assert_ne!(sealed[0].envelope_id, sealed[1].envelope_id);
}

#[tokio::test]
async fn pipelined_transaction_in_one_write() {
    let server = start_server(config()).await;
    let mut client = Client::connect(server.addr).await;
    client.reply().await;

    client
        .write("EHLO mail.local\r\nMAIL FROM:<alice@x.com>\r\nRCPT TO:<b@letter.me>\r\nRCPT TO:<evil@relay.net>\r\nDATA\r\n")
        .await;
    assert!(client.reply().await.starts_with("250-letter.me"));
    assert!(client.reply().await.starts_with("250 2.1.0"));
    assert!(client.reply().await.starts_with("250 2.1.5"));
    assert!(client.reply().await.starts_with("550 5.7.1 Relay access denied"));
    assert!(client.reply().await.starts_with("354"));

    client.write("hello\r\n.\r\nQUIT\r\n").await;
    assert!(client.reply().await.starts_with("250 2.0.0"));
    assert!(client.reply().await.starts_with("221"));
    assert_eq!(server.sink.len(), 1);
}

#[tokio::test]
async fn oversized_message_never_reaches_the_sink() {
    let server = start_server(config()).await;
    let mut client = Client::connect(server.addr).await;
    client.reply().await;
    client.command("MAIL FROM:<alice@x.com>").await;
    client.command("RCPT TO:<b@letter.me>").await;
    client.command("DATA").await;

    let line = format!("{}\r\n", "z".repeat(98));
    client.write(&line.repeat(50)).await;
    client.write(".\r\n").await;
    assert!(client.reply().await.starts_with("552 5.3.4"));
    assert!(client.command("NOOP").await.starts_with("250"));
    assert!(server.sink.is_empty());
}

#[tokio::test]
async fn bare_ten_byte_body_is_accepted() {
    let server = start_server(config()).await;
    let mut client = Client::connect(server.addr).await;
    client.reply().await;
    client.command("EHLO mail.local").await;
    client.command("MAIL FROM:<a@x.com>").await;
    client.command("RCPT TO:<b@letter.me>").await;
    assert!(client.command("DATA").await.starts_with("354"));
    client.write("0123456789\r\n.\r\n").await;
    assert_eq!(client.reply().await, "250 2.0.0 Message accepted\r\n");

    let sealed = server.sink.take();
    assert_eq!(sealed.len(), 1);
    let secret = server.secret("b@letter.me");
    assert_eq!(open(secret, &sealed[0].body).unwrap(), b"0123456789\r\n");
    assert_eq!(server.stop().await, DrainOutcome::Drained);
}

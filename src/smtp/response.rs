//! Precomputed protocol replies.
//!
//! Every reply the server sends is fixed once the configuration is known,
//! so the wire bytes are formatted once at start-up and shared by all
//! sessions.

/// Identifies one fixed reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reply {
    Greeting,
    Helo,
    /// EHLO capabilities on a plaintext session.
    Ehlo,
    /// EHLO capabilities once TLS is active (no STARTTLS).
    EhloSecured,
    Ok,
    SenderOk,
    RecipientOk,
    StartData,
    Accepted,
    Bye,
    CannotVerify,
    Help,
    ReadyToStartTls,
    TlsUnavailable,
    TlsAlreadyActive,
    NestedMail,
    MailRequired,
    RcptRequired,
    InvalidAddress,
    RelayDenied,
    TooManyRecipients,
    MessageTooLarge,
    MalformedMessage,
    QuotaExceeded,
    ProcessingFailed,
    LineTooLong,
    Unrecognized,
    IdleTimeout,
    ShuttingDown,
}

const ALL: [Reply; 29] = [
    Reply::Greeting,
    Reply::Helo,
    Reply::Ehlo,
    Reply::EhloSecured,
    Reply::Ok,
    Reply::SenderOk,
    Reply::RecipientOk,
    Reply::StartData,
    Reply::Accepted,
    Reply::Bye,
    Reply::CannotVerify,
    Reply::Help,
    Reply::ReadyToStartTls,
    Reply::TlsUnavailable,
    Reply::TlsAlreadyActive,
    Reply::NestedMail,
    Reply::MailRequired,
    Reply::RcptRequired,
    Reply::InvalidAddress,
    Reply::RelayDenied,
    Reply::TooManyRecipients,
    Reply::MessageTooLarge,
    Reply::MalformedMessage,
    Reply::QuotaExceeded,
    Reply::ProcessingFailed,
    Reply::LineTooLong,
    Reply::Unrecognized,
    Reply::IdleTimeout,
    Reply::ShuttingDown,
];

impl Reply {
    /// Three-digit reply code.
    pub fn code(self) -> u16 {
        match self {
            Reply::Greeting | Reply::ReadyToStartTls => 220,
            Reply::Bye => 221,
            Reply::Help => 214,
            Reply::CannotVerify => 252,
            Reply::StartData => 354,
            Reply::IdleTimeout | Reply::ShuttingDown => 421,
            Reply::ProcessingFailed => 451,
            Reply::TooManyRecipients => 452,
            Reply::TlsUnavailable => 454,
            Reply::LineTooLong | Reply::Unrecognized => 500,
            Reply::InvalidAddress => 501,
            Reply::NestedMail
            | Reply::MailRequired
            | Reply::RcptRequired
            | Reply::TlsAlreadyActive => 503,
            Reply::RelayDenied | Reply::MalformedMessage => 550,
            Reply::MessageTooLarge | Reply::QuotaExceeded => 552,
            Reply::Helo
            | Reply::Ehlo
            | Reply::EhloSecured
            | Reply::Ok
            | Reply::SenderOk
            | Reply::RecipientOk
            | Reply::Accepted => 250,
        }
    }

    /// 4xx: the peer may retry later.
    pub fn is_transient(self) -> bool {
        (400..500).contains(&self.code())
    }

    /// 5xx: the peer must not retry as-is.
    pub fn is_permanent(self) -> bool {
        self.code() >= 500
    }

    /// Metrics label for rejections.
    pub fn reason(self) -> &'static str {
        match self {
            Reply::TlsUnavailable => "tls_unavailable",
            Reply::TlsAlreadyActive => "tls_already_active",
            Reply::NestedMail => "nested_mail",
            Reply::MailRequired => "mail_required",
            Reply::RcptRequired => "rcpt_required",
            Reply::InvalidAddress => "invalid_address",
            Reply::RelayDenied => "relay_denied",
            Reply::TooManyRecipients => "too_many_recipients",
            Reply::MessageTooLarge => "message_too_large",
            Reply::MalformedMessage => "malformed_message",
            Reply::QuotaExceeded => "quota_exceeded",
            Reply::ProcessingFailed => "processing_failed",
            Reply::LineTooLong => "line_too_long",
            Reply::Unrecognized => "unrecognized",
            Reply::IdleTimeout => "idle_timeout",
            Reply::ShuttingDown => "shutting_down",
            _ => "none",
        }
    }
}

/// Wire bytes for every [`Reply`], formatted once.
#[derive(Debug, Clone)]
pub struct ResponseCache {
    lines: Vec<Vec<u8>>,
}

impl ResponseCache {
    /// Format every reply for this server.
    pub fn new(hostname: &str, max_envelope_size: usize, tls_available: bool) -> Self {
        let lines = ALL
            .iter()
            .map(|reply| render(*reply, hostname, max_envelope_size, tls_available).into_bytes())
            .collect();
        Self { lines }
    }

    /// The CRLF-terminated bytes for `reply`.
    pub fn get(&self, reply: Reply) -> &[u8] {
        &self.lines[reply as usize]
    }
}

fn render(reply: Reply, host: &str, max_size: usize, tls_available: bool) -> String {
    match reply {
        Reply::Greeting => format!("220 {host} ESMTP ready\r\n"),
        Reply::Helo => format!("250 {host} Hello\r\n"),
        Reply::Ehlo => ehlo(host, max_size, tls_available),
        Reply::EhloSecured => ehlo(host, max_size, false),
        Reply::Ok => "250 2.0.0 OK\r\n".into(),
        Reply::SenderOk => "250 2.1.0 Sender OK\r\n".into(),
        Reply::RecipientOk => "250 2.1.5 Recipient OK\r\n".into(),
        Reply::StartData => "354 End data with <CR><LF>.<CR><LF>\r\n".into(),
        Reply::Accepted => "250 2.0.0 Message accepted\r\n".into(),
        Reply::Bye => "221 2.0.0 Bye\r\n".into(),
        Reply::CannotVerify => "252 2.1.5 Cannot VRFY user, but will accept message\r\n".into(),
        Reply::Help => {
            "214 2.0.0 Commands: HELO EHLO MAIL RCPT DATA RSET NOOP VRFY HELP STARTTLS QUIT\r\n"
                .into()
        }
        Reply::ReadyToStartTls => "220 2.0.0 Ready to start TLS\r\n".into(),
        Reply::TlsUnavailable => "454 4.7.0 TLS not available\r\n".into(),
        Reply::TlsAlreadyActive => "503 5.5.1 TLS already active\r\n".into(),
        Reply::NestedMail => "503 5.5.1 Nested MAIL command\r\n".into(),
        Reply::MailRequired => "503 5.5.1 MAIL is required first\r\n".into(),
        Reply::RcptRequired => "503 5.5.1 RCPT is required first\r\n".into(),
        Reply::InvalidAddress => "501 5.1.3 Invalid address\r\n".into(),
        Reply::RelayDenied => "550 5.7.1 Relay access denied\r\n".into(),
        Reply::TooManyRecipients => "452 4.5.3 Too many recipients\r\n".into(),
        Reply::MessageTooLarge => "552 5.3.4 Message size exceeds fixed maximum\r\n".into(),
        Reply::MalformedMessage => "550 5.6.0 Malformed message\r\n".into(),
        Reply::QuotaExceeded => "552 5.2.2 Mailbox quota exceeded\r\n".into(),
        Reply::ProcessingFailed => "451 4.3.0 Message processing failed\r\n".into(),
        Reply::LineTooLong => "500 5.5.2 Line too long\r\n".into(),
        Reply::Unrecognized => "500 5.5.2 Command not recognized\r\n".into(),
        Reply::IdleTimeout => format!("421 4.4.2 {host} Idle timeout, closing connection\r\n"),
        Reply::ShuttingDown => format!("421 4.3.2 {host} Service shutting down\r\n"),
    }
}

fn ehlo(host: &str, max_size: usize, starttls: bool) -> String {
    let mut lines = vec![
        format!("{host} Hello"),
        format!("SIZE {max_size}"),
        "PIPELINING".to_string(),
    ];
    if starttls {
        lines.push("STARTTLS".to_string());
    }
    lines.push("ENHANCEDSTATUSCODES".to_string());
    lines.push("HELP".to_string());

    let last = lines.len() - 1;
    lines
        .iter()
        .enumerate()
        .map(|(i, line)| {
            let sep = if i == last { ' ' } else { '-' };
            format!("250{sep}{line}\r\n")
        })
        .collect()
}

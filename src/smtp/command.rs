//! Command line recognition.
//!
//! Matching is a case-insensitive prefix match against the raw line, so
//! `mail from:<a@b>` and `MAIL FROM:<a@b>` are the same command.

/// A recognised client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Helo(String),
    Ehlo(String),
    /// `MAIL FROM:<path> [SIZE=n]`
    MailFrom { path: String, size: Option<u64> },
    RcptTo(String),
    Data,
    Rset,
    Noop,
    Vrfy,
    Help,
    StartTls,
    Quit,
    Unknown,
}

const PREFIXES: &[(&str, Kind)] = &[
    ("HELO", Kind::Helo),
    ("EHLO", Kind::Ehlo),
    ("MAIL FROM:", Kind::Mail),
    ("RCPT TO:", Kind::Rcpt),
    ("DATA", Kind::Data),
    ("RSET", Kind::Rset),
    ("NOOP", Kind::Noop),
    ("VRFY", Kind::Vrfy),
    ("HELP", Kind::Help),
    ("STARTTLS", Kind::StartTls),
    ("QUIT", Kind::Quit),
];

#[derive(Clone, Copy)]
enum Kind {
    Helo,
    Ehlo,
    Mail,
    Rcpt,
    Data,
    Rset,
    Noop,
    Vrfy,
    Help,
    StartTls,
    Quit,
}

impl Command {
    /// Recognise a command line (without its line terminator).
    pub fn parse(line: &[u8]) -> Command {
        let text = String::from_utf8_lossy(line);
        let text = text.trim_start();

        let Some((rest, kind)) = PREFIXES.iter().find_map(|(prefix, kind)| {
            let head = text.get(..prefix.len())?;
            head.eq_ignore_ascii_case(prefix)
                .then(|| (&text[prefix.len()..], *kind))
        }) else {
            return Command::Unknown;
        };

        match kind {
            Kind::Helo => Command::Helo(rest.trim().to_string()),
            Kind::Ehlo => Command::Ehlo(rest.trim().to_string()),
            Kind::Mail => {
                let (path, params) = split_path(rest);
                Command::MailFrom {
                    path: path.to_string(),
                    size: size_param(params),
                }
            }
            Kind::Rcpt => Command::RcptTo(split_path(rest).0.to_string()),
            Kind::Data => Command::Data,
            Kind::Rset => Command::Rset,
            Kind::Noop => Command::Noop,
            Kind::Vrfy => Command::Vrfy,
            Kind::Help => Command::Help,
            Kind::StartTls => Command::StartTls,
            Kind::Quit => Command::Quit,
        }
    }

    /// Stable label for metrics and logs.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Helo(_) => "HELO",
            Command::Ehlo(_) => "EHLO",
            Command::MailFrom { .. } => "MAIL",
            Command::RcptTo(_) => "RCPT",
            Command::Data => "DATA",
            Command::Rset => "RSET",
            Command::Noop => "NOOP",
            Command::Vrfy => "VRFY",
            Command::Help => "HELP",
            Command::StartTls => "STARTTLS",
            Command::Quit => "QUIT",
            Command::Unknown => "UNKNOWN",
        }
    }
}

/// Split `  <path> PARAM=x` into the path and the trailing parameters.
fn split_path(rest: &str) -> (&str, &str) {
    let rest = rest.trim();
    let end = if rest.starts_with('<') {
        rest.find('>').map(|i| i + 1).unwrap_or(rest.len())
    } else {
        rest.find(char::is_whitespace).unwrap_or(rest.len())
    };
    (&rest[..end], rest[end..].trim())
}

fn size_param(params: &str) -> Option<u64> {
    params.split_whitespace().find_map(|param| {
        let (key, value) = param.split_once('=')?;
        key.eq_ignore_ascii_case("SIZE")
            .then(|| value.parse().ok())
            .flatten()
    })
}

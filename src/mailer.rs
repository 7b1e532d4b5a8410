// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

//! Alert delivery.
//!
//! Speaks just enough SMTP to hand one plain-text message to a relay:
//! `HELO`, `MAIL FROM`, `RCPT TO`, `DATA`, `QUIT`. No authentication or TLS;
//! the relay is expected to be local or on a trusted network.

use std::io::{self, BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use log::{debug, warn};

use crate::error::SentinelError;

/// Default connect and per-reply timeout.
const SMTP_TIMEOUT: Duration = Duration::from_secs(30);

/// A plain-text alert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertMessage {
    pub to: String,
    pub from: String,
    pub subject: String,
    pub body: String,
}

/// Notification transport.
pub trait Mailer: Send + Sync {
    /// Deliver a message through the given relay (`host` or `host:port`).
    fn send(&self, message: &AlertMessage, relay: &str) -> Result<(), SentinelError>;
}

/// Minimal blocking SMTP client.
pub struct SmtpMailer {
    default_port: u16,
    timeout: Duration,
    helo_name: String,
}

impl SmtpMailer {
    #[must_use]
    pub fn new(default_port: u16, helo_name: impl Into<String>) -> Self {
        Self {
            default_port,
            timeout: SMTP_TIMEOUT,
            helo_name: helo_name.into(),
        }
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Split `host[:port]`, falling back to the default port.
    fn resolve_relay<'a>(&self, relay: &'a str) -> (&'a str, u16) {
        relay
            .rsplit_once(':')
            .and_then(|(host, port)| port.parse().ok().map(|p| (host, p)))
            .unwrap_or((relay, self.default_port))
    }

    fn connect(&self, relay: &str) -> io::Result<TcpStream> {
        let (host, port) = self.resolve_relay(relay);
        let mut last_err = None;

        for addr in (host, port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(self.timeout))?;
                    stream.set_write_timeout(Some(self.timeout))?;
                    return Ok(stream);
                }
                Err(e) => {
                    debug!("SMTP connect to {addr} failed: {e}");
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no address for {host}"))
        }))
    }

    fn transact(&self, message: &AlertMessage, relay: &str) -> Result<(), String> {
        check_address(&message.from).map_err(|e| format!("sender: {e}"))?;
        check_address(&message.to).map_err(|e| format!("recipient: {e}"))?;

        let stream = self
            .connect(relay)
            .map_err(|e| format!("connect to {relay} failed: {e}"))?;
        let mut session = SmtpSession::new(stream).map_err(|e| e.to_string())?;

        session.expect_reply(&[220], "greeting")?;
        session.command(&format!("HELO {}", self.helo_name), &[250], "HELO")?;
        session.command(&format!("MAIL FROM:<{}>", message.from), &[250], "MAIL FROM")?;
        session.command(&format!("RCPT TO:<{}>", message.to), &[250, 251], "RCPT TO")?;
        session.command("DATA", &[354], "DATA")?;

        let date = chrono::Local::now().to_rfc2822();
        session.write_raw(&format_message(message, &date))?;
        session.expect_reply(&[250], "message body")?;

        if let Err(e) = session.command("QUIT", &[221], "QUIT") {
            // Message is already accepted at this point
            warn!("SMTP {e}");
        }
        Ok(())
    }
}

impl Mailer for SmtpMailer {
    fn send(&self, message: &AlertMessage, relay: &str) -> Result<(), SentinelError> {
        debug!("Sending alert '{}' to {} via {relay}", message.subject, message.to);
        self.transact(message, relay)
            .map_err(SentinelError::SendFailed)
    }
}

/// One SMTP conversation.
struct SmtpSession {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl SmtpSession {
    fn new(stream: TcpStream) -> io::Result<Self> {
        let writer = stream.try_clone()?;
        Ok(Self {
            reader: BufReader::new(stream),
            writer,
        })
    }

    /// Read a possibly multi-line reply (`250-...` continuations).
    fn read_reply(&mut self) -> io::Result<(u16, String)> {
        let mut text = String::new();
        loop {
            let mut line = String::new();
            if self.reader.read_line(&mut line)? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed by relay",
                ));
            }
            let line = line.trim_end();
            let code = line
                .get(..3)
                .and_then(|c| c.parse::<u16>().ok())
                .ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidData, format!("bad reply: {line}"))
                })?;
            text.push_str(line.get(4..).unwrap_or_default());
            if line.as_bytes().get(3) != Some(&b'-') {
                return Ok((code, text));
            }
            text.push('\n');
        }
    }

    fn expect_reply(&mut self, accepted: &[u16], step: &str) -> Result<(), String> {
        let (code, text) = self
            .read_reply()
            .map_err(|e| format!("{step}: {e}"))?;
        if accepted.contains(&code) {
            Ok(())
        } else {
            Err(format!("{step} rejected: {code} {text}"))
        }
    }

    fn command(&mut self, line: &str, accepted: &[u16], step: &str) -> Result<(), String> {
        self.write_raw(&format!("{line}\r\n"))?;
        self.expect_reply(accepted, step)
    }

    fn write_raw(&mut self, data: &str) -> Result<(), String> {
        self.writer
            .write_all(data.as_bytes())
            .and_then(|()| self.writer.flush())
            .map_err(|e| format!("write failed: {e}"))
    }
}

/// Reject addresses that would break out of an SMTP command or header line.
///
/// # Errors
/// Returns the reason the address is unusable.
pub fn check_address(address: &str) -> Result<(), String> {
    if address.trim().is_empty() {
        return Err("invalid address: empty".to_string());
    }
    if address.chars().any(|c| c.is_control() || matches!(c, '<' | '>' | ' ')) {
        return Err(format!("invalid address: {}", address.escape_debug()));
    }
    Ok(())
}

/// Render headers and body for the DATA phase, including the terminating dot.
///
/// Line endings are normalized to CRLF and lines starting with `.` are
/// dot-stuffed.
fn format_message(message: &AlertMessage, date: &str) -> String {
    let mut out = format!(
        "From: <{}>\r\nTo: <{}>\r\nSubject: {}\r\nDate: {date}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\r\n",
        message.from,
        message.to,
        message.subject.replace(['\r', '\n'], " ")
    );
    for line in message.body.lines() {
        if line.starts_with('.') {
            out.push('.');
        }
        out.push_str(line);
        out.push_str("\r\n");
    }
    out.push_str(".\r\n");
    out
}

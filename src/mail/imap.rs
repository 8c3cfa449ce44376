//! Raw IMAP over TLS.
//!
//! Blocking I/O; `ImapMailSource` runs every session on `spawn_blocking`.
//! UIDs are used throughout so an item's id stays stable across sessions.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use tracing::{debug, info, warn};

use crate::error::MailError;
use crate::mail::{MailConfig, parse_message};
use crate::pipeline::types::{MailSource, RawItem};

const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Polls one IMAP mailbox for unseen messages.
pub struct ImapMailSource {
    config: MailConfig,
}

impl ImapMailSource {
    pub fn new(config: MailConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MailSource for ImapMailSource {
    fn name(&self) -> &str {
        "imap"
    }

    async fn fetch_new_items(&self) -> Result<Vec<RawItem>, MailError> {
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || {
            let mut session = connect(&config)?;
            collect_unseen(&mut session, &config)
        })
        .await
        .map_err(|e| MailError::Protocol(format!("IMAP task failed: {e}")))?
    }
}

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

fn connect(config: &MailConfig) -> Result<ImapSession<TlsStream>, MailError> {
    let connectivity = |reason: String| MailError::Connectivity {
        host: config.imap_host.clone(),
        reason,
    };

    let tcp = TcpStream::connect((config.imap_host.as_str(), config.imap_port))
        .map_err(|e| connectivity(e.to_string()))?;
    tcp.set_read_timeout(Some(READ_TIMEOUT))
        .map_err(|e| connectivity(e.to_string()))?;

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    );
    let server_name = rustls::pki_types::ServerName::try_from(config.imap_host.clone())
        .map_err(|e| connectivity(format!("invalid server name: {e}")))?;
    let conn = rustls::ClientConnection::new(tls_config, server_name)
        .map_err(|e| connectivity(format!("TLS setup failed: {e}")))?;

    let mut session = ImapSession::new(rustls::StreamOwned::new(conn, tcp), &config.imap_host);
    session.greeting()?;
    Ok(session)
}

/// Log in, drain unseen messages and log out.
///
/// Every fetched UID is flagged `\Seen` before its item is returned, so a
/// later session never yields it again. Unparseable messages are flagged
/// too and dropped. A UID whose flag update fails is left out of this batch
/// and comes back on the next run. A fetch failure after some items were
/// collected ends the batch early with those items instead of an error.
fn collect_unseen<S: Read + Write>(
    session: &mut ImapSession<S>,
    config: &MailConfig,
) -> Result<Vec<RawItem>, MailError> {
    session.login(&config.username, config.password.expose_secret())?;
    session.select(&config.mailbox)?;

    let uids = session.search_unseen()?;
    debug!(mailbox = %config.mailbox, count = uids.len(), "Unseen messages");

    let mut items = Vec::new();
    for uid in uids {
        let raw = match session.fetch_rfc822(uid) {
            Ok(raw) => raw,
            // Items gathered so far are already flagged seen on the server.
            Err(e) if !items.is_empty() => {
                warn!(
                    uid,
                    error = %e,
                    delivered = items.len(),
                    "Fetch failed mid-batch, returning what was collected"
                );
                return Ok(items);
            }
            Err(e) => return Err(e),
        };
        let parsed = raw.as_deref().and_then(parse_message);

        if let Err(e) = session.mark_seen(uid) {
            warn!(uid, error = %e, "Failed to mark message seen, leaving it for the next run");
            continue;
        }

        let Some(mail) = parsed else {
            warn!(uid, "Unparseable message skipped");
            continue;
        };

        if config.is_own_address(&mail.sender) {
            debug!(uid, "Skipping self-sent message");
            continue;
        }
        if !config.is_sender_allowed(&mail.sender) {
            info!(uid, sender = %mail.sender, "Sender not in allowlist, skipping");
            continue;
        }

        let mut item = RawItem::new(uid.to_string(), mail.sender, mail.subject, mail.body);
        item.sent_at = mail.sent_at;
        items.push(item);
    }

    if let Err(e) = session.logout() {
        debug!(error = %e, "IMAP logout failed");
    }
    Ok(items)
}

// ── Session ─────────────────────────────────────────────────────────

/// Everything the server sent for one tagged command.
#[derive(Debug, Default)]
struct Response {
    untagged: Vec<String>,
    literals: Vec<Vec<u8>>,
    status: String,
}

struct ImapSession<S> {
    stream: S,
    host: String,
    next_tag: u32,
}

impl<S: Read + Write> ImapSession<S> {
    fn new(stream: S, host: &str) -> Self {
        Self {
            stream,
            host: host.to_string(),
            next_tag: 1,
        }
    }

    fn io_error(&self, e: std::io::Error) -> MailError {
        MailError::Connectivity {
            host: self.host.clone(),
            reason: e.to_string(),
        }
    }

    fn read_line(&mut self) -> Result<String, MailError> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match self.stream.read(&mut byte) {
                Ok(0) => {
                    return Err(MailError::Connectivity {
                        host: self.host.clone(),
                        reason: "IMAP connection closed".into(),
                    });
                }
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(String::from_utf8_lossy(&buf).into_owned());
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(self.io_error(e)),
            }
        }
    }

    fn greeting(&mut self) -> Result<(), MailError> {
        let line = self.read_line()?;
        if line.starts_with("* OK") || line.starts_with("* PREAUTH") {
            Ok(())
        } else {
            Err(MailError::Protocol(format!("unexpected greeting: {}", line.trim_end())))
        }
    }

    /// Send one command and read until its tagged completion line.
    fn command(&mut self, cmd: &str) -> Result<Response, MailError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;

        let full = format!("{tag} {cmd}\r\n");
        self.stream
            .write_all(full.as_bytes())
            .and_then(|()| self.stream.flush())
            .map_err(|e| self.io_error(e))?;

        let prefix = format!("{tag} ");
        let mut response = Response::default();
        loop {
            let line = self.read_line()?;
            if line.starts_with(&prefix) {
                response.status = line[prefix.len()..].trim_end().to_string();
                return Ok(response);
            }
            if let Some(len) = literal_len(&line) {
                let mut literal = vec![0u8; len];
                self.stream
                    .read_exact(&mut literal)
                    .map_err(|e| self.io_error(e))?;
                response.literals.push(literal);
            }
            response.untagged.push(line);
        }
    }

    /// Like `command`, but a non-OK completion is a protocol error.
    fn command_ok(&mut self, cmd: &str, what: &str) -> Result<Response, MailError> {
        let response = self.command(cmd)?;
        if is_ok(&response.status) {
            Ok(response)
        } else {
            Err(MailError::Protocol(format!("{what} failed: {}", response.status)))
        }
    }

    fn login(&mut self, user: &str, password: &str) -> Result<(), MailError> {
        let response = self.command(&format!("LOGIN {} {}", quote(user), quote(password)))?;
        if is_ok(&response.status) {
            Ok(())
        } else {
            Err(MailError::Auth {
                user: user.to_string(),
            })
        }
    }

    fn select(&mut self, mailbox: &str) -> Result<(), MailError> {
        self.command_ok(&format!("SELECT {}", quote(mailbox)), "SELECT")
            .map(|_| ())
    }

    fn search_unseen(&mut self) -> Result<Vec<u32>, MailError> {
        let response = self.command_ok("UID SEARCH UNSEEN", "SEARCH")?;
        let mut uids = Vec::new();
        for line in &response.untagged {
            if let Some(rest) = line.strip_prefix("* SEARCH") {
                for token in rest.split_whitespace() {
                    let uid = token.parse().map_err(|_| {
                        MailError::Protocol(format!("bad UID in SEARCH response: {token}"))
                    })?;
                    uids.push(uid);
                }
            }
        }
        Ok(uids)
    }

    /// Fetch the full message. `None` when the server returned no body
    /// (e.g. the message was expunged in between).
    fn fetch_rfc822(&mut self, uid: u32) -> Result<Option<Vec<u8>>, MailError> {
        let response = self.command_ok(&format!("UID FETCH {uid} RFC822"), "FETCH")?;
        Ok(response.literals.into_iter().next())
    }

    fn mark_seen(&mut self, uid: u32) -> Result<(), MailError> {
        self.command_ok(&format!("UID STORE {uid} +FLAGS (\\Seen)"), "STORE")
            .map(|_| ())
    }

    fn logout(&mut self) -> Result<(), MailError> {
        self.command("LOGOUT").map(|_| ())
    }
}

fn is_ok(status: &str) -> bool {
    status.split_whitespace().next() == Some("OK")
}

/// Size of a `{N}` literal announced at the end of a line.
fn literal_len(line: &str) -> Option<usize> {
    let line = line.trim_end();
    let inner = line.strip_suffix('}')?;
    let start = inner.rfind('{')?;
    inner[start + 1..].parse().ok()
}

/// IMAP quoted string.
fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

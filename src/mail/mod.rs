//! Inbound mail: IMAP polling and MIME reduction to `RawItem`s.

mod imap;

pub use imap::ImapMailSource;

use mail_parser::MimeHeaders;
use secrecy::SecretString;

use crate::config::{parse_or, required};
use crate::error::ConfigError;
use crate::pipeline::types::UNKNOWN_SENDER;

// ── Configuration ───────────────────────────────────────────────────

/// Mailbox connection settings.
#[derive(Debug, Clone)]
pub struct MailConfig {
    pub imap_host: String,
    pub imap_port: u16,
    pub username: String,
    pub password: SecretString,
    pub mailbox: String,
    /// Empty means every sender is accepted.
    pub allowed_senders: Vec<String>,
}

impl MailConfig {
    /// Build mail config from a key lookup (see `PipelineConfig::from_lookup`).
    pub fn from_lookup<F>(lookup: &F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let imap_host = required(lookup, "EMAIL_IMAP_HOST")?;
        let imap_port: u16 = parse_or(lookup, "EMAIL_IMAP_PORT", 993)?;
        let username = required(lookup, "EMAIL_USERNAME")?;
        let password = SecretString::from(required(lookup, "EMAIL_PASSWORD")?);
        let mailbox = lookup("EMAIL_MAILBOX")
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| "INBOX".to_string());

        let allowed_senders = lookup("EMAIL_ALLOWED_SENDERS")
            .map(|s| {
                s.split(',')
                    .map(|a| a.trim().to_string())
                    .filter(|a| !a.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            imap_host,
            imap_port,
            username,
            password,
            mailbox,
            allowed_senders,
        })
    }

    pub fn is_sender_allowed(&self, email: &str) -> bool {
        is_sender_allowed(&self.allowed_senders, email)
    }

    /// Mail we sent ourselves (replies, forwards) is never a lead.
    pub fn is_own_address(&self, email: &str) -> bool {
        self.username.eq_ignore_ascii_case(email)
    }
}

// ── Helpers (public for testing) ────────────────────────────────────

/// Check if a sender email passes the allowlist.
///
/// An empty list or `*` admits everyone. Entries may be a full address,
/// `@domain` or a bare `domain`.
pub fn is_sender_allowed(allowed: &[String], email: &str) -> bool {
    if allowed.is_empty() || allowed.iter().any(|a| a == "*") {
        return true;
    }
    let email_lower = email.to_lowercase();
    allowed.iter().any(|a| {
        if a.starts_with('@') {
            email_lower.ends_with(&a.to_lowercase())
        } else if a.contains('@') {
            a.eq_ignore_ascii_case(email)
        } else {
            email_lower.ends_with(&format!("@{}", a.to_lowercase()))
        }
    })
}

/// Strip HTML tags and collapse whitespace.
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => {
                in_tag = true;
                result.push(' ');
            }
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Fields pulled out of one RFC 822 message.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedMail {
    pub sender: String,
    pub subject: String,
    /// Plain text; empty when the message has no readable part.
    pub body: String,
    pub sent_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Parse a raw message. Returns `None` when the bytes are not a message.
pub fn parse_message(raw: &[u8]) -> Option<ParsedMail> {
    let parsed = mail_parser::MessageParser::default().parse(raw)?;

    let sender = parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
        .unwrap_or_else(|| UNKNOWN_SENDER.into());

    let subject = parsed
        .subject()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("(no subject)")
        .to_string();

    let sent_at = parsed
        .date()
        .and_then(|d| chrono::DateTime::from_timestamp(d.to_timestamp(), 0));

    Some(ParsedMail {
        sender,
        subject,
        body: extract_text(&parsed),
        sent_at,
    })
}

/// Readable text: the text part, else the stripped HTML part, else the
/// first textual attachment.
fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0)
        && !text.trim().is_empty()
    {
        return text.trim().to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        let text = strip_html(html.as_ref());
        if !text.is_empty() {
            return text;
        }
    }
    for part in parsed.attachments() {
        let part: &mail_parser::MessagePart = part;
        if let Some(ct) = MimeHeaders::content_type(part)
            && ct.ctype() == "text"
            && let Ok(text) = std::str::from_utf8(part.contents())
        {
            let name = MimeHeaders::attachment_name(part).unwrap_or("file");
            return format!("[Attachment: {name}]\n{text}");
        }
    }
    String::new()
}

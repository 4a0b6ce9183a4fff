//! Common structures and utilities for mailbox messages
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use log::warn;
use regex::Regex;

/// One mailbox entry as seen by the pipeline. Owned by the mail server,
/// never mutated here.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Mailbox-assigned identifier, `"<uidvalidity>:<uid>"` for IMAP.
    pub id: String,
    /// Display form of the sender, `Name <addr>` or the bare address.
    pub sender: String,
    /// Bare sender address, empty when the message has no usable From.
    pub sender_address: String,
    pub subject: String,
    pub body: String,
    pub received: DateTime<Utc>,
}

impl Message {
    /// Build a message from raw RFC 822 bytes.
    ///
    /// Unparseable input still yields a message (empty subject and body) so
    /// that the caller can record an attempt for it.
    pub fn from_rfc822(id: impl Into<String>, raw: &[u8], received: Option<DateTime<Utc>>) -> Self {
        let id = id.into();
        let Some(parsed) = mail_parser::MessageParser::default().parse(raw) else {
            warn!("Unable to parse message {}, keeping it with an empty body", id);
            return Message {
                id,
                sender: String::new(),
                sender_address: String::new(),
                subject: String::new(),
                body: String::new(),
                received: received.unwrap_or_else(Utc::now),
            };
        };

        let (sender, sender_address) = parsed
            .from()
            .and_then(|addrs| addrs.first())
            .map(|addr| {
                let address = addr.address.as_deref().unwrap_or_default().to_string();
                let display = match &addr.name {
                    Some(name) if !address.is_empty() => format!("{} <{}>", name, address),
                    Some(name) => name.to_string(),
                    None => address.clone(),
                };
                (display, address)
            })
            .unwrap_or_default();

        let received = received
            .or_else(|| {
                parsed
                    .date()
                    .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
            })
            .unwrap_or_else(Utc::now);

        Message {
            id,
            sender,
            sender_address,
            subject: parsed.subject().unwrap_or_default().to_string(),
            body: body_text(&parsed),
            received,
        }
    }
}

/// text/plain first, then text/html with the markup stripped.
fn body_text(parsed: &mail_parser::Message<'_>) -> String {
    // body_text() would convert an HTML-only body itself and drop the hrefs.
    let plain = parsed.text_part(0).and_then(|part| match &part.body {
        mail_parser::PartType::Text(text) => Some(text.as_ref()),
        _ => None,
    });
    if let Some(text) = plain {
        if !text.trim().is_empty() {
            return text.to_string();
        }
    }

    if let Some(html) = parsed.body_html(0) {
        return strip_html(&html);
    }

    String::new()
}

static LINE_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<br\s*/?>|</p>").expect("line break regex"));
// Keep href values: they are usually the target we are after.
static ANCHOR_HREF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<a\s[^>]*href\s*=\s*["']([^"']+)["'][^>]*>"#).expect("anchor regex")
});
static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").expect("tag regex"));

pub fn strip_html(html: &str) -> String {
    let with_breaks = LINE_BREAK.replace_all(html, "\n");
    let with_links = ANCHOR_HREF.replace_all(&with_breaks, " $1 ");
    decode_entities(&TAG.replace_all(&with_links, ""))
}

/// Entities that show up inside hrefs and link text. `&amp;` goes last so
/// `&amp;quot;` stays literal.
fn decode_entities(text: &str) -> String {
    text.replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&nbsp;", " ")
        .replace("&#38;", "&")
        .replace("&#x26;", "&")
        .replace("&amp;", "&")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderMatch {
    /// Case-insensitive equality with the bare address.
    Exact,
    /// Case-insensitive substring of the display sender.
    Substring,
}

/// Which messages of the mailbox are candidates for processing.
#[derive(Debug, Clone)]
pub struct MailFilter {
    pub sender: String,
    pub sender_match: SenderMatch,
    /// Must match the subject or the body when present.
    pub include: Option<Regex>,
}

impl MailFilter {
    pub fn matches(&self, message: &Message) -> bool {
        let wanted = self.sender.to_lowercase();
        let sender_ok = match self.sender_match {
            SenderMatch::Exact => message.sender_address.to_lowercase() == wanted,
            SenderMatch::Substring => message.sender.to_lowercase().contains(&wanted),
        };
        if !sender_ok {
            return false;
        }

        match &self.include {
            Some(re) => re.is_match(&message.subject) || re.is_match(&message.body),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(sender: &str, address: &str, subject: &str, body: &str) -> Message {
        Message {
            id: "1:1".into(),
            sender: sender.into(),
            sender_address: address.into(),
            subject: subject.into(),
            body: body.into(),
            received: Utc::now(),
        }
    }

    #[test]
    fn test_sender_substring_is_case_insensitive() {
        let filter = MailFilter {
            sender: "Example.com".into(),
            sender_match: SenderMatch::Substring,
            include: None,
        };
        assert!(filter.matches(&message("Alice <alice@example.com>", "alice@example.com", "", "")));
        assert!(!filter.matches(&message("bob@other.org", "bob@other.org", "", "")));
    }

    #[test]
    fn test_sender_exact() {
        let filter = MailFilter {
            sender: "alice@example.com".into(),
            sender_match: SenderMatch::Exact,
            include: None,
        };
        assert!(filter.matches(&message("Alice <ALICE@example.com>", "ALICE@example.com", "", "")));
        assert!(!filter.matches(&message("x <malice@example.com>", "malice@example.com", "", "")));
    }

    #[test]
    fn test_include_pattern_checks_subject_and_body() {
        let filter = MailFilter {
            sender: "alice".into(),
            sender_match: SenderMatch::Substring,
            include: Some(Regex::new("(?i)confirm").unwrap()),
        };
        assert!(filter.matches(&message("alice@x", "alice@x", "Please CONFIRM", "")));
        assert!(filter.matches(&message("alice@x", "alice@x", "", "confirm here")));
        assert!(!filter.matches(&message("alice@x", "alice@x", "hello", "world")));
    }

    #[test]
    fn test_strip_html_keeps_links() {
        let text = strip_html(r#"<p>Hello</p><a href="https://svc.example/go?a=1&amp;b=2">here</a><br/>bye"#);
        assert!(text.contains("Hello\n"));
        assert!(text.contains("https://svc.example/go?a=1&b=2"));
        assert!(text.contains("bye"));
        assert!(!text.contains('<'));
    }

    #[test]
    fn test_strip_html_decodes_entities() {
        let text = strip_html(
            r#"<a href="https://svc.example/v?t=1&#38;u=2">one</a> <a href='https://svc.example/w?t=3&#x26;u=4'>two</a> say &quot;hi&quot; &amp;quot;"#,
        );
        assert!(text.contains("https://svc.example/v?t=1&u=2"));
        assert!(text.contains("https://svc.example/w?t=3&u=4"));
        assert!(text.contains("say \"hi\""));
        assert!(text.ends_with("&quot;"));
    }

    #[test]
    fn test_from_rfc822_garbage_still_yields_message() {
        let msg = Message::from_rfc822("7:3", b"", None);
        assert_eq!(msg.id, "7:3");
        assert!(msg.body.is_empty());
    }
}

use log::debug;
use regex::Regex;

use crate::email::Message;

/// Default rule when neither a pattern nor a prefix is configured.
pub const DEFAULT_TARGET_PATTERN: &str = r"https?://[^\s]+";

/// Characters accepted after a literal prefix.
const PREFIX_TAIL: &str = r"[\w\-?&=/%#.]+";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionResult {
    Target(String),
    NoMatch,
}

impl ExtractionResult {
    pub fn target(&self) -> Option<&str> {
        match self {
            ExtractionResult::Target(t) => Some(t),
            ExtractionResult::NoMatch => None,
        }
    }
}

/// The single matching rule applied to every message.
#[derive(Debug, Clone)]
pub struct ExtractionRule {
    pattern: Regex,
    /// Also look at the subject when the body has no match.
    pub search_subject: bool,
}

impl ExtractionRule {
    pub fn pattern(pattern: &str) -> Result<Self, regex::Error> {
        Ok(ExtractionRule {
            pattern: Regex::new(pattern)?,
            search_subject: false,
        })
    }

    /// `prefix` taken literally, followed by URL characters.
    pub fn prefix(prefix: &str) -> Result<Self, regex::Error> {
        Self::pattern(&format!("{}{}", regex::escape(prefix), PREFIX_TAIL))
    }

    pub fn with_subject_fallback(mut self, enabled: bool) -> Self {
        self.search_subject = enabled;
        self
    }

    pub fn as_str(&self) -> &str {
        self.pattern.as_str()
    }
}

impl Default for ExtractionRule {
    fn default() -> Self {
        ExtractionRule {
            pattern: Regex::new(DEFAULT_TARGET_PATTERN).expect("default target pattern is valid"),
            search_subject: false,
        }
    }
}

/// Find the target of `message`. Pure; never fails.
///
/// The leftmost match in the body wins. An empty or whitespace-only body is
/// always `NoMatch`, even when the subject would match.
pub fn extract(message: &Message, rule: &ExtractionRule) -> ExtractionResult {
    if message.body.trim().is_empty() {
        debug!("Message {} has an empty body", message.id);
        return ExtractionResult::NoMatch;
    }

    if let Some(m) = rule.pattern.find(&message.body) {
        return ExtractionResult::Target(m.as_str().to_string());
    }

    if rule.search_subject {
        if let Some(m) = rule.pattern.find(&message.subject) {
            return ExtractionResult::Target(m.as_str().to_string());
        }
    }

    debug!("No target in message {} (rule: {})", message.id, rule.as_str());
    ExtractionResult::NoMatch
}

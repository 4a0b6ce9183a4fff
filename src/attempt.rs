use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::browser::{ActionOutcome, ActionStatus};
use crate::email::Message;

/// Maximum number of characters of the message body kept in a record.
pub const CONTENT_EXCERPT_CHARS: usize = 5000;

/// Terminal classification of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Success,
    NoTargetFound,
    ElementNotFound,
    NavigationFailed,
    Timeout,
    UnknownError,
}

impl AttemptStatus {
    pub const ALL: [AttemptStatus; 6] = [
        AttemptStatus::Success,
        AttemptStatus::NoTargetFound,
        AttemptStatus::ElementNotFound,
        AttemptStatus::NavigationFailed,
        AttemptStatus::Timeout,
        AttemptStatus::UnknownError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Success => "success",
            AttemptStatus::NoTargetFound => "no_target_found",
            AttemptStatus::ElementNotFound => "element_not_found",
            AttemptStatus::NavigationFailed => "navigation_failed",
            AttemptStatus::Timeout => "timeout",
            AttemptStatus::UnknownError => "unknown_error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == value)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, AttemptStatus::Success)
    }
}

impl std::fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ActionStatus> for AttemptStatus {
    fn from(status: ActionStatus) -> Self {
        match status {
            ActionStatus::Success => AttemptStatus::Success,
            ActionStatus::ElementNotFound => AttemptStatus::ElementNotFound,
            ActionStatus::NavigationFailed => AttemptStatus::NavigationFailed,
            ActionStatus::Timeout => AttemptStatus::Timeout,
            ActionStatus::UnknownError => AttemptStatus::UnknownError,
        }
    }
}

/// Persisted record of processing one message. Never modified once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub process_id: String,
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
    pub sender: String,
    pub subject: String,
    pub content: String,
    pub extracted_target: Option<String>,
    pub status: AttemptStatus,
    pub detailed_error: Option<String>,
    pub final_result: Option<String>,
}

impl Attempt {
    fn base(message: &Message, now: DateTime<Utc>) -> Self {
        Attempt {
            process_id: new_process_id(now),
            message_id: message.id.clone(),
            timestamp: now,
            sender: message.sender.clone(),
            subject: message.subject.clone(),
            content: content_excerpt(&message.body),
            extracted_target: None,
            status: AttemptStatus::UnknownError,
            detailed_error: None,
            final_result: None,
        }
    }

    pub fn no_target(message: &Message, now: DateTime<Utc>) -> Self {
        Attempt {
            status: AttemptStatus::NoTargetFound,
            detailed_error: Some("no target matched the extraction rule".to_string()),
            ..Self::base(message, now)
        }
    }

    pub fn from_outcome(
        message: &Message,
        target: &str,
        outcome: ActionOutcome,
        now: DateTime<Utc>,
    ) -> Self {
        let status = AttemptStatus::from(outcome.status);
        Attempt {
            extracted_target: Some(target.to_string()),
            status,
            detailed_error: outcome.detail,
            final_result: outcome.final_state,
            ..Self::base(message, now)
        }
    }

    pub fn unknown_error(
        message: &Message,
        target: Option<&str>,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Attempt {
            extracted_target: target.map(str::to_string),
            status: AttemptStatus::UnknownError,
            detailed_error: Some(error.into()),
            ..Self::base(message, now)
        }
    }
}

/// `RPA_<YYYYmmdd_HHMMSS>_<8 hex>`; unique per attempt.
pub fn new_process_id(now: DateTime<Utc>) -> String {
    let unique = uuid::Uuid::new_v4().simple().to_string();
    format!("RPA_{}_{}", now.format("%Y%m%d_%H%M%S"), &unique[..8])
}

pub fn content_excerpt(body: &str) -> String {
    let mut chars = body.char_indices();
    match chars.nth(CONTENT_EXCERPT_CHARS) {
        Some((cut, _)) => format!("{}...", &body[..cut]),
        None => body.to_string(),
    }
}

use std::time::Duration;

use crate::attempt::AttemptStatus;

/// Failures raised inside one cycle of the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("mailbox connection failed: {0}")]
    Connection(String),

    #[error("message parsing failed: {0}")]
    Parsing(String),

    #[error("browser automation failed: {0}")]
    Automation(String),

    #[error("result store failure: {0}")]
    Store(#[from] sqlx::Error),

    #[error("unexpected failure: {0}")]
    Unknown(String),
}

/// Fixed failure taxonomy used for logging and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCategory {
    Connection,
    Parsing,
    Automation,
    Unknown,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::Connection => "connection",
            FailureCategory::Parsing => "parsing",
            FailureCategory::Automation => "automation",
            FailureCategory::Unknown => "unknown",
        }
    }
}

/// What the orchestrator should do with a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Try the same operation again in this cycle after `delay`.
    Retry { delay: Duration },
    /// Give up for this cycle; nothing is recorded, the next tick starts over.
    DeferToNextCycle,
    /// Terminal for the message: persist an Attempt carrying the failure.
    RecordAttempt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff: base, 2*base, 4*base, ...
    pub fn delay_for(&self, retries_done: u32) -> Duration {
        let factor = 2u32.saturating_pow(retries_done.min(16));
        self.base_delay.saturating_mul(factor)
    }
}

#[derive(Debug, Clone, Default)]
pub struct FailureClassifier {
    policy: RetryPolicy,
}

impl FailureClassifier {
    pub fn new(policy: RetryPolicy) -> Self {
        FailureClassifier { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn classify(error: &PipelineError) -> FailureCategory {
        match error {
            PipelineError::Connection(_) => FailureCategory::Connection,
            PipelineError::Parsing(_) => FailureCategory::Parsing,
            PipelineError::Automation(_) => FailureCategory::Automation,
            PipelineError::Store(_) | PipelineError::Unknown(_) => FailureCategory::Unknown,
        }
    }

    /// Category of a terminal attempt status, `None` for success.
    pub fn classify_status(status: AttemptStatus) -> Option<FailureCategory> {
        match status {
            AttemptStatus::Success => None,
            AttemptStatus::NoTargetFound => Some(FailureCategory::Parsing),
            AttemptStatus::ElementNotFound
            | AttemptStatus::NavigationFailed
            | AttemptStatus::Timeout => Some(FailureCategory::Automation),
            AttemptStatus::UnknownError => Some(FailureCategory::Unknown),
        }
    }

    /// Decide the fate of `error` after `retries_done` in-cycle retries.
    ///
    /// Only mailbox and store failures are transient; everything local to a
    /// message becomes a recorded attempt.
    pub fn disposition(&self, error: &PipelineError, retries_done: u32) -> Disposition {
        let transient = matches!(error, PipelineError::Connection(_) | PipelineError::Store(_));
        if !transient {
            return Disposition::RecordAttempt;
        }
        if retries_done < self.policy.max_retries {
            Disposition::Retry {
                delay: self.policy.delay_for(retries_done),
            }
        } else {
            Disposition::DeferToNextCycle
        }
    }
}

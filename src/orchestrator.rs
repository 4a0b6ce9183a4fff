use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::attempt::{Attempt, AttemptStatus};
use crate::browser::ActionExecutor;
use crate::config::Config;
use crate::database::ResultStore;
use crate::email::{MailFilter, MailSource, Message};
use crate::failure::{Disposition, FailureClassifier, PipelineError, RetryPolicy};
use crate::link_extractor::{self, ExtractionResult, ExtractionRule};

/// Time source for the loop, swappable in tests.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Idle,
    Polling,
    ProcessingMessage,
    Sleeping,
    Stopped,
}

/// What one tick did.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    /// Messages returned by the mailbox.
    pub considered: usize,
    /// Already recorded in a previous cycle.
    pub skipped: usize,
    pub recorded: usize,
    /// Left for the next cycle because the store kept failing.
    pub deferred: usize,
    pub by_status: HashMap<AttemptStatus, usize>,
    pub poll_error: Option<String>,
    /// Shutdown was requested before every message was handled.
    pub interrupted: bool,
    /// Recorded or already recorded messages flagged on the server.
    pub marked: usize,
    pub elapsed: Duration,
}

impl CycleReport {
    pub fn count(&self, status: AttemptStatus) -> usize {
        self.by_status.get(&status).copied().unwrap_or(0)
    }

    fn record(&mut self, status: AttemptStatus) {
        self.recorded += 1;
        *self.by_status.entry(status).or_insert(0) += 1;
    }

    /// Percentage of recorded attempts that succeeded, `None` when nothing
    /// was recorded.
    pub fn success_rate(&self) -> Option<f64> {
        if self.recorded == 0 {
            return None;
        }
        Some(self.count(AttemptStatus::Success) as f64 * 100.0 / self.recorded as f64)
    }

    pub fn log_summary(&self) {
        if let Some(ref err) = self.poll_error {
            warn!("📊 Cycle aborted while polling: {}", err);
            return;
        }

        info!(
            "📊 Cycle summary: {} considered, {} recorded, {} already processed, {} deferred",
            self.considered, self.recorded, self.skipped, self.deferred
        );
        for status in AttemptStatus::ALL {
            let count = self.count(status);
            if count > 0 {
                info!("   {}: {}", status, count);
            }
        }
        if let Some(rate) = self.success_rate() {
            info!("   success rate: {:.1}%", rate);
        }
        info!("   execution time: {:.2}s", self.elapsed.as_secs_f64());
        if self.interrupted {
            info!("   cycle interrupted by shutdown");
        }
    }
}

/// Per-run settings of the loop.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub filter: MailFilter,
    pub rule: ExtractionRule,
    pub retry: RetryPolicy,
    pub poll_interval: Duration,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        OrchestratorSettings {
            filter: config.filter.clone(),
            rule: config.extraction.clone(),
            retry: config.retry,
            poll_interval: config.scheduler.poll_interval,
        }
    }
}

/// The polling loop: mailbox, extractor, executor and store, in that order,
/// one message at a time.
pub struct Orchestrator<M, E, S, C> {
    source: M,
    executor: E,
    store: S,
    clock: C,
    filter: MailFilter,
    rule: ExtractionRule,
    classifier: FailureClassifier,
    poll_interval: Duration,
    state: OrchestratorState,
}

impl<M, E, S, C> Orchestrator<M, E, S, C>
where
    M: MailSource,
    E: ActionExecutor,
    S: ResultStore,
    C: Clock,
{
    pub fn new(source: M, executor: E, store: S, clock: C, settings: OrchestratorSettings) -> Self {
        Orchestrator {
            source,
            executor,
            store,
            clock,
            filter: settings.filter,
            rule: settings.rule,
            classifier: FailureClassifier::new(settings.retry),
            poll_interval: settings.poll_interval,
            state: OrchestratorState::Idle,
        }
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run ticks until `shutdown` is cancelled.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        info!(
            "🚀 Polling every {}s for messages from '{}'",
            self.poll_interval.as_secs(),
            self.filter.sender
        );

        while !shutdown.is_cancelled() {
            let report = self.run_cycle(&shutdown).await;
            report.log_summary();

            if shutdown.is_cancelled() {
                break;
            }

            self.state = OrchestratorState::Sleeping;
            debug!("Sleeping {}s until next cycle", self.poll_interval.as_secs());
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.clock.sleep(self.poll_interval) => {}
            }
        }

        self.state = OrchestratorState::Stopped;
        info!("🛑 Orchestrator stopped");
    }

    /// One tick: poll, then handle every candidate in receipt order.
    pub async fn run_cycle(&mut self, shutdown: &CancellationToken) -> CycleReport {
        let started = Instant::now();
        let mut report = CycleReport::default();

        // Poll the mailbox
        self.state = OrchestratorState::Polling;
        let messages = match self
            .retrying("mailbox poll", || self.source.fetch_candidates(&self.filter))
            .await
        {
            Ok(messages) => messages,
            Err(e) => {
                error!(
                    "❌ Polling failed ({}), retrying next cycle: {}",
                    FailureClassifier::classify(&e).as_str(),
                    e
                );
                report.poll_error = Some(e.to_string());
                report.elapsed = started.elapsed();
                return report;
            }
        };
        report.considered = messages.len();
        if !messages.is_empty() {
            info!("📧 {} message(s) to consider", messages.len());
        }

        // Messages with a stored attempt; only these may be flagged seen.
        let mut settled = Vec::with_capacity(messages.len());
        for message in messages {
            if shutdown.is_cancelled() {
                info!("Shutdown requested, leaving remaining messages for later");
                report.interrupted = true;
                break;
            }

            self.state = OrchestratorState::ProcessingMessage;
            if self.handle(&message, &mut report).await {
                settled.push(message);
            }
        }

        if !settled.is_empty() {
            match self.source.mark_processed(&settled).await {
                Ok(()) => report.marked = settled.len(),
                // Still unseen: next cycle skips them through the store and retries the flag.
                Err(e) => warn!("Unable to flag {} processed message(s): {}", settled.len(), e),
            }
        }

        report.elapsed = started.elapsed();
        report
    }

    /// `true` once the store holds an attempt for `message`.
    async fn handle(&self, message: &Message, report: &mut CycleReport) -> bool {
        // Check if the message has already been processed
        match self
            .retrying("dedup lookup", || self.store.exists_for(&message.id))
            .await
        {
            Ok(true) => {
                debug!("Message {} already processed, skipping", message.id);
                report.skipped += 1;
                return true;
            }
            Ok(false) => {}
            Err(e) => {
                error!("Dedup lookup failed for {}, deferring: {}", message.id, e);
                report.deferred += 1;
                return false;
            }
        }

        info!("Processing message {} from {} ('{}')", message.id, message.sender, message.subject);
        let attempt = self.process(message).await;

        // Save the attempt
        match self
            .retrying("store append", || self.store.append(&attempt))
            .await
        {
            Ok(()) => {
                info!(
                    "✅ {} recorded as {} for message {}",
                    attempt.process_id, attempt.status, message.id
                );
                report.record(attempt.status);
                true
            }
            Err(e) => {
                error!(
                    "❌ Attempt {} for message {} could not be stored, deferring: {}",
                    attempt.process_id, message.id, e
                );
                report.deferred += 1;
                false
            }
        }
    }

    /// Extraction then action. Always yields an attempt, panics included.
    async fn process(&self, message: &Message) -> Attempt {
        let extracted =
            std::panic::catch_unwind(AssertUnwindSafe(|| link_extractor::extract(message, &self.rule)));

        let target = match extracted {
            Ok(ExtractionResult::Target(target)) => target,
            Ok(ExtractionResult::NoMatch) => {
                info!("No target in message {}", message.id);
                return Attempt::no_target(message, self.clock.now());
            }
            Err(payload) => {
                error!("Extraction panicked on message {}", message.id);
                return Attempt::unknown_error(
                    message,
                    None,
                    format!("extraction panicked: {}", panic_message(payload.as_ref())),
                    self.clock.now(),
                );
            }
        };

        info!("🎯 Target found: {}", target);
        match AssertUnwindSafe(self.executor.execute(&target))
            .catch_unwind()
            .await
        {
            Ok(outcome) => Attempt::from_outcome(message, &target, outcome, self.clock.now()),
            Err(payload) => {
                error!("Action panicked on {}", target);
                Attempt::unknown_error(
                    message,
                    Some(&target),
                    format!("action panicked: {}", panic_message(payload.as_ref())),
                    self.clock.now(),
                )
            }
        }
    }

    /// Run `op`, retrying as long as the classifier asks for it.
    async fn retrying<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let mut retries_done = 0;
        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            match self.classifier.disposition(&err, retries_done) {
                Disposition::Retry { delay } => {
                    warn!(
                        "{} failed (attempt {}/{}), retrying in {}s: {}",
                        what,
                        retries_done + 1,
                        self.classifier.policy().max_retries + 1,
                        delay.as_secs(),
                        err
                    );
                    self.clock.sleep(delay).await;
                    retries_done += 1;
                }
                Disposition::DeferToNextCycle | Disposition::RecordAttempt => return Err(err),
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::time::{sleep, timeout, Instant};

use super::{
    ActionExecutor, ActionOutcome, ActionStatus, BrowserLauncher, BrowserSession,
    SelectorDescriptor,
};

#[derive(Debug, Clone)]
pub struct ActionSettings {
    /// Evaluated in order, first match wins.
    pub selectors: Vec<SelectorDescriptor>,
    pub page_load_timeout: Duration,
    /// How long to wait for each selector before trying the next one.
    pub element_timeout: Duration,
    /// Bound on the whole invocation, launch and teardown excluded.
    pub action_timeout: Duration,
    pub poll_interval: Duration,
    /// Pause after the click so the page can react before it is observed.
    pub settle_delay: Duration,
    /// Send a HEAD request before launching the browser.
    pub preflight: bool,
}

impl Default for ActionSettings {
    fn default() -> Self {
        ActionSettings {
            selectors: super::default_selectors(),
            page_load_timeout: Duration::from_secs(30),
            element_timeout: Duration::from_secs(10),
            action_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_millis(250),
            settle_delay: Duration::from_secs(2),
            preflight: true,
        }
    }
}

const CLOSE_TIMEOUT: Duration = Duration::from_secs(15);

/// Executor that opens one fresh session per target through a launcher.
pub struct SessionExecutor<L: BrowserLauncher> {
    launcher: L,
    settings: ActionSettings,
    http: Option<reqwest::Client>,
}

impl<L: BrowserLauncher> SessionExecutor<L> {
    pub fn new(launcher: L, settings: ActionSettings) -> Self {
        let http = if settings.preflight {
            match reqwest::Client::builder()
                .timeout(settings.page_load_timeout)
                .build()
            {
                Ok(client) => Some(client),
                Err(e) => {
                    warn!("Preflight HTTP client unavailable, skipping HEAD checks: {}", e);
                    None
                }
            }
        } else {
            None
        };

        SessionExecutor {
            launcher,
            settings,
            http,
        }
    }

    pub fn settings(&self) -> &ActionSettings {
        &self.settings
    }

    /// `Some(outcome)` when the target is not worth launching a browser for.
    async fn preflight(&self, target: &str) -> Option<ActionOutcome> {
        let client = self.http.as_ref()?;
        debug!("HEAD {}", target);
        match client.head(target).send().await {
            Ok(response) => {
                let status = response.status();
                if status == reqwest::StatusCode::METHOD_NOT_ALLOWED {
                    debug!("HEAD not allowed on {}, continuing", target);
                    None
                } else if status.as_u16() >= 400 {
                    Some(ActionOutcome::failed(
                        ActionStatus::NavigationFailed,
                        format!("preflight HEAD returned {}", status),
                    ))
                } else {
                    None
                }
            }
            Err(e) if e.is_timeout() => Some(ActionOutcome::failed(
                ActionStatus::Timeout,
                format!("preflight HEAD timed out: {}", e),
            )),
            Err(e) => Some(ActionOutcome::failed(
                ActionStatus::NavigationFailed,
                format!("preflight HEAD failed: {}", e),
            )),
        }
    }

    async fn drive(&self, session: &mut L::Session, target: &str) -> ActionOutcome {
        // Load the page
        match timeout(self.settings.page_load_timeout, session.navigate(target)).await {
            Ok(Ok(())) => debug!("Page loaded: {}", target),
            Ok(Err(e)) => {
                return ActionOutcome::failed(ActionStatus::NavigationFailed, e.to_string());
            }
            Err(_) => {
                return ActionOutcome::failed(
                    ActionStatus::Timeout,
                    format!(
                        "page load exceeded {}s",
                        self.settings.page_load_timeout.as_secs()
                    ),
                );
            }
        }

        // Try each selector in turn, a failed click moves on to the next one
        let mut last_error = None;
        for selector in &self.settings.selectors {
            match self.wait_and_click(session, selector).await {
                Ok(true) => {
                    info!("Clicked element {}", selector);
                    sleep(self.settings.settle_delay).await;
                    let state = session.describe().await;
                    let final_state = match state {
                        Some(state) => format!("clicked {} | {}", selector, state),
                        None => format!("clicked {}", selector),
                    };
                    return ActionOutcome::success(final_state);
                }
                Ok(false) => debug!("No element for {}", selector),
                Err(e) => {
                    warn!("Click on {} failed: {}", selector, e);
                    last_error = Some(e.to_string());
                }
            }
        }

        let mut detail = format!(
            "none of {} selector(s) matched a clickable element",
            self.settings.selectors.len()
        );
        if let Some(err) = last_error {
            detail.push_str(&format!(" (last error: {})", err));
        }
        ActionOutcome::failed(ActionStatus::ElementNotFound, detail)
            .with_final_state(session.describe().await)
    }

    /// Poll for `selector` until it can be clicked or `element_timeout`
    /// elapses.
    async fn wait_and_click(
        &self,
        session: &mut L::Session,
        selector: &SelectorDescriptor,
    ) -> Result<bool, crate::failure::PipelineError> {
        let deadline = Instant::now() + self.settings.element_timeout;
        loop {
            if session.try_click(selector).await? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            sleep(self.settings.poll_interval).await;
        }
    }
}

#[async_trait]
impl<L: BrowserLauncher> ActionExecutor for SessionExecutor<L> {
    async fn execute(&self, target: &str) -> ActionOutcome {
        if let Some(outcome) = self.preflight(target).await {
            warn!("Preflight rejected {}: {:?}", target, outcome.detail);
            return outcome;
        }

        // Launch a fresh browser
        let mut session = match timeout(self.settings.page_load_timeout, self.launcher.launch()).await {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                return ActionOutcome::failed(
                    ActionStatus::UnknownError,
                    format!("browser launch failed: {}", e),
                );
            }
            Err(_) => {
                return ActionOutcome::failed(ActionStatus::Timeout, "browser launch timed out");
            }
        };

        let outcome = match timeout(self.settings.action_timeout, self.drive(&mut session, target)).await {
            Ok(outcome) => outcome,
            Err(_) => ActionOutcome::failed(
                ActionStatus::Timeout,
                format!(
                    "action exceeded {}s",
                    self.settings.action_timeout.as_secs()
                ),
            ),
        };

        // Close it whatever happened above
        if timeout(CLOSE_TIMEOUT, session.close()).await.is_err() {
            warn!("Browser session did not close within {}s", CLOSE_TIMEOUT.as_secs());
        }

        outcome
    }
}

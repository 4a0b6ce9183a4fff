use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use mailrpa::browser::{
    ActionExecutor, ActionSettings, ActionStatus, BrowserLauncher, BrowserSession,
    SelectorDescriptor, SelectorStrategy, SessionExecutor,
};
use mailrpa::failure::PipelineError;

#[derive(Clone, Copy, PartialEq)]
enum Navigation {
    Loads,
    Fails,
    Hangs,
}

/// Shared script and observations for every session the fake launches.
struct Script {
    navigation: Navigation,
    launch_fails: bool,
    clickable: Vec<String>,
    launches: AtomicUsize,
    closes: AtomicUsize,
    tried: Mutex<Vec<String>>,
}

impl Script {
    fn new(navigation: Navigation, clickable: &[&str]) -> Arc<Self> {
        Arc::new(Script {
            navigation,
            launch_fails: false,
            clickable: clickable.iter().map(|s| s.to_string()).collect(),
            launches: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            tried: Mutex::new(Vec::new()),
        })
    }
}

struct FakeLauncher {
    script: Arc<Script>,
}

#[async_trait]
impl BrowserLauncher for FakeLauncher {
    type Session = FakeSession;

    async fn launch(&self) -> Result<FakeSession, PipelineError> {
        self.script.launches.fetch_add(1, Ordering::SeqCst);
        if self.script.launch_fails {
            return Err(PipelineError::Automation("chrome not found".to_string()));
        }
        Ok(FakeSession {
            script: self.script.clone(),
        })
    }
}

struct FakeSession {
    script: Arc<Script>,
}

#[async_trait]
impl BrowserSession for FakeSession {
    async fn navigate(&mut self, url: &str) -> Result<(), PipelineError> {
        match self.script.navigation {
            Navigation::Loads => Ok(()),
            Navigation::Fails => Err(PipelineError::Automation(format!("net::ERR_NAME_NOT_RESOLVED at {}", url))),
            Navigation::Hangs => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            }
        }
    }

    async fn try_click(&mut self, selector: &SelectorDescriptor) -> Result<bool, PipelineError> {
        self.script.tried.lock().unwrap().push(selector.value.clone());
        Ok(self.script.clickable.contains(&selector.value))
    }

    async fn describe(&mut self) -> Option<String> {
        Some("title: 'Confirmed' | url: https://svc.example/done".to_string())
    }

    async fn close(&mut self) {
        self.script.closes.fetch_add(1, Ordering::SeqCst);
    }
}

fn settings(selectors: &[&str]) -> ActionSettings {
    ActionSettings {
        selectors: selectors
            .iter()
            .map(|s| SelectorDescriptor::new(SelectorStrategy::Path, *s))
            .collect(),
        page_load_timeout: Duration::from_secs(5),
        element_timeout: Duration::from_millis(50),
        action_timeout: Duration::from_secs(5),
        poll_interval: Duration::from_millis(10),
        settle_delay: Duration::from_millis(1),
        preflight: false,
    }
}

fn executor(script: &Arc<Script>, settings: ActionSettings) -> SessionExecutor<FakeLauncher> {
    SessionExecutor::new(
        FakeLauncher {
            script: script.clone(),
        },
        settings,
    )
}

#[tokio::test]
async fn test_first_resolving_selector_wins() {
    let script = Script::new(Navigation::Loads, &["//button", "//a"]);
    let executor = executor(&script, settings(&["//input", "//button", "//a"]));

    let outcome = executor.execute("https://svc.example/confirm?id=42").await;

    assert_eq!(outcome.status, ActionStatus::Success);
    let final_state = outcome.final_state.unwrap();
    assert!(final_state.contains("//button"));
    assert!(final_state.contains("Confirmed"));

    let tried = script.tried.lock().unwrap().clone();
    assert_eq!(tried.first().map(String::as_str), Some("//input"));
    assert_eq!(tried.last().map(String::as_str), Some("//button"));
    assert!(!tried.iter().any(|s| s == "//a"));
    assert_eq!(script.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_no_selector_resolves() {
    let script = Script::new(Navigation::Loads, &[]);
    let executor = executor(&script, settings(&["//input", "//button"]));

    let outcome = executor.execute("https://svc.example/confirm").await;

    assert_eq!(outcome.status, ActionStatus::ElementNotFound);
    assert!(outcome.detail.unwrap().contains("2 selector(s)"));
    assert!(outcome.final_state.is_some());
    assert_eq!(script.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_navigation_failure_closes_session() {
    let script = Script::new(Navigation::Fails, &["//button"]);
    let executor = executor(&script, settings(&["//button"]));

    let outcome = executor.execute("https://nowhere.invalid/").await;

    assert_eq!(outcome.status, ActionStatus::NavigationFailed);
    assert!(script.tried.lock().unwrap().is_empty());
    assert_eq!(script.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_action_timeout_releases_session() {
    let script = Script::new(Navigation::Hangs, &["//button"]);
    let mut settings = settings(&["//button"]);
    settings.action_timeout = Duration::from_millis(100);
    let executor = executor(&script, settings);

    let outcome = executor.execute("https://slow.example/").await;

    assert_eq!(outcome.status, ActionStatus::Timeout);
    assert_eq!(script.launches.load(Ordering::SeqCst), 1);
    assert_eq!(script.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_page_load_timeout() {
    let script = Script::new(Navigation::Hangs, &["//button"]);
    let mut settings = settings(&["//button"]);
    settings.page_load_timeout = Duration::from_millis(100);
    let executor = executor(&script, settings);

    let outcome = executor.execute("https://slow.example/").await;

    assert_eq!(outcome.status, ActionStatus::Timeout);
    assert!(outcome.detail.unwrap().contains("page load"));
    assert_eq!(script.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_launch_failure_is_unknown_error() {
    let script = Arc::new(Script {
        launch_fails: true,
        ..Arc::try_unwrap(Script::new(Navigation::Loads, &[])).ok().unwrap()
    });
    let executor = executor(&script, settings(&["//button"]));

    let outcome = executor.execute("https://svc.example/").await;

    assert_eq!(outcome.status, ActionStatus::UnknownError);
    assert_eq!(script.closes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_preflight_rejects_unreachable_target_without_browser() {
    let script = Script::new(Navigation::Loads, &["//button"]);
    let mut settings = settings(&["//button"]);
    settings.preflight = true;
    let executor = executor(&script, settings);

    // Nothing listens on port 1.
    let outcome = executor.execute("http://127.0.0.1:1/confirm").await;

    assert_ne!(outcome.status, ActionStatus::Success);
    assert_eq!(script.launches.load(Ordering::SeqCst), 0);
}

//! Browser automation: drive one isolated session against an extracted target
pub mod chrome;
pub mod executor;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;

use crate::failure::PipelineError;

pub use chrome::{ChromeLauncher, ChromeSession};
pub use executor::{ActionSettings, SessionExecutor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionStatus {
    Success,
    ElementNotFound,
    NavigationFailed,
    Timeout,
    UnknownError,
}

/// Result of one executor invocation. Failures are values, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionOutcome {
    pub status: ActionStatus,
    pub detail: Option<String>,
    pub final_state: Option<String>,
}

impl ActionOutcome {
    pub fn success(final_state: impl Into<String>) -> Self {
        ActionOutcome {
            status: ActionStatus::Success,
            detail: None,
            final_state: Some(final_state.into()),
        }
    }

    pub fn failed(status: ActionStatus, detail: impl Into<String>) -> Self {
        ActionOutcome {
            status,
            detail: Some(detail.into()),
            final_state: None,
        }
    }

    pub fn with_final_state(mut self, state: Option<String>) -> Self {
        self.final_state = state;
        self
    }
}

/// Performs the scripted interaction against a target.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// Always returns an outcome; nothing escapes as an error.
    async fn execute(&self, target: &str) -> ActionOutcome;
}

/// How a selector value is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorStrategy {
    /// XPath expression.
    Path,
    /// CSS selector, attribute selectors included.
    Attribute,
    Id,
    Class,
    Tag,
}

impl FromStr for SelectorStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "path-based" | "path" | "xpath" => Ok(SelectorStrategy::Path),
            "attribute-based" | "attribute" | "css" => Ok(SelectorStrategy::Attribute),
            "id" => Ok(SelectorStrategy::Id),
            "class" => Ok(SelectorStrategy::Class),
            "tag" => Ok(SelectorStrategy::Tag),
            other => Err(format!(
                "unknown selector strategy '{}' (expected path-based, attribute-based, id, class or tag)",
                other
            )),
        }
    }
}

impl fmt::Display for SelectorStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SelectorStrategy::Path => "path-based",
            SelectorStrategy::Attribute => "attribute-based",
            SelectorStrategy::Id => "id",
            SelectorStrategy::Class => "class",
            SelectorStrategy::Tag => "tag",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorDescriptor {
    pub strategy: SelectorStrategy,
    pub value: String,
}

impl SelectorDescriptor {
    pub fn new(strategy: SelectorStrategy, value: impl Into<String>) -> Self {
        SelectorDescriptor {
            strategy,
            value: value.into(),
        }
    }

    /// CSS form of every non-XPath strategy; `None` for XPath.
    pub fn css(&self) -> Option<String> {
        let quoted = self.value.replace('\\', "\\\\").replace('"', "\\\"");
        match self.strategy {
            SelectorStrategy::Path => None,
            SelectorStrategy::Attribute | SelectorStrategy::Tag => Some(self.value.clone()),
            SelectorStrategy::Id => Some(format!("[id=\"{}\"]", quoted)),
            SelectorStrategy::Class => Some(format!("[class~=\"{}\"]", quoted)),
        }
    }
}

impl fmt::Display for SelectorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.strategy, self.value)
    }
}

/// Parse a `||`-separated selector list. Each entry may carry its own
/// strategy as `strategy=value`; otherwise `default` applies.
pub fn parse_selector_list(
    input: &str,
    default: SelectorStrategy,
) -> Result<Vec<SelectorDescriptor>, String> {
    let mut selectors = Vec::new();
    for entry in input.split("||").map(str::trim).filter(|e| !e.is_empty()) {
        let descriptor = match entry.split_once('=') {
            Some((tag, value)) if tag.trim().parse::<SelectorStrategy>().is_ok() => {
                let strategy = tag.trim().parse()?;
                SelectorDescriptor::new(strategy, value.trim())
            }
            _ => SelectorDescriptor::new(default, entry),
        };
        if descriptor.value.is_empty() {
            return Err(format!("empty selector in '{}'", entry));
        }
        selectors.push(descriptor);
    }
    Ok(selectors)
}

const BUTTON_TEXTS: &str = "contains(text(), 'Click') or contains(text(), 'Submit') \
    or contains(text(), 'Login') or contains(text(), 'Sign in') \
    or contains(text(), 'Continue') or contains(text(), 'Next') \
    or contains(text(), 'Accept') or contains(text(), 'OK')";

/// Buttons and links with a call-to-action text, then any button, then
/// script/anchor links.
pub fn default_selectors() -> Vec<SelectorDescriptor> {
    vec![
        SelectorDescriptor::new(SelectorStrategy::Path, format!("//button[{}]", BUTTON_TEXTS)),
        SelectorDescriptor::new(SelectorStrategy::Path, format!("//a[{}]", BUTTON_TEXTS)),
        SelectorDescriptor::new(SelectorStrategy::Path, "//button"),
        SelectorDescriptor::new(
            SelectorStrategy::Path,
            "//a[contains(@href, '#') or contains(@href, 'javascript')]",
        ),
    ]
}

/// Opens isolated browser sessions.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    type Session: BrowserSession;

    async fn launch(&self) -> Result<Self::Session, PipelineError>;
}

/// One live browser session, owned by a single executor invocation.
#[async_trait]
pub trait BrowserSession: Send {
    async fn navigate(&mut self, url: &str) -> Result<(), PipelineError>;

    /// `Ok(false)` when the element is not (yet) on the page.
    async fn try_click(&mut self, selector: &SelectorDescriptor) -> Result<bool, PipelineError>;

    /// Human-readable page state (title and URL) after the action.
    async fn describe(&mut self) -> Option<String>;

    /// Release every resource held by the session. Called exactly once.
    async fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_tags() {
        assert_eq!("path-based".parse(), Ok(SelectorStrategy::Path));
        assert_eq!("XPATH".parse(), Ok(SelectorStrategy::Path));
        assert_eq!("attribute-based".parse(), Ok(SelectorStrategy::Attribute));
        assert_eq!("css".parse(), Ok(SelectorStrategy::Attribute));
        assert!("magic".parse::<SelectorStrategy>().is_err());
    }

    #[test]
    fn test_parse_selector_list() {
        let list = parse_selector_list(
            "//button | //a || css=#confirm || id=submit-btn ||  ",
            SelectorStrategy::Path,
        )
        .unwrap();

        assert_eq!(
            list,
            vec![
                SelectorDescriptor::new(SelectorStrategy::Path, "//button | //a"),
                SelectorDescriptor::new(SelectorStrategy::Attribute, "#confirm"),
                SelectorDescriptor::new(SelectorStrategy::Id, "submit-btn"),
            ]
        );
    }

    #[test]
    fn test_xpath_with_equals_keeps_default_strategy() {
        let list = parse_selector_list("//a[@id='go']", SelectorStrategy::Path).unwrap();
        assert_eq!(list[0], SelectorDescriptor::new(SelectorStrategy::Path, "//a[@id='go']"));
    }

    #[test]
    fn test_css_forms() {
        assert_eq!(SelectorDescriptor::new(SelectorStrategy::Path, "//a").css(), None);
        assert_eq!(
            SelectorDescriptor::new(SelectorStrategy::Id, "ok").css().as_deref(),
            Some("[id=\"ok\"]")
        );
        assert_eq!(
            SelectorDescriptor::new(SelectorStrategy::Class, "btn").css().as_deref(),
            Some("[class~=\"btn\"]")
        );
        assert_eq!(
            SelectorDescriptor::new(SelectorStrategy::Attribute, "a[data-x='1']").css().as_deref(),
            Some("a[data-x='1']")
        );
    }

    #[test]
    fn test_default_selectors_start_with_call_to_action() {
        let defaults = default_selectors();
        assert_eq!(defaults.len(), 4);
        assert!(defaults[0].value.starts_with("//button[contains(text(), 'Click')"));
        assert_eq!(defaults[2].value, "//button");
    }
}

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;

use crate::browser::{self, ActionSettings, SelectorDescriptor, SelectorStrategy};
use crate::email::{MailFilter, SenderMatch};
use crate::failure::RetryPolicy;
use crate::link_extractor::ExtractionRule;

/// Immutable configuration, built once at startup and handed to every
/// component.
#[derive(Debug, Clone)]
pub struct Config {
    pub imap: ImapConfig,
    pub filter: MailFilter,
    pub extraction: ExtractionRule,
    pub action: ActionSettings,
    pub browser: BrowserSettings,
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub retry: RetryPolicy,
    pub log_level: log::LevelFilter,
}

#[derive(Clone)]
pub struct ImapConfig {
    pub server: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub mailbox: String,
    /// Bound on every network step (connect, login, search, fetch).
    pub timeout: Duration,
    /// Most recent unseen messages considered per cycle.
    pub fetch_limit: usize,
    /// Flag messages `\Seen` once their attempt is stored.
    pub mark_seen: bool,
}

impl fmt::Debug for ImapConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImapConfig")
            .field("server", &self.server)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .field("mailbox", &self.mailbox)
            .field("timeout", &self.timeout)
            .field("fetch_limit", &self.fetch_limit)
            .field("mark_seen", &self.mark_seen)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct BrowserSettings {
    pub headless: bool,
    pub chrome_bin: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
}

const REQUIRED_VARS: [&str; 4] = ["EMAIL_USER", "EMAIL_PASSWORD", "IMAP_SERVER", "SENDER_FILTER"];

impl Config {
    /// Configuration from the process environment.
    pub fn new() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Configuration from an arbitrary key lookup. Blank values count as
    /// unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        env.check_required()?;

        let imap = ImapConfig {
            server: env.required("IMAP_SERVER")?,
            port: env.parse("IMAP_PORT", 993)?,
            username: env.required("EMAIL_USER")?,
            password: env.required("EMAIL_PASSWORD")?,
            mailbox: env.get("IMAP_MAILBOX").unwrap_or_else(|| "INBOX".to_string()),
            timeout: Duration::from_secs(env.parse("IMAP_TIMEOUT_SECS", 30)?),
            fetch_limit: env.parse("FETCH_LIMIT", 10)?,
            mark_seen: env.flag("MARK_SEEN", true)?,
        };
        if imap.fetch_limit == 0 {
            anyhow::bail!("FETCH_LIMIT must be at least 1");
        }

        let filter = MailFilter {
            sender: env.required("SENDER_FILTER")?,
            sender_match: match env.get("SENDER_MATCH").as_deref().map(str::to_lowercase).as_deref() {
                None | Some("substring") => SenderMatch::Substring,
                Some("exact") => SenderMatch::Exact,
                Some(other) => anyhow::bail!("SENDER_MATCH must be 'exact' or 'substring', got '{}'", other),
            },
            include: env
                .get("INCLUDE_PATTERN")
                .map(|p| Regex::new(&p).with_context(|| format!("INCLUDE_PATTERN '{}' is not a valid regex", p)))
                .transpose()?,
        };

        let extraction = match (env.get("TARGET_PATTERN"), env.get("TARGET_PREFIX")) {
            (Some(pattern), _) => ExtractionRule::pattern(&pattern)
                .with_context(|| format!("TARGET_PATTERN '{}' is not a valid regex", pattern))?,
            (None, Some(prefix)) => ExtractionRule::prefix(&prefix)
                .with_context(|| format!("TARGET_PREFIX '{}' cannot be used", prefix))?,
            (None, None) => ExtractionRule::default(),
        }
        .with_subject_fallback(env.flag("SEARCH_SUBJECT", false)?);

        let default_strategy: SelectorStrategy = match env.get("SELECTOR_TYPE") {
            Some(tag) => tag.parse().map_err(anyhow::Error::msg).context("SELECTOR_TYPE")?,
            None => SelectorStrategy::Path,
        };
        let selectors = match env.get("BUTTON_SELECTORS").or_else(|| env.get("BUTTON_SELECTOR")) {
            Some(list) => browser::parse_selector_list(&list, default_strategy)
                .map_err(anyhow::Error::msg)
                .context("BUTTON_SELECTORS")?,
            None => browser::default_selectors(),
        };
        let action = action_settings(&env, selectors)?;

        let browser = BrowserSettings {
            headless: env.flag("HEADLESS_MODE", true)?,
            chrome_bin: env.get("CHROME_BIN").map(PathBuf::from),
        };

        let database = DatabaseConfig {
            path: PathBuf::from(env.get("DATABASE_PATH").unwrap_or_else(|| "rpa.db".to_string())),
        };

        let scheduler = SchedulerConfig {
            poll_interval: Duration::from_secs(env.parse("POLL_INTERVAL_SECS", 600)?),
        };

        let retry = RetryPolicy {
            max_retries: env.parse("MAX_RETRIES", 3)?,
            base_delay: Duration::from_secs(env.parse("RETRY_DELAY_SECS", 5)?),
        };

        let log_level = if env.flag("DEBUG_MODE", false)? {
            log::LevelFilter::Debug
        } else {
            match env.get("LOG_LEVEL") {
                Some(level) => level
                    .parse()
                    .with_context(|| format!("LOG_LEVEL '{}' is not a log level", level))?,
                None => log::LevelFilter::Info,
            }
        };

        Ok(Config {
            imap,
            filter,
            extraction,
            action,
            browser,
            database,
            scheduler,
            retry,
            log_level,
        })
    }
}

fn action_settings<F>(env: &Env<F>, selectors: Vec<SelectorDescriptor>) -> Result<ActionSettings>
where
    F: Fn(&str) -> Option<String>,
{
    if selectors.is_empty() {
        anyhow::bail!("BUTTON_SELECTORS does not contain any selector");
    }
    let defaults = ActionSettings::default();
    Ok(ActionSettings {
        selectors,
        page_load_timeout: Duration::from_secs(env.parse("PAGE_LOAD_TIMEOUT_SECS", 30)?),
        element_timeout: Duration::from_secs(env.parse("ELEMENT_TIMEOUT_SECS", 10)?),
        action_timeout: Duration::from_secs(env.parse("ACTION_TIMEOUT_SECS", 120)?),
        preflight: env.flag("PREFLIGHT_CHECK", true)?,
        ..defaults
    })
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> Result<String> {
        self.get(key)
            .with_context(|| format!("{} must be set", key))
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.get(key) {
            Some(raw) => raw
                .parse()
                .map_err(|e| anyhow::anyhow!("{} has an invalid value '{}': {}", key, raw, e)),
            None => Ok(default),
        }
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool> {
        match self.get(key).map(|v| v.to_lowercase()) {
            None => Ok(default),
            Some(v) if matches!(v.as_str(), "true" | "1" | "yes" | "on") => Ok(true),
            Some(v) if matches!(v.as_str(), "false" | "0" | "no" | "off") => Ok(false),
            Some(v) => anyhow::bail!("{} must be true or false, got '{}'", key, v),
        }
    }

    fn check_required(&self) -> Result<()> {
        let missing: Vec<&str> = REQUIRED_VARS
            .iter()
            .copied()
            .filter(|var| self.get(var).is_none())
            .collect();

        if !missing.is_empty() {
            anyhow::bail!(
                "Missing environment variables: {}\n\
                 \n\
                 💡 Either create a .env file next to the binary:\n\
                    EMAIL_USER=robot@example.com\n\
                    EMAIL_PASSWORD=...\n\
                    IMAP_SERVER=imap.example.com\n\
                    SENDER_FILTER=notifications@service.example\n\
                 \n\
                 or export them before running:\n\
                    export SENDER_FILTER=notifications@service.example\n\
                    mailrpa --check-config",
                missing.join(", ")
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let mut map: HashMap<String, String> = [
            ("EMAIL_USER", "robot@example.com"),
            ("EMAIL_PASSWORD", "secret-password"),
            ("IMAP_SERVER", "imap.example.com"),
            ("SENDER_FILTER", "alice@example.com"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        for (k, v) in pairs {
            map.insert(k.to_string(), v.to_string());
        }
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();

        assert_eq!(config.imap.port, 993);
        assert_eq!(config.imap.mailbox, "INBOX");
        assert_eq!(config.imap.fetch_limit, 10);
        assert!(config.imap.mark_seen);
        assert_eq!(config.filter.sender_match, SenderMatch::Substring);
        assert_eq!(config.extraction.as_str(), crate::link_extractor::DEFAULT_TARGET_PATTERN);
        assert!(!config.extraction.search_subject);
        assert_eq!(config.action.selectors, browser::default_selectors());
        assert!(config.browser.headless);
        assert_eq!(config.scheduler.poll_interval, Duration::from_secs(600));
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.database.path, PathBuf::from("rpa.db"));
        assert_eq!(config.log_level, log::LevelFilter::Info);
    }

    #[test]
    fn test_missing_required_vars_are_listed() {
        let err = Config::from_lookup(|key| match key {
            "EMAIL_USER" => Some("robot@example.com".to_string()),
            "IMAP_SERVER" => Some("  ".to_string()),
            _ => None,
        })
        .unwrap_err()
        .to_string();

        assert!(err.contains("EMAIL_PASSWORD"));
        assert!(err.contains("IMAP_SERVER"));
        assert!(err.contains("SENDER_FILTER"));
        assert!(!err.contains("EMAIL_USER,"));
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("SENDER_MATCH", "Exact"),
            ("TARGET_PATTERN", r"https://svc\.example/\S+"),
            ("SEARCH_SUBJECT", "yes"),
            ("SELECTOR_TYPE", "attribute-based"),
            ("BUTTON_SELECTORS", "#confirm || xpath=//button"),
            ("HEADLESS_MODE", "false"),
            ("POLL_INTERVAL_SECS", "60"),
            ("DEBUG_MODE", "true"),
        ]))
        .unwrap();

        assert_eq!(config.filter.sender_match, SenderMatch::Exact);
        assert!(config.extraction.search_subject);
        assert_eq!(
            config.action.selectors,
            vec![
                SelectorDescriptor::new(SelectorStrategy::Attribute, "#confirm"),
                SelectorDescriptor::new(SelectorStrategy::Path, "//button"),
            ]
        );
        assert!(!config.browser.headless);
        assert_eq!(config.scheduler.poll_interval, Duration::from_secs(60));
        assert_eq!(config.log_level, log::LevelFilter::Debug);
    }

    #[test]
    fn test_invalid_values_are_fatal() {
        assert!(Config::from_lookup(lookup(&[("IMAP_PORT", "imaps")])).is_err());
        assert!(Config::from_lookup(lookup(&[("TARGET_PATTERN", "(")])).is_err());
        assert!(Config::from_lookup(lookup(&[("SELECTOR_TYPE", "magic")])).is_err());
        assert!(Config::from_lookup(lookup(&[("HEADLESS_MODE", "maybe")])).is_err());
        assert!(Config::from_lookup(lookup(&[("BUTTON_SELECTORS", " || ")])).is_err());
        assert!(Config::from_lookup(lookup(&[("FETCH_LIMIT", "0")])).is_err());
    }

    #[test]
    fn test_password_is_not_debug_printed() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        let printed = format!("{:?}", config.imap);
        assert!(!printed.contains("secret-password"));
    }
}

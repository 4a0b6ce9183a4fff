use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::task::JoinHandle;

use super::{BrowserLauncher, BrowserSession, SelectorDescriptor, SelectorStrategy};
use crate::config::BrowserSettings;
use crate::failure::PipelineError;

const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
    (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Launches Chromium through the DevTools protocol, one profile per session.
#[derive(Debug, Clone)]
pub struct ChromeLauncher {
    settings: BrowserSettings,
}

impl ChromeLauncher {
    pub fn new(settings: BrowserSettings) -> Self {
        ChromeLauncher { settings }
    }

    fn browser_config(&self, profile_dir: &Path) -> Result<BrowserConfig, String> {
        let mut builder = BrowserConfig::builder();
        if let Some(ref bin) = self.settings.chrome_bin {
            builder = builder.chrome_executable(bin);
        }
        if !self.settings.headless {
            builder = builder.with_head();
        }

        builder
            .user_data_dir(profile_dir)
            .args(vec![
                "--no-sandbox".to_string(),
                "--disable-dev-shm-usage".to_string(),
                "--disable-gpu".to_string(),
                "--disable-extensions".to_string(),
                "--disable-background-timer-throttling".to_string(),
                "--disable-renderer-backgrounding".to_string(),
                "--disable-backgrounding-occluded-windows".to_string(),
                "--window-size=1920,1080".to_string(),
                format!("--user-agent={}", USER_AGENT),
            ])
            .build()
    }
}

#[async_trait]
impl BrowserLauncher for ChromeLauncher {
    type Session = ChromeSession;

    async fn launch(&self) -> Result<ChromeSession, PipelineError> {
        // Removed on drop, so a failed or cancelled launch leaves nothing behind.
        let profile_dir = ProfileDir::new();
        let config = self
            .browser_config(profile_dir.path())
            .map_err(|e| PipelineError::Automation(format!("invalid browser config: {}", e)))?;

        info!(
            "Launching Chromium (headless={}, bin={:?})",
            self.settings.headless, self.settings.chrome_bin
        );
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| PipelineError::Automation(format!("browser launch failed: {}", e)))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("CDP handler event error: {}", e);
                }
            }
        });

        let mut session = ChromeSession {
            browser,
            page: None,
            handler: Some(handler_task),
            profile_dir,
        };

        match session.browser.new_page("about:blank").await {
            Ok(page) => {
                session.page = Some(page);
                Ok(session)
            }
            Err(e) => {
                session.close().await;
                Err(PipelineError::Automation(format!("unable to open a page: {}", e)))
            }
        }
    }
}

pub struct ChromeSession {
    browser: Browser,
    page: Option<Page>,
    handler: Option<JoinHandle<()>>,
    profile_dir: ProfileDir,
}

impl ChromeSession {
    fn page(&self) -> Result<&Page, PipelineError> {
        self.page
            .as_ref()
            .ok_or_else(|| PipelineError::Automation("no active page".to_string()))
    }
}

#[async_trait]
impl BrowserSession for ChromeSession {
    async fn navigate(&mut self, url: &str) -> Result<(), PipelineError> {
        let page = self.page()?;
        debug!("Navigating to {}", url);
        page.goto(url)
            .await
            .map_err(|e| PipelineError::Automation(format!("navigation to {} failed: {}", url, e)))?
            .wait_for_navigation()
            .await
            .map_err(|e| PipelineError::Automation(format!("page {} did not load: {}", url, e)))?;
        Ok(())
    }

    async fn try_click(&mut self, selector: &SelectorDescriptor) -> Result<bool, PipelineError> {
        let page = self.page()?;
        let found = match (selector.strategy, selector.css()) {
            (SelectorStrategy::Path, _) | (_, None) => page.find_xpath(selector.value.as_str()).await,
            (_, Some(css)) => page.find_element(css).await,
        };

        let element = match found {
            Ok(element) => element,
            Err(e) => {
                debug!("Element {} not found yet: {}", selector, e);
                return Ok(false);
            }
        };

        element
            .click()
            .await
            .map_err(|e| PipelineError::Automation(format!("click on {} failed: {}", selector, e)))?;
        Ok(true)
    }

    async fn describe(&mut self) -> Option<String> {
        let page = self.page.as_ref()?;
        let title = page.get_title().await.ok().flatten().unwrap_or_default();
        let url = page.url().await.ok().flatten().unwrap_or_default();
        Some(format!("title: '{}' | url: {}", title, url))
    }

    async fn close(&mut self) {
        if let Some(page) = self.page.take() {
            if let Err(e) = page.close().await {
                debug!("Page close failed: {}", e);
            }
        }
        if let Err(e) = self.browser.close().await {
            warn!("Browser close failed: {}", e);
        }
        if let Err(e) = self.browser.wait().await {
            warn!("Waiting for the browser process failed: {}", e);
        }
        if let Some(handler) = self.handler.take() {
            handler.abort();
        }
        self.profile_dir.remove();
        debug!("Browser session closed");
    }
}

impl Drop for ChromeSession {
    fn drop(&mut self) {
        if let Some(handler) = self.handler.take() {
            handler.abort();
        }
    }
}

/// Throwaway Chromium profile under the temp dir, deleted when dropped.
struct ProfileDir {
    path: PathBuf,
    removed: bool,
}

impl ProfileDir {
    fn new() -> Self {
        ProfileDir {
            path: std::env::temp_dir()
                .join(format!("mailrpa-profile-{}", uuid::Uuid::new_v4().simple())),
            removed: false,
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn remove(&mut self) {
        if self.removed {
            return;
        }
        self.removed = true;
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => debug!("Profile dir {} removed", self.path.display()),
            // Chromium never got to create it.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Profile dir {} not removed: {}", self.path.display(), e),
        }
    }
}

impl Drop for ProfileDir {
    fn drop(&mut self) {
        self.remove();
    }
}

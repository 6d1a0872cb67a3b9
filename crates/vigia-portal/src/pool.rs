//! Bounded pool of long-lived browser sessions.
//!
//! Sessions are launched lazily up to the pool cap and reused across jobs.
//! Each session counts the pages it has opened; once past the configured
//! ceiling it is closed and replaced on the next acquisition, which bounds
//! memory growth and fingerprint accumulation. Waiters queue FIFO and a
//! released session is handed to the first waiter directly, without
//! touching the idle list.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chromiumoxide::error::CdpError;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use tokio::sync::oneshot;
use uuid::Uuid;

use vigia_core::error::AppError;

use crate::stealth;

/// Configuration for the browser pool.
#[derive(Debug, Clone)]
pub struct BrowserPoolConfig {
    /// Maximum number of concurrent browser sessions.
    pub size: usize,
    /// Pages a session may open before it is recycled.
    pub max_pages_per_browser: u32,
    /// Default timeout for page operations.
    pub page_timeout: Duration,
    /// Default timeout for navigations.
    pub navigation_timeout: Duration,
}

impl Default for BrowserPoolConfig {
    fn default() -> Self {
        Self {
            size: 3,
            max_pages_per_browser: 20,
            page_timeout: Duration::from_secs(30),
            navigation_timeout: Duration::from_secs(45),
        }
    }
}

/// One pooled browser process plus its bookkeeping.
struct PooledBrowser {
    id: Uuid,
    browser: Browser,
    handler_task: tokio::task::JoinHandle<()>,
    user_agent: String,
    pages_opened: u32,
    broken: bool,
}

impl PooledBrowser {
    async fn shutdown(mut self) {
        if let Err(e) = self.browser.close().await {
            tracing::debug!(browser = %self.id, error = %e, "Browser close failed");
        }
        let _ = self.browser.wait().await;
        self.handler_task.abort();
    }
}

struct PoolInner {
    idle: Vec<PooledBrowser>,
    /// Browsers that exist (idle + leased + launching).
    live: usize,
    /// Browsers currently leased out.
    in_use: usize,
    waiters: VecDeque<oneshot::Sender<PooledBrowser>>,
    recycled: u64,
    draining: bool,
}

/// Pool statistics for `/status`.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct PoolStats {
    pub size: usize,
    pub in_use: usize,
    pub idle: usize,
    pub waiting: usize,
    pub recycled: u64,
}

enum AcquirePlan {
    Reuse(PooledBrowser),
    Launch,
    Wait(oneshot::Receiver<PooledBrowser>),
}

/// Shared, bounded pool of browser sessions.
#[derive(Clone)]
pub struct BrowserPool {
    config: Arc<BrowserPoolConfig>,
    inner: Arc<Mutex<PoolInner>>,
}

impl BrowserPool {
    pub fn new(config: BrowserPoolConfig) -> Self {
        Self {
            config: Arc::new(config),
            inner: Arc::new(Mutex::new(PoolInner {
                idle: Vec::new(),
                live: 0,
                in_use: 0,
                waiters: VecDeque::new(),
                recycled: 0,
                draining: false,
            })),
        }
    }

    pub fn config(&self) -> &BrowserPoolConfig {
        &self.config
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.lock_inner();
        PoolStats {
            size: self.config.size,
            in_use: inner.in_use,
            idle: inner.idle.len(),
            waiting: inner.waiters.len(),
            recycled: inner.recycled,
        }
    }

    pub fn is_draining(&self) -> bool {
        self.lock_inner().draining
    }

    /// Lease one page. Blocks FIFO behind other acquirers when the pool is
    /// at capacity. The returned lease closes its page and returns the
    /// session on drop, on every control-flow path.
    pub async fn acquire(&self) -> Result<PageLease, AppError> {
        let plan = {
            let mut inner = self.lock_inner();
            if inner.draining {
                return Err(AppError::BrowserCrash("browser pool is draining".into()));
            }
            if let Some(browser) = inner.idle.pop() {
                inner.in_use += 1;
                AcquirePlan::Reuse(browser)
            } else if inner.live < self.config.size {
                inner.live += 1;
                inner.in_use += 1;
                AcquirePlan::Launch
            } else {
                let (tx, rx) = oneshot::channel();
                inner.waiters.push_back(tx);
                AcquirePlan::Wait(rx)
            }
        };

        let browser = match plan {
            AcquirePlan::Reuse(browser) => self.ensure_fresh(browser).await?,
            AcquirePlan::Launch => match self.launch().await {
                Ok(browser) => browser,
                Err(e) => {
                    let mut inner = self.lock_inner();
                    inner.live -= 1;
                    inner.in_use -= 1;
                    return Err(e);
                }
            },
            AcquirePlan::Wait(rx) => {
                // The releaser hands us a session with in_use already
                // accounted for.
                let browser = rx.await.map_err(|_| {
                    AppError::BrowserCrash("browser pool shut down while waiting".into())
                })?;
                self.ensure_fresh(browser).await?
            }
        };

        self.open_page(browser).await
    }

    /// Replace a session that is broken or past its page budget.
    async fn ensure_fresh(&self, browser: PooledBrowser) -> Result<PooledBrowser, AppError> {
        if !browser.broken && browser.pages_opened < self.config.max_pages_per_browser {
            return Ok(browser);
        }

        tracing::info!(
            browser = %browser.id,
            pages_opened = browser.pages_opened,
            broken = browser.broken,
            "Recycling browser session"
        );
        browser.shutdown().await;

        match self.launch().await {
            Ok(fresh) => {
                self.lock_inner().recycled += 1;
                Ok(fresh)
            }
            Err(e) => {
                let mut inner = self.lock_inner();
                inner.live -= 1;
                inner.in_use -= 1;
                Err(e)
            }
        }
    }

    async fn open_page(&self, mut browser: PooledBrowser) -> Result<PageLease, AppError> {
        let result = tokio::time::timeout(self.config.navigation_timeout, async {
            let page = browser
                .browser
                .new_page("about:blank")
                .await
                .map_err(classify_cdp)?;
            stealth::prepare_page(&page, &browser.user_agent).await?;
            Ok::<Page, AppError>(page)
        })
        .await;

        match result {
            Ok(Ok(page)) => {
                browser.pages_opened += 1;
                Ok(PageLease {
                    page: Some(page),
                    browser: Some(browser),
                    pool: self.clone(),
                    broken: false,
                })
            }
            Ok(Err(e)) => {
                browser.broken = true;
                self.release_browser(browser);
                Err(e)
            }
            Err(_) => {
                browser.broken = true;
                self.release_browser(browser);
                Err(AppError::BrowserCrash("page open timed out".into()))
            }
        }
    }

    /// Return a session to the pool: first queued waiter gets it directly,
    /// otherwise it goes idle. While draining, returned sessions are closed.
    fn release_browser(&self, browser: PooledBrowser) {
        let mut inner = self.lock_inner();

        if inner.draining {
            inner.in_use -= 1;
            inner.live -= 1;
            drop(inner);
            tokio::spawn(browser.shutdown());
            return;
        }

        let mut browser = browser;
        while let Some(waiter) = inner.waiters.pop_front() {
            match waiter.send(browser) {
                // Handed off; in_use transfers to the waiter.
                Ok(()) => return,
                // Waiter gave up; try the next one.
                Err(returned) => browser = returned,
            }
        }

        inner.in_use -= 1;
        inner.idle.push(browser);
    }

    async fn launch(&self) -> Result<PooledBrowser, AppError> {
        let mut builder = BrowserConfig::builder();
        builder = builder.no_sandbox();

        if let Some(bin) = find_chrome_binary() {
            tracing::debug!("Using Chrome binary: {}", bin.display());
            builder = builder.chrome_executable(bin);
        }

        let config = builder
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-popup-blocking")
            .arg("--disable-translate")
            .arg("--no-first-run")
            .arg("--lang=es-PE")
            .arg("--window-size=1366,768")
            .build()
            .map_err(|e| AppError::BrowserCrash(format!("browser config error: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| AppError::BrowserCrash(format!("failed to launch browser: {e}")))?;

        // The CDP handler must be polled continuously for the connection to
        // work.
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    tracing::warn!("Browser CDP handler error: {event:?}");
                    break;
                }
            }
        });

        let user_agent = match browser.version().await {
            Ok(version) => stealth::realistic_user_agent(&version.product),
            Err(e) => {
                tracing::warn!(error = %e, "Could not read browser version; using default UA");
                stealth::realistic_user_agent("")
            }
        };

        Ok(PooledBrowser {
            id: Uuid::new_v4(),
            browser,
            handler_task,
            user_agent,
            pages_opened: 0,
            broken: false,
        })
    }

    /// Close all sessions and refuse new acquisitions. Blocks until every
    /// leased session has been returned. Idempotent.
    pub async fn drain(&self) {
        let idle = {
            let mut inner = self.lock_inner();
            inner.draining = true;
            // Waiters can never be served now.
            inner.waiters.clear();
            let idle: Vec<_> = inner.idle.drain(..).collect();
            inner.live -= idle.len();
            idle
        };

        for browser in idle {
            browser.shutdown().await;
        }

        loop {
            if self.lock_inner().live == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        tracing::info!("Browser pool drained");
    }
}

/// Exclusive lease of one page on one pooled browser session.
///
/// Dropping the lease closes the page and returns the session, even when
/// the holder panics.
pub struct PageLease {
    page: Option<Page>,
    browser: Option<PooledBrowser>,
    pool: BrowserPool,
    broken: bool,
}

impl PageLease {
    pub fn page(&self) -> &Page {
        self.page
            .as_ref()
            .expect("page is present until the lease drops")
    }

    pub fn page_timeout(&self) -> Duration {
        self.pool.config.page_timeout
    }

    pub fn navigation_timeout(&self) -> Duration {
        self.pool.config.navigation_timeout
    }

    /// Mark the underlying session for recycling before reuse (fatal
    /// browser errors).
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl Drop for PageLease {
    fn drop(&mut self) {
        let page = self.page.take();
        let Some(mut browser) = self.browser.take() else {
            return;
        };
        browser.broken = browser.broken || self.broken;

        let pool = self.pool.clone();
        tokio::spawn(async move {
            if let Some(page) = page {
                if let Err(e) = page.close().await {
                    tracing::debug!(error = %e, "Page close failed");
                    browser.broken = true;
                }
            }
            pool.release_browser(browser);
        });
    }
}

/// Classify a CDP error: a lost connection means the browser process died.
pub(crate) fn classify_cdp(error: CdpError) -> AppError {
    let message = error.to_string();
    if message.contains("oneshot canceled")
        || message.contains("connection closed")
        || message.contains("Browser closed")
        || matches!(error, CdpError::LaunchExit(..) | CdpError::LaunchTimeout(..))
    {
        AppError::BrowserCrash(message)
    } else {
        AppError::PortalUnreachable(message)
    }
}

/// Tries to locate the real Chrome/Chromium binary.
///
/// On systems where Chromium is installed via snap, the wrapper at
/// `/snap/bin/chromium` strips unknown CLI flags, breaking headless mode;
/// the real binary inside the snap is checked first, then well-known
/// system paths. `CHROME_BIN` overrides everything.
fn find_chrome_binary() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("CHROME_BIN") {
        let path = PathBuf::from(&p);
        if path.exists() {
            return Some(path);
        }
    }

    let candidates: &[&str] = &[
        "/snap/chromium/current/usr/lib/chromium-browser/chrome",
        "/var/lib/flatpak/exports/bin/org.chromium.Chromium",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/google-chrome",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
    ];

    candidates.iter().map(PathBuf::from).find(|p| p.exists())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_portal_tolerances() {
        let config = BrowserPoolConfig::default();
        assert_eq!(config.size, 3);
        assert_eq!(config.max_pages_per_browser, 20);
    }

    #[test]
    fn fresh_pool_reports_empty_stats() {
        let pool = BrowserPool::new(BrowserPoolConfig::default());
        let stats = pool.stats();
        assert_eq!(stats.size, 3);
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.waiting, 0);
        assert!(!pool.is_draining());
    }
}

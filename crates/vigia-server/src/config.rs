use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;

use vigia_core::error::AppError;
use vigia_core::rate_limit::RateLimitConfig;
use vigia_core::schedule::FrequencyConfig;
use vigia_core::scheduler::SchedulerConfig;
use vigia_portal::{BrowserPoolConfig, PortalConfig};

/// Full service configuration, read from the environment once at startup.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub port: u16,
    pub timezone: Tz,
    pub service_secret: String,

    pub portal_base_url: Option<String>,
    pub solver_base_url: String,
    pub image_solver_key: Option<String>,
    pub token_solver_key: Option<String>,

    pub browser_pool_size: usize,
    pub max_pages_per_browser: u32,
    pub page_timeout: Duration,
    pub navigation_timeout: Duration,

    pub worker_concurrency: usize,
    pub rate_limit_max: u32,
    pub rate_limit_window: Duration,
    pub scheduler_interval: Duration,
    pub shutdown_deadline: Duration,

    pub attachment_prefix: String,
    pub object_store_root: String,
    pub cors_origin: Option<String>,
}

fn parse_env<T: FromStr>(key: &str, default: T) -> Result<T, AppError> {
    match std::env::var(key) {
        Err(_) => Ok(default),
        Ok(raw) => raw
            .parse()
            .map_err(|_| AppError::ConfigError(format!("Invalid {key}: '{raw}'"))),
    }
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let service_secret = std::env::var("VIGIA_SERVICE_SECRET").map_err(|_| {
            AppError::ConfigError(
                "VIGIA_SERVICE_SECRET not set. Required to authenticate the control API.".into(),
            )
        })?;

        let timezone_name =
            std::env::var("VIGIA_TIMEZONE").unwrap_or_else(|_| "America/Lima".to_string());
        let timezone: Tz = timezone_name
            .parse()
            .map_err(|_| AppError::ConfigError(format!("Invalid VIGIA_TIMEZONE: '{timezone_name}'")))?;

        Ok(Self {
            port: parse_env("VIGIA_PORT", 3000)?,
            timezone,
            service_secret,
            portal_base_url: std::env::var("VIGIA_PORTAL_BASE_URL").ok(),
            solver_base_url: std::env::var("VIGIA_SOLVER_BASE_URL")
                .unwrap_or_else(|_| "https://api.anti-captcha.com".to_string()),
            image_solver_key: std::env::var("VIGIA_IMAGE_SOLVER_KEY").ok(),
            token_solver_key: std::env::var("VIGIA_TOKEN_SOLVER_KEY").ok(),
            browser_pool_size: parse_env("VIGIA_BROWSER_POOL_SIZE", 3)?,
            max_pages_per_browser: parse_env("VIGIA_MAX_PAGES_PER_BROWSER", 20)?,
            page_timeout: Duration::from_millis(parse_env("VIGIA_PAGE_TIMEOUT_MS", 30_000u64)?),
            navigation_timeout: Duration::from_millis(parse_env(
                "VIGIA_NAVIGATION_TIMEOUT_MS",
                45_000u64,
            )?),
            worker_concurrency: parse_env("VIGIA_WORKER_CONCURRENCY", 4)?,
            rate_limit_max: parse_env("VIGIA_RATE_LIMIT_MAX", 10)?,
            rate_limit_window: Duration::from_millis(parse_env(
                "VIGIA_RATE_LIMIT_WINDOW_MS",
                60_000u64,
            )?),
            scheduler_interval: Duration::from_secs(
                60 * parse_env("VIGIA_SCHEDULER_INTERVAL_MINUTES", 10u64)?,
            ),
            shutdown_deadline: Duration::from_secs(parse_env(
                "VIGIA_SHUTDOWN_DEADLINE_SECS",
                30u64,
            )?),
            attachment_prefix: std::env::var("VIGIA_ATTACHMENT_PREFIX")
                .unwrap_or_else(|_| "cases".to_string()),
            object_store_root: std::env::var("VIGIA_OBJECT_STORE_ROOT")
                .unwrap_or_else(|_| "./attachments".to_string()),
            cors_origin: std::env::var("VIGIA_CORS_ORIGIN").ok(),
        })
    }

    pub fn rate_limit(&self) -> RateLimitConfig {
        RateLimitConfig {
            max: self.rate_limit_max,
            window: self.rate_limit_window,
        }
    }

    pub fn browser_pool(&self) -> BrowserPoolConfig {
        BrowserPoolConfig {
            size: self.browser_pool_size,
            max_pages_per_browser: self.max_pages_per_browser,
            page_timeout: self.page_timeout,
            navigation_timeout: self.navigation_timeout,
        }
    }

    pub fn portal(&self) -> PortalConfig {
        let mut config = PortalConfig::default();
        if let Some(base_url) = &self.portal_base_url {
            config.base_url = base_url.clone();
        }
        config
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            interval: self.scheduler_interval,
            timezone: self.timezone,
            frequency: FrequencyConfig::default(),
        }
    }
}

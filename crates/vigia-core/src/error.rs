use thiserror::Error;

/// Application-wide error types for Vigia.
///
/// Each variant maps to a stable kind code recorded in job logs and on
/// snapshots, plus a retry disposition applied by the job queue.
#[derive(Error, Debug)]
pub enum AppError {
    /// No CAPTCHA strategy managed to solve the page.
    #[error("CAPTCHA failed: {0}")]
    CaptchaFailed(String),

    /// The portal could not be reached or did not render its form.
    #[error("Portal unreachable: {0}")]
    PortalUnreachable(String),

    /// The portal's antibot interposition persisted through all retries.
    #[error("Bot detection triggered by the portal")]
    BotDetected,

    /// The portal reported no results for the case number.
    #[error("Case number not found on the portal")]
    InvalidCaseNumber,

    /// The browser session crashed or became unresponsive.
    #[error("Browser crash: {0}")]
    BrowserCrash(String),

    /// Extracted data failed structural validation.
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// An operation exceeded its deadline.
    #[error("Timed out after {0} seconds")]
    Timeout(u64),

    /// An external CAPTCHA solver API call failed.
    #[error("Solver API error (HTTP {status_code}): {message}")]
    SolverApi { message: String, status_code: u16 },

    /// Blob upload/download failed. File-level only: a single failed
    /// attachment is logged and skipped, never fatal to the job.
    #[error("Object store error: {0}")]
    ObjectStoreFailure(String),

    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Invalid or missing configuration.
    #[error("Config error: {0}")]
    ConfigError(String),

    /// Anything unclassified. Treated as retryable.
    #[error("{0}")]
    Unknown(String),
}

impl AppError {
    /// Stable kind code, recorded in `job_log.error_kind` and
    /// `snapshots.last_error`.
    pub fn kind_code(&self) -> &'static str {
        match self {
            AppError::CaptchaFailed(_) => "captcha_failed",
            AppError::PortalUnreachable(_) => "portal_unreachable",
            AppError::BotDetected => "bot_detected",
            AppError::InvalidCaseNumber => "invalid_case_number",
            AppError::BrowserCrash(_) => "browser_crash",
            AppError::ValidationFailed(_) => "validation_failed",
            AppError::Timeout(_) => "timeout",
            AppError::SolverApi { .. } => "solver_api",
            AppError::ObjectStoreFailure(_) => "object_store",
            AppError::DatabaseError(_) => "repository",
            AppError::SerializationError(_) => "validation_failed",
            AppError::ConfigError(_) => "config",
            AppError::Unknown(_) => "unknown",
        }
    }

    /// Returns true if this error is transient and worth retrying
    /// with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::CaptchaFailed(_)
            | AppError::PortalUnreachable(_)
            | AppError::BotDetected
            | AppError::BrowserCrash(_)
            | AppError::Timeout(_)
            | AppError::SolverApi { .. }
            | AppError::ObjectStoreFailure(_)
            | AppError::DatabaseError(_)
            | AppError::Unknown(_) => true,
            AppError::InvalidCaseNumber
            | AppError::ValidationFailed(_)
            | AppError::SerializationError(_)
            | AppError::ConfigError(_) => false,
        }
    }

    /// Returns true if this error signals portal-level trouble and should
    /// trip the portal circuit breaker. Local failures (browser, database,
    /// validation) never trip it.
    pub fn should_trip_circuit(&self) -> bool {
        matches!(
            self,
            AppError::PortalUnreachable(_) | AppError::Timeout(_) | AppError::BotDetected
        )
    }
}

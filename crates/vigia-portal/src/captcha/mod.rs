//! CAPTCHA strategy chain.
//!
//! The portal rotates between several protection mechanisms; each one gets
//! a [`CaptchaStrategy`]. The chain tries strategies in configuration
//! order and the first applicable-and-successful one wins. None of them
//! clicks the final submit control — that stays with the form flow.

mod audio;
mod challenge;
mod image;

use std::sync::Arc;

use async_trait::async_trait;
use chromiumoxide::Page;

use vigia_core::error::AppError;

pub(crate) use crate::extract::{element_exists, field_value, set_field_value};

pub use audio::AudioCodeStrategy;
pub use challenge::HostedChallengeStrategy;
pub use image::ImageCaptchaStrategy;

/// Outcome of one strategy attempt.
#[derive(Debug, Clone, Default)]
pub struct CaptchaOutcome {
    pub solved: bool,
    /// The code typed into the form, when the mechanism uses one.
    pub solution: Option<String>,
    /// The response token, for hosted challenges.
    pub token: Option<String>,
}

impl CaptchaOutcome {
    pub fn solved_with_code(code: impl Into<String>) -> Self {
        Self {
            solved: true,
            solution: Some(code.into()),
            token: None,
        }
    }

    pub fn solved_with_token(token: impl Into<String>) -> Self {
        Self {
            solved: true,
            solution: None,
            token: Some(token.into()),
        }
    }

    pub fn unsolved() -> Self {
        Self::default()
    }
}

/// One CAPTCHA mechanism handler.
#[async_trait]
pub trait CaptchaStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Cheap page inspection: is this mechanism present right now?
    async fn applicable(&self, page: &Page) -> Result<bool, AppError>;

    /// Attempt to solve. May call the external solver service. Must leave
    /// the page ready for submission without clicking submit itself.
    async fn solve(&self, page: &Page) -> Result<CaptchaOutcome, AppError>;
}

/// Ordered chain of strategies.
#[derive(Clone)]
pub struct CaptchaChain {
    strategies: Vec<Arc<dyn CaptchaStrategy>>,
}

impl CaptchaChain {
    pub fn new(strategies: Vec<Arc<dyn CaptchaStrategy>>) -> Self {
        Self { strategies }
    }

    /// Run the chain. A strategy that errors or comes back unsolved yields
    /// to the next one; if none succeeds the whole operation fails with
    /// `CaptchaFailed`.
    pub async fn solve(&self, page: &Page) -> Result<CaptchaOutcome, AppError> {
        for strategy in &self.strategies {
            match strategy.applicable(page).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    tracing::debug!(strategy = strategy.name(), error = %e, "Applicability check failed");
                    continue;
                }
            }

            match strategy.solve(page).await {
                Ok(outcome) if outcome.solved => {
                    tracing::info!(strategy = strategy.name(), "CAPTCHA solved");
                    return Ok(outcome);
                }
                Ok(_) => {
                    tracing::debug!(strategy = strategy.name(), "Strategy came back unsolved");
                }
                Err(e) => {
                    tracing::warn!(strategy = strategy.name(), error = %e, "Strategy failed");
                }
            }
        }

        Err(AppError::CaptchaFailed(
            "no strategy solved the page".into(),
        ))
    }
}

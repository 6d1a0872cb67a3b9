//! Audio-code strategy.
//!
//! The portal's accessibility fallback plays the code out loud and, as a
//! side effect, writes it into a hidden field. Triggering the playback and
//! reading that field is free and instant, so this strategy goes first in
//! the chain.

use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::Page;

use vigia_core::error::AppError;

use super::{element_exists, field_value, set_field_value, CaptchaOutcome, CaptchaStrategy};

const AUDIO_TRIGGER: &str = "#btnAudio";
const AUDIO_VALUE_FIELD: &str = "#codigoAudio";
const CODE_FIELD: &str = "#codigoCaptcha";

/// How long the portal script takes to populate the hidden field.
const POPULATE_DELAY: Duration = Duration::from_millis(800);
const POPULATE_ATTEMPTS: u32 = 4;

pub struct AudioCodeStrategy;

#[async_trait]
impl CaptchaStrategy for AudioCodeStrategy {
    fn name(&self) -> &'static str {
        "audio-code"
    }

    async fn applicable(&self, page: &Page) -> Result<bool, AppError> {
        Ok(element_exists(page, AUDIO_TRIGGER).await?
            && element_exists(page, AUDIO_VALUE_FIELD).await?)
    }

    async fn solve(&self, page: &Page) -> Result<CaptchaOutcome, AppError> {
        // Sometimes the field is pre-populated and the click is unnecessary.
        if let Some(code) = field_value(page, AUDIO_VALUE_FIELD).await? {
            set_field_value(page, CODE_FIELD, &code).await?;
            return Ok(CaptchaOutcome::solved_with_code(code));
        }

        page.find_element(AUDIO_TRIGGER)
            .await
            .map_err(crate::pool::classify_cdp)?
            .click()
            .await
            .map_err(crate::pool::classify_cdp)?;

        for _ in 0..POPULATE_ATTEMPTS {
            tokio::time::sleep(POPULATE_DELAY).await;
            if let Some(code) = field_value(page, AUDIO_VALUE_FIELD).await? {
                set_field_value(page, CODE_FIELD, &code).await?;
                return Ok(CaptchaOutcome::solved_with_code(code));
            }
        }

        Ok(CaptchaOutcome::unsolved())
    }
}

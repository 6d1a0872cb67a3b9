//! Image-to-text strategy.
//!
//! Extracts the CAPTCHA image via a canvas re-render, sends it to the
//! external image solver, and writes the answer into both the visible code
//! field and the antibot hidden field the portal checks server-side.

use async_trait::async_trait;
use chromiumoxide::Page;

use vigia_core::error::AppError;

use crate::solver::SolverClient;

use super::{element_exists, set_field_value, CaptchaOutcome, CaptchaStrategy};

const CAPTCHA_IMAGE: &str = "#captcha_image";
const CODE_FIELD: &str = "#codigoCaptcha";
const ANTIBOT_FIELD: &str = "#codigoAntibot";

pub struct ImageCaptchaStrategy {
    solver: SolverClient,
}

impl ImageCaptchaStrategy {
    pub fn new(solver: SolverClient) -> Self {
        Self { solver }
    }

    async fn image_base64(&self, page: &Page) -> Result<Option<String>, AppError> {
        let js = format!(
            r#"(() => {{
                const img = document.querySelector({sel});
                if (!img || !img.complete || img.naturalWidth === 0) return null;
                const canvas = document.createElement('canvas');
                canvas.width = img.naturalWidth;
                canvas.height = img.naturalHeight;
                canvas.getContext('2d').drawImage(img, 0, 0);
                return canvas.toDataURL('image/png').split(',')[1];
            }})()"#,
            sel = serde_json::to_string(CAPTCHA_IMAGE)?,
        );
        let result = page
            .evaluate(js)
            .await
            .map_err(crate::pool::classify_cdp)?;
        Ok(result.into_value::<Option<String>>().unwrap_or(None))
    }
}

#[async_trait]
impl CaptchaStrategy for ImageCaptchaStrategy {
    fn name(&self) -> &'static str {
        "image-solver"
    }

    async fn applicable(&self, page: &Page) -> Result<bool, AppError> {
        element_exists(page, CAPTCHA_IMAGE).await
    }

    async fn solve(&self, page: &Page) -> Result<CaptchaOutcome, AppError> {
        let Some(image) = self.image_base64(page).await? else {
            return Ok(CaptchaOutcome::unsolved());
        };

        let code = self.solver.solve_image(&image).await?;
        if code.trim().is_empty() {
            return Ok(CaptchaOutcome::unsolved());
        }

        set_field_value(page, CODE_FIELD, &code).await?;
        // The server cross-checks this hidden field against the visible one.
        if element_exists(page, ANTIBOT_FIELD).await? {
            set_field_value(page, ANTIBOT_FIELD, &code).await?;
        }

        Ok(CaptchaOutcome::solved_with_code(code))
    }
}

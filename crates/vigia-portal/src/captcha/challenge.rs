//! Hosted-challenge strategy.
//!
//! Some antibot interpositions embed a third-party challenge widget in an
//! iframe. The widget's site key and the page URL go to the external token
//! solver; the returned token is injected into every response field and
//! the widget's success callback is invoked so the page proceeds on its
//! own.

use async_trait::async_trait;
use chromiumoxide::Page;

use vigia_core::error::AppError;

use crate::solver::SolverClient;

use super::{CaptchaOutcome, CaptchaStrategy};

const SITE_KEY_JS: &str = r#"(() => {
    const holder = document.querySelector('[data-sitekey]');
    if (holder) return holder.getAttribute('data-sitekey');
    const frame = document.querySelector("iframe[src*='challenges'], iframe[src*='captcha']");
    if (!frame) return null;
    try {
        const url = new URL(frame.src);
        return url.searchParams.get('k') || url.searchParams.get('sitekey');
    } catch (_) {
        return null;
    }
})()"#;

pub struct HostedChallengeStrategy {
    solver: SolverClient,
}

impl HostedChallengeStrategy {
    pub fn new(solver: SolverClient) -> Self {
        Self { solver }
    }

    async fn site_key(&self, page: &Page) -> Result<Option<String>, AppError> {
        let result = page
            .evaluate(SITE_KEY_JS)
            .await
            .map_err(crate::pool::classify_cdp)?;
        Ok(result
            .into_value::<Option<String>>()
            .unwrap_or(None)
            .filter(|k| !k.is_empty()))
    }

    async fn inject_token(&self, page: &Page, token: &str) -> Result<(), AppError> {
        let js = format!(
            r#"((token) => {{
                for (const el of document.querySelectorAll(
                    "textarea[name$='response'], input[name$='response']")) {{
                    el.value = token;
                }}
                const holder = document.querySelector('[data-callback]');
                if (holder) {{
                    const cb = window[holder.getAttribute('data-callback')];
                    if (typeof cb === 'function') cb(token);
                }}
            }})({token})"#,
            token = serde_json::to_string(token)?,
        );
        page.evaluate(js)
            .await
            .map_err(crate::pool::classify_cdp)?;
        Ok(())
    }
}

#[async_trait]
impl CaptchaStrategy for HostedChallengeStrategy {
    fn name(&self) -> &'static str {
        "hosted-challenge"
    }

    async fn applicable(&self, page: &Page) -> Result<bool, AppError> {
        Ok(self.site_key(page).await?.is_some())
    }

    async fn solve(&self, page: &Page) -> Result<CaptchaOutcome, AppError> {
        let Some(site_key) = self.site_key(page).await? else {
            return Ok(CaptchaOutcome::unsolved());
        };

        let page_url = page
            .url()
            .await
            .map_err(crate::pool::classify_cdp)?
            .unwrap_or_default();

        let token = self.solver.solve_challenge(&site_key, &page_url).await?;
        self.inject_token(page, &token).await?;

        Ok(CaptchaOutcome::solved_with_token(token))
    }
}

//! The portal client: navigation, form submission, outcome classification
//! and file download, on top of the browser pool and the CAPTCHA chain.

use std::path::PathBuf;
use std::time::Duration;

use base64::Engine;
use chromiumoxide::Page;
use uuid::Uuid;

use vigia_core::error::AppError;
use vigia_core::model::RawBinnacle;
use vigia_core::traits::Portal;

use crate::captcha::CaptchaChain;
use crate::extract::{self, element_exists};
use crate::pool::{classify_cdp, BrowserPool, PageLease};

// Form view.
const FORM_MARKER: &str = "#divConsultar";
const CASE_NUMBER_FIELD: &str = "#numeroExpediente";
const PARTY_FIELD: &str = "#nombreParte";
const SUBMIT_BUTTON: &str = "#btnConsultar";

// Post-submit classification. The first matching marker wins.
const CLASSIFY_JS: &str = r#"(() => {
    if (document.querySelector('#divDetalles, #gridResultados')) return 'results';
    if (document.querySelector('#mensajeNoExiste, .alert-no-results')) return 'no-results';
    if (document.querySelector('#mensajeCaptchaError, #codCaptchaError')) return 'captcha-error';
    if (document.querySelector('#divAntibot, #challenge-running')) return 'antibot';
    return 'pending';
})()"#;

const ANTIBOT_MARKER_JS: &str =
    "document.querySelector('#divAntibot, #challenge-running') !== null";

const DETAIL_LINK: &str = "#gridResultados a.aDetalle, #btnDetalle";
const DETAIL_MARKER: &str = "#pnlSeguimientos, #divSeguimientos";

const CLASSIFY_POLL: Duration = Duration::from_millis(250);

/// Final page state after a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageOutcome {
    Results,
    NoResults,
    CaptchaError,
    Antibot,
}

/// Configuration for the portal client.
#[derive(Debug, Clone)]
pub struct PortalConfig {
    pub base_url: String,
    /// Full-navigation retries before giving up as unreachable.
    pub navigation_retries: u32,
    /// Antibot interposition retries during submission.
    pub antibot_retries: u32,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            base_url: "https://cej.pj.gob.pe/cej/forms/busquedaform.html".into(),
            navigation_retries: 3,
            antibot_retries: 2,
        }
    }
}

/// Browser-backed portal access shared by all workers.
#[derive(Clone)]
pub struct PortalClient {
    pool: BrowserPool,
    chain: CaptchaChain,
    config: PortalConfig,
}

impl PortalClient {
    pub fn new(pool: BrowserPool, chain: CaptchaChain, config: PortalConfig) -> Self {
        Self {
            pool,
            chain,
            config,
        }
    }

    async fn with_timeout<T>(
        &self,
        budget: Duration,
        fut: impl std::future::Future<Output = Result<T, AppError>>,
    ) -> Result<T, AppError> {
        match tokio::time::timeout(budget, fut).await {
            Ok(inner) => inner,
            Err(_) => Err(AppError::Timeout(budget.as_secs())),
        }
    }

    /// Land on the search form, solving any antibot interposition on the
    /// way. Retries full navigations before declaring the portal
    /// unreachable.
    async fn navigate(&self, lease: &PageLease) -> Result<(), AppError> {
        let budget = lease.navigation_timeout();
        let mut last_error = String::from("no attempts made");

        for attempt in 1..=self.config.navigation_retries {
            let result = self
                .with_timeout(budget, async {
                    let page = lease.page();
                    page.goto(self.config.base_url.as_str())
                        .await
                        .map_err(classify_cdp)?;
                    page.wait_for_navigation().await.map_err(classify_cdp)?;
                    Ok(())
                })
                .await;

            match result {
                Ok(()) => {
                    if self.antibot_interposed(lease.page()).await? {
                        tracing::info!(attempt, "Antibot interposition on navigation");
                        self.chain.solve(lease.page()).await?;
                        continue;
                    }
                    if element_exists(lease.page(), FORM_MARKER).await? {
                        return Ok(());
                    }
                    last_error = "form never rendered".into();
                }
                Err(e @ AppError::BrowserCrash(_)) => return Err(e),
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "Navigation attempt failed");
                    last_error = e.to_string();
                }
            }
        }

        Err(AppError::PortalUnreachable(last_error))
    }

    async fn antibot_interposed(&self, page: &Page) -> Result<bool, AppError> {
        let result = page.evaluate(ANTIBOT_MARKER_JS).await.map_err(classify_cdp)?;
        Ok(result.into_value::<bool>().unwrap_or(false))
    }

    async fn fill_form(
        &self,
        page: &Page,
        case_number: &str,
        party_name: &str,
    ) -> Result<(), AppError> {
        type_into(page, CASE_NUMBER_FIELD, case_number).await?;
        type_into(page, PARTY_FIELD, party_name).await?;
        Ok(())
    }

    /// Click submit and poll until the page settles into one of the four
    /// classified states.
    async fn submit_and_classify(&self, lease: &PageLease) -> Result<PageOutcome, AppError> {
        let page = lease.page();
        page.find_element(SUBMIT_BUTTON)
            .await
            .map_err(classify_cdp)?
            .click()
            .await
            .map_err(classify_cdp)?;

        let deadline = tokio::time::Instant::now() + lease.page_timeout();
        loop {
            tokio::time::sleep(CLASSIFY_POLL).await;

            let state = page
                .evaluate(CLASSIFY_JS)
                .await
                .map_err(classify_cdp)?
                .into_value::<String>()
                .unwrap_or_else(|_| "pending".into());

            match state.as_str() {
                "results" => return Ok(PageOutcome::Results),
                "no-results" => return Ok(PageOutcome::NoResults),
                "captcha-error" => return Ok(PageOutcome::CaptchaError),
                "antibot" => return Ok(PageOutcome::Antibot),
                _ => {}
            }

            if tokio::time::Instant::now() > deadline {
                return Err(AppError::Timeout(lease.page_timeout().as_secs()));
            }
        }
    }

    async fn open_detail(&self, lease: &PageLease) -> Result<(), AppError> {
        let budget = lease.navigation_timeout();
        self.with_timeout(budget, async {
            let page = lease.page();
            if let Ok(link) = page.find_element(DETAIL_LINK).await {
                link.click().await.map_err(classify_cdp)?;
            }
            // Some case numbers resolve straight into the detail view.
            let deadline = tokio::time::Instant::now() + budget;
            loop {
                if element_exists(page, DETAIL_MARKER).await? {
                    return Ok(());
                }
                if tokio::time::Instant::now() > deadline {
                    return Err(AppError::Timeout(budget.as_secs()));
                }
                tokio::time::sleep(CLASSIFY_POLL).await;
            }
        })
        .await
    }

    async fn fetch_case_inner(
        &self,
        lease: &PageLease,
        case_number: &str,
        party_name: &str,
    ) -> Result<Vec<RawBinnacle>, AppError> {
        self.navigate(lease).await?;

        let mut antibot_attempts = 0;
        loop {
            self.fill_form(lease.page(), case_number, party_name).await?;
            self.chain.solve(lease.page()).await?;

            match self.submit_and_classify(lease).await? {
                PageOutcome::Results => break,
                PageOutcome::NoResults => return Err(AppError::InvalidCaseNumber),
                PageOutcome::CaptchaError => {
                    return Err(AppError::CaptchaFailed(
                        "portal rejected the submitted code".into(),
                    ));
                }
                PageOutcome::Antibot => {
                    antibot_attempts += 1;
                    if antibot_attempts > self.config.antibot_retries {
                        return Err(AppError::BotDetected);
                    }
                    tracing::info!(
                        attempt = antibot_attempts,
                        "Antibot interposition after submit; solving and re-navigating"
                    );
                    self.chain.solve(lease.page()).await?;
                    self.navigate(lease).await?;
                }
            }
        }

        self.open_detail(lease).await?;
        extract::binnacles(lease.page()).await
    }
}

impl Portal for PortalClient {
    type Session = PageLease;

    async fn open(&self) -> Result<PageLease, AppError> {
        self.pool.acquire().await
    }

    async fn fetch_case(
        &self,
        session: &mut PageLease,
        case_number: &str,
        party_name: &str,
    ) -> Result<Vec<RawBinnacle>, AppError> {
        let result = self
            .fetch_case_inner(session, case_number, party_name)
            .await;

        if let Err(AppError::BrowserCrash(_)) = &result {
            session.mark_broken();
        }
        result
    }

    async fn download_file(
        &self,
        session: &mut PageLease,
        url: &str,
    ) -> Result<Option<PathBuf>, AppError> {
        let js = format!(
            r#"(async (url) => {{
                try {{
                    const response = await fetch(url, {{ credentials: 'include' }});
                    if (!response.ok) return null;
                    const buffer = await response.arrayBuffer();
                    const bytes = new Uint8Array(buffer);
                    let binary = '';
                    const chunk = 0x8000;
                    for (let i = 0; i < bytes.length; i += chunk) {{
                        binary += String.fromCharCode.apply(null, bytes.subarray(i, i + chunk));
                    }}
                    return btoa(binary);
                }} catch (_) {{
                    return null;
                }}
            }})({url})"#,
            url = serde_json::to_string(url)?,
        );

        let budget = session.page_timeout();
        let result = self
            .with_timeout(budget, async {
                session
                    .page()
                    .evaluate(js.as_str())
                    .await
                    .map_err(classify_cdp)
            })
            .await;

        let encoded = match result {
            Ok(eval) => eval.into_value::<Option<String>>().unwrap_or(None),
            Err(e) => {
                tracing::warn!(url, error = %e, "File download evaluation failed");
                return Ok(None);
            }
        };

        let Some(encoded) = encoded else {
            return Ok(None);
        };

        let bytes = match base64::engine::general_purpose::STANDARD.decode(encoded) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(url, error = %e, "Download payload was not valid base64");
                return Ok(None);
            }
        };

        let path = std::env::temp_dir().join(format!("vigia-{}", Uuid::new_v4()));
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| AppError::ObjectStoreFailure(format!("temp file write: {e}")))?;

        Ok(Some(path))
    }
}

// -- Page helpers local to the form flow --

async fn type_into(page: &Page, selector: &str, value: &str) -> Result<(), AppError> {
    let element = page.find_element(selector).await.map_err(classify_cdp)?;
    element.click().await.map_err(classify_cdp)?;
    element.type_str(value).await.map_err(classify_cdp)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_points_at_the_search_form() {
        let config = PortalConfig::default();
        assert!(config.base_url.starts_with("https://"));
        assert_eq!(config.navigation_retries, 3);
        assert_eq!(config.antibot_retries, 2);
    }
}

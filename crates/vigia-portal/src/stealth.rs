//! Anti-detection page preparation.
//!
//! The portal's antibot interposition fingerprints headless browsers. Every
//! new page gets the same treatment before its first navigation: the
//! automation flag removed, a plausible plugin/language surface, a minimal
//! runtime object, and a user agent that matches the real engine version
//! instead of advertising headless mode.

use chromiumoxide::cdp::browser_protocol::emulation::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::network::SetBlockedUrLsParams;
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::Page;

use vigia_core::error::AppError;

/// Script injected before any document in the page runs.
const INIT_SCRIPT: &str = r#"
Object.defineProperty(navigator, 'webdriver', { get: () => undefined });
Object.defineProperty(navigator, 'plugins', {
    get: () => [
        { name: 'PDF Viewer', filename: 'internal-pdf-viewer' },
        { name: 'Chrome PDF Viewer', filename: 'internal-pdf-viewer' },
        { name: 'Native Client', filename: 'internal-nacl-plugin' },
    ],
});
Object.defineProperty(navigator, 'languages', { get: () => ['es-PE', 'es', 'en'] });
window.chrome = window.chrome || { runtime: {} };
"#;

/// URL patterns blocked on every page. Only fonts and media: the portal's
/// scripts, styles and the CAPTCHA image itself must keep loading.
const BLOCKED_URL_PATTERNS: &[&str] = &[
    "*.woff", "*.woff2", "*.ttf", "*.otf", "*.eot", "*.mp3", "*.mp4", "*.avi", "*.webm",
    "*.ogg", "*.wav",
];

/// Derive a realistic user agent from the engine's version product
/// (e.g. `HeadlessChrome/124.0.6367.78` becomes a matching desktop Chrome
/// UA).
pub fn realistic_user_agent(product: &str) -> String {
    let version = product
        .rsplit('/')
        .next()
        .filter(|v| !v.is_empty())
        .unwrap_or("124.0.0.0");
    format!(
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
         (KHTML, like Gecko) Chrome/{version} Safari/537.36"
    )
}

/// Apply the full anti-detection treatment to a fresh page.
pub async fn prepare_page(page: &Page, user_agent: &str) -> Result<(), AppError> {
    page.execute(SetUserAgentOverrideParams::new(user_agent))
        .await
        .map_err(|e| AppError::BrowserCrash(format!("set user agent: {e}")))?;

    page.execute(
        AddScriptToEvaluateOnNewDocumentParams::builder()
            .source(INIT_SCRIPT)
            .build()
            .map_err(AppError::Unknown)?,
    )
    .await
    .map_err(|e| AppError::BrowserCrash(format!("install init script: {e}")))?;

    page.execute(SetBlockedUrLsParams::new(
        BLOCKED_URL_PATTERNS
            .iter()
            .map(|p| (*p).to_string())
            .collect::<Vec<_>>(),
    ))
    .await
    .map_err(|e| AppError::BrowserCrash(format!("set blocked urls: {e}")))?;

    Ok(())
}

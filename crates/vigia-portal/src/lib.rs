//! Browser-facing adapters: the session pool, anti-detection patching, the
//! CAPTCHA strategy chain with its solver clients, the portal form client
//! and the attachment object store.

pub mod captcha;
pub mod extract;
pub mod object_store;
pub mod pool;
pub mod portal;
pub mod solver;
pub mod stealth;

pub use captcha::{
    AudioCodeStrategy, CaptchaChain, CaptchaOutcome, CaptchaStrategy, HostedChallengeStrategy,
    ImageCaptchaStrategy,
};
pub use object_store::FsObjectStore;
pub use pool::{BrowserPool, BrowserPoolConfig, PageLease, PoolStats};
pub use portal::{PortalClient, PortalConfig};
pub use solver::SolverClient;

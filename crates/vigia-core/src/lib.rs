//! Core scrape coordination engine: domain model, adaptive scheduler,
//! prioritized job pipeline, change detection and the worker that ties
//! them together. External collaborators (portal, repositories, object
//! store) plug in through the traits in [`traits`].

pub mod breaker;
pub mod diff;
pub mod error;
pub mod job;
pub mod job_store;
pub mod model;
pub mod normalize;
pub mod rate_limit;
pub mod schedule;
pub mod scheduler;
pub mod testutil;
pub mod traits;
pub mod util;
pub mod worker;

pub use breaker::{BreakerConfig, PortalBreaker};
pub use diff::{detect, Detection};
pub use error::AppError;
pub use job::{EnqueueRequest, JobState, Lane, Priority, RetryPolicy, ScrapeJob, WorkerConfig};
pub use job_store::{JobStore, LaneCounts};
pub use normalize::CanonicalBinnacle;
pub use rate_limit::{RateLimitConfig, RateLimitedJobStore, TokenBucket};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use traits::{JobLog, ObjectStore, PlanStore, Portal, ScrapeStore};
pub use worker::{LaneGate, TracingWorkerReporter, WorkerService};

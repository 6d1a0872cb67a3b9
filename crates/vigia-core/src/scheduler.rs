//! Periodic planner: selects due case files and enqueues deduplicated
//! monitor batches.

use std::time::Duration;

use chrono::Utc;
use chrono_tz::Tz;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::job::EnqueueRequest;
use crate::job_store::JobStore;
use crate::schedule::{is_due, priority_for, FrequencyConfig};
use crate::traits::PlanStore;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Interval between planning ticks.
    pub interval: Duration,
    /// Timezone for calendar-day dedup keys and delivery-hour math.
    pub timezone: Tz,
    pub frequency: FrequencyConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10 * 60),
            timezone: chrono_tz::America::Lima,
            frequency: FrequencyConfig::default(),
        }
    }
}

/// Result of one planning tick, for logging and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub tenants_seen: usize,
    pub case_files_seen: usize,
    pub jobs_enqueued: usize,
}

/// Periodic planner over the plan store and the job queue.
pub struct Scheduler<P, J>
where
    P: PlanStore,
    J: JobStore,
{
    store: P,
    jobs: J,
    config: SchedulerConfig,
    /// Reentrancy guard: a tick that finds this held is dropped, not queued.
    tick_guard: tokio::sync::Mutex<()>,
}

impl<P, J> Scheduler<P, J>
where
    P: PlanStore,
    J: JobStore,
{
    pub fn new(store: P, jobs: J, config: SchedulerConfig) -> Self {
        Self {
            store,
            jobs,
            config,
            tick_guard: tokio::sync::Mutex::new(()),
        }
    }

    /// Run ticks until cancellation. The in-flight tick finishes before the
    /// loop exits.
    pub async fn run(&self, cancel_token: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                () = cancel_token.cancelled() => break,
            }

            match self.tick().await {
                Ok(Some(report)) => {
                    tracing::info!(
                        tenants = report.tenants_seen,
                        case_files = report.case_files_seen,
                        enqueued = report.jobs_enqueued,
                        "Scheduler tick complete"
                    );
                }
                Ok(None) => {
                    tracing::warn!("Previous scheduler tick still running; skipping");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Scheduler tick failed");
                }
            }
        }

        tracing::info!("Scheduler stopped");
    }

    /// One planning pass. Returns `None` if a previous tick is still
    /// running.
    pub async fn tick(&self) -> Result<Option<TickReport>, AppError> {
        let Ok(_guard) = self.tick_guard.try_lock() else {
            return Ok(None);
        };

        let mut report = TickReport::default();
        let now = Utc::now();
        let today = now.with_timezone(&self.config.timezone).date_naive();

        let schedules = self.store.monitoring_schedules().await?;
        report.tenants_seen = schedules.len();

        for schedule in schedules {
            let case_files = self.store.eligible_case_files(schedule.tenant_id).await?;
            if case_files.is_empty() {
                continue;
            }
            report.case_files_seen += case_files.len();

            let ids: Vec<_> = case_files.iter().map(|cf| cf.id).collect();
            let snapshots = self.store.snapshots_for(&ids).await?;

            for case_file in case_files {
                let snapshot = snapshots.get(&case_file.id);
                if !is_due(now, case_file.created_at, snapshot, &self.config.frequency) {
                    continue;
                }

                let priority = priority_for(now, self.config.timezone, &schedule.hours);
                let request = EnqueueRequest::monitor(
                    case_file.id,
                    case_file.tenant_id,
                    case_file.external_case_number.clone(),
                    priority,
                    today,
                );

                self.jobs.enqueue(request).await?;
                report.jobs_enqueued += 1;
            }
        }

        metrics::counter!("vigia_scheduler_jobs_enqueued_total")
            .increment(report.jobs_enqueued as u64);

        Ok(Some(report))
    }
}

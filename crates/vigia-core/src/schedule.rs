//! Adaptive scrape frequency and deadline-driven priority.
//!
//! Pure functions: the scheduler feeds them tenant schedules, case-file
//! ages and snapshot timestamps; they decide who is due and how urgently.

use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::job::Priority;
use crate::model::SnapshotSummary;

/// Thresholds (in days) for the adaptive frequency rule.
#[derive(Debug, Clone)]
pub struct FrequencyConfig {
    /// Cases younger than this are scraped on every tick.
    pub young_case_days: i64,
    /// Cases that changed within this window are scraped on every tick.
    pub active_change_days: i64,
    /// Unchanged for longer than this: weekly.
    pub very_stale_days: i64,
    pub very_stale_rescrape_days: i64,
    /// Unchanged for longer than this (but not very stale): every 3 days.
    pub high_stale_days: i64,
    pub high_stale_rescrape_days: i64,
    /// Everything else: daily.
    pub moderate_rescrape_days: i64,
}

impl Default for FrequencyConfig {
    fn default() -> Self {
        Self {
            young_case_days: 7,
            active_change_days: 7,
            very_stale_days: 90,
            very_stale_rescrape_days: 7,
            high_stale_days: 30,
            high_stale_rescrape_days: 3,
            moderate_rescrape_days: 1,
        }
    }
}

/// Decide whether a case file is due for scraping this tick.
pub fn is_due(
    now: DateTime<Utc>,
    created_at: DateTime<Utc>,
    snapshot: Option<&SnapshotSummary>,
    config: &FrequencyConfig,
) -> bool {
    // Young cases move fast on the portal; scrape unconditionally.
    if (now - created_at).num_days() < config.young_case_days {
        return true;
    }

    let Some(snapshot) = snapshot else {
        // Never scraped successfully.
        return true;
    };

    let days_since_scrape = (now - snapshot.last_scraped_at).num_days();

    if let Some(changed_at) = snapshot.last_changed_at {
        let days_since_change = (now - changed_at).num_days();
        if days_since_change < config.active_change_days {
            return true;
        }
        if days_since_change > config.very_stale_days {
            return days_since_scrape >= config.very_stale_rescrape_days;
        }
        if days_since_change > config.high_stale_days {
            return days_since_scrape >= config.high_stale_rescrape_days;
        }
    }

    days_since_scrape >= config.moderate_rescrape_days
}

/// Fallback deadline when a tenant has no configured delivery hours.
const END_OF_DAY: (u32, u32) = (23, 59);

/// Compute a job's priority from the nearest upcoming delivery hour.
///
/// `now` is the current instant; hours are wall-clock times in the
/// configured zone. An hour earlier than now today rolls to tomorrow.
pub fn priority_for(now: DateTime<Utc>, tz: Tz, hours: &[NaiveTime]) -> Priority {
    let local = now.with_timezone(&tz);

    let fallback = NaiveTime::from_hms_opt(END_OF_DAY.0, END_OF_DAY.1, 0)
        .unwrap_or(NaiveTime::MIN);
    let candidates: &[NaiveTime] = if hours.is_empty() {
        std::slice::from_ref(&fallback)
    } else {
        hours
    };

    let mut min_minutes: i64 = i64::MAX;
    for hour in candidates {
        let today = local.date_naive().and_time(*hour);
        let occurrence = match tz.from_local_datetime(&today).earliest() {
            Some(t) if t > local => t,
            // Already past (or DST gap): same time tomorrow.
            _ => {
                let tomorrow = local
                    .date_naive()
                    .succ_opt()
                    .unwrap_or(local.date_naive())
                    .and_time(*hour);
                match tz.from_local_datetime(&tomorrow).earliest() {
                    Some(t) => t,
                    None => continue,
                }
            }
        };
        min_minutes = min_minutes.min((occurrence - local).num_minutes());
    }

    match min_minutes {
        m if m < 60 => Priority::Critical,
        m if m < 180 => Priority::High,
        m if m < 360 => Priority::Medium,
        _ => Priority::Low,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const TZ: Tz = chrono_tz::America::Lima;

    fn days_ago(n: i64) -> DateTime<Utc> {
        Utc::now() - Duration::days(n)
    }

    fn snapshot(scraped_days_ago: i64, changed_days_ago: Option<i64>) -> SnapshotSummary {
        SnapshotSummary {
            last_scraped_at: days_ago(scraped_days_ago),
            last_changed_at: changed_days_ago.map(days_ago),
        }
    }

    #[test]
    fn young_case_is_always_due() {
        let config = FrequencyConfig::default();
        let snap = snapshot(0, Some(60));
        assert!(is_due(Utc::now(), days_ago(3), Some(&snap), &config));
    }

    #[test]
    fn missing_snapshot_is_due() {
        let config = FrequencyConfig::default();
        assert!(is_due(Utc::now(), days_ago(100), None, &config));
    }

    #[test]
    fn recently_active_is_due_every_tick() {
        let config = FrequencyConfig::default();
        let snap = snapshot(0, Some(2));
        assert!(is_due(Utc::now(), days_ago(100), Some(&snap), &config));
    }

    #[test]
    fn very_stale_is_weekly() {
        let config = FrequencyConfig::default();
        let not_yet = snapshot(5, Some(120));
        assert!(!is_due(Utc::now(), days_ago(200), Some(&not_yet), &config));

        let due = snapshot(8, Some(120));
        assert!(is_due(Utc::now(), days_ago(200), Some(&due), &config));
    }

    #[test]
    fn high_stale_is_every_three_days() {
        let config = FrequencyConfig::default();
        let not_yet = snapshot(2, Some(45));
        assert!(!is_due(Utc::now(), days_ago(200), Some(&not_yet), &config));

        let due = snapshot(3, Some(45));
        assert!(is_due(Utc::now(), days_ago(200), Some(&due), &config));
    }

    #[test]
    fn moderate_is_daily() {
        let config = FrequencyConfig::default();
        let scraped_today = snapshot(0, Some(15));
        assert!(!is_due(
            Utc::now(),
            days_ago(200),
            Some(&scraped_today),
            &config
        ));

        let scraped_yesterday = snapshot(1, Some(15));
        assert!(is_due(
            Utc::now(),
            days_ago(200),
            Some(&scraped_yesterday),
            &config
        ));
    }

    #[test]
    fn never_changed_falls_back_to_daily() {
        let config = FrequencyConfig::default();
        let snap = snapshot(1, None);
        assert!(is_due(Utc::now(), days_ago(200), Some(&snap), &config));

        let fresh = snapshot(0, None);
        assert!(!is_due(Utc::now(), days_ago(200), Some(&fresh), &config));
    }

    fn at_local(h: u32, m: u32) -> DateTime<Utc> {
        let today = Utc::now().with_timezone(&TZ).date_naive();
        TZ.from_local_datetime(&today.and_time(NaiveTime::from_hms_opt(h, m, 0).unwrap()))
            .earliest()
            .unwrap()
            .with_timezone(&Utc)
    }

    fn hour(h: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, 0, 0).unwrap()
    }

    #[test]
    fn priority_tiers_by_time_until_delivery() {
        let now = at_local(8, 30);
        assert_eq!(priority_for(now, TZ, &[hour(9)]), Priority::Critical);
        assert_eq!(priority_for(now, TZ, &[hour(11)]), Priority::High);
        assert_eq!(priority_for(now, TZ, &[hour(14)]), Priority::Medium);
        assert_eq!(priority_for(now, TZ, &[hour(20)]), Priority::Low);
    }

    #[test]
    fn priority_picks_nearest_future_hour() {
        let now = at_local(8, 30);
        assert_eq!(
            priority_for(now, TZ, &[hour(20), hour(9)]),
            Priority::Critical
        );
    }

    #[test]
    fn priority_past_hour_rolls_to_tomorrow() {
        let now = at_local(23, 30);
        // 9:00 already passed today; next occurrence is in ~9.5 hours.
        assert_eq!(priority_for(now, TZ, &[hour(9)]), Priority::Low);
    }

    #[test]
    fn priority_defaults_to_end_of_day() {
        let now = at_local(23, 30);
        // No hours configured: 23:59 is 29 minutes away.
        assert_eq!(priority_for(now, TZ, &[]), Priority::Critical);
    }
}

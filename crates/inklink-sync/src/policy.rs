//! Sync cadence: when is it worth waking the companion's radio?
//!
//! Hourly during the day; every four hours overnight while the device
//! owner is most likely asleep. Content changes and explicit refreshes
//! bypass the cadence entirely.

use chrono::{DateTime, Duration, TimeZone, Timelike, Utc};

use inklink_core::config::SyncConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPolicy {
    normal_interval: Duration,
    quiet_interval: Duration,
    quiet_start_hour: u32,
    quiet_end_hour: u32,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

fn seconds(secs: u64) -> Duration {
    Duration::seconds(secs.min(i32::MAX as u64) as i64)
}

impl SyncPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            normal_interval: seconds(config.normal_interval_secs),
            quiet_interval: seconds(config.quiet_interval_secs),
            quiet_start_hour: config.quiet_start_hour,
            quiet_end_hour: config.quiet_end_hour,
        }
    }

    /// Whether `hour` (0..24, local) falls in the quiet window. The window
    /// may wrap midnight.
    pub fn is_quiet_hour(&self, hour: u32) -> bool {
        if self.quiet_start_hour <= self.quiet_end_hour {
            hour >= self.quiet_start_hour && hour < self.quiet_end_hour
        } else {
            hour >= self.quiet_start_hour || hour < self.quiet_end_hour
        }
    }

    /// Sync interval in effect at `now`, judged by its local hour.
    pub fn interval_at<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Duration {
        if self.is_quiet_hour(now.hour()) {
            self.quiet_interval
        } else {
            self.normal_interval
        }
    }

    /// Earliest moment the cadence allows the next sync. Never synced
    /// means now.
    pub fn next_sync_time<Tz: TimeZone>(
        &self,
        now: &DateTime<Tz>,
        last_sync: Option<DateTime<Utc>>,
    ) -> DateTime<Utc> {
        match last_sync {
            Some(last) => last + self.interval_at(now),
            None => now.with_timezone(&Utc),
        }
    }

    pub fn should_sync<Tz: TimeZone>(
        &self,
        now: &DateTime<Tz>,
        last_sync: Option<DateTime<Utc>>,
        content_changed: bool,
        force: bool,
    ) -> bool {
        if force || content_changed {
            return true;
        }
        now.with_timezone(&Utc) >= self.next_sync_time(now, last_sync)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;

    fn at(hour: u32, minute: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(2 * 3600)
            .unwrap()
            .with_ymd_and_hms(2026, 5, 4, hour, minute, 0)
            .unwrap()
    }

    fn ago(now: &DateTime<FixedOffset>, minutes: i64) -> Option<DateTime<Utc>> {
        Some(now.with_timezone(&Utc) - Duration::minutes(minutes))
    }

    #[test]
    fn quiet_window_wraps_midnight() {
        let policy = SyncPolicy::default();
        for hour in [23, 0, 3, 7] {
            assert!(policy.is_quiet_hour(hour), "{hour} should be quiet");
        }
        for hour in [8, 12, 22] {
            assert!(!policy.is_quiet_hour(hour), "{hour} should not be quiet");
        }
    }

    #[test]
    fn never_synced_always_syncs() {
        let policy = SyncPolicy::default();
        assert!(policy.should_sync(&at(12, 0), None, false, false));
    }

    #[test]
    fn force_and_content_change_bypass_cadence() {
        let policy = SyncPolicy::default();
        let now = at(12, 0);
        assert!(!policy.should_sync(&now, ago(&now, 5), false, false));
        assert!(policy.should_sync(&now, ago(&now, 5), true, false));
        assert!(policy.should_sync(&now, ago(&now, 5), false, true));
    }

    #[test]
    fn daytime_interval_is_one_hour() {
        let policy = SyncPolicy::default();
        let now = at(14, 0);
        assert!(!policy.should_sync(&now, ago(&now, 59), false, false));
        assert!(policy.should_sync(&now, ago(&now, 60), false, false));
    }

    #[test]
    fn due_exactly_at_interval_not_a_second_before() {
        let policy = SyncPolicy::default();
        for (hour, interval) in [(14, Duration::hours(1)), (2, Duration::hours(4))] {
            let now = at(hour, 0);
            let due = now.with_timezone(&Utc) - interval;
            assert!(policy.should_sync(&now, Some(due), false, false), "hour {hour}");
            assert!(
                !policy.should_sync(&now, Some(due + Duration::seconds(1)), false, false),
                "hour {hour}"
            );
        }
    }

    #[test]
    fn night_interval_is_four_hours() {
        let policy = SyncPolicy::default();
        let now = at(2, 0);
        assert!(!policy.should_sync(&now, ago(&now, 90), false, false));
        assert!(!policy.should_sync(&now, ago(&now, 239), false, false));
        assert!(policy.should_sync(&now, ago(&now, 240), false, false));
    }

    #[test]
    fn interval_uses_local_hour_of_now() {
        let policy = SyncPolicy::default();
        // 23:30 local is 21:30 UTC; the local hour decides.
        let now = at(23, 30);
        assert_eq!(policy.interval_at(&now), Duration::hours(4));
        assert_eq!(policy.interval_at(&at(8, 0)), Duration::hours(1));
    }

    #[test]
    fn next_sync_time_adds_interval() {
        let policy = SyncPolicy::default();
        let now = at(10, 0);
        let last = ago(&now, 20);
        assert_eq!(
            policy.next_sync_time(&now, last),
            now.with_timezone(&Utc) + Duration::minutes(40)
        );
        assert_eq!(policy.next_sync_time(&now, None), now.with_timezone(&Utc));
    }
}

//! Time utilities for gatehoused
//!
//! Sessions, cooldowns and quota cycles are all expressed in wall-clock time
//! so they survive restarts of the service.
//!
//! # Mock Time for Development
//!
//! In debug builds, the `GATEHOUSE_MOCK_TIME` environment variable can be set
//! to override the system time for all time-sensitive operations. This is useful
//! for checking quota resets and cooldown expiry without waiting.
//!
//! Format: `YYYY-MM-DD HH:MM:SS` (e.g., `2025-12-25 23:59:30`)
//!
//! Example:
//! ```bash
//! GATEHOUSE_MOCK_TIME="2025-12-25 23:59:30" gatehoused
//! ```

use chrono::{DateTime, Local, LocalResult, NaiveDateTime, NaiveTime, TimeZone};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;

/// Environment variable name for mock time (debug builds only)
pub const MOCK_TIME_ENV_VAR: &str = "GATEHOUSE_MOCK_TIME";

/// Offset between mock time and real time, computed once at first use so
/// mock time keeps advancing.
static MOCK_TIME_OFFSET: OnceLock<Option<chrono::Duration>> = OnceLock::new();

#[allow(clippy::disallowed_methods)] // wraps Local::now()
fn get_mock_time_offset() -> Option<chrono::Duration> {
    *MOCK_TIME_OFFSET.get_or_init(|| {
        #[cfg(debug_assertions)]
        {
            let mock_time_str = std::env::var(MOCK_TIME_ENV_VAR).ok()?;
            let Ok(naive_dt) = NaiveDateTime::parse_from_str(&mock_time_str, "%Y-%m-%d %H:%M:%S")
            else {
                tracing::warn!(
                    mock_time = %mock_time_str,
                    expected_format = "%Y-%m-%d %H:%M:%S",
                    "Invalid mock time format"
                );
                return None;
            };

            let mock_dt = resolve_local(&Local, naive_dt);
            let offset = mock_dt.signed_duration_since(chrono::Local::now());
            tracing::info!(
                mock_time = %mock_time_str,
                offset_secs = offset.num_seconds(),
                "Mock time enabled"
            );
            Some(offset)
        }
        #[cfg(not(debug_assertions))]
        {
            None
        }
    })
}

/// Returns whether mock time is currently active.
pub fn is_mock_time_active() -> bool {
    get_mock_time_offset().is_some()
}

/// Get the current local time, respecting mock time settings in debug builds.
#[allow(clippy::disallowed_methods)]
pub fn now() -> DateTime<Local> {
    let real_now = chrono::Local::now();

    match get_mock_time_offset() {
        Some(offset) => real_now + offset,
        None => real_now,
    }
}

/// Time of day on the local wall clock, minute resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WallClock {
    pub hour: u8,
    pub minute: u8,
}

impl WallClock {
    pub const MIDNIGHT: WallClock = WallClock { hour: 0, minute: 0 };

    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        if hour < 24 && minute < 60 {
            Some(Self { hour, minute })
        } else {
            None
        }
    }

    /// Parse `HH:MM` (24-hour clock).
    pub fn parse(s: &str) -> Option<Self> {
        let (hour, minute) = s.trim().split_once(':')?;
        if hour.is_empty() || minute.len() != 2 {
            return None;
        }
        Self::new(hour.parse().ok()?, minute.parse().ok()?)
    }

    pub fn to_naive_time(self) -> NaiveTime {
        NaiveTime::from_hms_opt(self.hour as u32, self.minute as u32, 0).unwrap_or(NaiveTime::MIN)
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::MIDNIGHT
    }
}

impl fmt::Display for WallClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// Map a local date-time onto the timeline.
///
/// Ambiguous times (clocks turned back) take the earlier instant. Times that
/// fall in a gap (clocks turned forward) move to the first valid minute after
/// the gap.
pub fn resolve_local<Tz: TimeZone>(tz: &Tz, naive: NaiveDateTime) -> DateTime<Tz> {
    let mut candidate = naive;
    // Gaps are at most a couple of hours in practice.
    for _ in 0..(4 * 60) {
        match tz.from_local_datetime(&candidate) {
            LocalResult::Single(dt) => return dt,
            LocalResult::Ambiguous(earliest, _) => return earliest,
            LocalResult::None => candidate += chrono::Duration::minutes(1),
        }
    }
    tz.from_utc_datetime(&naive)
}

/// Start of the quota cycle containing `now`: the latest occurrence of
/// `reset` on the local wall clock that is not after `now`.
///
/// With a 23:00 reset, both 23:30 and 01:00 the next morning fall into the
/// cycle that began at 23:00.
pub fn cycle_start<Tz: TimeZone>(now: &DateTime<Tz>, reset: WallClock) -> DateTime<Tz> {
    let tz = now.timezone();
    let today = now.date_naive();
    let todays_reset = resolve_local(&tz, today.and_time(reset.to_naive_time()));
    if *now >= todays_reset {
        return todays_reset;
    }

    match today.pred_opt() {
        Some(yesterday) => resolve_local(&tz, yesterday.and_time(reset.to_naive_time())),
        None => todays_reset,
    }
}

/// Helper to format durations in human-readable form
pub fn format_duration(d: Duration) -> String {
    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Convert a possibly-negative chrono span into a std duration, clamping at zero.
pub fn non_negative(d: chrono::Duration) -> Duration {
    d.to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, FixedOffset, Timelike};

    fn at(h: u32, m: u32, day: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(3600)
            .unwrap()
            .with_ymd_and_hms(2025, 3, day, h, m, 0)
            .unwrap()
    }

    #[test]
    fn wall_clock_parse() {
        assert_eq!(WallClock::parse("00:00"), Some(WallClock::MIDNIGHT));
        assert_eq!(WallClock::parse("23:59"), WallClock::new(23, 59));
        assert_eq!(WallClock::parse("7:05"), WallClock::new(7, 5));
        assert_eq!(WallClock::parse("24:00"), None);
        assert_eq!(WallClock::parse("12:60"), None);
        assert_eq!(WallClock::parse("12:5"), None);
        assert_eq!(WallClock::parse("noon"), None);
        assert_eq!(WallClock::parse(""), None);
    }

    #[test]
    fn wall_clock_display() {
        assert_eq!(WallClock::new(7, 5).unwrap().to_string(), "07:05");
    }

    #[test]
    fn cycle_start_midnight_reset() {
        let reset = WallClock::MIDNIGHT;
        assert_eq!(cycle_start(&at(14, 30, 10), reset), at(0, 0, 10));
        assert_eq!(cycle_start(&at(0, 0, 10), reset), at(0, 0, 10));
    }

    #[test]
    fn cycle_start_late_reset_spans_midnight() {
        let reset = WallClock::new(23, 0).unwrap();
        // 23:30 and 01:00 the next day share the cycle that began at 23:00
        assert_eq!(cycle_start(&at(23, 30, 10), reset), at(23, 0, 10));
        assert_eq!(cycle_start(&at(1, 0, 11), reset), at(23, 0, 10));
        // 22:59 is still in the previous day's cycle
        assert_eq!(cycle_start(&at(22, 59, 11), reset), at(23, 0, 10));
    }

    #[test]
    fn cycle_start_crosses_month_boundary() {
        let reset = WallClock::new(6, 0).unwrap();
        let start = cycle_start(&at(5, 0, 1), reset);
        assert_eq!(start.month(), 2);
        assert_eq!(start.hour(), 6);
    }

    #[test]
    fn cycle_start_in_local_zone_is_not_after_now() {
        let now = now();
        let start = cycle_start(&now, WallClock::new(4, 0).unwrap());
        assert!(start <= now);
        assert!(now - start < chrono::Duration::hours(26));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
        assert_eq!(format_duration(Duration::from_secs(3661)), "1h 1m 1s");
    }

    #[test]
    fn non_negative_clamps() {
        assert_eq!(non_negative(chrono::Duration::seconds(-5)), Duration::ZERO);
        assert_eq!(non_negative(chrono::Duration::seconds(5)), Duration::from_secs(5));
    }

    #[test]
    fn test_mock_time_env_var_name() {
        assert_eq!(MOCK_TIME_ENV_VAR, "GATEHOUSE_MOCK_TIME");
    }

    #[test]
    fn test_now_consistency() {
        let t1 = now();
        std::thread::sleep(Duration::from_millis(50));
        let t2 = now();
        assert!(t2 > t1, "Time should advance forward");
    }
}

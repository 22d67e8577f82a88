use std::collections::HashMap;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

pub const DEFAULT_TIMEZONE: &str = "America/Los_Angeles";

/// Opening hours for one weekday, `start`/`end` as zero-padded `HH:MM`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DaySchedule {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub start: String,
    #[serde(default)]
    pub end: String,
}

/// Keyed by lowercase full weekday name (`monday` .. `sunday`).
pub type WeeklySchedule = HashMap<String, DaySchedule>;

/// Whether `now` falls inside the schedule, evaluated in `timezone`.
///
/// A day with no entry is open all day, a disabled day is closed. Both ends
/// of the window are inclusive. An unknown timezone counts as open.
pub fn is_within_schedule(
    schedule: &WeeklySchedule,
    timezone: Option<&str>,
    now: DateTime<Utc>,
) -> bool {
    let tz_name = timezone.filter(|t| !t.is_empty()).unwrap_or(DEFAULT_TIMEZONE);
    let tz: Tz = match tz_name.parse() {
        Ok(tz) => tz,
        Err(_) => {
            tracing::warn!(timezone = %tz_name, "Unknown schedule timezone, treating as available");
            return true;
        }
    };

    let local = now.with_timezone(&tz);
    let weekday = local.format("%A").to_string().to_lowercase();
    let current = local.format("%H:%M").to_string();

    let Some(day) = schedule.get(&weekday) else {
        tracing::debug!(%weekday, "No schedule for day, available");
        return true;
    };
    if !day.enabled {
        return false;
    }

    // Zero-padded HH:MM compares correctly as strings
    current.as_str() >= day.start.as_str() && current.as_str() <= day.end.as_str()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn weekdays(start: &str, end: &str) -> WeeklySchedule {
        ["monday", "tuesday", "wednesday", "thursday", "friday"]
            .into_iter()
            .map(|d| {
                (
                    d.to_string(),
                    DaySchedule {
                        enabled: true,
                        start: start.into(),
                        end: end.into(),
                    },
                )
            })
            .chain(std::iter::once((
                "sunday".to_string(),
                DaySchedule {
                    enabled: false,
                    start: String::new(),
                    end: String::new(),
                },
            )))
            .collect()
    }

    // 2025-01-06 is a Monday
    fn utc(day: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, day, h, m, 0).unwrap()
    }

    #[test]
    fn boundaries_are_inclusive() {
        let s = weekdays("09:00", "17:00");
        assert!(is_within_schedule(&s, Some("UTC"), utc(6, 9, 0)));
        assert!(is_within_schedule(&s, Some("UTC"), utc(6, 17, 0)));
        assert!(!is_within_schedule(&s, Some("UTC"), utc(6, 8, 59)));
        assert!(!is_within_schedule(&s, Some("UTC"), utc(6, 17, 1)));
    }

    #[test]
    fn missing_day_is_available_disabled_day_is_not() {
        let s = weekdays("09:00", "17:00");
        // Saturday has no entry
        assert!(is_within_schedule(&s, Some("UTC"), utc(11, 3, 0)));
        // Sunday is disabled
        assert!(!is_within_schedule(&s, Some("UTC"), utc(12, 12, 0)));
    }

    #[test]
    fn default_timezone_is_los_angeles() {
        let s = weekdays("09:00", "17:00");
        // Monday 16:30 UTC is 08:30 in Los Angeles
        assert!(!is_within_schedule(&s, None, utc(6, 16, 30)));
        // Monday 17:30 UTC is 09:30 in Los Angeles
        assert!(is_within_schedule(&s, None, utc(6, 17, 30)));
    }

    #[test]
    fn local_weekday_is_used() {
        let s = weekdays("00:00", "23:59");
        // Monday 03:00 UTC is still Sunday evening in Los Angeles
        assert!(!is_within_schedule(&s, Some("America/Los_Angeles"), utc(6, 3, 0)));
    }

    #[test]
    fn unknown_timezone_is_available() {
        let s = weekdays("09:00", "09:01");
        assert!(is_within_schedule(&s, Some("Mars/Olympus"), utc(12, 0, 0)));
    }
}

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

/// Decides whether an instant falls on an operationally critical day.
///
/// The decision depends only on the clock, never on caller-supplied flags.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CriticalDayCalendar {
    pub weekdays: Vec<Weekday>,
    pub dates: Vec<NaiveDate>,
    /// Local offset used to turn epoch time into a calendar day.
    pub utc_offset_minutes: i32,
}

impl Default for CriticalDayCalendar {
    fn default() -> Self {
        Self {
            weekdays: vec![Weekday::Sat],
            dates: Vec::new(),
            utc_offset_minutes: 0,
        }
    }
}

impl CriticalDayCalendar {
    pub fn never() -> Self {
        Self {
            weekdays: Vec::new(),
            dates: Vec::new(),
            utc_offset_minutes: 0,
        }
    }

    pub fn local_date(&self, now_ms: u64) -> Option<NaiveDate> {
        let offset = FixedOffset::east_opt(self.utc_offset_minutes.checked_mul(60)?)?;
        let millis = i64::try_from(now_ms).ok()?;
        let utc = DateTime::from_timestamp_millis(millis)?;
        Some(utc.with_timezone(&offset).date_naive())
    }

    pub fn is_critical_day(&self, now_ms: u64) -> bool {
        match self.local_date(now_ms) {
            Some(date) => self.weekdays.contains(&date.weekday()) || self.dates.contains(&date),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2024-06-15 12:00:00 UTC, a Saturday.
    const SATURDAY_NOON: u64 = 1_718_452_800_000;
    const DAY: u64 = 86_400_000;

    #[test]
    fn default_marks_saturdays() {
        let cal = CriticalDayCalendar::default();
        assert!(cal.is_critical_day(SATURDAY_NOON));
        assert!(!cal.is_critical_day(SATURDAY_NOON + DAY));
    }

    #[test]
    fn explicit_dates_and_offsets() {
        let cal = CriticalDayCalendar {
            weekdays: Vec::new(),
            dates: vec![NaiveDate::from_ymd_opt(2024, 6, 16).unwrap()],
            utc_offset_minutes: 0,
        };
        assert!(!cal.is_critical_day(SATURDAY_NOON));
        assert!(cal.is_critical_day(SATURDAY_NOON + DAY));

        // Saturday 12:00 UTC is already Sunday at UTC+13.
        let shifted = CriticalDayCalendar {
            utc_offset_minutes: 13 * 60,
            ..cal
        };
        assert!(shifted.is_critical_day(SATURDAY_NOON));
    }

    #[test]
    fn never_calendar_is_never_critical() {
        assert!(!CriticalDayCalendar::never().is_critical_day(SATURDAY_NOON));
    }
}

//! Off-peak gating in a fixed reference time zone.

use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;

use crate::config::WindowSettings;

/// Outcome of checking the off-peak window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowGate {
    Open,
    /// Closed; the next window opens at this instant.
    OpensAt(DateTime<Utc>),
}

/// Weekends are always open. On weekdays the window is `[start, end)` local
/// time and may wrap past midnight; `start == end` opens the whole day.
pub fn check_window(now: DateTime<Utc>, window: &WindowSettings) -> WindowGate {
    let tz = window.time_zone;
    let local = now.with_timezone(&tz);
    if is_weekend(local.weekday()) {
        return WindowGate::Open;
    }

    let (Some(start), Some(end)) = (
        NaiveTime::from_hms_opt(window.start_hour, window.start_minute, 0),
        NaiveTime::from_hms_opt(window.end_hour, window.end_minute, 0),
    ) else {
        return WindowGate::Open;
    };

    let time = local.time();
    let inside = if start == end {
        true
    } else if start < end {
        start <= time && time < end
    } else {
        time >= start || time < end
    };
    if inside {
        return WindowGate::Open;
    }

    let today = local.date_naive();
    let next = if time < start {
        Some((today, start))
    } else {
        // After Friday's window the next opening is Saturday midnight.
        today.checked_add_days(Days::new(1)).map(|day| {
            if is_weekend(day.weekday()) {
                (day, NaiveTime::MIN)
            } else {
                (day, start)
            }
        })
    };
    match next.and_then(|(day, at)| local_instant(tz, day, at)) {
        Some(opens) => WindowGate::OpensAt(opens),
        None => WindowGate::Open,
    }
}

fn is_weekend(day: Weekday) -> bool {
    matches!(day, Weekday::Sat | Weekday::Sun)
}

/// `day` at `time` in `tz`; a time skipped by a DST jump resolves one hour
/// later.
fn local_instant(tz: Tz, day: NaiveDate, time: NaiveTime) -> Option<DateTime<Utc>> {
    let naive = day.and_time(time);
    tz.from_local_datetime(&naive)
        .earliest()
        .or_else(|| {
            tz.from_local_datetime(&(naive + chrono::Duration::hours(1)))
                .earliest()
        })
        .map(|t| t.with_timezone(&Utc))
}

//! Observed NYSE holiday rules and one-off closures.
//!
//! The scheduled holidays are generated from the exchange's published rules
//! rather than stored as a flat table: fixed-date holidays shift to the
//! nearest weekday under the Saturday/Sunday observance convention (a
//! Saturday holiday is not observed; a Sunday holiday moves to Monday), and
//! the floating holidays are nth-weekday rules plus Good Friday from the
//! Gregorian Easter computus. One-off closures are listed explicitly.

use chrono::{Datelike, NaiveDate, Weekday};
use std::ops::RangeInclusive;

/// Years covered by the rules and closure list below.
pub const SUPPORTED_YEARS: RangeInclusive<i32> = 1990..=2034;

/// Full-day closures outside the scheduled holiday rules.
pub const UNSCHEDULED_CLOSURES: &[(i32, u32, u32)] = &[
    (1994, 4, 27),  // President Nixon funeral
    (2001, 9, 11),  // September 11 attacks
    (2001, 9, 12),
    (2001, 9, 13),
    (2001, 9, 14),
    (2004, 6, 11),  // President Reagan day of mourning
    (2007, 1, 2),   // President Ford day of mourning
    (2012, 10, 29), // Hurricane Sandy
    (2012, 10, 30),
    (2018, 12, 5),  // President G.H.W. Bush day of mourning
    (2025, 1, 9),   // President Carter day of mourning
];

/// Whether `date` (assumed to be a weekday in the supported range) is an
/// observed market holiday or unscheduled closure.
pub fn is_market_holiday(date: NaiveDate) -> bool {
    let year = date.year();

    if UNSCHEDULED_CLOSURES
        .iter()
        .any(|&(y, m, d)| y == year && m == date.month() && d == date.day())
    {
        return true;
    }

    // New Year's Day. When Jan 1 falls on a Saturday the exchange does not
    // observe it; a Sunday Jan 1 is observed the following Monday.
    if let Some(observed) = observed_fixed(year, 1, 1) {
        if date == observed {
            return true;
        }
    }

    // Martin Luther King Jr. Day, third Monday of January (observed since 1998).
    if year >= 1998 && date == nth_weekday(year, 1, Weekday::Mon, 3) {
        return true;
    }

    // Washington's Birthday, third Monday of February.
    if date == nth_weekday(year, 2, Weekday::Mon, 3) {
        return true;
    }

    // Good Friday, two days before Easter Sunday.
    if date == good_friday(year) {
        return true;
    }

    // Memorial Day, last Monday of May.
    if date == last_weekday(year, 5, Weekday::Mon) {
        return true;
    }

    // Juneteenth, observed since 2022.
    if year >= 2022 {
        if let Some(observed) = observed_fixed(year, 6, 19) {
            if date == observed {
                return true;
            }
        }
    }

    // Independence Day.
    if let Some(observed) = observed_fixed(year, 7, 4) {
        if date == observed {
            return true;
        }
    }

    // Labor Day, first Monday of September.
    if date == nth_weekday(year, 9, Weekday::Mon, 1) {
        return true;
    }

    // Thanksgiving, fourth Thursday of November.
    if date == nth_weekday(year, 11, Weekday::Thu, 4) {
        return true;
    }

    // Christmas Day.
    if let Some(observed) = observed_fixed(year, 12, 25) {
        if date == observed {
            return true;
        }
    }

    false
}

/// Observed date for a fixed holiday: Sunday moves to Monday, Saturday is
/// not observed (the preceding Friday observance was retired for Saturday
/// New Year's and is handled that way for July 4 / Christmas, which do use
/// the Friday).
fn observed_fixed(year: i32, month: u32, day: u32) -> Option<NaiveDate> {
    let date = NaiveDate::from_ymd_opt(year, month, day)?;
    match date.weekday() {
        Weekday::Sun => date.succ_opt(),
        Weekday::Sat => {
            // Jan 1 on a Saturday is skipped entirely; other fixed holidays
            // are observed the preceding Friday.
            if month == 1 && day == 1 {
                None
            } else {
                date.pred_opt()
            }
        }
        _ => Some(date),
    }
}

/// The `n`th `weekday` of a month (1-based `n`).
fn nth_weekday(year: i32, month: u32, weekday: Weekday, n: u32) -> NaiveDate {
    let first = NaiveDate::from_ymd_opt(year, month, 1).expect("valid month start");
    let offset = (7 + weekday.num_days_from_monday() as i64
        - first.weekday().num_days_from_monday() as i64)
        % 7;
    first + chrono::Duration::days(offset + 7 * (n as i64 - 1))
}

/// The last `weekday` of a month.
fn last_weekday(year: i32, month: u32, weekday: Weekday) -> NaiveDate {
    let last_day = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    }
    .expect("valid month start")
    .pred_opt()
    .expect("valid month end");
    let offset = (7 + last_day.weekday().num_days_from_monday() as i64
        - weekday.num_days_from_monday() as i64)
        % 7;
    last_day - chrono::Duration::days(offset)
}

/// Good Friday via the anonymous Gregorian Easter computus.
fn good_friday(year: i32) -> NaiveDate {
    let a = year % 19;
    let b = year / 100;
    let c = year % 100;
    let d = b / 4;
    let e = b % 4;
    let f = (b + 8) / 25;
    let g = (b - f + 1) / 3;
    let h = (19 * a + b - d - g + 15) % 30;
    let i = c / 4;
    let k = c % 4;
    let l = (32 + 2 * e + 2 * i - h - k) % 7;
    let m = (a + 11 * h + 22 * l) / 451;
    let month = (h + l - 7 * m + 114) / 31;
    let day = ((h + l - 7 * m + 114) % 31) + 1;
    let easter = NaiveDate::from_ymd_opt(year, month as u32, day as u32)
        .expect("computus yields a valid date");
    easter - chrono::Duration::days(2)
}

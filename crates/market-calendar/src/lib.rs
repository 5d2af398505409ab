//! US equity market trading calendar.
//!
//! Enumerates trading days, classifies dates as trading or non-trading, and
//! aligns deposit / rebalance cadences to the first trading day on or after
//! their logical scheduled date.

mod holidays;

use chrono::{Datelike, Duration, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use holidays::{SUPPORTED_YEARS, UNSCHEDULED_CLOSURES};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CalendarError {
    #[error("unknown calendar: {0}")]
    UnknownCalendar(String),

    #[error("date {0} is outside the embedded holiday tables")]
    OutOfRange(NaiveDate),
}

/// Scheduling cadence for deposits and calendar rebalances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cadence {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    Annually,
    EveryMarketDay,
}

/// Trading-day calendar for a named market (US equities only).
#[derive(Debug, Clone)]
pub struct MarketCalendar {
    name: String,
}

impl MarketCalendar {
    /// Build a calendar by name. `NYSE` (and its alias `US`) is the only
    /// supported table.
    pub fn new(name: &str) -> Result<Self, CalendarError> {
        match name {
            "NYSE" | "US" => Ok(Self { name: name.to_string() }),
            other => Err(CalendarError::UnknownCalendar(other.to_string())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether `date` is a trading day. Total over the supported year range.
    pub fn is_trading(&self, date: NaiveDate) -> Result<bool, CalendarError> {
        if !SUPPORTED_YEARS.contains(&date.year()) {
            return Err(CalendarError::OutOfRange(date));
        }
        let weekday = date.weekday();
        if weekday == Weekday::Sat || weekday == Weekday::Sun {
            return Ok(false);
        }
        Ok(!holidays::is_market_holiday(date))
    }

    /// Strictly increasing list of trading days in `[start, end]`.
    pub fn trading_days(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<NaiveDate>, CalendarError> {
        let mut days = Vec::new();
        let mut current = start;
        while current <= end {
            if self.is_trading(current)? {
                days.push(current);
            }
            current += Duration::days(1);
        }
        Ok(days)
    }

    /// First trading day strictly after `date`.
    pub fn next_trading_day(&self, date: NaiveDate) -> Result<NaiveDate, CalendarError> {
        let mut current = date + Duration::days(1);
        loop {
            if self.is_trading(current)? {
                return Ok(current);
            }
            current += Duration::days(1);
        }
    }

    /// Last trading day strictly before `date`.
    pub fn previous_trading_day(&self, date: NaiveDate) -> Result<NaiveDate, CalendarError> {
        let mut current = date - Duration::days(1);
        loop {
            if self.is_trading(current)? {
                return Ok(current);
            }
            current -= Duration::days(1);
        }
    }

    /// `date` itself if it trades, otherwise the next trading day.
    pub fn on_or_after(&self, date: NaiveDate) -> Result<NaiveDate, CalendarError> {
        if self.is_trading(date)? {
            Ok(date)
        } else {
            self.next_trading_day(date)
        }
    }

    pub fn first_trading_day_of_month(
        &self,
        year: i32,
        month: u32,
    ) -> Result<NaiveDate, CalendarError> {
        let first = NaiveDate::from_ymd_opt(year, month, 1)
            .ok_or(CalendarError::OutOfRange(NaiveDate::MAX))?;
        self.on_or_after(first)
    }

    pub fn last_trading_day_of_month(
        &self,
        year: i32,
        month: u32,
    ) -> Result<NaiveDate, CalendarError> {
        let next_month = if month == 12 {
            NaiveDate::from_ymd_opt(year + 1, 1, 1)
        } else {
            NaiveDate::from_ymd_opt(year, month + 1, 1)
        }
        .ok_or(CalendarError::OutOfRange(NaiveDate::MAX))?;
        self.previous_trading_day(next_month)
    }

    /// First trading day of quarter 1-4 (Jan / Apr / Jul / Oct).
    pub fn first_trading_day_of_quarter(
        &self,
        year: i32,
        quarter: u32,
    ) -> Result<NaiveDate, CalendarError> {
        let month = (quarter - 1) * 3 + 1;
        self.first_trading_day_of_month(year, month)
    }

    pub fn first_trading_day_of_year(&self, year: i32) -> Result<NaiveDate, CalendarError> {
        self.first_trading_day_of_month(year, 1)
    }

    /// First trading day on or after the logical scheduled date that `date`
    /// falls in for `cadence`: the Monday of its week, the first of its
    /// month / quarter / year, or the date itself for daily cadences.
    pub fn align(&self, date: NaiveDate, cadence: Cadence) -> Result<NaiveDate, CalendarError> {
        match cadence {
            Cadence::Daily | Cadence::EveryMarketDay => self.on_or_after(date),
            Cadence::Weekly => {
                let offset = date.weekday().num_days_from_monday() as i64;
                self.on_or_after(date - Duration::days(offset))
            }
            Cadence::Monthly => self.first_trading_day_of_month(date.year(), date.month()),
            Cadence::Quarterly => {
                let quarter = (date.month() - 1) / 3 + 1;
                self.first_trading_day_of_quarter(date.year(), quarter)
            }
            Cadence::Annually => self.first_trading_day_of_year(date.year()),
        }
    }

    /// First scheduled trading date of the cadence period after the one
    /// containing `date`. Drives "next rebalance due" bookkeeping.
    pub fn next_occurrence(
        &self,
        date: NaiveDate,
        cadence: Cadence,
    ) -> Result<NaiveDate, CalendarError> {
        match cadence {
            Cadence::Daily | Cadence::EveryMarketDay => self.next_trading_day(date),
            Cadence::Weekly => {
                let days_to_monday = 7 - date.weekday().num_days_from_monday() as i64;
                self.on_or_after(date + Duration::days(days_to_monday))
            }
            Cadence::Monthly => {
                let (year, month) = if date.month() == 12 {
                    (date.year() + 1, 1)
                } else {
                    (date.year(), date.month() + 1)
                };
                self.first_trading_day_of_month(year, month)
            }
            Cadence::Quarterly => {
                let quarter = (date.month() - 1) / 3 + 1;
                let (year, quarter) = if quarter == 4 {
                    (date.year() + 1, 1)
                } else {
                    (date.year(), quarter + 1)
                };
                self.first_trading_day_of_quarter(year, quarter)
            }
            Cadence::Annually => self.first_trading_day_of_year(date.year() + 1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn nyse() -> MarketCalendar {
        MarketCalendar::new("NYSE").unwrap()
    }

    #[test]
    fn unknown_calendar_is_rejected() {
        assert!(matches!(
            MarketCalendar::new("LSE"),
            Err(CalendarError::UnknownCalendar(_))
        ));
    }

    #[test]
    fn out_of_range_date_errors() {
        let cal = nyse();
        assert!(matches!(
            cal.is_trading(ymd(1980, 6, 2)),
            Err(CalendarError::OutOfRange(_))
        ));
    }

    #[test]
    fn weekends_are_closed() {
        let cal = nyse();
        assert!(!cal.is_trading(ymd(2020, 3, 7)).unwrap()); // Saturday
        assert!(!cal.is_trading(ymd(2020, 3, 8)).unwrap()); // Sunday
        assert!(cal.is_trading(ymd(2020, 3, 9)).unwrap()); // Monday
    }

    #[test]
    fn fixed_holidays_observed() {
        let cal = nyse();
        assert!(!cal.is_trading(ymd(2020, 1, 1)).unwrap()); // New Year's Day
        assert!(!cal.is_trading(ymd(2020, 7, 3)).unwrap()); // July 4 observed (Sat)
        assert!(!cal.is_trading(ymd(2021, 7, 5)).unwrap()); // July 4 observed (Sun)
        assert!(!cal.is_trading(ymd(2020, 12, 25)).unwrap()); // Christmas
        assert!(!cal.is_trading(ymd(2022, 6, 20)).unwrap()); // Juneteenth observed (Sun)
        assert!(cal.is_trading(ymd(2021, 6, 18)).unwrap()); // Juneteenth not yet observed in 2021
    }

    #[test]
    fn floating_holidays_observed() {
        let cal = nyse();
        assert!(!cal.is_trading(ymd(2020, 1, 20)).unwrap()); // MLK, 3rd Monday Jan
        assert!(!cal.is_trading(ymd(2020, 2, 17)).unwrap()); // Washington's Birthday
        assert!(!cal.is_trading(ymd(2020, 4, 10)).unwrap()); // Good Friday
        assert!(!cal.is_trading(ymd(2020, 5, 25)).unwrap()); // Memorial Day
        assert!(!cal.is_trading(ymd(2020, 9, 7)).unwrap()); // Labor Day
        assert!(!cal.is_trading(ymd(2020, 11, 26)).unwrap()); // Thanksgiving
    }

    #[test]
    fn unscheduled_closures_observed() {
        let cal = nyse();
        assert!(!cal.is_trading(ymd(2001, 9, 11)).unwrap());
        assert!(!cal.is_trading(ymd(2012, 10, 29)).unwrap()); // Hurricane Sandy
        assert!(!cal.is_trading(ymd(2012, 10, 30)).unwrap());
        assert!(!cal.is_trading(ymd(2018, 12, 5)).unwrap()); // G.H.W. Bush mourning
    }

    #[test]
    fn trading_days_are_strictly_increasing_and_bounded() {
        let cal = nyse();
        let days = cal.trading_days(ymd(2020, 1, 1), ymd(2020, 1, 31)).unwrap();
        assert_eq!(days.first().copied(), Some(ymd(2020, 1, 2)));
        assert_eq!(days.last().copied(), Some(ymd(2020, 1, 31)));
        assert!(days.windows(2).all(|w| w[0] < w[1]));
        // Jan 2020: 23 weekdays minus New Year's Day and MLK.
        assert_eq!(days.len(), 21);
    }

    #[test]
    fn align_monthly_hits_first_trading_day() {
        let cal = nyse();
        // Jan 1 2022 was a Saturday; first trading day was Mon Jan 3.
        assert_eq!(cal.align(ymd(2022, 1, 15), Cadence::Monthly).unwrap(), ymd(2022, 1, 3));
        assert_eq!(cal.align(ymd(2020, 4, 1), Cadence::Quarterly).unwrap(), ymd(2020, 4, 1));
        assert_eq!(cal.align(ymd(2020, 6, 30), Cadence::Annually).unwrap(), ymd(2020, 1, 2));
    }

    #[test]
    fn align_weekly_lands_on_monday_or_after() {
        let cal = nyse();
        // Week of 2020-01-20: Monday is MLK, so the aligned day is Tuesday.
        assert_eq!(cal.align(ymd(2020, 1, 22), Cadence::Weekly).unwrap(), ymd(2020, 1, 21));
        assert_eq!(cal.align(ymd(2020, 3, 11), Cadence::Weekly).unwrap(), ymd(2020, 3, 9));
    }

    #[test]
    fn align_daily_shifts_holidays_forward() {
        let cal = nyse();
        assert_eq!(cal.align(ymd(2020, 7, 3), Cadence::Daily).unwrap(), ymd(2020, 7, 6));
    }

    #[test]
    fn next_occurrence_advances_one_period() {
        let cal = nyse();
        assert_eq!(
            cal.next_occurrence(ymd(2020, 1, 2), Cadence::Monthly).unwrap(),
            ymd(2020, 2, 3)
        );
        assert_eq!(
            cal.next_occurrence(ymd(2020, 2, 14), Cadence::Quarterly).unwrap(),
            ymd(2020, 4, 1)
        );
        assert_eq!(
            cal.next_occurrence(ymd(2020, 3, 9), Cadence::Weekly).unwrap(),
            ymd(2020, 3, 16)
        );
        assert_eq!(
            cal.next_occurrence(ymd(2020, 11, 5), Cadence::Annually).unwrap(),
            ymd(2021, 1, 4)
        );
    }
}

use chrono::NaiveDate;
use market_calendar::CalendarError;
use rust_decimal::Decimal;
use thiserror::Error;

pub type SimResult<T> = Result<T, SimError>;

/// Error taxonomy of the simulation core.
///
/// `ConfigurationInvalid` and `DataUnavailable` are fatal before or during
/// data load. `InsufficientCash` is recoverable by the rebalancer (the plan
/// is scaled down and a warning recorded); `InsufficientShares` indicates a
/// planning bug and is always fatal. `ContributionCapExceeded` is downgraded
/// to a warning by the driver unless the strict-fail policy is set.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SimError {
    #[error("invalid configuration: {0}")]
    ConfigurationInvalid(String),

    #[error("market data unavailable for {symbol} starting {date}")]
    DataUnavailable { symbol: String, date: NaiveDate },

    #[error("insufficient cash: need {needed}, have {available}")]
    InsufficientCash { needed: Decimal, available: Decimal },

    #[error("insufficient shares of {symbol}: need {needed}, have {available}")]
    InsufficientShares {
        symbol: String,
        needed: Decimal,
        available: Decimal,
    },

    #[error("{year} contribution cap {cap} would be exceeded by deposit of {attempted}")]
    ContributionCapExceeded {
        year: i32,
        cap: Decimal,
        attempted: Decimal,
    },

    #[error("cancelled by host")]
    CancelledByHost,

    #[error("internal consistency failure on {date}: {detail}")]
    InternalConsistency { date: NaiveDate, detail: String },

    #[error(transparent)]
    Calendar(#[from] CalendarError),
}

impl SimError {
    /// Whether this error aborts the simulation loop.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            SimError::InsufficientCash { .. } | SimError::ContributionCapExceeded { .. }
        )
    }
}

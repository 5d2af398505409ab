use std::collections::BTreeMap;

use chrono::NaiveDate;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::config::StrategyConfig;

/// Decimal places for share quantities.
pub const QTY_DP: u32 = 4;
/// Decimal places for cash amounts.
pub const CASH_DP: u32 = 2;
/// Decimal places for per-share cost basis.
pub const BASIS_DP: u32 = 6;

/// Holding ≤ 365 days (inclusive of the acquisition day) is short-term.
pub const SHORT_TERM_DAYS: i64 = 365;
/// Wash-sale window half-width in calendar days, both sides inclusive.
pub const WASH_SALE_DAYS: i64 = 30;
/// Annualization convention for daily series.
pub const TRADING_DAYS_PER_YEAR: f64 = 252.0;

/// Round a share quantity down to its ledger precision.
pub fn round_qty(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(QTY_DP, RoundingStrategy::ToZero)
}

/// Round a cash amount to the nearest cent.
pub fn round_cash(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(CASH_DP, RoundingStrategy::MidpointNearestEven)
}

/// Round a per-share basis to its ledger precision.
pub fn round_basis(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(BASIS_DP, RoundingStrategy::MidpointNearestEven)
}

/// One trading day of OHLCV data for a symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub date: NaiveDate,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub adj_close: Decimal,
    pub volume: f64,
}

/// Cash dividend declared on an ex-date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DividendAction {
    pub ex_date: NaiveDate,
    /// Amount per share.
    pub amount: Decimal,
    /// Fraction of the payment that is qualified, 0.0 to 1.0. Falls back
    /// to the account's configured default when absent.
    pub qualified_pct: Option<f64>,
}

/// Stock split effective on an ex-date. A ratio of 2 is a 2-for-1 split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitAction {
    pub ex_date: NaiveDate,
    pub ratio: Decimal,
}

pub type LotId = u64;
pub type TradeId = u64;

/// An open tax lot. Created by BUY or DRIP; its remaining quantity only
/// decreases (SELL) and its basis only changes through wash-sale attribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lot {
    pub id: LotId,
    pub symbol: String,
    pub original_quantity: Decimal,
    /// Remaining quantity; the lot is removed when this reaches zero.
    pub quantity: Decimal,
    pub basis_per_share: Decimal,
    pub acquisition_date: NaiveDate,
    /// Disallowed loss that was rolled into this lot's basis.
    pub wash_adjustment: Decimal,
    /// Whether any wash-sale attribution has landed on this lot.
    pub washed_in: bool,
}

impl Lot {
    /// Total remaining cost basis of the lot.
    pub fn cost_basis(&self) -> Decimal {
        round_cash(self.quantity * self.basis_per_share)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeAction {
    Buy,
    Sell,
    Drip,
    DividendCash,
    Deposit,
}

/// An executed ledger event. Append-only; ids increase monotonically over
/// the life of one simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: TradeId,
    pub date: NaiveDate,
    pub symbol: String,
    pub action: TradeAction,
    pub quantity: Decimal,
    pub price: Decimal,
    pub commission: Decimal,
    pub slippage: Decimal,
    /// Signed effect on cash: negative for buys, positive for sells,
    /// dividends, and deposits.
    pub cash_delta: Decimal,
    /// Lots created (BUY/DRIP) or consumed (SELL).
    pub lot_ids: Vec<LotId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GainTerm {
    ShortTerm,
    LongTerm,
}

/// Realized gain or loss from one lot portion consumed by a SELL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealizedEvent {
    pub date: NaiveDate,
    pub symbol: String,
    pub quantity: Decimal,
    pub proceeds: Decimal,
    pub cost_basis: Decimal,
    pub holding_days: i64,
    pub term: GainTerm,
    /// Portion of the loss disallowed by wash-sale attribution.
    pub wash_disallowed: Decimal,
}

impl RealizedEvent {
    /// Gain net of any wash-sale disallowance.
    pub fn recognized_gain(&self) -> Decimal {
        self.proceeds - self.cost_basis + self.wash_disallowed
    }
}

/// Derived per-symbol view over the open lots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub quantity: Decimal,
    pub market_value: Decimal,
    pub cost_basis: Decimal,
    pub unrealized_gain: Decimal,
    pub lots: Vec<Lot>,
}

/// Daily portfolio snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub date: NaiveDate,
    pub cash: Decimal,
    pub positions_value: Decimal,
    pub portfolio_value: Decimal,
    /// Net external cashflow posted on this day (deposits minus
    /// withdrawals); used to neutralize flows in the TWR series.
    pub net_cashflow: Decimal,
}

/// Year-end tax rollup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxYearSummary {
    pub year: i32,
    pub short_term_gains: Decimal,
    pub long_term_gains: Decimal,
    pub qualified_dividends: Decimal,
    pub ordinary_dividends: Decimal,
    pub interest_income: Decimal,
    pub total_tax: Decimal,
    pub wash_sale_count: u32,
}

/// Performance metrics over the simulated period. Ratios are `None` when
/// the series is too short, volatility is zero, or no benchmark was given.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    /// Chained time-weighted return over the whole period.
    pub twr: f64,
    pub irr: Option<f64>,
    pub cagr: f64,
    pub annual_vol: Option<f64>,
    pub sharpe: Option<f64>,
    pub sortino: Option<f64>,
    pub calmar: Option<f64>,
    /// Largest peak-to-trough decline, as a negative fraction.
    pub max_drawdown: f64,
    /// Days from peak to recovery, or to period end if unrecovered.
    pub max_drawdown_duration_days: i64,
    pub best_month: Option<f64>,
    pub worst_month: Option<f64>,
    pub best_quarter: Option<f64>,
    pub worst_quarter: Option<f64>,
    /// Fraction of months with a positive time-weighted return.
    pub hit_ratio: Option<f64>,
    pub alpha: Option<f64>,
    pub beta: Option<f64>,
    pub tracking_error: Option<f64>,
    pub information_ratio: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    DataGap,
    ContributionCap,
    PlanScaled,
    TradeFailed,
}

/// Non-fatal event surfaced alongside a successful result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimWarning {
    pub date: Option<NaiveDate>,
    pub kind: WarningKind,
    pub message: String,
}

/// The fatal error that truncated a partial run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimFailure {
    pub date: NaiveDate,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub trading_days: usize,
    pub rebalances_performed: u32,
    pub trades_executed: u32,
    /// End-of-period value after the account's withdrawal-tax equivalence.
    pub after_tax_value: Decimal,
}

/// Complete output bundle of one simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationResult {
    pub config: StrategyConfig,
    pub equity_curve: Vec<EquityPoint>,
    pub metrics: PerformanceReport,
    pub benchmark_metrics: BTreeMap<String, PerformanceReport>,
    pub benchmark_equity: BTreeMap<String, Vec<EquityPoint>>,
    pub trades: Vec<TradeRecord>,
    pub positions: Vec<Position>,
    pub realized_events: Vec<RealizedEvent>,
    pub tax_summaries: Vec<TaxYearSummary>,
    pub open_lots: Vec<Lot>,
    pub warnings: Vec<SimWarning>,
    pub diagnostics: Diagnostics,
    /// True when the run was truncated by cancellation or a mid-loop
    /// fatal error; days computed before the truncation are retained.
    pub partial: bool,
    pub failure: Option<SimFailure>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn quantity_rounds_toward_zero() {
        assert_eq!(round_qty(dec!(10.99999)), dec!(10.9999));
        assert_eq!(round_qty(dec!(0.00009)), dec!(0.0000));
    }

    #[test]
    fn basis_rounds_to_six_places() {
        assert_eq!(round_basis(dec!(33.3333333)), dec!(33.333333));
    }

    #[test]
    fn recognized_gain_adds_back_disallowed_loss() {
        let event = RealizedEvent {
            date: NaiveDate::from_ymd_opt(2020, 3, 2).unwrap(),
            symbol: "VTI".into(),
            quantity: dec!(100),
            proceeds: dec!(9000),
            cost_basis: dec!(10000),
            holding_days: 20,
            term: GainTerm::ShortTerm,
            wash_disallowed: dec!(1000),
        };
        assert_eq!(event.recognized_gain(), dec!(0));
    }
}

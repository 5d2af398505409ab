//! Benchmark equity curves: a parallel buy-and-hold of each benchmark
//! symbol with the same deposit schedule and dividend policy as the
//! strategy, marked over the same trading days.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use rust_decimal::Decimal;
use sim_core::{
    round_cash, round_qty, Bar, DividendAction, DividendMode, EquityPoint, SplitAction,
};

pub struct BenchmarkData<'a> {
    pub bars: &'a BTreeMap<NaiveDate, Bar>,
    pub dividends: &'a [DividendAction],
    pub splits: &'a [SplitAction],
}

/// Run a deposit-aware buy-and-hold of one symbol. Fresh cash (the opening
/// balance and every scheduled deposit) is swept into shares at that day's
/// close; dividends reinvest under DRIP or accumulate as cash otherwise.
pub fn replicate_buy_and_hold(
    data: &BenchmarkData<'_>,
    trading_days: &[NaiveDate],
    initial_cash: Decimal,
    deposit_dates: &BTreeSet<NaiveDate>,
    deposit_amount: Decimal,
    dividend_mode: DividendMode,
) -> Vec<EquityPoint> {
    let mut shares = Decimal::ZERO;
    // Cash waiting to be swept into shares, and cash that stays put
    // (CASH-mode dividends).
    let mut sweep = initial_cash;
    let mut idle = Decimal::ZERO;
    let mut last_close = Decimal::ZERO;
    let mut curve = Vec::with_capacity(trading_days.len());

    for date in trading_days {
        for split in data.splits.iter().filter(|s| s.ex_date == *date) {
            if split.ratio > Decimal::ZERO {
                shares = round_qty(shares * split.ratio);
            }
        }

        for dividend in data.dividends.iter().filter(|d| d.ex_date == *date) {
            let amount = round_cash(shares * dividend.amount);
            match dividend_mode {
                DividendMode::Drip => sweep += amount,
                DividendMode::Cash => idle += amount,
            }
        }

        let mut net_cashflow = Decimal::ZERO;
        if deposit_dates.contains(date) {
            sweep += deposit_amount;
            net_cashflow = deposit_amount;
        }

        if let Some(bar) = data.bars.get(date) {
            last_close = bar.close;
        }
        if last_close > Decimal::ZERO && sweep > Decimal::ZERO {
            let quantity = round_qty(sweep / last_close);
            let cost = round_cash(quantity * last_close);
            shares += quantity;
            sweep -= cost;
        }

        let positions_value = round_cash(shares * last_close);
        let cash = idle + sweep;
        curve.push(EquityPoint {
            date: *date,
            cash,
            positions_value,
            portfolio_value: cash + positions_value,
            net_cashflow,
        });
    }
    curve
}

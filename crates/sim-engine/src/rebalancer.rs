//! Rebalancing triggers and tax-aware trade-plan construction.
//!
//! The rebalancer only ever reads from the portfolio; it emits a plan of
//! sell and buy legs that the driver executes. Sell legs in taxable
//! accounts are ordered losses first, then long-term gains, with short-term
//! gains deferred to the end; buys follow the sells so the plan stays cash
//! feasible, scaling down proportionally when it would not.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use log::debug;
use market_calendar::{Cadence, MarketCalendar};
use rust_decimal::Decimal;
use sim_core::{
    round_cash, round_qty, AccountType, DriftRebalanceConfig, LotMethod, RebalanceType,
    RebalancingConfig, SimResult, SHORT_TERM_DAYS,
};

use crate::portfolio::{decimal_to_f64, Frictions, Portfolio};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebalanceReason {
    Calendar,
    Drift,
    Cashflow,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SellLeg {
    pub symbol: String,
    pub quantity: Decimal,
    /// Disposal-method override; `None` uses the portfolio's configured
    /// method. Taxable rebalance sells run HIFO to surface losses first.
    pub method: Option<LotMethod>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuyLeg {
    pub symbol: String,
    pub notional: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TradePlan {
    pub sells: Vec<SellLeg>,
    pub buys: Vec<BuyLeg>,
    /// True when buys were scaled down to keep the plan cash feasible.
    pub scaled: bool,
}

impl TradePlan {
    pub fn is_empty(&self) -> bool {
        self.sells.is_empty() && self.buys.is_empty()
    }
}

/// Ranking buckets for taxable sell ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum SellClass {
    Loss,
    LongGain,
    ShortGain,
}

pub struct Rebalancer {
    mode: RebalanceType,
    calendar_cadence: Option<Cadence>,
    drift: Option<DriftRebalanceConfig>,
    account_type: AccountType,
    frictions: Frictions,
    /// Cash inflows below this fraction of portfolio value do not trigger
    /// cashflow-driven deployment.
    deploy_threshold_pct: f64,
    next_calendar_due: Option<NaiveDate>,
}

impl Rebalancer {
    pub fn new(
        config: &RebalancingConfig,
        account_type: AccountType,
        frictions: Frictions,
        deploy_threshold_pct: f64,
    ) -> Self {
        Self {
            mode: config.mode,
            calendar_cadence: config.calendar.as_ref().map(|c| c.period.as_cadence()),
            drift: config.drift.clone(),
            account_type,
            frictions,
            deploy_threshold_pct,
            next_calendar_due: None,
        }
    }

    /// Set the first calendar due date. Aligning the period start means a
    /// simulation beginning on a scheduled day rebalances on that day.
    pub fn prime(&mut self, calendar: &MarketCalendar, start: NaiveDate) -> SimResult<()> {
        if let Some(cadence) = self.calendar_cadence {
            if uses_calendar(self.mode) {
                self.next_calendar_due = Some(calendar.align(start, cadence)?);
            }
        }
        Ok(())
    }

    /// Decide whether a rebalance is due today. `cash_inflow` is the cash
    /// added by deposits and cash dividends so far today.
    pub fn is_due(
        &mut self,
        calendar: &MarketCalendar,
        date: NaiveDate,
        current_weights: &BTreeMap<String, f64>,
        target_weights: &BTreeMap<String, f64>,
        cash_inflow: Decimal,
        total_value: Decimal,
    ) -> SimResult<Option<RebalanceReason>> {
        if self.mode == RebalanceType::CashflowOnly {
            if cash_inflow > Decimal::ZERO && total_value > Decimal::ZERO {
                let threshold = decimal_to_f64(total_value) * self.deploy_threshold_pct;
                if decimal_to_f64(cash_inflow) >= threshold {
                    return Ok(Some(RebalanceReason::Cashflow));
                }
            }
            return Ok(None);
        }

        if uses_calendar(self.mode) {
            if let (Some(due), Some(cadence)) = (self.next_calendar_due, self.calendar_cadence) {
                if date >= due {
                    self.next_calendar_due = Some(calendar.next_occurrence(date, cadence)?);
                    return Ok(Some(RebalanceReason::Calendar));
                }
            }
        }

        if uses_drift(self.mode) {
            if let Some(drift) = &self.drift {
                if drift_exceeded(drift, current_weights, target_weights) {
                    return Ok(Some(RebalanceReason::Drift));
                }
            }
        }

        Ok(None)
    }

    /// Plan that deploys `amount` of fresh cash toward the target weights
    /// without touching existing lots.
    pub fn deposit_plan(
        &self,
        target_weights: &BTreeMap<String, f64>,
        amount: Decimal,
        prices: &BTreeMap<String, Decimal>,
    ) -> TradePlan {
        let mut buys = Vec::new();
        if amount <= Decimal::ZERO {
            return TradePlan::default();
        }
        for (symbol, weight) in target_weights {
            if *weight <= 0.0 || !prices.contains_key(symbol) {
                continue;
            }
            let notional = round_cash(amount * to_decimal(*weight));
            if notional > Decimal::ZERO {
                buys.push(BuyLeg {
                    symbol: symbol.clone(),
                    notional,
                });
            }
        }
        TradePlan {
            sells: Vec::new(),
            buys,
            scaled: false,
        }
    }

    /// Full rebalance toward the target weights: sells ordered tax-aware,
    /// buys largest-underweight first, scaled to the cash the sells free up.
    pub fn build_plan(
        &self,
        portfolio: &Portfolio,
        target_weights: &BTreeMap<String, f64>,
        prices: &BTreeMap<String, Decimal>,
        date: NaiveDate,
    ) -> TradePlan {
        let total_value = portfolio.total_value(prices);
        if total_value <= Decimal::ZERO {
            return TradePlan::default();
        }

        // Union of targeted and held symbols; a held symbol that fell out
        // of the targets is sold down to zero.
        let mut symbols: BTreeSet<String> = target_weights.keys().cloned().collect();
        for position in portfolio.positions(prices) {
            symbols.insert(position.symbol);
        }

        // Anything below a dollar of drift is left alone.
        let min_trade = Decimal::ONE;

        let mut sells: Vec<(SellClass, Decimal, SellLeg)> = Vec::new();
        let mut underweights: Vec<(Decimal, String)> = Vec::new();

        for symbol in &symbols {
            let Some(price) = prices.get(symbol).copied().filter(|p| *p > Decimal::ZERO)
            else {
                continue;
            };
            let weight = target_weights.get(symbol).copied().unwrap_or(0.0);
            let target_value = round_cash(total_value * to_decimal(weight));
            let current_value = round_cash(portfolio.quantity(symbol) * price);
            let diff = current_value - target_value;

            if diff > min_trade {
                let quantity = round_qty(diff / price).min(portfolio.quantity(symbol));
                if quantity <= Decimal::ZERO {
                    continue;
                }
                let (class, magnitude, method) = if self.account_type.is_taxable() {
                    let (total_gain, short_gain) =
                        estimate_sale(portfolio, symbol, quantity, price, date);
                    if total_gain < Decimal::ZERO {
                        // Largest loss harvested first.
                        (SellClass::Loss, -total_gain, Some(LotMethod::Hifo))
                    } else if short_gain <= Decimal::ZERO {
                        (SellClass::LongGain, diff, Some(LotMethod::Hifo))
                    } else {
                        (SellClass::ShortGain, diff, Some(LotMethod::Hifo))
                    }
                } else {
                    (SellClass::LongGain, diff, None)
                };
                sells.push((
                    class,
                    magnitude,
                    SellLeg {
                        symbol: symbol.clone(),
                        quantity,
                        method,
                    },
                ));
            } else if diff < -min_trade {
                underweights.push((-diff, symbol.clone()));
            }
        }

        sells.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));
        underweights.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        // Cash feasibility: project the proceeds, then scale the buys.
        let mut projected_cash = portfolio.cash();
        for (_, _, leg) in &sells {
            if let Some(price) = prices.get(&leg.symbol) {
                let gross = leg.quantity * *price * (Decimal::ONE - self.frictions.slippage);
                projected_cash += round_cash(gross) - self.frictions.commission_per_trade;
            }
        }

        let total_buy: Decimal = underweights.iter().map(|(amount, _)| *amount).sum();
        let mut scaled = false;
        let mut buys = Vec::new();
        if total_buy > Decimal::ZERO && projected_cash > Decimal::ZERO {
            scaled = total_buy > projected_cash;
            let factor = if scaled {
                projected_cash / total_buy
            } else {
                Decimal::ONE
            };
            for (amount, symbol) in underweights {
                let notional = round_cash(amount * factor);
                if notional > Decimal::ZERO {
                    buys.push(BuyLeg { symbol, notional });
                }
            }
        }

        let plan = TradePlan {
            sells: sells.into_iter().map(|(_, _, leg)| leg).collect(),
            buys,
            scaled,
        };
        if !plan.is_empty() {
            debug!(
                "rebalance plan on {date}: {} sells, {} buys{}",
                plan.sells.len(),
                plan.buys.len(),
                if plan.scaled { " (scaled)" } else { "" }
            );
        }
        plan
    }
}

fn uses_calendar(mode: RebalanceType) -> bool {
    matches!(mode, RebalanceType::Calendar | RebalanceType::Both)
}

fn uses_drift(mode: RebalanceType) -> bool {
    matches!(mode, RebalanceType::Drift | RebalanceType::Both)
}

fn drift_exceeded(
    config: &DriftRebalanceConfig,
    current: &BTreeMap<String, f64>,
    target: &BTreeMap<String, f64>,
) -> bool {
    for (symbol, target_weight) in target {
        let current_weight = current.get(symbol).copied().unwrap_or(0.0);
        let deviation = (current_weight - target_weight).abs();
        if let Some(abs_pct) = config.abs_pct {
            if deviation > abs_pct {
                return true;
            }
        }
        if let Some(rel_pct) = config.rel_pct {
            if *target_weight > 0.0 && deviation / target_weight > rel_pct {
                return true;
            }
        }
    }
    false
}

/// Walk the symbol's lots in HIFO order for the hypothetical sale and split
/// the realized gain into total and short-term components.
fn estimate_sale(
    portfolio: &Portfolio,
    symbol: &str,
    quantity: Decimal,
    price: Decimal,
    date: NaiveDate,
) -> (Decimal, Decimal) {
    let mut lots: Vec<_> = portfolio.lots(symbol).iter().collect();
    lots.sort_by(|a, b| {
        b.basis_per_share
            .cmp(&a.basis_per_share)
            .then(a.acquisition_date.cmp(&b.acquisition_date))
    });

    let mut remaining = quantity;
    let mut total_gain = Decimal::ZERO;
    let mut short_gain = Decimal::ZERO;
    for lot in lots {
        if remaining <= Decimal::ZERO {
            break;
        }
        let take = remaining.min(lot.quantity);
        let gain = take * (price - lot.basis_per_share);
        total_gain += gain;
        if (date - lot.acquisition_date).num_days() <= SHORT_TERM_DAYS {
            short_gain += gain;
        }
        remaining -= take;
    }
    (total_gain, short_gain)
}

fn to_decimal(value: f64) -> Decimal {
    Decimal::from_f64_retain(value).unwrap_or_default()
}

//! The top-level daily simulation loop.
//!
//! Per trading day the order is fixed and observable: prices, splits,
//! dividends, deposits, signals, rebalance, expense drag, mark, year-end.
//! The only suspension points are the `PriceSource` calls, which all happen
//! before the loop starts; the loop itself is pure computation.
//!
//! Cancellation is observed at day boundaries and yields a result flagged
//! `partial`. A fatal mid-loop error also yields a partial result: the
//! equity curve ends at the prior day, and the `failure` field carries the
//! offending date and message.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{Datelike, NaiveDate};
use log::info;
use market_calendar::{Cadence, MarketCalendar};
use rayon::prelude::*;
use rust_decimal::Decimal;
use sim_core::{
    round_cash, Bar, CancelToken, DepositConfig, Diagnostics, DividendAction, DividendMode,
    EquityPoint, OrderTiming, PriceSource, RebalanceType, SimError, SimFailure, SimResult,
    SimWarning, SimulationResult, SplitAction, StrategyConfig, TaxYearSummary, WarningKind,
};
use tax_ledger::TaxLedger;

use crate::benchmark::{replicate_buy_and_hold, BenchmarkData};
use crate::metrics::MetricsEngine;
use crate::portfolio::{decimal_to_f64, CapPolicy, Frictions, Portfolio};
use crate::rebalancer::{RebalanceReason, Rebalancer, TradePlan};
use crate::signals::SignalEngine;

/// Preloaded market data for one symbol.
struct SymbolMarket {
    bars: BTreeMap<NaiveDate, Bar>,
    dividends: Vec<DividendAction>,
    splits: Vec<SplitAction>,
    expense_ratio: f64,
}

pub struct SimulationDriver<'a> {
    source: &'a dyn PriceSource,
}

impl<'a> SimulationDriver<'a> {
    pub fn new(source: &'a dyn PriceSource) -> Self {
        Self { source }
    }

    /// Execute the configured strategy. Deterministic: identical config and
    /// source data produce identical results.
    pub async fn run(
        &self,
        config: &StrategyConfig,
        cancel: &CancelToken,
    ) -> SimResult<SimulationResult> {
        config.validate()?;
        let calendar = MarketCalendar::new(&config.period.calendar)?;
        let days = calendar.trading_days(config.period.start, config.period.end)?;
        if days.is_empty() {
            return Err(SimError::ConfigurationInvalid(
                "period contains no trading days".into(),
            ));
        }

        info!(
            "loading data for {} symbols over {} trading days",
            config.universe.symbols.len(),
            days.len()
        );
        let market = self.load_universe(config, &days).await?;

        let frictions = Frictions::from(&config.frictions);
        let mut portfolio = Portfolio::new(
            config.initial_cash,
            config.account.account_type,
            config.lots.method,
            frictions,
            CapPolicy {
                annual_cap: config.contribution_cap(),
                allow_partial: config.account.contribution_caps.allow_partial,
            },
        );
        let mut ledger = TaxLedger::new(config.account.account_type, config.account.tax.clone());
        let mut rebalancer = Rebalancer::new(
            &config.rebalancing,
            config.account.account_type,
            frictions,
            config.dividends.reinvest_threshold_pct,
        );
        rebalancer.prime(&calendar, days[0])?;

        let signal_engine = SignalEngine::build(config, &close_series(&market, &days));
        let base_targets = config.target_weights();
        let deposit_dates = deposit_schedule(&calendar, config.deposits.as_ref(), &days)?;
        let daily_interest = config
            .frictions
            .cash_yield_apy
            .and_then(|apy| Decimal::from_f64_retain(apy / 252.0));

        let mut drag: BTreeMap<String, Decimal> = BTreeMap::new();
        let mut last_trade_price: BTreeMap<String, Decimal> = BTreeMap::new();
        let mut last_close: BTreeMap<String, Decimal> = BTreeMap::new();

        let mut equity_curve: Vec<EquityPoint> = Vec::with_capacity(days.len());
        let mut warnings: Vec<SimWarning> = Vec::new();
        let mut rebalances_performed = 0u32;
        let mut partial = false;
        let mut failure: Option<SimFailure> = None;

        for (i, date) in days.iter().copied().enumerate() {
            if cancel.is_cancelled() {
                partial = true;
                break;
            }

            // 1. Prices for the day. Delisted symbols keep their last marks.
            for (symbol, data) in &market {
                if let Some(bar) = data.bars.get(&date) {
                    let trade = match config.orders.timing {
                        OrderTiming::MarketOnOpen => bar.open,
                        OrderTiming::MarketOnClose => bar.close,
                    };
                    last_trade_price.insert(symbol.clone(), trade);
                    last_close.insert(symbol.clone(), bar.close);
                }
            }
            let trade_prices = last_trade_price.clone();

            // 2. Splits before dividends.
            for (symbol, data) in &market {
                for split in data.splits.iter().filter(|s| s.ex_date == date) {
                    portfolio.apply_split(symbol, split.ratio, date);
                }
            }

            // 3. Dividends, cash or DRIP. Cash-mode payouts count toward
            // the day's deployable inflow.
            let mut cash_inflow = Decimal::ZERO;
            let result = apply_dividends(
                config,
                &market,
                &last_close,
                date,
                &mut portfolio,
                &mut ledger,
                &mut cash_inflow,
            );
            if let Err(err) = result {
                partial = true;
                failure = Some(SimFailure {
                    date,
                    message: err.to_string(),
                });
                break;
            }

            // 4. Scheduled deposit; cap breaches downgrade to warnings.
            let mut net_cashflow = Decimal::ZERO;
            if deposit_dates.contains(&date) {
                if let Some(deposits) = &config.deposits {
                    match portfolio.deposit(deposits.amount, date) {
                        Ok(credited) => {
                            if credited < deposits.amount {
                                warnings.push(SimWarning {
                                    date: Some(date),
                                    kind: WarningKind::ContributionCap,
                                    message: format!(
                                        "deposit reduced to {credited} by the contribution cap"
                                    ),
                                });
                            }
                            net_cashflow = credited;
                            cash_inflow += credited;
                        }
                        Err(err) => {
                            warnings.push(SimWarning {
                                date: Some(date),
                                kind: WarningKind::ContributionCap,
                                message: format!("deposit skipped: {err}"),
                            });
                        }
                    }
                }
            }

            // Idle-cash yield accrues as ordinary interest income.
            if let Some(rate) = daily_interest {
                if portfolio.cash() > Decimal::ZERO {
                    let interest = round_cash(portfolio.cash() * rate);
                    if interest > Decimal::ZERO {
                        portfolio.accrue_interest(interest);
                        ledger.record_interest(date, interest);
                    }
                }
            }

            // 5. Signals gate the target weights.
            let targets = signal_engine.gate_targets(&base_targets, i);

            // 6. Rebalance / deploy.
            let current_weights = portfolio.weights(&trade_prices);
            let total_value = portfolio.total_value(&trade_prices);
            let due = match rebalancer.is_due(
                &calendar,
                date,
                &current_weights,
                &targets,
                cash_inflow,
                total_value,
            ) {
                Ok(due) => due,
                Err(err) => {
                    partial = true;
                    failure = Some(SimFailure {
                        date,
                        message: err.to_string(),
                    });
                    break;
                }
            };

            let plan = if let Some(reason) = due {
                rebalances_performed += 1;
                match reason {
                    RebalanceReason::Cashflow => {
                        rebalancer.deposit_plan(&targets, portfolio.cash(), &trade_prices)
                    }
                    _ => rebalancer.build_plan(&portfolio, &targets, &trade_prices, date),
                }
            } else if net_cashflow > Decimal::ZERO
                && config.rebalancing.mode != RebalanceType::CashflowOnly
            {
                // Deposit days deploy the fresh cash without churning lots.
                rebalancer.deposit_plan(&targets, net_cashflow, &trade_prices)
            } else if i == 0 {
                // Initial deployment of the opening balance.
                rebalancer.build_plan(&portfolio, &targets, &trade_prices, date)
            } else {
                TradePlan::default()
            };

            if plan.scaled {
                warnings.push(SimWarning {
                    date: Some(date),
                    kind: WarningKind::PlanScaled,
                    message: "buy legs scaled down to available cash".into(),
                });
            }
            if let Err(err) = execute_plan(
                &plan,
                &trade_prices,
                date,
                &mut portfolio,
                &mut ledger,
                &mut warnings,
            ) {
                partial = true;
                failure = Some(SimFailure {
                    date,
                    message: err.to_string(),
                });
                break;
            }

            // 7. Daily expense-ratio drag on the accounting price.
            for (symbol, data) in &market {
                if data.expense_ratio > 0.0 {
                    if let Some(step) =
                        Decimal::from_f64_retain(1.0 - data.expense_ratio / 252.0)
                    {
                        let factor = drag.entry(symbol.clone()).or_insert(Decimal::ONE);
                        *factor *= step;
                    }
                }
            }

            // 8. Mark to the drag-adjusted close and record the day.
            let accounting_prices: BTreeMap<String, Decimal> = last_close
                .iter()
                .map(|(symbol, close)| {
                    let factor = drag.get(symbol).copied().unwrap_or(Decimal::ONE);
                    (symbol.clone(), *close * factor)
                })
                .collect();
            if let Err(err) = portfolio.verify_consistency(date) {
                partial = true;
                failure = Some(SimFailure {
                    date,
                    message: err.to_string(),
                });
                break;
            }
            let positions_value = portfolio.mark(&accounting_prices);
            equity_curve.push(EquityPoint {
                date,
                cash: portfolio.cash(),
                positions_value,
                portfolio_value: portfolio.cash() + positions_value,
                net_cashflow,
            });
            ledger.expire_wash_state(date);

            // 9. Year-end tax accrual on the last trading day of the year.
            let year_ends = match days.get(i + 1) {
                Some(next) => next.year() > date.year(),
                None => true,
            };
            if year_ends {
                let summary = ledger.close_year(date.year());
                if summary.total_tax > Decimal::ZERO && !config.account.tax.pay_taxes_from_external
                {
                    portfolio.deduct_tax(summary.total_tax);
                    info!("{} tax accrued for {}: {}", date.year(), date, summary.total_tax);
                }
            }
        }

        // Assemble the bundle from whatever was computed.
        let accounting_prices: BTreeMap<String, Decimal> = last_close
            .iter()
            .map(|(symbol, close)| {
                let factor = drag.get(symbol).copied().unwrap_or(Decimal::ONE);
                (symbol.clone(), *close * factor)
            })
            .collect();
        let positions = portfolio.positions(&accounting_prices);
        let unrealized: Decimal = positions.iter().map(|p| p.unrealized_gain).sum();
        let total_value = portfolio.total_value(&accounting_prices);
        let after_tax_value = ledger.after_tax_value(total_value, unrealized);

        let (benchmark_equity, benchmark_metrics) = self
            .run_benchmarks(config, &days, &deposit_dates, &mut warnings)
            .await;

        let primary_benchmark = config
            .benchmark
            .first()
            .and_then(|symbol| benchmark_equity.get(symbol));
        let metrics =
            MetricsEngine::default().compute(&equity_curve, primary_benchmark.map(Vec::as_slice));

        let mut tax_summaries: Vec<TaxYearSummary> = Vec::new();
        if let (Some(first), Some(last)) = (equity_curve.first(), equity_curve.last()) {
            for year in first.date.year()..=last.date.year() {
                tax_summaries.push(ledger.close_year(year));
            }
        }

        let diagnostics = Diagnostics {
            trading_days: equity_curve.len(),
            rebalances_performed,
            trades_executed: portfolio.trades().len() as u32,
            after_tax_value,
        };
        let open_lots = portfolio.open_lots();
        let trades = portfolio.into_trades();
        let realized_events = ledger.into_events();

        Ok(SimulationResult {
            config: config.clone(),
            equity_curve,
            metrics,
            benchmark_metrics,
            benchmark_equity,
            trades,
            positions,
            realized_events,
            tax_summaries,
            open_lots,
            warnings,
            diagnostics,
            partial,
            failure,
        })
    }

    /// Load and completeness-check the universe. A missing bar on a trading
    /// day is fatal unless the symbol is delisted as of that day.
    async fn load_universe(
        &self,
        config: &StrategyConfig,
        days: &[NaiveDate],
    ) -> SimResult<BTreeMap<String, SymbolMarket>> {
        let start = config.period.start;
        let end = config.period.end;
        let mut market = BTreeMap::new();

        for symbol in &config.universe.symbols {
            let bars = self.source.bars(symbol, start, end).await?;
            if bars.is_empty() {
                return Err(SimError::DataUnavailable {
                    symbol: symbol.clone(),
                    date: days[0],
                });
            }
            let by_date: BTreeMap<NaiveDate, Bar> =
                bars.into_iter().map(|b| (b.date, b)).collect();
            for day in days {
                if !by_date.contains_key(day) {
                    if self.source.is_delisted(symbol, *day).await? {
                        break;
                    }
                    return Err(SimError::DataUnavailable {
                        symbol: symbol.clone(),
                        date: *day,
                    });
                }
            }

            let dividends = self.source.dividends(symbol, start, end).await?;
            let splits = self.source.splits(symbol, start, end).await?;
            let expense_ratio = if config.frictions.use_actual_etf_er {
                self.source.expense_ratio(symbol).await?.unwrap_or(0.0)
            } else {
                0.0
            };
            market.insert(
                symbol.clone(),
                SymbolMarket {
                    bars: by_date,
                    dividends,
                    splits,
                    expense_ratio,
                },
            );
        }
        Ok(market)
    }

    /// Buy-and-hold replication of each benchmark with the same deposit
    /// schedule and dividend mode. Benchmarks are best-effort: missing data
    /// becomes a warning, not an error.
    async fn run_benchmarks(
        &self,
        config: &StrategyConfig,
        days: &[NaiveDate],
        deposit_dates: &BTreeSet<NaiveDate>,
        warnings: &mut Vec<SimWarning>,
    ) -> (
        BTreeMap<String, Vec<EquityPoint>>,
        BTreeMap<String, sim_core::PerformanceReport>,
    ) {
        let mut equity = BTreeMap::new();
        let mut metrics = BTreeMap::new();
        let deposit_amount = config
            .deposits
            .as_ref()
            .map(|d| d.amount)
            .unwrap_or(Decimal::ZERO);

        for symbol in &config.benchmark {
            let bars = match self.source.bars(symbol, config.period.start, config.period.end).await
            {
                Ok(bars) if !bars.is_empty() => bars,
                Ok(_) => {
                    warnings.push(SimWarning {
                        date: None,
                        kind: WarningKind::DataGap,
                        message: format!("no benchmark data for {symbol}"),
                    });
                    continue;
                }
                Err(err) => {
                    warnings.push(SimWarning {
                        date: None,
                        kind: WarningKind::DataGap,
                        message: format!("benchmark {symbol} failed to load: {err}"),
                    });
                    continue;
                }
            };
            let dividends = self
                .source
                .dividends(symbol, config.period.start, config.period.end)
                .await
                .unwrap_or_default();
            let splits = self
                .source
                .splits(symbol, config.period.start, config.period.end)
                .await
                .unwrap_or_default();
            let by_date: BTreeMap<NaiveDate, Bar> =
                bars.into_iter().map(|b| (b.date, b)).collect();

            let curve = replicate_buy_and_hold(
                &BenchmarkData {
                    bars: &by_date,
                    dividends: &dividends,
                    splits: &splits,
                },
                days,
                config.initial_cash,
                deposit_dates,
                deposit_amount,
                config.dividends.mode,
            );
            metrics.insert(symbol.clone(), MetricsEngine::default().compute(&curve, None));
            equity.insert(symbol.clone(), curve);
        }
        (equity, metrics)
    }
}

/// Aligned close series per symbol for the signal engine, carrying the last
/// close forward over any post-delisting gap.
fn close_series(
    market: &BTreeMap<String, SymbolMarket>,
    days: &[NaiveDate],
) -> BTreeMap<String, Vec<f64>> {
    market
        .iter()
        .map(|(symbol, data)| {
            let mut closes = Vec::with_capacity(days.len());
            let mut last = 0.0;
            for day in days {
                if let Some(bar) = data.bars.get(day) {
                    last = decimal_to_f64(bar.close);
                }
                closes.push(last);
            }
            (symbol.clone(), closes)
        })
        .collect()
}

/// The trading days on which a scheduled deposit lands: each logical
/// cadence date aligned to the first trading day on or after it.
fn deposit_schedule(
    calendar: &MarketCalendar,
    deposits: Option<&DepositConfig>,
    days: &[NaiveDate],
) -> SimResult<BTreeSet<NaiveDate>> {
    let mut dates = BTreeSet::new();
    let Some(config) = deposits else {
        return Ok(dates);
    };
    if config.amount <= Decimal::ZERO {
        return Ok(dates);
    }
    let cadence = config.cadence.as_cadence();
    match cadence {
        Cadence::Daily | Cadence::EveryMarketDay => {
            dates.extend(days.iter().copied());
        }
        _ => {
            let mut due = calendar.align(days[0], cadence)?;
            if due < days[0] {
                due = calendar.next_occurrence(days[0], cadence)?;
            }
            let last = days[days.len() - 1];
            while due <= last {
                dates.insert(due);
                due = calendar.next_occurrence(due, cadence)?;
            }
        }
    }
    Ok(dates)
}

fn apply_dividends(
    config: &StrategyConfig,
    market: &BTreeMap<String, SymbolMarket>,
    last_close: &BTreeMap<String, Decimal>,
    date: NaiveDate,
    portfolio: &mut Portfolio,
    ledger: &mut TaxLedger,
    cash_inflow: &mut Decimal,
) -> SimResult<()> {
    for (symbol, data) in market {
        for dividend in data.dividends.iter().filter(|d| d.ex_date == date) {
            let close = last_close.get(symbol).copied().unwrap_or(Decimal::ZERO);
            let qualified_pct = dividend
                .qualified_pct
                .unwrap_or(config.account.tax.qualified_dividend_pct);
            let before = portfolio.cash();
            portfolio.apply_dividend(
                symbol,
                dividend.amount,
                qualified_pct,
                date,
                config.dividends.mode,
                close,
                ledger,
            )?;
            if config.dividends.mode == DividendMode::Cash {
                *cash_inflow += portfolio.cash() - before;
            }
        }
    }
    Ok(())
}

fn execute_plan(
    plan: &TradePlan,
    prices: &BTreeMap<String, Decimal>,
    date: NaiveDate,
    portfolio: &mut Portfolio,
    ledger: &mut TaxLedger,
    warnings: &mut Vec<SimWarning>,
) -> SimResult<()> {
    for leg in &plan.sells {
        let Some(price) = prices.get(&leg.symbol).copied() else {
            continue;
        };
        // A sell that the plan computed from live positions must succeed;
        // anything else is a planning bug and aborts the run.
        portfolio.sell_shares(&leg.symbol, leg.quantity, price, date, leg.method, ledger)?;
    }
    for leg in &plan.buys {
        let Some(price) = prices.get(&leg.symbol).copied() else {
            continue;
        };
        let notional = leg.notional.min(portfolio.cash());
        if notional <= Decimal::ZERO {
            continue;
        }
        if let Err(err) = portfolio.buy_notional(&leg.symbol, notional, price, date, ledger) {
            match err {
                SimError::InsufficientCash { .. } => {
                    warnings.push(SimWarning {
                        date: Some(date),
                        kind: WarningKind::TradeFailed,
                        message: format!("buy of {} skipped: {err}", leg.symbol),
                    });
                }
                other => return Err(other),
            }
        }
    }
    Ok(())
}

/// Run several independent simulations in parallel against a shared,
/// thread-safe source. Each simulation is its own value computation; no
/// state is shared between them.
pub fn run_compare(
    source: &(dyn PriceSource),
    configs: &[StrategyConfig],
) -> Vec<SimResult<SimulationResult>> {
    configs
        .par_iter()
        .map(|config| {
            let driver = SimulationDriver::new(source);
            let cancel = CancelToken::new();
            futures::executor::block_on(driver.run(config, &cancel))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn monthly_deposit_schedule_aligns_forward() {
        let calendar = MarketCalendar::new("NYSE").unwrap();
        let days = calendar
            .trading_days(ymd(2020, 1, 2), ymd(2020, 4, 30))
            .unwrap();
        let config = DepositConfig {
            cadence: sim_core::DepositCadence::Monthly,
            amount: Decimal::from(500),
            day_rule: "FIRST_BUSINESS_DAY".into(),
            market_day_everyday: false,
        };
        let schedule = deposit_schedule(&calendar, Some(&config), &days).unwrap();
        // Feb 1 2020 was a Saturday; the deposit lands Monday Feb 3.
        assert_eq!(
            schedule.into_iter().collect::<Vec<_>>(),
            vec![ymd(2020, 1, 2), ymd(2020, 2, 3), ymd(2020, 3, 2), ymd(2020, 4, 1)]
        );
    }

    #[test]
    fn zero_amount_schedules_nothing() {
        let calendar = MarketCalendar::new("NYSE").unwrap();
        let days = calendar
            .trading_days(ymd(2020, 1, 2), ymd(2020, 3, 31))
            .unwrap();
        let config = DepositConfig {
            cadence: sim_core::DepositCadence::Monthly,
            amount: Decimal::ZERO,
            day_rule: "FIRST_BUSINESS_DAY".into(),
            market_day_everyday: false,
        };
        assert!(deposit_schedule(&calendar, Some(&config), &days)
            .unwrap()
            .is_empty());
    }
}

//! Performance metrics over the recorded equity series.
//!
//! Daily returns neutralize external cashflows (TWR convention); the IRR is
//! solved from the dated cashflow schedule by bracketing bisection with a
//! Newton refinement. Ratios degrade to `None` rather than fabricating
//! values: too few points, zero volatility, or a missing benchmark all
//! yield nulls.

use chrono::{Datelike, NaiveDate};
use sim_core::{EquityPoint, PerformanceReport, TRADING_DAYS_PER_YEAR};

use crate::portfolio::decimal_to_f64;

#[derive(Debug, Clone, Copy)]
pub struct MetricsOptions {
    /// Annual risk-free rate used by Sharpe and Sortino. Zero by default.
    pub risk_free_rate: f64,
}

impl Default for MetricsOptions {
    fn default() -> Self {
        Self {
            risk_free_rate: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsEngine {
    options: MetricsOptions,
}

impl MetricsEngine {
    pub fn new(options: MetricsOptions) -> Self {
        Self { options }
    }

    pub fn compute(
        &self,
        curve: &[EquityPoint],
        benchmark: Option<&[EquityPoint]>,
    ) -> PerformanceReport {
        if curve.len() < 2 {
            return empty_report();
        }

        let returns = daily_returns(curve);
        let twr = returns.iter().fold(1.0, |acc, r| acc * (1.0 + r)) - 1.0;

        let total_days = (curve[curve.len() - 1].date - curve[0].date).num_days().max(1);
        let cagr = if 1.0 + twr > 0.0 {
            (1.0 + twr).powf(365.0 / total_days as f64) - 1.0
        } else {
            -1.0
        };

        let rf_daily = (1.0 + self.options.risk_free_rate).powf(1.0 / TRADING_DAYS_PER_YEAR) - 1.0;
        let excess: Vec<f64> = returns.iter().map(|r| r - rf_daily).collect();
        let mean_excess = mean(&excess);

        let vol = std_dev(&returns);
        let annual_vol = if returns.len() >= 2 {
            Some(vol * TRADING_DAYS_PER_YEAR.sqrt())
        } else {
            None
        };

        let sharpe = annual_vol
            .filter(|v| *v > 0.0)
            .map(|v| mean_excess * TRADING_DAYS_PER_YEAR / v);

        let downside: Vec<f64> = excess.iter().copied().filter(|r| *r < 0.0).collect();
        let downside_dev = std_dev(&downside) * TRADING_DAYS_PER_YEAR.sqrt();
        let sortino = if !downside.is_empty() && downside_dev > 0.0 {
            Some(mean_excess * TRADING_DAYS_PER_YEAR / downside_dev)
        } else {
            None
        };

        let (max_drawdown, max_drawdown_duration_days) = max_drawdown(curve);
        let calmar = if max_drawdown < 0.0 {
            Some(cagr / max_drawdown.abs())
        } else {
            None
        };

        let monthly = period_returns(curve, &returns, PeriodKey::month);
        let quarterly = period_returns(curve, &returns, PeriodKey::quarter);
        let best_month = max_of(&monthly);
        let worst_month = min_of(&monthly);
        let best_quarter = max_of(&quarterly);
        let worst_quarter = min_of(&quarterly);
        let hit_ratio = if monthly.is_empty() {
            None
        } else {
            Some(monthly.iter().filter(|r| **r > 0.0).count() as f64 / monthly.len() as f64)
        };

        let irr = internal_rate_of_return(curve);

        let (alpha, beta, tracking_error, information_ratio) = benchmark
            .filter(|b| b.len() == curve.len() && b.len() >= 2)
            .map(|b| benchmark_stats(&returns, &daily_returns(b), rf_daily))
            .unwrap_or((None, None, None, None));

        PerformanceReport {
            twr,
            irr,
            cagr,
            annual_vol,
            sharpe,
            sortino,
            calmar,
            max_drawdown,
            max_drawdown_duration_days,
            best_month,
            worst_month,
            best_quarter,
            worst_quarter,
            hit_ratio,
            alpha,
            beta,
            tracking_error,
            information_ratio,
        }
    }
}

fn empty_report() -> PerformanceReport {
    PerformanceReport {
        twr: 0.0,
        irr: None,
        cagr: 0.0,
        annual_vol: None,
        sharpe: None,
        sortino: None,
        calmar: None,
        max_drawdown: 0.0,
        max_drawdown_duration_days: 0,
        best_month: None,
        worst_month: None,
        best_quarter: None,
        worst_quarter: None,
        hit_ratio: None,
        alpha: None,
        beta: None,
        tracking_error: None,
        information_ratio: None,
    }
}

/// Flow-adjusted daily returns: `(V_t - C_t) / V_{t-1} - 1`.
fn daily_returns(curve: &[EquityPoint]) -> Vec<f64> {
    curve
        .windows(2)
        .map(|w| {
            let prev = decimal_to_f64(w[0].portfolio_value);
            let current = decimal_to_f64(w[1].portfolio_value);
            let flow = decimal_to_f64(w[1].net_cashflow);
            if prev > 0.0 {
                (current - flow) / prev - 1.0
            } else {
                0.0
            }
        })
        .collect()
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

/// Largest peak-to-trough decline and its peak-to-recovery duration in
/// calendar days (to period end if the trough never recovers).
fn max_drawdown(curve: &[EquityPoint]) -> (f64, i64) {
    let values: Vec<f64> = curve
        .iter()
        .map(|p| decimal_to_f64(p.portfolio_value))
        .collect();

    let mut peak = values[0];
    let mut peak_idx = 0usize;
    let mut max_dd = 0.0f64;
    let mut dd_peak_idx = 0usize;
    let mut dd_trough_idx = 0usize;

    for (i, value) in values.iter().enumerate() {
        if *value > peak {
            peak = *value;
            peak_idx = i;
        } else if peak > 0.0 {
            let dd = (value - peak) / peak;
            if dd < max_dd {
                max_dd = dd;
                dd_peak_idx = peak_idx;
                dd_trough_idx = i;
            }
        }
    }

    if max_dd >= 0.0 {
        return (0.0, 0);
    }

    let peak_value = values[dd_peak_idx];
    let recovery_idx = (dd_trough_idx..values.len()).find(|i| values[*i] >= peak_value);
    let end = match recovery_idx {
        Some(i) => curve[i].date,
        None => curve[curve.len() - 1].date,
    };
    (max_dd, (end - curve[dd_peak_idx].date).num_days())
}

struct PeriodKey;

impl PeriodKey {
    fn month(date: NaiveDate) -> (i32, u32) {
        (date.year(), date.month())
    }

    fn quarter(date: NaiveDate) -> (i32, u32) {
        (date.year(), (date.month() - 1) / 3)
    }
}

/// Compound the daily returns within each calendar period.
fn period_returns(
    curve: &[EquityPoint],
    returns: &[f64],
    key: fn(NaiveDate) -> (i32, u32),
) -> Vec<f64> {
    let mut result = Vec::new();
    let mut current_key: Option<(i32, u32)> = None;
    let mut compounded = 1.0;

    for (i, r) in returns.iter().enumerate() {
        let date = curve[i + 1].date;
        let k = key(date);
        match current_key {
            Some(existing) if existing == k => {
                compounded *= 1.0 + r;
            }
            Some(_) => {
                result.push(compounded - 1.0);
                compounded = 1.0 + r;
                current_key = Some(k);
            }
            None => {
                compounded = 1.0 + r;
                current_key = Some(k);
            }
        }
    }
    if current_key.is_some() {
        result.push(compounded - 1.0);
    }
    result
}

fn max_of(values: &[f64]) -> Option<f64> {
    values.iter().copied().reduce(f64::max)
}

fn min_of(values: &[f64]) -> Option<f64> {
    values.iter().copied().reduce(f64::min)
}

/// OLS of strategy excess returns on benchmark excess returns, plus active
/// return statistics.
fn benchmark_stats(
    returns: &[f64],
    benchmark_returns: &[f64],
    rf_daily: f64,
) -> (Option<f64>, Option<f64>, Option<f64>, Option<f64>) {
    let n = returns.len().min(benchmark_returns.len());
    if n < 2 {
        return (None, None, None, None);
    }
    let excess_p: Vec<f64> = returns[..n].iter().map(|r| r - rf_daily).collect();
    let excess_b: Vec<f64> = benchmark_returns[..n].iter().map(|r| r - rf_daily).collect();

    let mean_p = mean(&excess_p);
    let mean_b = mean(&excess_b);
    let covariance = excess_p
        .iter()
        .zip(excess_b.iter())
        .map(|(p, b)| (p - mean_p) * (b - mean_b))
        .sum::<f64>()
        / n as f64;
    let variance_b = excess_b.iter().map(|b| (b - mean_b).powi(2)).sum::<f64>() / n as f64;

    let beta = if variance_b > 0.0 {
        Some(covariance / variance_b)
    } else {
        None
    };
    let alpha = beta.map(|beta| (mean_p - beta * mean_b) * TRADING_DAYS_PER_YEAR);

    let active: Vec<f64> = returns[..n]
        .iter()
        .zip(benchmark_returns[..n].iter())
        .map(|(p, b)| p - b)
        .collect();
    let tracking_error = {
        let te = std_dev(&active) * TRADING_DAYS_PER_YEAR.sqrt();
        if te > 0.0 {
            Some(te)
        } else {
            None
        }
    };
    let information_ratio =
        tracking_error.map(|te| mean(&active) * TRADING_DAYS_PER_YEAR / te);

    (alpha, beta, tracking_error, information_ratio)
}

/// Solve the IRR of the dated cashflow schedule implied by the curve: the
/// opening value and every external flow go in, the terminal value comes
/// out. Bracketing bisection to 1e-8 with a Newton polish on the result.
fn internal_rate_of_return(curve: &[EquityPoint]) -> Option<f64> {
    if curve.len() < 2 {
        return None;
    }
    let t0 = curve[0].date;
    let mut flows: Vec<(f64, f64)> = Vec::new();
    flows.push((0.0, -decimal_to_f64(curve[0].portfolio_value)));
    for point in &curve[1..curve.len() - 1] {
        let flow = decimal_to_f64(point.net_cashflow);
        if flow != 0.0 {
            flows.push(((point.date - t0).num_days() as f64 / 365.0, -flow));
        }
    }
    let last = &curve[curve.len() - 1];
    let terminal = decimal_to_f64(last.portfolio_value) - decimal_to_f64(last.net_cashflow);
    flows.push(((last.date - t0).num_days() as f64 / 365.0, terminal));

    if !flows.iter().any(|(_, v)| *v > 0.0) || !flows.iter().any(|(_, v)| *v < 0.0) {
        return None;
    }

    let npv = |rate: f64| -> f64 {
        flows
            .iter()
            .map(|(years, value)| value / (1.0 + rate).powf(*years))
            .sum()
    };

    let mut lo = -0.9999;
    let mut hi = 10.0;
    let mut npv_lo = npv(lo);
    while npv_lo * npv(hi) > 0.0 {
        hi *= 10.0;
        if hi > 1e6 {
            return None;
        }
    }

    for _ in 0..200 {
        let mid = (lo + hi) / 2.0;
        let value = npv(mid);
        if value.abs() < 1e-12 || (hi - lo) / 2.0 < 1e-8 {
            lo = mid;
            hi = mid;
            break;
        }
        if npv_lo * value < 0.0 {
            hi = mid;
        } else {
            lo = mid;
            npv_lo = value;
        }
    }
    let bisected = (lo + hi) / 2.0;

    // Newton refinement with a numerical derivative; keep the bisection
    // answer unless Newton actually improves on it.
    let mut refined = bisected;
    for _ in 0..20 {
        let value = npv(refined);
        let h = 1e-7;
        let derivative = (npv(refined + h) - value) / h;
        if derivative.abs() < 1e-12 {
            break;
        }
        let next = refined - value / derivative;
        if !next.is_finite() || next <= -1.0 {
            break;
        }
        if (next - refined).abs() < 1e-12 {
            refined = next;
            break;
        }
        refined = next;
    }
    if refined.is_finite() && npv(refined).abs() <= npv(bisected).abs() {
        Some(refined)
    } else {
        Some(bisected)
    }
}

//! Technical indicators and entry/exit rule evaluation.
//!
//! Indicators are computed over the close series; a rule evaluated on day
//! `t` only ever reads indicator state through day `t-1`, so no trade can
//! see the bar it executes on. Symbols whose exit rule has fired are gated
//! out of the target weights until their entry rules fire again.

use std::collections::BTreeMap;

use sim_core::{RuleOp, SignalConfig, SignalKind, StrategyConfig};

/// Simple moving average; `None` until the window fills.
pub fn sma(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if period == 0 || values.len() < period {
        return out;
    }
    let mut sum: f64 = values[..period].iter().sum();
    out[period - 1] = Some(sum / period as f64);
    for i in period..values.len() {
        sum += values[i] - values[i - period];
        out[i] = Some(sum / period as f64);
    }
    out
}

/// Exponential moving average seeded with the SMA of the first window.
pub fn ema(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if period == 0 || values.len() < period {
        return out;
    }
    let alpha = 2.0 / (period as f64 + 1.0);
    let seed: f64 = values[..period].iter().sum::<f64>() / period as f64;
    let mut current = seed;
    out[period - 1] = Some(current);
    for i in period..values.len() {
        current = alpha * values[i] + (1.0 - alpha) * current;
        out[i] = Some(current);
    }
    out
}

/// RSI over simple rolling means of gains and losses.
pub fn rsi(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if period == 0 || values.len() <= period {
        return out;
    }
    let deltas: Vec<f64> = values.windows(2).map(|w| w[1] - w[0]).collect();
    for i in period..=deltas.len() {
        let window = &deltas[i - period..i];
        let gain: f64 = window.iter().filter(|d| **d > 0.0).sum::<f64>() / period as f64;
        let loss: f64 = -window.iter().filter(|d| **d < 0.0).sum::<f64>() / period as f64;
        let value = if loss == 0.0 {
            100.0
        } else {
            100.0 - 100.0 / (1.0 + gain / loss)
        };
        // deltas[i-1] is the move into values[i].
        out[i] = Some(value);
    }
    out
}

/// MACD line, signal line, and histogram.
pub fn macd(
    values: &[f64],
    fast: usize,
    slow: usize,
    signal: usize,
) -> (Vec<Option<f64>>, Vec<Option<f64>>, Vec<Option<f64>>) {
    let ema_fast = ema(values, fast);
    let ema_slow = ema(values, slow);
    let line: Vec<Option<f64>> = ema_fast
        .iter()
        .zip(ema_slow.iter())
        .map(|(f, s)| match (f, s) {
            (Some(f), Some(s)) => Some(f - s),
            _ => None,
        })
        .collect();

    // The signal line is an EMA of the defined stretch of the MACD line.
    let defined: Vec<f64> = line.iter().flatten().copied().collect();
    let offset = line.len() - defined.len();
    let signal_defined = ema(&defined, signal);
    let mut signal_line = vec![None; offset];
    signal_line.extend(signal_defined);

    let histogram: Vec<Option<f64>> = line
        .iter()
        .zip(signal_line.iter())
        .map(|(m, s)| match (m, s) {
            (Some(m), Some(s)) => Some(m - s),
            _ => None,
        })
        .collect();
    (line, signal_line, histogram)
}

/// Return over `lookback - skip` periods (the classic 12-1 momentum when
/// called with 252 and 21).
pub fn momentum(values: &[f64], lookback: usize, skip: usize) -> Vec<Option<f64>> {
    let span = lookback.saturating_sub(skip);
    let mut out = vec![None; values.len()];
    if span == 0 {
        return out;
    }
    for i in span..values.len() {
        if values[i - span] != 0.0 {
            out[i] = Some(values[i] / values[i - span] - 1.0);
        }
    }
    out
}

/// Bollinger bands: (upper, middle, lower).
pub fn bollinger(
    values: &[f64],
    period: usize,
    std_devs: f64,
) -> (Vec<Option<f64>>, Vec<Option<f64>>, Vec<Option<f64>>) {
    let middle = sma(values, period);
    let mut upper = vec![None; values.len()];
    let mut lower = vec![None; values.len()];
    for i in 0..values.len() {
        if let Some(m) = middle[i] {
            let window = &values[i + 1 - period..=i];
            let variance =
                window.iter().map(|v| (v - m).powi(2)).sum::<f64>() / period as f64;
            let band = variance.sqrt() * std_devs;
            upper[i] = Some(m + band);
            lower[i] = Some(m - band);
        }
    }
    (upper, middle, lower)
}

/// Rolling maximum over the trailing `window` values, inclusive.
pub fn rolling_max(values: &[f64], window: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if window == 0 || values.len() < window {
        return out;
    }
    for i in window - 1..values.len() {
        out[i] = values[i + 1 - window..=i]
            .iter()
            .copied()
            .reduce(f64::max);
    }
    out
}

/// Boolean state series of one configured signal over a close series.
fn signal_state(config: &SignalConfig, closes: &[f64]) -> Vec<Option<bool>> {
    let param = |name: &str, default: f64| -> f64 {
        config.params.get(name).copied().unwrap_or(default)
    };
    let combine = |a: &[Option<f64>], b: &[Option<f64>]| -> Vec<Option<bool>> {
        a.iter()
            .zip(b.iter())
            .map(|(x, y)| match (x, y) {
                (Some(x), Some(y)) => Some(x > y),
                _ => None,
            })
            .collect()
    };

    match config.kind {
        SignalKind::SmaCross => {
            let fast = sma(closes, param("fast", 50.0) as usize);
            let slow = sma(closes, param("slow", 200.0) as usize);
            combine(&fast, &slow)
        }
        SignalKind::EmaCross => {
            let fast = ema(closes, param("fast", 12.0) as usize);
            let slow = ema(closes, param("slow", 26.0) as usize);
            combine(&fast, &slow)
        }
        SignalKind::Rsi => {
            let threshold = param("threshold", 30.0);
            rsi(closes, param("period", 14.0) as usize)
                .iter()
                .map(|v| v.map(|v| v > threshold))
                .collect()
        }
        SignalKind::Macd => {
            let (line, signal_line, _) = macd(
                closes,
                param("fast", 12.0) as usize,
                param("slow", 26.0) as usize,
                param("signal", 9.0) as usize,
            );
            combine(&line, &signal_line)
        }
        SignalKind::Momentum => momentum(
            closes,
            param("lookback", 252.0) as usize,
            param("skip", 21.0) as usize,
        )
        .iter()
        .map(|v| v.map(|v| v > 0.0))
        .collect(),
        SignalKind::Bollinger => {
            let (upper, _, _) = bollinger(
                closes,
                param("period", 20.0) as usize,
                param("std_dev", 2.0),
            );
            upper
                .iter()
                .zip(closes.iter())
                .map(|(u, c)| u.map(|u| *c > u))
                .collect()
        }
        SignalKind::Breakout52w => {
            let high = rolling_max(closes, param("window", 252.0) as usize);
            high.iter()
                .zip(closes.iter())
                .map(|(h, c)| h.map(|h| *c >= h))
                .collect()
        }
    }
}

/// Whether a rule fires on day `t`, reading only state through `t-1`.
fn rule_fires(op: RuleOp, states: &[Option<bool>], t: usize) -> bool {
    let at = |i: usize| states.get(i).copied().flatten();
    let yesterday = if t >= 1 { at(t - 1) } else { None };
    let before = if t >= 2 { at(t - 2) } else { None };
    match op {
        RuleOp::Above => yesterday == Some(true),
        RuleOp::Below => yesterday == Some(false),
        RuleOp::CrossUp => yesterday == Some(true) && before == Some(false),
        RuleOp::CrossDown => yesterday == Some(false) && before == Some(true),
    }
}

/// Pre-computed per-symbol eligibility over the trading-day sequence.
pub struct SignalEngine {
    eligibility: BTreeMap<String, Vec<bool>>,
    gated: bool,
}

impl SignalEngine {
    /// Build eligibility series from the configured signals and rules.
    /// `closes_by_symbol` must be aligned with the trading-day sequence.
    pub fn build(config: &StrategyConfig, closes_by_symbol: &BTreeMap<String, Vec<f64>>) -> Self {
        let gated = !(config.rules.entry.is_empty() && config.rules.exit.is_empty());
        if !gated {
            return Self {
                eligibility: BTreeMap::new(),
                gated,
            };
        }

        let mut eligibility = BTreeMap::new();
        for (symbol, closes) in closes_by_symbol {
            let states: BTreeMap<&str, Vec<Option<bool>>> = config
                .signals
                .iter()
                .map(|s| (s.id.as_str(), signal_state(s, closes)))
                .collect();

            let has_entry = !config.rules.entry.is_empty();
            let mut in_market = !has_entry;
            let mut series = Vec::with_capacity(closes.len());
            for t in 0..closes.len() {
                if in_market {
                    let exited = config
                        .rules
                        .exit
                        .iter()
                        .any(|r| states.get(r.signal.as_str()).is_some_and(|s| {
                            rule_fires(r.op, s, t)
                        }));
                    if exited {
                        in_market = false;
                    }
                } else if has_entry {
                    let entered = config
                        .rules
                        .entry
                        .iter()
                        .all(|r| states.get(r.signal.as_str()).is_some_and(|s| {
                            rule_fires(r.op, s, t)
                        }));
                    if entered {
                        in_market = true;
                    }
                }
                series.push(in_market);
            }
            eligibility.insert(symbol.clone(), series);
        }

        Self { eligibility, gated }
    }

    /// Whether any rules gate the targets at all.
    pub fn is_gated(&self) -> bool {
        self.gated
    }

    /// Whether `symbol` may be held on trading day `day_idx`.
    pub fn eligible(&self, symbol: &str, day_idx: usize) -> bool {
        if !self.gated {
            return true;
        }
        self.eligibility
            .get(symbol)
            .and_then(|series| series.get(day_idx).copied())
            .unwrap_or(true)
    }

    /// Target weights with ineligible symbols zeroed and the remainder
    /// renormalized. All-ineligible days go to cash.
    pub fn gate_targets(
        &self,
        targets: &BTreeMap<String, f64>,
        day_idx: usize,
    ) -> BTreeMap<String, f64> {
        if !self.gated {
            return targets.clone();
        }
        let live: f64 = targets
            .iter()
            .filter(|(symbol, _)| self.eligible(symbol, day_idx))
            .map(|(_, w)| *w)
            .sum();
        targets
            .iter()
            .map(|(symbol, weight)| {
                let gated = if live > 0.0 && self.eligible(symbol, day_idx) {
                    weight / live
                } else {
                    0.0
                };
                (symbol.clone(), gated)
            })
            .collect()
    }
}

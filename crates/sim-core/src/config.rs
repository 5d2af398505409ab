//! Strategy configuration: the immutable input contract of a simulation.
//!
//! Every field is enumerated and validated up front; unknown keys and
//! unknown enum values are rejected at deserialization time.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use market_calendar::Cadence;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{SimError, SimResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetaConfig {
    #[serde(default = "default_strategy_name")]
    pub name: String,
    #[serde(default)]
    pub notes: String,
}

fn default_strategy_name() -> String {
    "Untitled".to_string()
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            name: default_strategy_name(),
            notes: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeriodConfig {
    pub start: NaiveDate,
    pub end: NaiveDate,
    #[serde(default = "default_calendar")]
    pub calendar: String,
}

fn default_calendar() -> String {
    "NYSE".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UniverseConfig {
    pub symbols: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountType {
    Taxable,
    #[serde(rename = "Traditional-IRA")]
    TraditionalIra,
    #[serde(rename = "Roth-IRA")]
    RothIra,
    #[serde(rename = "529-Plan")]
    Plan529,
}

impl AccountType {
    /// Whether realized gains and dividends are taxed during the simulation.
    pub fn is_taxable(self) -> bool {
        matches!(self, AccountType::Taxable)
    }

    /// Whether annual contribution caps apply.
    pub fn has_contribution_cap(self) -> bool {
        matches!(self, AccountType::TraditionalIra | AccountType::RothIra)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TaxConfig {
    pub federal_ordinary: f64,
    pub federal_ltcg: f64,
    pub state: f64,
    /// Default qualified fraction applied when a dividend carries none.
    pub qualified_dividend_pct: f64,
    pub apply_wash_sale: bool,
    /// When true, year-end tax is recorded as an external liability and is
    /// not deducted from portfolio cash.
    pub pay_taxes_from_external: bool,
    pub withdrawal_tax_rate_for_ira: f64,
}

impl Default for TaxConfig {
    fn default() -> Self {
        Self {
            federal_ordinary: 0.32,
            federal_ltcg: 0.15,
            state: 0.06,
            qualified_dividend_pct: 0.8,
            apply_wash_sale: true,
            pay_taxes_from_external: false,
            withdrawal_tax_rate_for_ira: 0.25,
        }
    }
}

/// IRS annual contribution limits (2024 figures as defaults).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ContributionCaps {
    pub enforce: bool,
    pub ira: Decimal,
    pub ira_catch_up: Decimal,
    pub roth: Decimal,
    pub roth_catch_up: Decimal,
    /// Whether the account holder qualifies for the catch-up allowance.
    pub catch_up_eligible: bool,
    /// When true, a deposit that would breach the cap is credited up to the
    /// remaining room instead of being rejected outright.
    pub allow_partial: bool,
}

impl Default for ContributionCaps {
    fn default() -> Self {
        Self {
            enforce: true,
            ira: Decimal::from(7000),
            ira_catch_up: Decimal::from(1000),
            roth: Decimal::from(7000),
            roth_catch_up: Decimal::from(1000),
            catch_up_eligible: false,
            allow_partial: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccountConfig {
    #[serde(rename = "type")]
    pub account_type: AccountType,
    /// Optional state of residence, informational only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default)]
    pub tax: TaxConfig,
    #[serde(default)]
    pub contribution_caps: ContributionCaps,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepositCadence {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    Yearly,
    EveryMarketDay,
}

impl DepositCadence {
    pub fn as_cadence(self) -> Cadence {
        match self {
            DepositCadence::Daily => Cadence::Daily,
            DepositCadence::Weekly => Cadence::Weekly,
            DepositCadence::Monthly => Cadence::Monthly,
            DepositCadence::Quarterly => Cadence::Quarterly,
            DepositCadence::Yearly => Cadence::Annually,
            DepositCadence::EveryMarketDay => Cadence::EveryMarketDay,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DepositConfig {
    pub cadence: DepositCadence,
    pub amount: Decimal,
    #[serde(default = "default_day_rule")]
    pub day_rule: String,
    #[serde(default)]
    pub market_day_everyday: bool,
}

fn default_day_rule() -> String {
    "FIRST_BUSINESS_DAY".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DividendMode {
    #[serde(rename = "DRIP")]
    Drip,
    #[serde(rename = "CASH")]
    Cash,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DividendConfig {
    #[serde(default = "default_dividend_mode")]
    pub mode: DividendMode,
    /// Cash inflows below this fraction of portfolio value are left
    /// undeployed by cashflow-driven rebalancing.
    #[serde(default)]
    pub reinvest_threshold_pct: f64,
}

fn default_dividend_mode() -> DividendMode {
    DividendMode::Drip
}

impl Default for DividendConfig {
    fn default() -> Self {
        Self {
            mode: default_dividend_mode(),
            reinvest_threshold_pct: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebalanceType {
    Calendar,
    Drift,
    Both,
    CashflowOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalendarPeriod {
    D,
    W,
    M,
    Q,
    A,
}

impl CalendarPeriod {
    pub fn as_cadence(self) -> Cadence {
        match self {
            CalendarPeriod::D => Cadence::Daily,
            CalendarPeriod::W => Cadence::Weekly,
            CalendarPeriod::M => Cadence::Monthly,
            CalendarPeriod::Q => Cadence::Quarterly,
            CalendarPeriod::A => Cadence::Annually,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CalendarRebalanceConfig {
    pub period: CalendarPeriod,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DriftRebalanceConfig {
    /// Absolute weight deviation threshold, e.g. 0.05 for five points.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abs_pct: Option<f64>,
    /// Relative deviation threshold, |current - target| / target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rel_pct: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RebalancingConfig {
    #[serde(rename = "type")]
    pub mode: RebalanceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calendar: Option<CalendarRebalanceConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drift: Option<DriftRebalanceConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderTiming {
    #[serde(rename = "MOO")]
    MarketOnOpen,
    #[serde(rename = "MOC")]
    MarketOnClose,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrderConfig {
    #[serde(default = "default_order_timing")]
    pub timing: OrderTiming,
}

fn default_order_timing() -> OrderTiming {
    OrderTiming::MarketOnOpen
}

impl Default for OrderConfig {
    fn default() -> Self {
        Self {
            timing: default_order_timing(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LotMethod {
    #[serde(rename = "FIFO")]
    Fifo,
    #[serde(rename = "LIFO")]
    Lifo,
    #[serde(rename = "HIFO")]
    Hifo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LotConfig {
    #[serde(default = "default_lot_method")]
    pub method: LotMethod,
}

fn default_lot_method() -> LotMethod {
    LotMethod::Hifo
}

impl Default for LotConfig {
    fn default() -> Self {
        Self {
            method: default_lot_method(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FrictionsConfig {
    pub commission_per_trade: Decimal,
    pub slippage_bps: f64,
    pub use_actual_etf_er: bool,
    pub equity_borrow_bps: f64,
    /// Annual yield accrued on idle cash; the interest is ordinary income.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cash_yield_apy: Option<f64>,
}

impl Default for FrictionsConfig {
    fn default() -> Self {
        Self {
            commission_per_trade: Decimal::ZERO,
            slippage_bps: 5.0,
            use_actual_etf_er: true,
            equity_borrow_bps: 0.0,
            cash_yield_apy: None,
        }
    }
}

/// A named indicator used by entry/exit rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignalConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: SignalKind,
    #[serde(default)]
    pub params: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalKind {
    SmaCross,
    EmaCross,
    Rsi,
    Macd,
    Momentum,
    Bollinger,
    Breakout52w,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleOp {
    CrossUp,
    CrossDown,
    Above,
    Below,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Rule {
    pub signal: String,
    pub op: RuleOp,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RulesConfig {
    pub entry: Vec<Rule>,
    pub exit: Vec<Rule>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SizingMethod {
    EqualWeight,
    CustomWeights,
    VolTarget,
    MomentumTopN,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PositionSizingConfig {
    pub method: SizingMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_weights: Option<BTreeMap<String, f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_n: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vol_target: Option<f64>,
}

impl Default for PositionSizingConfig {
    fn default() -> Self {
        Self {
            method: SizingMethod::EqualWeight,
            custom_weights: None,
            top_n: None,
            vol_target: None,
        }
    }
}

/// The complete, immutable strategy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StrategyConfig {
    #[serde(default)]
    pub meta: MetaConfig,
    pub period: PeriodConfig,
    pub universe: UniverseConfig,
    pub initial_cash: Decimal,
    pub account: AccountConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deposits: Option<DepositConfig>,
    #[serde(default)]
    pub dividends: DividendConfig,
    pub rebalancing: RebalancingConfig,
    #[serde(default)]
    pub orders: OrderConfig,
    #[serde(default)]
    pub lots: LotConfig,
    #[serde(default)]
    pub frictions: FrictionsConfig,
    #[serde(default)]
    pub signals: Vec<SignalConfig>,
    #[serde(default)]
    pub rules: RulesConfig,
    #[serde(default)]
    pub position_sizing: PositionSizingConfig,
    #[serde(default)]
    pub benchmark: Vec<String>,
}

impl StrategyConfig {
    /// Validate the cross-field constraints serde cannot express. Called by
    /// the driver before any data is loaded.
    pub fn validate(&self) -> SimResult<()> {
        if self.period.start >= self.period.end {
            return Err(SimError::ConfigurationInvalid(format!(
                "period start {} must precede end {}",
                self.period.start, self.period.end
            )));
        }
        if self.universe.symbols.is_empty() {
            return Err(SimError::ConfigurationInvalid(
                "universe.symbols must not be empty".into(),
            ));
        }
        if self.initial_cash < Decimal::ZERO {
            return Err(SimError::ConfigurationInvalid(
                "initial_cash must not be negative".into(),
            ));
        }
        if let Some(deposits) = &self.deposits {
            if deposits.amount < Decimal::ZERO {
                return Err(SimError::ConfigurationInvalid(
                    "deposits.amount must not be negative".into(),
                ));
            }
        }
        if self.frictions.slippage_bps < 0.0 {
            return Err(SimError::ConfigurationInvalid(
                "frictions.slippage_bps must not be negative".into(),
            ));
        }
        match self.rebalancing.mode {
            RebalanceType::Calendar | RebalanceType::Both if self.rebalancing.calendar.is_none() => {
                return Err(SimError::ConfigurationInvalid(
                    "rebalancing.calendar is required for calendar-driven modes".into(),
                ));
            }
            RebalanceType::Drift | RebalanceType::Both => {
                let drift = self.rebalancing.drift.as_ref().ok_or_else(|| {
                    SimError::ConfigurationInvalid(
                        "rebalancing.drift is required for drift-driven modes".into(),
                    )
                })?;
                if drift.abs_pct.is_none() && drift.rel_pct.is_none() {
                    return Err(SimError::ConfigurationInvalid(
                        "rebalancing.drift needs abs_pct or rel_pct".into(),
                    ));
                }
            }
            _ => {}
        }
        match self.position_sizing.method {
            SizingMethod::CustomWeights => {
                let weights = self.position_sizing.custom_weights.as_ref().ok_or_else(|| {
                    SimError::ConfigurationInvalid(
                        "position_sizing.custom_weights is required for CUSTOM_WEIGHTS".into(),
                    )
                })?;
                if weights.values().any(|w| *w < 0.0) {
                    return Err(SimError::ConfigurationInvalid(
                        "custom weights must not be negative".into(),
                    ));
                }
                if weights.values().sum::<f64>() <= 0.0 {
                    return Err(SimError::ConfigurationInvalid(
                        "custom weights must sum to a positive total".into(),
                    ));
                }
            }
            SizingMethod::VolTarget | SizingMethod::MomentumTopN => {
                return Err(SimError::ConfigurationInvalid(
                    "position sizing method is recognized but not supported in this version".into(),
                ));
            }
            SizingMethod::EqualWeight => {}
        }
        for rule in self.rules.entry.iter().chain(self.rules.exit.iter()) {
            if !self.signals.iter().any(|s| s.id == rule.signal) {
                return Err(SimError::ConfigurationInvalid(format!(
                    "rule references unknown signal `{}`",
                    rule.signal
                )));
            }
        }
        Ok(())
    }

    /// Target weights per symbol, normalized to sum to one.
    pub fn target_weights(&self) -> BTreeMap<String, f64> {
        let symbols = &self.universe.symbols;
        match self.position_sizing.method {
            SizingMethod::CustomWeights => {
                let custom = self
                    .position_sizing
                    .custom_weights
                    .clone()
                    .unwrap_or_default();
                let total: f64 = symbols
                    .iter()
                    .map(|s| custom.get(s).copied().unwrap_or(0.0))
                    .sum();
                if total <= 0.0 {
                    return equal_weights(symbols);
                }
                symbols
                    .iter()
                    .map(|s| (s.clone(), custom.get(s).copied().unwrap_or(0.0) / total))
                    .collect()
            }
            _ => equal_weights(symbols),
        }
    }

    /// Effective annual contribution cap for the account, if any.
    pub fn contribution_cap(&self) -> Option<Decimal> {
        if !self.account.contribution_caps.enforce {
            return None;
        }
        let caps = &self.account.contribution_caps;
        let (base, catch_up) = match self.account.account_type {
            AccountType::TraditionalIra => (caps.ira, caps.ira_catch_up),
            AccountType::RothIra => (caps.roth, caps.roth_catch_up),
            _ => return None,
        };
        Some(if caps.catch_up_eligible {
            base + catch_up
        } else {
            base
        })
    }
}

fn equal_weights(symbols: &[String]) -> BTreeMap<String, f64> {
    let weight = 1.0 / symbols.len().max(1) as f64;
    symbols.iter().map(|s| (s.clone(), weight)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn base_config() -> StrategyConfig {
        serde_json::from_value(serde_json::json!({
            "period": { "start": "2020-01-02", "end": "2020-12-31" },
            "universe": { "symbols": ["SPY", "AGG"] },
            "initial_cash": "10000",
            "account": { "type": "Taxable" },
            "rebalancing": { "type": "calendar", "calendar": { "period": "Q" } }
        }))
        .unwrap()
    }

    #[test]
    fn defaults_round_trip() {
        let config = base_config();
        assert_eq!(config.lots.method, LotMethod::Hifo);
        assert_eq!(config.orders.timing, OrderTiming::MarketOnOpen);
        assert_eq!(config.dividends.mode, DividendMode::Drip);
        assert_eq!(config.frictions.slippage_bps, 5.0);

        let text = serde_json::to_string(&config).unwrap();
        let back: StrategyConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let result: Result<StrategyConfig, _> = serde_json::from_value(serde_json::json!({
            "period": { "start": "2020-01-02", "end": "2020-12-31" },
            "universe": { "symbols": ["SPY"] },
            "initial_cash": "10000",
            "account": { "type": "Taxable" },
            "rebalancing": { "type": "calendar", "calendar": { "period": "Q" } },
            "turbo": true
        }));
        assert!(result.is_err());
    }

    #[test]
    fn inverted_period_is_invalid() {
        let mut config = base_config();
        config.period.end = config.period.start;
        assert!(matches!(
            config.validate(),
            Err(SimError::ConfigurationInvalid(_))
        ));
    }

    #[test]
    fn empty_universe_is_invalid() {
        let mut config = base_config();
        config.universe.symbols.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn drift_mode_requires_thresholds() {
        let mut config = base_config();
        config.rebalancing = RebalancingConfig {
            mode: RebalanceType::Drift,
            calendar: None,
            drift: Some(DriftRebalanceConfig {
                abs_pct: None,
                rel_pct: None,
            }),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn custom_weights_normalize() {
        let mut config = base_config();
        config.position_sizing.method = SizingMethod::CustomWeights;
        config.position_sizing.custom_weights = Some(BTreeMap::from([
            ("SPY".to_string(), 3.0),
            ("AGG".to_string(), 2.0),
        ]));
        config.validate().unwrap();
        let weights = config.target_weights();
        assert!((weights["SPY"] - 0.6).abs() < 1e-12);
        assert!((weights["AGG"] - 0.4).abs() < 1e-12);
    }

    #[test]
    fn single_symbol_equal_weight_is_full() {
        let mut config = base_config();
        config.universe.symbols = vec!["SPY".to_string()];
        assert_eq!(config.target_weights()["SPY"], 1.0);
    }

    #[test]
    fn roth_cap_includes_catch_up_when_eligible() {
        let mut config = base_config();
        config.account.account_type = AccountType::RothIra;
        assert_eq!(config.contribution_cap(), Some(dec!(7000)));
        config.account.contribution_caps.catch_up_eligible = true;
        assert_eq!(config.contribution_cap(), Some(dec!(8000)));
        config.account.contribution_caps.enforce = false;
        assert_eq!(config.contribution_cap(), None);
    }
}

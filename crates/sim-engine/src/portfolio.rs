//! Per-lot portfolio ledger.
//!
//! The portfolio exclusively owns its lots and cash. Operations are
//! transactional: every check runs before the first mutation, so a failed
//! call leaves no trace. Sales report realized events to the `TaxLedger`
//! collaborator and apply whatever wash-sale basis adjustments it returns;
//! the ledger never reaches back into the portfolio.

use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate};
use log::{debug, warn};
use rust_decimal::Decimal;
use sim_core::{
    round_basis, round_cash, round_qty, AccountType, DividendMode, FrictionsConfig, GainTerm,
    Lot, LotId, LotMethod, Position, RealizedEvent, SimError, SimResult, TradeAction, TradeId,
    TradeRecord, SHORT_TERM_DAYS,
};
use tax_ledger::TaxLedger;

/// Per-trade commission and proportional slippage, pre-converted from the
/// config's basis points.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frictions {
    pub commission_per_trade: Decimal,
    /// Slippage as a fraction of price (bps / 10_000).
    pub slippage: Decimal,
}

impl Frictions {
    pub const NONE: Frictions = Frictions {
        commission_per_trade: Decimal::ZERO,
        slippage: Decimal::ZERO,
    };
}

impl From<&FrictionsConfig> for Frictions {
    fn from(config: &FrictionsConfig) -> Self {
        Self {
            commission_per_trade: config.commission_per_trade,
            slippage: Decimal::from_f64_retain(config.slippage_bps / 10_000.0)
                .unwrap_or_default(),
        }
    }
}

/// Contribution-cap policy for IRA / Roth accounts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CapPolicy {
    /// Effective annual cap; `None` disables enforcement.
    pub annual_cap: Option<Decimal>,
    /// Credit up to the remaining room instead of rejecting outright.
    pub allow_partial: bool,
}

impl CapPolicy {
    pub const UNENFORCED: CapPolicy = CapPolicy {
        annual_cap: None,
        allow_partial: false,
    };
}

pub struct Portfolio {
    cash: Decimal,
    account_type: AccountType,
    default_method: LotMethod,
    frictions: Frictions,
    cap: CapPolicy,
    lots: BTreeMap<String, Vec<Lot>>,
    trades: Vec<TradeRecord>,
    next_lot_id: LotId,
    next_trade_id: TradeId,
    cumulative_deposits: Decimal,
    annual_contributions: BTreeMap<i32, Decimal>,
    /// Initial cash plus every recorded cash movement; checked against the
    /// live balance by `verify_consistency`.
    recorded_cash: Decimal,
}

impl Portfolio {
    pub fn new(
        initial_cash: Decimal,
        account_type: AccountType,
        default_method: LotMethod,
        frictions: Frictions,
        cap: CapPolicy,
    ) -> Self {
        Self {
            cash: initial_cash,
            account_type,
            default_method,
            frictions,
            cap,
            lots: BTreeMap::new(),
            trades: Vec::new(),
            next_lot_id: 1,
            next_trade_id: 1,
            cumulative_deposits: Decimal::ZERO,
            annual_contributions: BTreeMap::new(),
            recorded_cash: initial_cash,
        }
    }

    pub fn cash(&self) -> Decimal {
        self.cash
    }

    pub fn cumulative_deposits(&self) -> Decimal {
        self.cumulative_deposits
    }

    pub fn account_type(&self) -> AccountType {
        self.account_type
    }

    pub fn default_method(&self) -> LotMethod {
        self.default_method
    }

    pub fn trades(&self) -> &[TradeRecord] {
        &self.trades
    }

    /// Total shares held in a symbol.
    pub fn quantity(&self, symbol: &str) -> Decimal {
        self.lots
            .get(symbol)
            .map(|lots| lots.iter().map(|l| l.quantity).sum())
            .unwrap_or(Decimal::ZERO)
    }

    /// Open lots of a symbol, in acquisition order.
    pub fn lots(&self, symbol: &str) -> &[Lot] {
        self.lots.get(symbol).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Snapshot of every open lot, ordered by symbol then acquisition.
    pub fn open_lots(&self) -> Vec<Lot> {
        self.lots.values().flatten().cloned().collect()
    }

    /// Mark the positions against the given closes. Never mutates.
    pub fn mark(&self, prices: &BTreeMap<String, Decimal>) -> Decimal {
        let mut value = Decimal::ZERO;
        for (symbol, lots) in &self.lots {
            if let Some(price) = prices.get(symbol) {
                let quantity: Decimal = lots.iter().map(|l| l.quantity).sum();
                value += quantity * *price;
            }
        }
        round_cash(value)
    }

    pub fn total_value(&self, prices: &BTreeMap<String, Decimal>) -> Decimal {
        self.cash + self.mark(prices)
    }

    /// Position views with market values at the given prices.
    pub fn positions(&self, prices: &BTreeMap<String, Decimal>) -> Vec<Position> {
        self.lots
            .iter()
            .filter(|(_, lots)| !lots.is_empty())
            .map(|(symbol, lots)| {
                let quantity: Decimal = lots.iter().map(|l| l.quantity).sum();
                let cost_basis: Decimal = lots.iter().map(|l| l.cost_basis()).sum();
                let price = prices.get(symbol).copied().unwrap_or(Decimal::ZERO);
                let market_value = round_cash(quantity * price);
                Position {
                    symbol: symbol.clone(),
                    quantity,
                    market_value,
                    cost_basis,
                    unrealized_gain: market_value - cost_basis,
                    lots: lots.clone(),
                }
            })
            .collect()
    }

    /// Current weight of each held symbol, as a fraction of total value.
    pub fn weights(&self, prices: &BTreeMap<String, Decimal>) -> BTreeMap<String, f64> {
        let total = self.total_value(prices);
        if total <= Decimal::ZERO {
            return BTreeMap::new();
        }
        let total = decimal_to_f64(total);
        self.lots
            .iter()
            .filter(|(_, lots)| !lots.is_empty())
            .map(|(symbol, lots)| {
                let quantity: Decimal = lots.iter().map(|l| l.quantity).sum();
                let price = prices.get(symbol).copied().unwrap_or(Decimal::ZERO);
                (symbol.clone(), decimal_to_f64(quantity * price) / total)
            })
            .collect()
    }

    /// Post an external deposit. Returns the amount actually credited,
    /// which is less than `amount` only under the partial-credit policy.
    pub fn deposit(&mut self, amount: Decimal, date: NaiveDate) -> SimResult<Decimal> {
        let year = date.year();
        let credited = if self.account_type.has_contribution_cap() {
            match self.cap.annual_cap {
                Some(cap) => {
                    let used = self
                        .annual_contributions
                        .get(&year)
                        .copied()
                        .unwrap_or(Decimal::ZERO);
                    if used + amount <= cap {
                        amount
                    } else if self.cap.allow_partial && used < cap {
                        cap - used
                    } else {
                        return Err(SimError::ContributionCapExceeded {
                            year,
                            cap,
                            attempted: amount,
                        });
                    }
                }
                None => amount,
            }
        } else {
            amount
        };

        self.cash += credited;
        self.recorded_cash += credited;
        self.cumulative_deposits += credited;
        *self.annual_contributions.entry(year).or_default() += credited;

        self.push_trade(
            date,
            String::new(),
            TradeAction::Deposit,
            Decimal::ZERO,
            Decimal::ZERO,
            Decimal::ZERO,
            Decimal::ZERO,
            credited,
            Vec::new(),
        );
        Ok(credited)
    }

    /// Convert a cash notional into shares at `price` and open a new lot.
    /// Slippage widens the executed price; commission and slippage are
    /// capitalized into the lot's basis.
    pub fn buy_notional(
        &mut self,
        symbol: &str,
        notional: Decimal,
        price: Decimal,
        date: NaiveDate,
        ledger: &mut TaxLedger,
    ) -> SimResult<TradeId> {
        self.execute_buy(
            symbol,
            notional,
            price,
            date,
            TradeAction::Buy,
            self.frictions,
            ledger,
        )
    }

    fn execute_buy(
        &mut self,
        symbol: &str,
        notional: Decimal,
        price: Decimal,
        date: NaiveDate,
        action: TradeAction,
        frictions: Frictions,
        ledger: &mut TaxLedger,
    ) -> SimResult<TradeId> {
        if notional > self.cash {
            return Err(SimError::InsufficientCash {
                needed: round_cash(notional),
                available: self.cash,
            });
        }
        let exec_price = price * (Decimal::ONE + frictions.slippage);
        let investable = notional - frictions.commission_per_trade;
        if investable <= Decimal::ZERO || exec_price <= Decimal::ZERO {
            return Err(SimError::InsufficientCash {
                needed: round_cash(notional),
                available: self.cash,
            });
        }
        let quantity = round_qty(investable / exec_price);
        if quantity <= Decimal::ZERO {
            return Err(SimError::InsufficientCash {
                needed: round_cash(notional),
                available: self.cash,
            });
        }

        let gross = round_cash(quantity * price);
        let slippage_cost = round_cash(quantity * price * frictions.slippage);
        let total_cost = gross + slippage_cost + frictions.commission_per_trade;

        self.cash -= total_cost;
        self.recorded_cash -= total_cost;

        let lot_id = self.next_lot_id;
        self.next_lot_id += 1;
        let lot = Lot {
            id: lot_id,
            symbol: symbol.to_string(),
            original_quantity: quantity,
            quantity,
            basis_per_share: round_basis(total_cost / quantity),
            acquisition_date: date,
            wash_adjustment: Decimal::ZERO,
            washed_in: false,
        };
        self.lots.entry(symbol.to_string()).or_default().push(lot);

        // Wash-sale: this buy may be a replacement purchase for an earlier
        // loss sale. The disallowed loss rolls into the new lot's basis.
        for attribution in ledger.record_buy(symbol, date, lot_id, quantity) {
            self.adjust_lot_basis(symbol, attribution.lot_id, attribution.disallowed);
        }

        debug!("{action:?} {quantity} {symbol} @ {price} on {date}");
        Ok(self.push_trade(
            date,
            symbol.to_string(),
            action,
            quantity,
            price,
            frictions.commission_per_trade,
            slippage_cost,
            -total_cost,
            vec![lot_id],
        ))
    }

    /// Sell shares, consuming lots in `method` order. Each consumed portion
    /// emits a `RealizedEvent` to the ledger; loss events may return
    /// wash-sale adjustments against replacement lots bought earlier.
    pub fn sell_shares(
        &mut self,
        symbol: &str,
        quantity: Decimal,
        price: Decimal,
        date: NaiveDate,
        method: Option<LotMethod>,
        ledger: &mut TaxLedger,
    ) -> SimResult<TradeId> {
        let quantity = round_qty(quantity);
        let held = self.quantity(symbol);
        if quantity <= Decimal::ZERO || quantity > held {
            return Err(SimError::InsufficientShares {
                symbol: symbol.to_string(),
                needed: quantity,
                available: held,
            });
        }
        let method = method.unwrap_or(self.default_method);

        let exec_price = price * (Decimal::ONE - self.frictions.slippage);
        let gross = round_cash(quantity * exec_price);
        let slippage_cost = round_cash(quantity * price * self.frictions.slippage);
        let net_proceeds = gross - self.frictions.commission_per_trade;

        let selections = self.select_lots(symbol, quantity, method);
        let consumed_ids: Vec<LotId> = selections.iter().map(|s| s.lot_id).collect();

        // Build the realized events before mutating anything.
        let mut events = Vec::with_capacity(selections.len());
        let mut allocated = Decimal::ZERO;
        for (i, selection) in selections.iter().enumerate() {
            let proceeds = if i + 1 == selections.len() {
                net_proceeds - allocated
            } else {
                round_cash(net_proceeds * selection.quantity / quantity)
            };
            allocated += proceeds;
            let holding_days = (date - selection.acquisition_date).num_days();
            events.push(RealizedEvent {
                date,
                symbol: symbol.to_string(),
                quantity: selection.quantity,
                proceeds,
                cost_basis: round_cash(selection.quantity * selection.basis_per_share),
                holding_days,
                term: if holding_days <= SHORT_TERM_DAYS {
                    GainTerm::ShortTerm
                } else {
                    GainTerm::LongTerm
                },
                wash_disallowed: Decimal::ZERO,
            });
        }

        // Apply the reductions.
        for selection in &selections {
            ledger.note_lot_reduced(selection.lot_id, selection.quantity);
            if let Some(lots) = self.lots.get_mut(symbol) {
                if let Some(lot) = lots.iter_mut().find(|l| l.id == selection.lot_id) {
                    lot.quantity -= selection.quantity;
                }
                lots.retain(|l| l.quantity > Decimal::ZERO);
            }
        }
        self.cash += net_proceeds;
        self.recorded_cash += net_proceeds;

        // Report to the ledger; a loss sale may match replacement buys made
        // in the preceding thirty days.
        for event in events {
            for attribution in ledger.record_sale(event, &consumed_ids) {
                self.adjust_lot_basis(symbol, attribution.lot_id, attribution.disallowed);
            }
        }

        debug!("SELL {quantity} {symbol} @ {price} on {date} ({method:?})");
        Ok(self.push_trade(
            date,
            symbol.to_string(),
            TradeAction::Sell,
            quantity,
            price,
            self.frictions.commission_per_trade,
            slippage_cost,
            net_proceeds,
            consumed_ids,
        ))
    }

    /// Pay a dividend on the shares held over the ex-date. In CASH mode the
    /// amount stays in cash; in DRIP mode it immediately buys more shares at
    /// the closing price, frictionless. The qualified / ordinary split flows
    /// to the ledger either way.
    pub fn apply_dividend(
        &mut self,
        symbol: &str,
        per_share: Decimal,
        qualified_pct: f64,
        date: NaiveDate,
        mode: DividendMode,
        close_price: Decimal,
        ledger: &mut TaxLedger,
    ) -> SimResult<Vec<TradeId>> {
        let shares = self.quantity(symbol);
        if shares <= Decimal::ZERO || per_share <= Decimal::ZERO {
            return Ok(Vec::new());
        }
        let amount = round_cash(shares * per_share);

        self.cash += amount;
        self.recorded_cash += amount;
        ledger.record_dividend(date, amount, qualified_pct);

        let mut ids = vec![self.push_trade(
            date,
            symbol.to_string(),
            TradeAction::DividendCash,
            shares,
            per_share,
            Decimal::ZERO,
            Decimal::ZERO,
            amount,
            Vec::new(),
        )];

        if mode == DividendMode::Drip && close_price > Decimal::ZERO {
            match self.execute_buy(
                symbol,
                amount,
                close_price,
                date,
                TradeAction::Drip,
                Frictions::NONE,
                ledger,
            ) {
                Ok(id) => ids.push(id),
                Err(err) => {
                    // Too small to buy a single ledger unit; the cash stays.
                    warn!("DRIP for {symbol} on {date} left in cash: {err}");
                }
            }
        }
        Ok(ids)
    }

    /// Apply a split: quantities multiply by the ratio, per-share bases
    /// divide by it. No cashflow.
    pub fn apply_split(&mut self, symbol: &str, ratio: Decimal, _date: NaiveDate) {
        if ratio <= Decimal::ZERO {
            return;
        }
        if let Some(lots) = self.lots.get_mut(symbol) {
            for lot in lots.iter_mut() {
                lot.quantity = round_qty(lot.quantity * ratio);
                lot.original_quantity = round_qty(lot.original_quantity * ratio);
                lot.basis_per_share = round_basis(lot.basis_per_share / ratio);
            }
        }
    }

    /// Deduct the year-end tax from cash. The balance may go negative; the
    /// next operation that needs cash will fail on its own check.
    pub fn deduct_tax(&mut self, amount: Decimal) {
        self.cash -= amount;
        self.recorded_cash -= amount;
    }

    /// Credit interest on idle cash.
    pub fn accrue_interest(&mut self, amount: Decimal) {
        self.cash += amount;
        self.recorded_cash += amount;
    }

    /// Check the universal ledger invariants.
    pub fn verify_consistency(&self, date: NaiveDate) -> SimResult<()> {
        for (symbol, lots) in &self.lots {
            for lot in lots {
                if lot.quantity <= Decimal::ZERO {
                    return Err(SimError::InternalConsistency {
                        date,
                        detail: format!("lot {} of {symbol} has non-positive quantity", lot.id),
                    });
                }
            }
        }
        let drift = (self.cash - self.recorded_cash).abs();
        if drift > Decimal::new(1, 6) {
            return Err(SimError::InternalConsistency {
                date,
                detail: format!(
                    "cash {} deviates from recorded movements {}",
                    self.cash, self.recorded_cash
                ),
            });
        }
        Ok(())
    }

    pub fn into_trades(self) -> Vec<TradeRecord> {
        self.trades
    }

    fn adjust_lot_basis(&mut self, symbol: &str, lot_id: LotId, amount: Decimal) {
        if amount <= Decimal::ZERO {
            return;
        }
        if let Some(lot) = self
            .lots
            .get_mut(symbol)
            .and_then(|lots| lots.iter_mut().find(|l| l.id == lot_id))
        {
            let total = lot.quantity * lot.basis_per_share + amount;
            lot.basis_per_share = round_basis(total / lot.quantity);
            lot.wash_adjustment += amount;
            lot.washed_in = true;
        }
    }

    fn select_lots(&self, symbol: &str, quantity: Decimal, method: LotMethod) -> Vec<Selection> {
        let mut candidates: Vec<&Lot> = self.lots(symbol).iter().collect();
        match method {
            LotMethod::Fifo => candidates.sort_by_key(|l| (l.acquisition_date, l.id)),
            LotMethod::Lifo => {
                candidates.sort_by_key(|l| (std::cmp::Reverse(l.acquisition_date), l.id))
            }
            // Highest basis first; ties broken by older acquisition.
            LotMethod::Hifo => candidates.sort_by(|a, b| {
                b.basis_per_share
                    .cmp(&a.basis_per_share)
                    .then(a.acquisition_date.cmp(&b.acquisition_date))
                    .then(a.id.cmp(&b.id))
            }),
        }

        let mut remaining = quantity;
        let mut selections = Vec::new();
        for lot in candidates {
            if remaining <= Decimal::ZERO {
                break;
            }
            let take = remaining.min(lot.quantity);
            selections.push(Selection {
                lot_id: lot.id,
                quantity: take,
                basis_per_share: lot.basis_per_share,
                acquisition_date: lot.acquisition_date,
            });
            remaining -= take;
        }
        selections
    }

    #[allow(clippy::too_many_arguments)]
    fn push_trade(
        &mut self,
        date: NaiveDate,
        symbol: String,
        action: TradeAction,
        quantity: Decimal,
        price: Decimal,
        commission: Decimal,
        slippage: Decimal,
        cash_delta: Decimal,
        lot_ids: Vec<LotId>,
    ) -> TradeId {
        let id = self.next_trade_id;
        self.next_trade_id += 1;
        self.trades.push(TradeRecord {
            id,
            date,
            symbol,
            action,
            quantity,
            price,
            commission,
            slippage,
            cash_delta,
            lot_ids,
        });
        id
    }
}

struct Selection {
    lot_id: LotId,
    quantity: Decimal,
    basis_per_share: Decimal,
    acquisition_date: NaiveDate,
}

pub(crate) fn decimal_to_f64(value: Decimal) -> f64 {
    use rust_decimal::prelude::ToPrimitive;
    value.to_f64().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use sim_core::TaxConfig;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn taxable() -> (Portfolio, TaxLedger) {
        let portfolio = Portfolio::new(
            dec!(100000),
            AccountType::Taxable,
            LotMethod::Fifo,
            Frictions::NONE,
            CapPolicy::UNENFORCED,
        );
        let ledger = TaxLedger::new(AccountType::Taxable, TaxConfig::default());
        (portfolio, ledger)
    }

    fn prices(pairs: &[(&str, Decimal)]) -> BTreeMap<String, Decimal> {
        pairs.iter().map(|(s, p)| (s.to_string(), *p)).collect()
    }

    #[test]
    fn buy_converts_notional_to_shares() {
        let (mut portfolio, mut ledger) = taxable();
        portfolio
            .buy_notional("VTI", dec!(10000), dec!(200), ymd(2020, 1, 2), &mut ledger)
            .unwrap();
        assert_eq!(portfolio.quantity("VTI"), dec!(50));
        assert_eq!(portfolio.cash(), dec!(90000));
        let lot = &portfolio.lots("VTI")[0];
        assert_eq!(lot.basis_per_share, dec!(200));
    }

    #[test]
    fn buy_shares_round_down_to_four_places() {
        let (mut portfolio, mut ledger) = taxable();
        portfolio
            .buy_notional("VTI", dec!(1000), dec!(3), ymd(2020, 1, 2), &mut ledger)
            .unwrap();
        // 1000 / 3 = 333.3333..., truncated at four places.
        assert_eq!(portfolio.quantity("VTI"), dec!(333.3333));
    }

    #[test]
    fn buy_rejects_notional_above_cash() {
        let (mut portfolio, mut ledger) = taxable();
        let result =
            portfolio.buy_notional("VTI", dec!(200000), dec!(200), ymd(2020, 1, 2), &mut ledger);
        assert!(matches!(result, Err(SimError::InsufficientCash { .. })));
        assert_eq!(portfolio.cash(), dec!(100000));
        assert!(portfolio.lots("VTI").is_empty());
    }

    #[test]
    fn slippage_widens_buy_price_and_narrows_sell_price() {
        let mut portfolio = Portfolio::new(
            dec!(100000),
            AccountType::Taxable,
            LotMethod::Fifo,
            Frictions {
                commission_per_trade: Decimal::ZERO,
                slippage: dec!(0.01),
            },
            CapPolicy::UNENFORCED,
        );
        let mut ledger = TaxLedger::new(AccountType::Taxable, TaxConfig::default());

        portfolio
            .buy_notional("VTI", dec!(10100), dec!(100), ymd(2020, 1, 2), &mut ledger)
            .unwrap();
        // Executed at 101: exactly 100 shares.
        assert_eq!(portfolio.quantity("VTI"), dec!(100));

        portfolio
            .sell_shares("VTI", dec!(100), dec!(100), ymd(2020, 1, 10), None, &mut ledger)
            .unwrap();
        // Sold at 99: 9,900 back against 10,100 spent.
        assert_eq!(portfolio.cash(), dec!(99800));
    }

    #[test]
    fn buy_then_sell_at_same_price_is_cash_neutral() {
        let (mut portfolio, mut ledger) = taxable();
        portfolio
            .buy_notional("VTI", dec!(10000), dec!(200), ymd(2020, 1, 2), &mut ledger)
            .unwrap();
        portfolio
            .sell_shares("VTI", dec!(50), dec!(200), ymd(2020, 1, 10), None, &mut ledger)
            .unwrap();
        assert_eq!(portfolio.cash(), dec!(100000));
        assert!(portfolio.lots("VTI").is_empty());
    }

    #[test]
    fn sell_rejects_more_than_held() {
        let (mut portfolio, mut ledger) = taxable();
        portfolio
            .buy_notional("VTI", dec!(10000), dec!(200), ymd(2020, 1, 2), &mut ledger)
            .unwrap();
        let result =
            portfolio.sell_shares("VTI", dec!(51), dec!(200), ymd(2020, 1, 10), None, &mut ledger);
        assert!(matches!(result, Err(SimError::InsufficientShares { .. })));
        assert_eq!(portfolio.quantity("VTI"), dec!(50));
    }

    #[test]
    fn fifo_consumes_oldest_lot_first() {
        let (mut portfolio, mut ledger) = taxable();
        portfolio
            .buy_notional("VTI", dec!(1000), dec!(100), ymd(2020, 1, 2), &mut ledger)
            .unwrap();
        portfolio
            .buy_notional("VTI", dec!(1200), dec!(120), ymd(2020, 2, 3), &mut ledger)
            .unwrap();
        portfolio
            .sell_shares("VTI", dec!(10), dec!(150), ymd(2020, 6, 1), None, &mut ledger)
            .unwrap();
        // The January lot (basis 100) went first: gain 500.
        let event = &ledger.events()[0];
        assert_eq!(event.cost_basis, dec!(1000));
        assert_eq!(event.proceeds - event.cost_basis, dec!(500));
        assert_eq!(portfolio.lots("VTI")[0].basis_per_share, dec!(120));
    }

    #[test]
    fn lifo_consumes_newest_lot_first() {
        let (mut portfolio, mut ledger) = taxable();
        portfolio
            .buy_notional("VTI", dec!(1000), dec!(100), ymd(2020, 1, 2), &mut ledger)
            .unwrap();
        portfolio
            .buy_notional("VTI", dec!(1200), dec!(120), ymd(2020, 2, 3), &mut ledger)
            .unwrap();
        portfolio
            .sell_shares(
                "VTI",
                dec!(10),
                dec!(150),
                ymd(2020, 6, 1),
                Some(LotMethod::Lifo),
                &mut ledger,
            )
            .unwrap();
        assert_eq!(ledger.events()[0].cost_basis, dec!(1200));
        assert_eq!(portfolio.lots("VTI")[0].basis_per_share, dec!(100));
    }

    #[test]
    fn hifo_consumes_highest_basis_first() {
        let (mut portfolio, mut ledger) = taxable();
        portfolio
            .buy_notional("VTI", dec!(1200), dec!(120), ymd(2020, 1, 2), &mut ledger)
            .unwrap();
        portfolio
            .buy_notional("VTI", dec!(1000), dec!(100), ymd(2020, 2, 3), &mut ledger)
            .unwrap();
        portfolio
            .sell_shares(
                "VTI",
                dec!(10),
                dec!(150),
                ymd(2020, 6, 1),
                Some(LotMethod::Hifo),
                &mut ledger,
            )
            .unwrap();
        assert_eq!(ledger.events()[0].cost_basis, dec!(1200));
    }

    #[test]
    fn sale_spanning_lots_emits_one_event_per_lot() {
        let (mut portfolio, mut ledger) = taxable();
        portfolio
            .buy_notional("VTI", dec!(1000), dec!(100), ymd(2020, 1, 2), &mut ledger)
            .unwrap();
        portfolio
            .buy_notional("VTI", dec!(1200), dec!(120), ymd(2020, 2, 3), &mut ledger)
            .unwrap();
        portfolio
            .sell_shares("VTI", dec!(15), dec!(150), ymd(2020, 6, 1), None, &mut ledger)
            .unwrap();
        assert_eq!(ledger.events().len(), 2);
        assert_eq!(ledger.events()[0].quantity, dec!(10));
        assert_eq!(ledger.events()[1].quantity, dec!(5));
        // Proceeds allocate pro rata and sum exactly to the net amount.
        let total: Decimal = ledger.events().iter().map(|e| e.proceeds).sum();
        assert_eq!(total, dec!(2250));
    }

    #[test]
    fn holding_period_boundary_is_365_days() {
        let (mut portfolio, mut ledger) = taxable();
        portfolio
            .buy_notional("VTI", dec!(2000), dec!(100), ymd(2020, 1, 2), &mut ledger)
            .unwrap();
        portfolio
            .sell_shares("VTI", dec!(10), dec!(150), ymd(2021, 1, 1), None, &mut ledger)
            .unwrap();
        portfolio
            .sell_shares("VTI", dec!(10), dec!(150), ymd(2021, 1, 2), None, &mut ledger)
            .unwrap();
        assert_eq!(ledger.events()[0].term, GainTerm::ShortTerm); // 365 days
        assert_eq!(ledger.events()[1].term, GainTerm::LongTerm); // 366 days
    }

    #[test]
    fn split_preserves_total_basis() {
        let (mut portfolio, mut ledger) = taxable();
        portfolio
            .buy_notional("VTI", dec!(5000), dec!(50), ymd(2020, 1, 2), &mut ledger)
            .unwrap();
        portfolio.apply_split("VTI", dec!(2), ymd(2020, 3, 2));
        let lot = &portfolio.lots("VTI")[0];
        assert_eq!(lot.quantity, dec!(200));
        assert_eq!(lot.basis_per_share, dec!(25));

        // The inverse ratio restores the original lot.
        portfolio.apply_split("VTI", dec!(0.5), ymd(2020, 4, 2));
        let lot = &portfolio.lots("VTI")[0];
        assert_eq!(lot.quantity, dec!(100));
        assert_eq!(lot.basis_per_share, dec!(50));
    }

    #[test]
    fn dividend_cash_mode_credits_cash_and_ledger() {
        let (mut portfolio, mut ledger) = taxable();
        portfolio
            .buy_notional("VTI", dec!(10000), dec!(100), ymd(2020, 1, 2), &mut ledger)
            .unwrap();
        portfolio
            .apply_dividend(
                "VTI",
                dec!(0.50),
                0.8,
                ymd(2020, 3, 20),
                DividendMode::Cash,
                dec!(105),
                &mut ledger,
            )
            .unwrap();
        assert_eq!(portfolio.cash(), dec!(90050));
        let summary = ledger.close_year(2020);
        assert_eq!(summary.qualified_dividends, dec!(40));
        assert_eq!(summary.ordinary_dividends, dec!(10));
    }

    #[test]
    fn dividend_drip_mode_buys_at_close() {
        let (mut portfolio, mut ledger) = taxable();
        portfolio
            .buy_notional("VTI", dec!(10000), dec!(100), ymd(2020, 1, 2), &mut ledger)
            .unwrap();
        let ids = portfolio
            .apply_dividend(
                "VTI",
                dec!(0.50),
                0.8,
                ymd(2020, 3, 20),
                DividendMode::Drip,
                dec!(100),
                &mut ledger,
            )
            .unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(portfolio.quantity("VTI"), dec!(100.5));
        assert_eq!(portfolio.cash(), dec!(90000));
        assert_eq!(portfolio.lots("VTI").len(), 2);
        let drip_lot = &portfolio.lots("VTI")[1];
        assert_eq!(drip_lot.acquisition_date, ymd(2020, 3, 20));
    }

    #[test]
    fn dividend_on_empty_position_is_a_no_op() {
        let (mut portfolio, mut ledger) = taxable();
        let ids = portfolio
            .apply_dividend(
                "VTI",
                dec!(0.50),
                1.0,
                ymd(2020, 3, 20),
                DividendMode::Cash,
                dec!(100),
                &mut ledger,
            )
            .unwrap();
        assert!(ids.is_empty());
        assert_eq!(portfolio.cash(), dec!(100000));
    }

    #[test]
    fn wash_sale_adjusts_replacement_lot_basis() {
        let (mut portfolio, mut ledger) = taxable();
        // Buy 100 @ 100, sell at 90 for a 1,000 loss, rebuy 100 @ 92.
        portfolio
            .buy_notional("VTI", dec!(10000), dec!(100), ymd(2020, 1, 2), &mut ledger)
            .unwrap();
        portfolio
            .sell_shares("VTI", dec!(100), dec!(90), ymd(2020, 1, 22), None, &mut ledger)
            .unwrap();
        portfolio
            .buy_notional("VTI", dec!(9200), dec!(92), ymd(2020, 1, 27), &mut ledger)
            .unwrap();

        let event = &ledger.events()[0];
        assert_eq!(event.wash_disallowed, dec!(1000));
        assert_eq!(event.recognized_gain(), dec!(0));

        let lot = &portfolio.lots("VTI")[0];
        assert!(lot.washed_in);
        // 92 cost + 10/share disallowed loss.
        assert_eq!(lot.basis_per_share, dec!(102));
        assert_eq!(lot.acquisition_date, ymd(2020, 1, 27));
    }

    #[test]
    fn roth_deposit_respects_cap() {
        let mut portfolio = Portfolio::new(
            dec!(0),
            AccountType::RothIra,
            LotMethod::Fifo,
            Frictions::NONE,
            CapPolicy {
                annual_cap: Some(dec!(7000)),
                allow_partial: false,
            },
        );
        for month in 1..=7 {
            portfolio.deposit(dec!(1000), ymd(2024, month, 1)).unwrap();
        }
        let result = portfolio.deposit(dec!(1000), ymd(2024, 8, 1));
        assert!(matches!(
            result,
            Err(SimError::ContributionCapExceeded { .. })
        ));
        assert_eq!(portfolio.cash(), dec!(7000));

        // The cap resets with the calendar year.
        portfolio.deposit(dec!(1000), ymd(2025, 1, 2)).unwrap();
        assert_eq!(portfolio.cash(), dec!(8000));
    }

    #[test]
    fn partial_credit_fills_remaining_room() {
        let mut portfolio = Portfolio::new(
            dec!(0),
            AccountType::RothIra,
            LotMethod::Fifo,
            Frictions::NONE,
            CapPolicy {
                annual_cap: Some(dec!(7000)),
                allow_partial: true,
            },
        );
        portfolio.deposit(dec!(6500), ymd(2024, 1, 2)).unwrap();
        let credited = portfolio.deposit(dec!(1000), ymd(2024, 2, 1)).unwrap();
        assert_eq!(credited, dec!(500));
        assert_eq!(portfolio.cash(), dec!(7000));
    }

    #[test]
    fn trade_ids_increase_monotonically() {
        let (mut portfolio, mut ledger) = taxable();
        portfolio.deposit(dec!(100), ymd(2020, 1, 2)).unwrap();
        portfolio
            .buy_notional("VTI", dec!(1000), dec!(100), ymd(2020, 1, 2), &mut ledger)
            .unwrap();
        portfolio
            .sell_shares("VTI", dec!(5), dec!(100), ymd(2020, 1, 3), None, &mut ledger)
            .unwrap();
        let ids: Vec<_> = portfolio.trades().iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn consistency_check_passes_after_mixed_activity() {
        let (mut portfolio, mut ledger) = taxable();
        portfolio.deposit(dec!(500), ymd(2020, 1, 2)).unwrap();
        portfolio
            .buy_notional("VTI", dec!(10000), dec!(100), ymd(2020, 1, 2), &mut ledger)
            .unwrap();
        portfolio
            .apply_dividend(
                "VTI",
                dec!(0.30),
                1.0,
                ymd(2020, 3, 20),
                DividendMode::Drip,
                dec!(101),
                &mut ledger,
            )
            .unwrap();
        portfolio.deduct_tax(dec!(42));
        portfolio.verify_consistency(ymd(2020, 12, 31)).unwrap();

        let marked = portfolio.mark(&prices(&[("VTI", dec!(110))]));
        assert!(marked > dec!(11000));
    }
}

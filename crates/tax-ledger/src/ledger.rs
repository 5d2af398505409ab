use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate};
use log::debug;
use rust_decimal::Decimal;
use sim_core::{
    round_cash, AccountType, GainTerm, LotId, RealizedEvent, TaxConfig, TaxYearSummary,
};

use crate::wash::{WashAttribution, WashSaleTracker};

#[derive(Debug, Clone, Default)]
struct YearTotals {
    short_term: Decimal,
    long_term: Decimal,
    qualified: Decimal,
    ordinary: Decimal,
    interest: Decimal,
    wash_count: u32,
}

/// Accumulates realized gains, dividend income, and wash-sale activity by
/// calendar year, and computes the year-end tax.
///
/// Tax-advantaged accounts accrue nothing during the simulation; their
/// summaries report zero tax. The realized-event trail is kept for every
/// account type.
#[derive(Debug, Clone)]
pub struct TaxLedger {
    account_type: AccountType,
    config: TaxConfig,
    events: Vec<RealizedEvent>,
    years: BTreeMap<i32, YearTotals>,
    wash: WashSaleTracker,
}

impl TaxLedger {
    pub fn new(account_type: AccountType, config: TaxConfig) -> Self {
        Self {
            account_type,
            config,
            events: Vec::new(),
            years: BTreeMap::new(),
            wash: WashSaleTracker::new(),
        }
    }

    fn wash_enabled(&self) -> bool {
        self.account_type.is_taxable() && self.config.apply_wash_sale
    }

    /// Record a realized event from a SELL. For taxable accounts the gain
    /// lands in the year's short- or long-term bucket; a loss additionally
    /// runs backward wash matching against recent buys. Returns the basis
    /// adjustments the portfolio must apply to existing replacement lots.
    pub fn record_sale(
        &mut self,
        mut event: RealizedEvent,
        consumed_lots: &[LotId],
    ) -> Vec<WashAttribution> {
        let gain = event.proceeds - event.cost_basis;
        let year = event.date.year();
        let idx = self.events.len();

        if self.account_type.is_taxable() {
            let totals = self.years.entry(year).or_default();
            match event.term {
                GainTerm::ShortTerm => totals.short_term += gain,
                GainTerm::LongTerm => totals.long_term += gain,
            }
        }

        let mut attributions = Vec::new();
        if gain < Decimal::ZERO && self.wash_enabled() && event.quantity > Decimal::ZERO {
            let loss_per_share = (-gain) / event.quantity;
            attributions = self.wash.record_loss_sale(
                &event.symbol,
                event.date,
                event.quantity,
                loss_per_share,
                idx,
                consumed_lots,
            );
        }

        self.events.push(event);
        for attribution in &mut attributions {
            self.apply_disallowance(attribution);
        }
        attributions
    }

    /// Record a buy (or DRIP) for wash matching. Returns the adjustments to
    /// fold into the newly created lot's basis.
    pub fn record_buy(
        &mut self,
        symbol: &str,
        date: NaiveDate,
        lot_id: LotId,
        quantity: Decimal,
    ) -> Vec<WashAttribution> {
        if !self.wash_enabled() {
            return Vec::new();
        }
        let mut attributions = self.wash.record_buy(symbol, date, lot_id, quantity);
        for attribution in &mut attributions {
            self.apply_disallowance(attribution);
        }
        attributions
    }

    /// Flag the originating event and add the disallowed loss back to its
    /// year bucket, capping at the loss that remains disallowable.
    fn apply_disallowance(&mut self, attribution: &mut WashAttribution) {
        let event = &mut self.events[attribution.event_idx];
        let total_loss = event.cost_basis - event.proceeds;
        let remaining = (total_loss - event.wash_disallowed).max(Decimal::ZERO);
        attribution.disallowed = attribution.disallowed.min(remaining);
        if attribution.disallowed <= Decimal::ZERO {
            attribution.disallowed = Decimal::ZERO;
            return;
        }
        event.wash_disallowed += attribution.disallowed;

        let totals = self.years.entry(event.date.year()).or_default();
        match event.term {
            GainTerm::ShortTerm => totals.short_term += attribution.disallowed,
            GainTerm::LongTerm => totals.long_term += attribution.disallowed,
        }
        totals.wash_count += 1;
        debug!(
            "wash sale: {} {} disallowed into lot {}",
            event.symbol, attribution.disallowed, attribution.lot_id
        );
    }

    /// Shares sold from a lot stop being replacement-share candidates.
    pub fn note_lot_reduced(&mut self, lot_id: LotId, quantity: Decimal) {
        if self.wash_enabled() {
            self.wash.reduce_matchable(lot_id, quantity);
        }
    }

    /// Route a cash dividend into its qualified and ordinary buckets.
    pub fn record_dividend(&mut self, date: NaiveDate, amount: Decimal, qualified_pct: f64) {
        if !self.account_type.is_taxable() {
            return;
        }
        let qualified_pct = qualified_pct.clamp(0.0, 1.0);
        let qualified = round_cash(amount * rate(qualified_pct));
        let totals = self.years.entry(date.year()).or_default();
        totals.qualified += qualified;
        totals.ordinary += amount - qualified;
    }

    /// Interest on idle cash, taxed as ordinary income.
    pub fn record_interest(&mut self, date: NaiveDate, amount: Decimal) {
        if !self.account_type.is_taxable() {
            return;
        }
        self.years.entry(date.year()).or_default().interest += amount;
    }

    /// Drop expired wash windows and stale buy records.
    pub fn expire_wash_state(&mut self, as_of: NaiveDate) {
        self.wash.expire(as_of);
    }

    /// Compute the year's tax. Losses offset gains within class first (the
    /// buckets accumulate net), then short-term losses reduce long-term
    /// gains and vice versa. A net-negative year owes nothing and carries
    /// nothing forward.
    pub fn close_year(&self, year: i32) -> TaxYearSummary {
        let totals = self.years.get(&year).cloned().unwrap_or_default();

        let (st_taxable, lt_taxable) = offset_cross_class(totals.short_term, totals.long_term);

        let total_tax = if self.account_type.is_taxable() {
            let ordinary_rate = rate(self.config.federal_ordinary + self.config.state);
            let ltcg_rate = rate(self.config.federal_ltcg + self.config.state);
            round_cash(
                st_taxable * ordinary_rate
                    + lt_taxable * ltcg_rate
                    + totals.qualified * ltcg_rate
                    + (totals.ordinary + totals.interest) * ordinary_rate,
            )
        } else {
            Decimal::ZERO
        };

        TaxYearSummary {
            year,
            short_term_gains: round_cash(totals.short_term),
            long_term_gains: round_cash(totals.long_term),
            qualified_dividends: round_cash(totals.qualified),
            ordinary_dividends: round_cash(totals.ordinary),
            interest_income: round_cash(totals.interest),
            total_tax,
            wash_sale_count: totals.wash_count,
        }
    }

    /// Years with any recorded activity, ascending.
    pub fn active_years(&self) -> Vec<i32> {
        self.years.keys().copied().collect()
    }

    pub fn events(&self) -> &[RealizedEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<RealizedEvent> {
        self.events
    }

    /// End-of-period value after the account's withdrawal treatment: Roth
    /// and 529 withdraw tax-free, a Traditional IRA is taxed in full at the
    /// configured withdrawal rate, and a taxable account nets out the
    /// long-term tax on positive unrealized gains.
    pub fn after_tax_value(&self, total_value: Decimal, unrealized_gain: Decimal) -> Decimal {
        match self.account_type {
            AccountType::RothIra | AccountType::Plan529 => total_value,
            AccountType::TraditionalIra => round_cash(
                total_value * (Decimal::ONE - rate(self.config.withdrawal_tax_rate_for_ira)),
            ),
            AccountType::Taxable => {
                let gain_tax = if unrealized_gain > Decimal::ZERO {
                    unrealized_gain * rate(self.config.federal_ltcg + self.config.state)
                } else {
                    Decimal::ZERO
                };
                round_cash(total_value - gain_tax)
            }
        }
    }
}

/// Apply cross-class offsetting and return the taxable (non-negative)
/// short- and long-term amounts.
fn offset_cross_class(short_term: Decimal, long_term: Decimal) -> (Decimal, Decimal) {
    let mut st = short_term;
    let mut lt = long_term;
    if st < Decimal::ZERO && lt > Decimal::ZERO {
        lt = (lt + st).max(Decimal::ZERO);
        st = Decimal::ZERO;
    } else if lt < Decimal::ZERO && st > Decimal::ZERO {
        st = (st + lt).max(Decimal::ZERO);
        lt = Decimal::ZERO;
    }
    (st.max(Decimal::ZERO), lt.max(Decimal::ZERO))
}

fn rate(value: f64) -> Decimal {
    Decimal::from_f64_retain(value).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn event(
        date: NaiveDate,
        symbol: &str,
        quantity: Decimal,
        proceeds: Decimal,
        cost_basis: Decimal,
        term: GainTerm,
    ) -> RealizedEvent {
        RealizedEvent {
            date,
            symbol: symbol.into(),
            quantity,
            proceeds,
            cost_basis,
            holding_days: match term {
                GainTerm::ShortTerm => 100,
                GainTerm::LongTerm => 500,
            },
            term,
            wash_disallowed: Decimal::ZERO,
        }
    }

    fn taxable_ledger() -> TaxLedger {
        TaxLedger::new(AccountType::Taxable, TaxConfig::default())
    }

    #[test]
    fn gains_accumulate_by_term() {
        let mut ledger = taxable_ledger();
        ledger.record_sale(
            event(ymd(2020, 3, 2), "SPY", dec!(10), dec!(1100), dec!(1000), GainTerm::ShortTerm),
            &[],
        );
        ledger.record_sale(
            event(ymd(2020, 6, 2), "SPY", dec!(10), dec!(1300), dec!(1000), GainTerm::LongTerm),
            &[],
        );

        let summary = ledger.close_year(2020);
        assert_eq!(summary.short_term_gains, dec!(100));
        assert_eq!(summary.long_term_gains, dec!(300));
        // 100 * 0.38 + 300 * 0.21
        assert_eq!(summary.total_tax, dec!(101));
    }

    #[test]
    fn short_losses_reduce_long_gains() {
        let mut ledger = taxable_ledger();
        ledger.record_sale(
            event(ymd(2020, 3, 2), "SPY", dec!(10), dec!(800), dec!(1000), GainTerm::ShortTerm),
            &[],
        );
        ledger.record_sale(
            event(ymd(2020, 6, 2), "TLT", dec!(10), dec!(1500), dec!(1000), GainTerm::LongTerm),
            &[],
        );

        let summary = ledger.close_year(2020);
        // 500 long gain less 200 short loss, taxed at the LTCG+state rate.
        assert_eq!(summary.total_tax, dec!(63));
    }

    #[test]
    fn net_loss_year_owes_nothing() {
        let mut ledger = taxable_ledger();
        ledger.record_sale(
            event(ymd(2020, 3, 2), "SPY", dec!(10), dec!(500), dec!(1000), GainTerm::ShortTerm),
            &[],
        );
        let summary = ledger.close_year(2020);
        assert_eq!(summary.total_tax, dec!(0));
        // And the loss does not reach the following year.
        assert_eq!(ledger.close_year(2021).total_tax, dec!(0));
        assert_eq!(ledger.close_year(2021).short_term_gains, dec!(0));
    }

    #[test]
    fn dividends_split_by_qualified_fraction() {
        let mut ledger = taxable_ledger();
        ledger.record_dividend(ymd(2020, 9, 10), dec!(1000), 0.8);
        let summary = ledger.close_year(2020);
        assert_eq!(summary.qualified_dividends, dec!(800));
        assert_eq!(summary.ordinary_dividends, dec!(200));
        // 800 * 0.21 + 200 * 0.38
        assert_eq!(summary.total_tax, dec!(244));
    }

    #[test]
    fn roth_accrues_zero_tax() {
        let mut ledger = TaxLedger::new(AccountType::RothIra, TaxConfig::default());
        ledger.record_sale(
            event(ymd(2020, 3, 2), "SPY", dec!(10), dec!(2000), dec!(1000), GainTerm::ShortTerm),
            &[],
        );
        ledger.record_dividend(ymd(2020, 9, 10), dec!(1000), 0.8);
        let summary = ledger.close_year(2020);
        assert_eq!(summary.total_tax, dec!(0));
        assert_eq!(summary.qualified_dividends, dec!(0));
        // The audit trail is still kept.
        assert_eq!(ledger.events().len(), 1);
    }

    #[test]
    fn wash_sale_disallows_loss_and_flags_event() {
        let mut ledger = taxable_ledger();
        // Sell 100 shares at a 1,000 loss.
        ledger.record_sale(
            event(ymd(2020, 1, 20), "VTI", dec!(100), dec!(9000), dec!(10000), GainTerm::ShortTerm),
            &[],
        );
        // Replacement buy five days later.
        let adjustments = ledger.record_buy("VTI", ymd(2020, 1, 25), 42, dec!(100));
        assert_eq!(adjustments.len(), 1);
        assert_eq!(adjustments[0].disallowed, dec!(1000));

        let flagged = &ledger.events()[0];
        assert_eq!(flagged.wash_disallowed, dec!(1000));
        assert_eq!(flagged.recognized_gain(), dec!(0));

        let summary = ledger.close_year(2020);
        assert_eq!(summary.wash_sale_count, 1);
        // The disallowed loss is added back: no net short-term loss remains.
        assert_eq!(summary.short_term_gains, dec!(0));
    }

    #[test]
    fn disallowance_never_exceeds_the_loss() {
        let mut ledger = taxable_ledger();
        ledger.record_sale(
            event(ymd(2020, 1, 20), "VTI", dec!(100), dec!(9000), dec!(10000), GainTerm::ShortTerm),
            &[],
        );
        ledger.record_buy("VTI", ymd(2020, 1, 25), 42, dec!(100));
        // A second replacement buy finds nothing left to disallow.
        let adjustments = ledger.record_buy("VTI", ymd(2020, 1, 27), 43, dec!(100));
        assert!(adjustments.is_empty() || adjustments[0].disallowed == dec!(0));
        assert_eq!(ledger.events()[0].wash_disallowed, dec!(1000));
    }

    #[test]
    fn after_tax_value_by_account_type() {
        let ledger = taxable_ledger();
        assert_eq!(ledger.after_tax_value(dec!(10000), dec!(1000)), dec!(9790));

        let ledger = TaxLedger::new(AccountType::TraditionalIra, TaxConfig::default());
        assert_eq!(ledger.after_tax_value(dec!(10000), dec!(1000)), dec!(7500));

        let ledger = TaxLedger::new(AccountType::RothIra, TaxConfig::default());
        assert_eq!(ledger.after_tax_value(dec!(10000), dec!(1000)), dec!(10000));
    }
}

//! Wash-sale window tracking with quantity-matched FIFO attribution.
//!
//! A loss-producing sale opens a window spanning thirty calendar days on
//! either side of the sale date, both endpoints inclusive. Replacement buys
//! inside a window disallow the loss up to the overlapping quantity; the
//! disallowed amount moves into the replacement lot's cost basis. Buys that
//! predate the sale are matched when the sale is recorded, buys that follow
//! it are matched as they happen. Matching is FIFO on both sides, and a
//! share can serve as replacement for at most one sale.

use chrono::{Duration, NaiveDate};
use rust_decimal::Decimal;
use sim_core::{round_cash, LotId, WASH_SALE_DAYS};

/// One basis adjustment produced by matching a buy against a loss window.
#[derive(Debug, Clone, PartialEq)]
pub struct WashAttribution {
    /// The replacement lot whose basis absorbs the disallowed loss.
    pub lot_id: LotId,
    /// Shares matched.
    pub quantity: Decimal,
    /// Disallowed loss amount, rounded to cents.
    pub disallowed: Decimal,
    /// Index of the originating realized event in the ledger's trail.
    pub event_idx: usize,
}

#[derive(Debug, Clone)]
struct WashWindow {
    symbol: String,
    sale_date: NaiveDate,
    window_start: NaiveDate,
    window_end: NaiveDate,
    loss_per_share: Decimal,
    /// Sold quantity not yet matched by a replacement buy.
    open_quantity: Decimal,
    event_idx: usize,
}

impl WashWindow {
    fn contains(&self, date: NaiveDate) -> bool {
        date >= self.window_start && date <= self.window_end
    }
}

#[derive(Debug, Clone)]
struct BuyRecord {
    symbol: String,
    date: NaiveDate,
    lot_id: LotId,
    /// Shares still usable as replacement shares.
    matchable: Decimal,
}

/// Tracks loss windows and candidate replacement buys for one portfolio.
#[derive(Debug, Clone, Default)]
pub struct WashSaleTracker {
    windows: Vec<WashWindow>,
    buys: Vec<BuyRecord>,
}

impl WashSaleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a buy (or DRIP) and match it FIFO against any open windows
    /// whose span contains the buy date. Returns the adjustments the caller
    /// must apply to the newly created lot.
    pub fn record_buy(
        &mut self,
        symbol: &str,
        date: NaiveDate,
        lot_id: LotId,
        quantity: Decimal,
    ) -> Vec<WashAttribution> {
        let mut attributions = Vec::new();
        let mut unmatched = quantity;

        for window in self
            .windows
            .iter_mut()
            .filter(|w| w.symbol == symbol && w.open_quantity > Decimal::ZERO)
        {
            if unmatched <= Decimal::ZERO {
                break;
            }
            if !window.contains(date) {
                continue;
            }
            let matched = unmatched.min(window.open_quantity);
            window.open_quantity -= matched;
            unmatched -= matched;
            attributions.push(WashAttribution {
                lot_id,
                quantity: matched,
                disallowed: round_cash(matched * window.loss_per_share),
                event_idx: window.event_idx,
            });
        }

        self.buys.push(BuyRecord {
            symbol: symbol.to_string(),
            date,
            lot_id,
            matchable: unmatched,
        });

        attributions
    }

    /// Record a loss-producing sale. Buys already on the books within the
    /// thirty days leading up to the sale are matched immediately (FIFO by
    /// buy date), excluding the lots the sale itself consumed; any remainder
    /// stays open for forward matching until the window expires.
    pub fn record_loss_sale(
        &mut self,
        symbol: &str,
        sale_date: NaiveDate,
        quantity: Decimal,
        loss_per_share: Decimal,
        event_idx: usize,
        consumed_lots: &[LotId],
    ) -> Vec<WashAttribution> {
        let window_start = sale_date - Duration::days(WASH_SALE_DAYS);
        let window_end = sale_date + Duration::days(WASH_SALE_DAYS);
        let mut attributions = Vec::new();
        let mut open = quantity;

        for buy in self.buys.iter_mut().filter(|b| {
            b.symbol == symbol
                && b.matchable > Decimal::ZERO
                && b.date >= window_start
                && b.date <= sale_date
                && !consumed_lots.contains(&b.lot_id)
        }) {
            if open <= Decimal::ZERO {
                break;
            }
            let matched = open.min(buy.matchable);
            buy.matchable -= matched;
            open -= matched;
            attributions.push(WashAttribution {
                lot_id: buy.lot_id,
                quantity: matched,
                disallowed: round_cash(matched * loss_per_share),
                event_idx,
            });
        }

        if open > Decimal::ZERO {
            self.windows.push(WashWindow {
                symbol: symbol.to_string(),
                sale_date,
                window_start,
                window_end,
                loss_per_share,
                open_quantity: open,
                event_idx,
            });
        }

        attributions
    }

    /// Shares sold out of an existing lot can no longer act as replacement
    /// shares; the portfolio reports every lot reduction here.
    pub fn reduce_matchable(&mut self, lot_id: LotId, quantity: Decimal) {
        let mut remaining = quantity;
        for buy in self
            .buys
            .iter_mut()
            .filter(|b| b.lot_id == lot_id && b.matchable > Decimal::ZERO)
        {
            if remaining <= Decimal::ZERO {
                break;
            }
            let taken = remaining.min(buy.matchable);
            buy.matchable -= taken;
            remaining -= taken;
        }
    }

    /// Drop windows whose forward span has lapsed and buy records too old to
    /// ever fall inside a new window.
    pub fn expire(&mut self, as_of: NaiveDate) {
        self.windows
            .retain(|w| w.window_end >= as_of && w.open_quantity > Decimal::ZERO);
        let horizon = as_of - Duration::days(WASH_SALE_DAYS);
        self.buys
            .retain(|b| b.date >= horizon && b.matchable > Decimal::ZERO);
    }

    /// Open (unmatched, unexpired) loss quantity for a symbol.
    pub fn open_quantity(&self, symbol: &str) -> Decimal {
        self.windows
            .iter()
            .filter(|w| w.symbol == symbol)
            .map(|w| w.open_quantity)
            .sum()
    }
}

//! The data seam between the simulation core and the outside world.
//!
//! `PriceSource` is the only interface through which the driver may suspend;
//! implementations that perform I/O own their timeouts. `MemoryPriceSource`
//! is the reference implementation: an immutable preloaded store, safe to
//! share across concurrently running simulations.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::error::SimResult;
use crate::types::{Bar, DividendAction, SplitAction};

/// Read-only market data provider.
///
/// Implementations must return records in non-decreasing date order and be
/// safe to call from multiple threads.
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn bars(&self, symbol: &str, start: NaiveDate, end: NaiveDate) -> SimResult<Vec<Bar>>;

    async fn dividends(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> SimResult<Vec<DividendAction>>;

    async fn splits(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> SimResult<Vec<SplitAction>>;

    /// Annual expense ratio, if the instrument has one.
    async fn expense_ratio(&self, symbol: &str) -> SimResult<Option<f64>>;

    /// Whether the symbol has stopped trading as of `date`.
    async fn is_delisted(&self, symbol: &str, date: NaiveDate) -> SimResult<bool>;
}

/// Preloaded data for one symbol.
#[derive(Debug, Clone, Default)]
pub struct SymbolData {
    pub bars: Vec<Bar>,
    pub dividends: Vec<DividendAction>,
    pub splits: Vec<SplitAction>,
    pub expense_ratio: Option<f64>,
    /// The symbol stops trading after this date, if set.
    pub delisted_after: Option<NaiveDate>,
}

/// In-memory `PriceSource` backed by immutable preloaded data.
#[derive(Debug, Clone, Default)]
pub struct MemoryPriceSource {
    symbols: BTreeMap<String, SymbolData>,
}

impl MemoryPriceSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, symbol: impl Into<String>, data: SymbolData) {
        self.symbols.insert(symbol.into(), data);
    }

    pub fn with_bars(mut self, symbol: impl Into<String>, bars: Vec<Bar>) -> Self {
        self.symbols.entry(symbol.into()).or_default().bars = bars;
        self
    }

    pub fn with_dividends(
        mut self,
        symbol: impl Into<String>,
        dividends: Vec<DividendAction>,
    ) -> Self {
        self.symbols.entry(symbol.into()).or_default().dividends = dividends;
        self
    }

    pub fn with_splits(mut self, symbol: impl Into<String>, splits: Vec<SplitAction>) -> Self {
        self.symbols.entry(symbol.into()).or_default().splits = splits;
        self
    }

    pub fn with_expense_ratio(mut self, symbol: impl Into<String>, er: f64) -> Self {
        self.symbols.entry(symbol.into()).or_default().expense_ratio = Some(er);
        self
    }

    pub fn with_delisted_after(mut self, symbol: impl Into<String>, date: NaiveDate) -> Self {
        self.symbols.entry(symbol.into()).or_default().delisted_after = Some(date);
        self
    }

    fn data(&self, symbol: &str) -> Option<&SymbolData> {
        self.symbols.get(symbol)
    }
}

#[async_trait]
impl PriceSource for MemoryPriceSource {
    async fn bars(&self, symbol: &str, start: NaiveDate, end: NaiveDate) -> SimResult<Vec<Bar>> {
        Ok(self
            .data(symbol)
            .map(|d| {
                d.bars
                    .iter()
                    .filter(|b| b.date >= start && b.date <= end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn dividends(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> SimResult<Vec<DividendAction>> {
        Ok(self
            .data(symbol)
            .map(|d| {
                d.dividends
                    .iter()
                    .filter(|a| a.ex_date >= start && a.ex_date <= end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn splits(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> SimResult<Vec<SplitAction>> {
        Ok(self
            .data(symbol)
            .map(|d| {
                d.splits
                    .iter()
                    .filter(|a| a.ex_date >= start && a.ex_date <= end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn expense_ratio(&self, symbol: &str) -> SimResult<Option<f64>> {
        Ok(self.data(symbol).and_then(|d| d.expense_ratio))
    }

    async fn is_delisted(&self, symbol: &str, date: NaiveDate) -> SimResult<bool> {
        Ok(self
            .data(symbol)
            .and_then(|d| d.delisted_after)
            .is_some_and(|cutoff| date > cutoff))
    }
}

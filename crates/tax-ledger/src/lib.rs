//! Tax accounting for the simulation core.
//!
//! The ledger owns the realized-event trail and the per-year accumulators;
//! the portfolio reports every sale, buy, dividend, and interest accrual to
//! it and applies whatever basis adjustments wash-sale matching hands back.
//! Nothing here ever reaches into the portfolio.

mod ledger;
mod wash;

pub use ledger::TaxLedger;
pub use wash::{WashAttribution, WashSaleTracker};

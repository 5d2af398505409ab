//! Shared data model for the backtesting simulation core.
//!
//! Everything the engine crates exchange lives here: market data records,
//! per-lot ledger types, the validated strategy configuration, the error
//! taxonomy, the `PriceSource` seam to the outside world, and the
//! day-boundary cancellation token.

pub mod cancel;
pub mod config;
pub mod error;
pub mod source;
pub mod types;

pub use cancel::CancelToken;
pub use config::*;
pub use error::{SimError, SimResult};
pub use source::{MemoryPriceSource, PriceSource, SymbolData};
pub use types::*;

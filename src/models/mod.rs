//! Data models for bars, positions, trades, and instrument rules.

mod bar;
mod instrument;
mod position;
mod trade;

pub use bar::Bar;
pub use instrument::{parse_filter_decimal, InstrumentConstraints};
pub use position::Position;
pub use trade::{TradeRecord, TradeSide};

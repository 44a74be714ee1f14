//! Risk management: sizing, pre-trade limits, protective levels, statistics.

mod engine;
mod limits;
pub mod stats;

pub use engine::{RiskContext, RiskEngine, RiskVerdict, SizeDecision, SizingInputs, StopInputs};
pub use limits::{RiskLimits, RiskSnapshot};
pub use stats::SymbolStats;

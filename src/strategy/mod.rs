//! Trading strategies: signal generation over bar history.
//!
//! Strategies are advisory. They say *whether* to trade; the risk engine
//! decides *how much* and whether the trade is allowed at all.

mod moving_average;
mod rsi;

use anyhow::{bail, Result};
use rust_decimal::Decimal;

pub use moving_average::MovingAverageStrategy;
pub use rsi::RsiStrategy;

use crate::models::Bar;

/// Advisory trading signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Buy,
    Sell,
    Hold,
}

/// How the protective stop for a position should be derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMethod {
    /// ATR multiple below/above entry
    Atr,
    /// Fixed percentage from entry
    Percentage,
    /// Below trailing support (longs) or above trailing resistance (shorts)
    SupportResistance,
}

/// A signal generator over chronological bar history.
///
/// Implementations must be pure with respect to the bars they are given:
/// the backtester relies on identical input producing identical signals.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    /// Bars of history required before signals are meaningful.
    fn warmup(&self) -> usize;

    /// Evaluate the newest bar in context. Bars are oldest-first and the
    /// last element is the bar being decided on.
    fn generate_signal(&self, bars: &[Bar]) -> Signal;

    /// Conviction in the latest signal, in [0, 1]. Scales position size.
    fn signal_strength(&self, _bars: &[Bar]) -> f64 {
        1.0
    }

    fn stop_method(&self) -> StopMethod {
        StopMethod::Percentage
    }

    /// Whether sell signals on a flat book may open short positions.
    fn allow_short(&self) -> bool {
        false
    }
}

/// Build a strategy from its CLI name.
pub fn build(name: &str) -> Result<Box<dyn Strategy>> {
    match name.to_lowercase().as_str() {
        "ma" | "moving_average" => Ok(Box::new(MovingAverageStrategy::default())),
        "rsi" => Ok(Box::new(RsiStrategy::default())),
        other => bail!("unknown strategy {:?} (expected 'ma' or 'rsi')", other),
    }
}

/// Simple moving average of the last `period` closes.
pub(crate) fn sma(bars: &[Bar], period: usize) -> Option<Decimal> {
    if period == 0 || bars.len() < period {
        return None;
    }
    let sum: Decimal = bars[bars.len() - period..].iter().map(|b| b.close).sum();
    Some(sum / Decimal::from(period as u64))
}

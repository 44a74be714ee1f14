//! Dual moving-average crossover strategy.

use rust_decimal::prelude::ToPrimitive;

use crate::models::Bar;

use super::{sma, Signal, StopMethod, Strategy};

/// Golden-cross / death-cross strategy on close prices.
///
/// Buys when the short average crosses above the long average on the
/// newest bar, sells on the opposite cross. Between crosses it holds.
#[derive(Debug, Clone)]
pub struct MovingAverageStrategy {
    pub short_period: usize,
    pub long_period: usize,
}

impl Default for MovingAverageStrategy {
    fn default() -> Self {
        Self {
            short_period: 10,
            long_period: 30,
        }
    }
}

impl Strategy for MovingAverageStrategy {
    fn name(&self) -> &str {
        "moving_average"
    }

    fn warmup(&self) -> usize {
        self.long_period + 1
    }

    fn generate_signal(&self, bars: &[Bar]) -> Signal {
        if bars.len() < self.warmup() {
            return Signal::Hold;
        }

        let prev = &bars[..bars.len() - 1];

        let (Some(short_now), Some(long_now), Some(short_prev), Some(long_prev)) = (
            sma(bars, self.short_period),
            sma(bars, self.long_period),
            sma(prev, self.short_period),
            sma(prev, self.long_period),
        ) else {
            return Signal::Hold;
        };

        if short_prev <= long_prev && short_now > long_now {
            Signal::Buy
        } else if short_prev >= long_prev && short_now < long_now {
            Signal::Sell
        } else {
            Signal::Hold
        }
    }

    /// Separation between the averages, relative to the long average.
    /// A fresh cross with wide separation reads as higher conviction.
    fn signal_strength(&self, bars: &[Bar]) -> f64 {
        let (Some(short), Some(long)) = (sma(bars, self.short_period), sma(bars, self.long_period))
        else {
            return 0.0;
        };
        if long.is_zero() {
            return 0.0;
        }

        let spread = ((short - long) / long).abs().to_f64().unwrap_or(0.0);
        // 1% separation or more counts as full conviction
        (spread * 100.0).min(1.0)
    }

    fn stop_method(&self) -> StopMethod {
        StopMethod::SupportResistance
    }
}

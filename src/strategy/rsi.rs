//! RSI mean-reversion strategy.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::models::Bar;

use super::{Signal, StopMethod, Strategy};

/// Relative Strength Index strategy: buy oversold, sell overbought.
#[derive(Debug, Clone)]
pub struct RsiStrategy {
    pub period: usize,
    pub oversold: f64,
    pub overbought: f64,
}

impl Default for RsiStrategy {
    fn default() -> Self {
        Self {
            period: 14,
            oversold: 30.0,
            overbought: 70.0,
        }
    }
}

impl RsiStrategy {
    /// RSI over the trailing `period` closes, in [0, 100].
    /// Returns `None` until enough history exists.
    fn rsi(&self, bars: &[Bar]) -> Option<f64> {
        if self.period == 0 || bars.len() < self.period + 1 {
            return None;
        }

        let window = &bars[bars.len() - self.period - 1..];
        let mut gain_sum = Decimal::ZERO;
        let mut loss_sum = Decimal::ZERO;

        for pair in window.windows(2) {
            let change = pair[1].close - pair[0].close;
            if change > Decimal::ZERO {
                gain_sum += change;
            } else {
                loss_sum += -change;
            }
        }

        if loss_sum.is_zero() {
            return Some(100.0);
        }

        let rs = (gain_sum / loss_sum).to_f64()?;
        Some(100.0 - 100.0 / (1.0 + rs))
    }
}

impl Strategy for RsiStrategy {
    fn name(&self) -> &str {
        "rsi"
    }

    fn warmup(&self) -> usize {
        self.period + 1
    }

    fn generate_signal(&self, bars: &[Bar]) -> Signal {
        match self.rsi(bars) {
            Some(rsi) if rsi <= self.oversold => Signal::Buy,
            Some(rsi) if rsi >= self.overbought => Signal::Sell,
            _ => Signal::Hold,
        }
    }

    /// Distance beyond the threshold, so an RSI of 10 sizes larger than 29.
    fn signal_strength(&self, bars: &[Bar]) -> f64 {
        let Some(rsi) = self.rsi(bars) else {
            return 0.0;
        };

        if rsi <= self.oversold {
            ((self.oversold - rsi) / self.oversold + 0.5).min(1.0)
        } else if rsi >= self.overbought {
            ((rsi - self.overbought) / (100.0 - self.overbought) + 0.5).min(1.0)
        } else {
            0.0
        }
    }

    fn stop_method(&self) -> StopMethod {
        StopMethod::Atr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use rust_decimal_macros::dec;

    fn bars_from_closes(closes: &[Decimal]) -> Vec<Bar> {
        let start = Utc::now();
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Bar {
                open_time: start + Duration::hours(i as i64),
                open: close,
                high: close,
                low: close,
                close,
                volume: dec!(100),
            })
            .collect()
    }

    fn strategy() -> RsiStrategy {
        RsiStrategy {
            period: 5,
            oversold: 30.0,
            overbought: 70.0,
        }
    }

    #[test]
    fn test_monotonic_decline_is_oversold() {
        let closes: Vec<_> = (0..8).map(|i| Decimal::from(100 - i * 5)).collect();
        let bars = bars_from_closes(&closes);

        let rsi = strategy().rsi(&bars).unwrap();
        assert!(rsi < 30.0, "rsi = {}", rsi);
        assert_eq!(strategy().generate_signal(&bars), Signal::Buy);
    }

    #[test]
    fn test_monotonic_rally_is_overbought() {
        let closes: Vec<_> = (0..8).map(|i| Decimal::from(100 + i * 5)).collect();
        let bars = bars_from_closes(&closes);

        assert_eq!(strategy().rsi(&bars), Some(100.0));
        assert_eq!(strategy().generate_signal(&bars), Signal::Sell);
    }

    #[test]
    fn test_neutral_holds() {
        let closes = vec![
            dec!(100),
            dec!(102),
            dec!(99),
            dec!(101),
            dec!(98),
            dec!(102),
            dec!(100),
        ];
        let bars = bars_from_closes(&closes);

        assert_eq!(strategy().generate_signal(&bars), Signal::Hold);
    }

    #[test]
    fn test_insufficient_history_holds() {
        let bars = bars_from_closes(&[dec!(100), dec!(101)]);
        assert_eq!(strategy().generate_signal(&bars), Signal::Hold);
    }

    #[test]
    fn test_strength_bounded() {
        let closes: Vec<_> = (0..8).map(|i| Decimal::from(100 - i * 5)).collect();
        let bars = bars_from_closes(&closes);

        let s = strategy().signal_strength(&bars);
        assert!((0.0..=1.0).contains(&s));
        assert!(s >= 0.5);
    }
}

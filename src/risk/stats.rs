//! Statistical helpers: trade statistics, volatility, ATR, price levels.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use statrs::statistics::Statistics;

use crate::models::Bar;

/// Trading periods per year used for annualization (daily convention).
pub const PERIODS_PER_YEAR: f64 = 252.0;

/// Rolling win/loss record for one symbol, kept in memory by whoever owns
/// the trading loop. Persistence is telemetry only and never read back.
#[derive(Debug, Clone, Default)]
pub struct SymbolStats {
    pnls: Vec<Decimal>,
}

impl SymbolStats {
    /// Record the realized P&L of a completed round trip.
    pub fn record(&mut self, pnl: Decimal) {
        self.pnls.push(pnl);
    }

    /// Number of completed round trips.
    pub fn completed(&self) -> usize {
        self.pnls.len()
    }

    pub fn win_rate(&self) -> f64 {
        if self.pnls.is_empty() {
            return 0.0;
        }
        let wins = self.pnls.iter().filter(|p| **p > Decimal::ZERO).count();
        wins as f64 / self.pnls.len() as f64
    }

    /// Mean profit of winning trades, zero when there are none.
    pub fn avg_win(&self) -> Decimal {
        let wins: Vec<_> = self.pnls.iter().filter(|p| **p > Decimal::ZERO).collect();
        if wins.is_empty() {
            return Decimal::ZERO;
        }
        wins.iter().copied().sum::<Decimal>() / Decimal::from(wins.len() as u64)
    }

    /// Mean absolute loss of losing trades, zero when there are none.
    pub fn avg_loss(&self) -> Decimal {
        let losses: Vec<_> = self.pnls.iter().filter(|p| **p < Decimal::ZERO).collect();
        if losses.is_empty() {
            return Decimal::ZERO;
        }
        losses.iter().map(|p| p.abs()).sum::<Decimal>() / Decimal::from(losses.len() as u64)
    }
}

/// Simple close-to-close returns, oldest first.
pub fn close_returns(bars: &[Bar]) -> Vec<f64> {
    bars.windows(2)
        .filter_map(|pair| {
            let prev = pair[0].close.to_f64()?;
            let cur = pair[1].close.to_f64()?;
            if prev == 0.0 {
                None
            } else {
                Some(cur / prev - 1.0)
            }
        })
        .collect()
}

/// Annualized volatility of close-to-close returns.
/// Returns `None` with fewer than three bars.
pub fn annualized_volatility(bars: &[Bar]) -> Option<f64> {
    let returns = close_returns(bars);
    if returns.len() < 2 {
        return None;
    }
    let std_dev = returns.std_dev();
    if !std_dev.is_finite() {
        return None;
    }
    Some(std_dev * PERIODS_PER_YEAR.sqrt())
}

/// Average true range over the trailing `period` bars.
pub fn average_true_range(bars: &[Bar], period: usize) -> Option<Decimal> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }

    let window = &bars[bars.len() - period - 1..];
    let sum: Decimal = window
        .windows(2)
        .map(|pair| pair[1].true_range(pair[0].close))
        .sum();

    Some(sum / Decimal::from(period as u64))
}

/// Trailing support level: lowest low of the last `lookback` bars.
pub fn support_level(bars: &[Bar], lookback: usize) -> Option<Decimal> {
    if bars.is_empty() {
        return None;
    }
    let start = bars.len().saturating_sub(lookback);
    bars[start..].iter().map(|b| b.low).min()
}

/// Trailing resistance level: highest high of the last `lookback` bars.
pub fn resistance_level(bars: &[Bar], lookback: usize) -> Option<Decimal> {
    if bars.is_empty() {
        return None;
    }
    let start = bars.len().saturating_sub(lookback);
    bars[start..].iter().map(|b| b.high).max()
}

/// Pearson correlation of two equal-length return series.
/// Zero when either series is degenerate.
pub fn correlation(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n < 2 {
        return 0.0;
    }
    let a = &a[a.len() - n..];
    let b = &b[b.len() - n..];

    let mean_a = a.to_vec().mean();
    let mean_b = b.to_vec().mean();

    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for i in 0..n {
        let da = a[i] - mean_a;
        let db = b[i] - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }

    if var_a == 0.0 || var_b == 0.0 {
        return 0.0;
    }
    cov / (var_a.sqrt() * var_b.sqrt())
}

/// Loss at the given percentile of the return distribution, as a positive
/// fraction. `percentile` is e.g. 0.95 for VaR(95).
pub fn value_at_risk(returns: &[f64], percentile: f64) -> f64 {
    if returns.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<f64> = returns.to_vec();
    sorted.sort_by(|x, y| x.partial_cmp(y).unwrap_or(std::cmp::Ordering::Equal));

    let idx = ((1.0 - percentile) * sorted.len() as f64).floor() as usize;
    let idx = idx.min(sorted.len() - 1);
    (-sorted[idx]).max(0.0)
}

/// Maximum peak-to-trough drawdown of an equity curve, as a fraction.
pub fn max_drawdown(equity: &[Decimal]) -> f64 {
    let mut peak = Decimal::ZERO;
    let mut max_dd = 0.0f64;

    for &point in equity {
        if point > peak {
            peak = point;
        }
        if peak > Decimal::ZERO {
            let dd = ((peak - point) / peak).to_f64().unwrap_or(0.0);
            if dd > max_dd {
                max_dd = dd;
            }
        }
    }

    max_dd
}

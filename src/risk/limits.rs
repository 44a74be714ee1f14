//! Risk limit configuration and portfolio risk snapshot.

use anyhow::{bail, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Hard limits the risk engine enforces before any order is placed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimits {
    /// Maximum fraction of portfolio value in a single asset
    pub max_asset_weight: Decimal,

    /// Maximum projected portfolio VaR as a fraction of portfolio value
    pub max_portfolio_var: f64,

    /// Daily realized loss, as a fraction of portfolio value, that halts new entries
    pub max_daily_loss: Decimal,

    /// Maximum pairwise return correlation with an existing holding
    pub max_correlation: f64,

    /// A single trade may consume at most this fraction of 24h quote volume
    pub max_volume_fraction: f64,

    /// Maximum acceptable bid/ask spread relative to mid price
    pub max_spread_pct: f64,

    /// Upper bound on the Kelly fraction
    pub kelly_cap: f64,

    /// Fraction used when trade history is too thin for Kelly
    pub fallback_fraction: f64,

    /// Closed trades required before Kelly statistics are trusted
    pub min_sample_trades: usize,

    /// Annualized volatility the sizing scales toward
    pub target_volatility: f64,

    /// Volatility assumed when none can be derived
    pub default_volatility: f64,

    /// Stop distance for percentage stops
    pub stop_pct: Decimal,

    /// Narrowest allowed stop, as a fraction of entry
    pub stop_clamp_min: Decimal,

    /// Widest allowed stop, as a fraction of entry
    pub stop_clamp_max: Decimal,

    /// ATR multiple for ATR-based stops
    pub atr_multiple: Decimal,

    /// Reward-to-risk ratio for take-profit projection
    pub reward_ratio: Decimal,

    /// Buffer applied below support / above resistance levels
    pub level_buffer_pct: Decimal,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_asset_weight: dec!(0.3),     // 30% per asset
            max_portfolio_var: 0.15,
            max_daily_loss: dec!(0.10),      // Halt entries at -10% on the day
            max_correlation: 0.8,
            max_volume_fraction: 0.01,       // 1% of 24h volume
            max_spread_pct: 0.01,
            kelly_cap: 0.25,                 // Quarter Kelly ceiling
            fallback_fraction: 0.05,
            min_sample_trades: 5,
            target_volatility: 0.2,
            default_volatility: 0.2,
            stop_pct: dec!(0.02),
            stop_clamp_min: dec!(0.01),
            stop_clamp_max: dec!(0.05),
            atr_multiple: dec!(2),
            reward_ratio: dec!(2),
            level_buffer_pct: dec!(0.01),
        }
    }
}

impl RiskLimits {
    /// Reject nonsensical limit combinations. Called once at startup;
    /// failure here is fatal.
    pub fn validate(&self) -> Result<()> {
        if self.max_asset_weight <= Decimal::ZERO || self.max_asset_weight > Decimal::ONE {
            bail!("max_asset_weight must be in (0, 1], got {}", self.max_asset_weight);
        }
        if !(0.0..=1.0).contains(&self.max_portfolio_var) || self.max_portfolio_var == 0.0 {
            bail!("max_portfolio_var must be in (0, 1], got {}", self.max_portfolio_var);
        }
        if self.max_daily_loss <= Decimal::ZERO || self.max_daily_loss > Decimal::ONE {
            bail!("max_daily_loss must be in (0, 1], got {}", self.max_daily_loss);
        }
        if !(0.0..=1.0).contains(&self.max_correlation) {
            bail!("max_correlation must be in [0, 1], got {}", self.max_correlation);
        }
        if self.kelly_cap <= 0.0 || self.kelly_cap > 1.0 {
            bail!("kelly_cap must be in (0, 1], got {}", self.kelly_cap);
        }
        if self.fallback_fraction < 0.0 || self.fallback_fraction > self.kelly_cap {
            bail!(
                "fallback_fraction must be in [0, kelly_cap], got {}",
                self.fallback_fraction
            );
        }
        if self.target_volatility <= 0.0 || self.default_volatility <= 0.0 {
            bail!("volatility parameters must be positive");
        }
        if self.stop_clamp_min <= Decimal::ZERO || self.stop_clamp_min >= self.stop_clamp_max {
            bail!(
                "stop clamp band invalid: [{}, {}]",
                self.stop_clamp_min,
                self.stop_clamp_max
            );
        }
        if self.reward_ratio <= Decimal::ZERO {
            bail!("reward_ratio must be positive, got {}", self.reward_ratio);
        }
        Ok(())
    }
}

/// Point-in-time portfolio risk figures, recomputed from current state on
/// every request rather than cached.
#[derive(Debug, Clone, Default)]
pub struct RiskSnapshot {
    pub portfolio_value: Decimal,
    pub var_95: f64,
    pub var_99: f64,
    pub volatility: f64,
    pub sharpe_ratio: f64,
    pub max_drawdown: f64,
    pub benchmark_correlation: f64,
}

impl std::fmt::Display for RiskSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{:=^48}", " RISK SNAPSHOT ")?;
        writeln!(f, "Portfolio Value:  ${:.2}", self.portfolio_value)?;
        writeln!(f, "VaR (95%):        {:.2}%", self.var_95 * 100.0)?;
        writeln!(f, "VaR (99%):        {:.2}%", self.var_99 * 100.0)?;
        writeln!(f, "Volatility (ann): {:.2}%", self.volatility * 100.0)?;
        writeln!(f, "Sharpe Ratio:     {:.2}", self.sharpe_ratio)?;
        writeln!(f, "Max Drawdown:     {:.2}%", self.max_drawdown * 100.0)?;
        writeln!(f, "Benchmark Corr:   {:.2}", self.benchmark_correlation)?;
        Ok(())
    }
}

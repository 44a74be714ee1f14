//! Historical simulation over bar data.
//!
//! The simulator drives a strategy bar by bar through the same sizing,
//! quantization, and protective-level code the live engine uses. Fills
//! happen at the decision bar's close; stops and targets are evaluated
//! against closes, never intrabar. Runs are deterministic: the same bars
//! and configuration always produce the same ledger.

mod ledger;
mod report;

use std::path::Path;

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::debug;

pub use ledger::{LedgerEntry, SimulationLedger, TradeAction};
pub use report::BacktestReport;

use crate::models::{Bar, InstrumentConstraints, TradeSide};
use crate::quantizer;
use crate::risk::{stats, RiskEngine, SizeDecision, SizingInputs, StopInputs, SymbolStats};
use crate::strategy::{Signal, StopMethod, Strategy};

/// Minimum bars of history before the first decision, regardless of the
/// strategy's own warmup. Volatility and trailing levels need depth too.
const MIN_WARMUP_BARS: usize = 50;

/// Simulation parameters.
#[derive(Debug, Clone)]
pub struct BacktestConfig {
    pub initial_capital: Decimal,

    /// Commission charged on the notional of each fill
    pub commission_rate: Decimal,

    /// Whether sell signals on a flat book open shorts
    pub allow_short: bool,

    /// Quantity grid to quantize against; `None` trades un-quantized
    pub constraints: Option<InstrumentConstraints>,

    pub atr_period: usize,
    pub level_lookback: usize,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            initial_capital: dec!(10000),
            commission_rate: dec!(0.001), // 10 bps per fill
            allow_short: false,
            constraints: None,
            atr_period: 14,
            level_lookback: 20,
        }
    }
}

/// Ledger plus summary for one finished run.
#[derive(Debug)]
pub struct BacktestOutcome {
    pub report: BacktestReport,
    pub ledger: SimulationLedger,
}

/// Bar-by-bar strategy simulator.
pub struct BacktestSimulator {
    config: BacktestConfig,
    risk: RiskEngine,
}

impl BacktestSimulator {
    pub fn new(config: BacktestConfig, risk: RiskEngine) -> Self {
        Self { config, risk }
    }

    /// Run the strategy over `bars` (oldest first) and produce the ledger
    /// and report. Any open position is force-closed on the final bar.
    pub fn run(
        &self,
        strategy: &dyn Strategy,
        symbol: &str,
        bars: &[Bar],
    ) -> Result<BacktestOutcome> {
        let warmup = strategy.warmup().max(MIN_WARMUP_BARS);
        if bars.len() <= warmup {
            bail!(
                "need more than {} bars for strategy {:?}, got {}",
                warmup,
                strategy.name(),
                bars.len()
            );
        }

        let mut ledger =
            SimulationLedger::new(self.config.initial_capital, self.config.commission_rate);
        let mut stats = SymbolStats::default();
        let mut protective: Option<(Decimal, Decimal)> = None;

        for i in warmup..bars.len() {
            let window = &bars[..=i];
            let bar = &bars[i];
            let price = bar.close;

            // Protective exits fire before the strategy speaks
            if let Some((stop, target)) = protective {
                if let Some(action) = exit_action(&ledger, price, stop, target) {
                    let profit = ledger.close(bar.open_time, action, price);
                    stats.record(profit);
                    protective = None;
                }
            }

            match strategy.generate_signal(window) {
                Signal::Buy => {
                    if !ledger.is_long() {
                        if !ledger.is_flat() {
                            let profit = ledger.close(bar.open_time, TradeAction::Cover, price);
                            stats.record(profit);
                            protective = None;
                        }
                        protective = self.try_open(
                            &mut ledger,
                            strategy,
                            symbol,
                            window,
                            TradeSide::Buy,
                            TradeAction::Buy,
                            &stats,
                        );
                    }
                }
                Signal::Sell => {
                    if ledger.is_long() {
                        let profit = ledger.close(bar.open_time, TradeAction::Sell, price);
                        stats.record(profit);
                        protective = None;
                    }
                    if ledger.is_flat() && self.config.allow_short {
                        protective = self.try_open(
                            &mut ledger,
                            strategy,
                            symbol,
                            window,
                            TradeSide::Sell,
                            TradeAction::Short,
                            &stats,
                        );
                    }
                }
                Signal::Hold => {}
            }

            ledger.mark(bar.open_time, price);
        }

        if !ledger.is_flat() {
            let last = &bars[bars.len() - 1];
            let profit = ledger.close(last.open_time, TradeAction::FinalClose, last.close);
            stats.record(profit);
            // The loop already sampled this bar; refresh that sample with
            // the post-close capital instead of appending a duplicate
            if let Some(sample) = ledger.equity_curve.last_mut() {
                sample.1 = ledger.capital;
            }
        }

        let final_equity = ledger.capital;
        let report = BacktestReport::compute(
            symbol,
            strategy.name(),
            self.config.initial_capital,
            final_equity,
            &ledger.entries,
            &ledger.equity_curve,
            ledger.total_commission,
        );

        Ok(BacktestOutcome { report, ledger })
    }

    /// Size, quantize, and open a position. Returns the protective
    /// stop/target pair, or `None` when sizing declined the trade.
    fn try_open(
        &self,
        ledger: &mut SimulationLedger,
        strategy: &dyn Strategy,
        symbol: &str,
        window: &[Bar],
        side: TradeSide,
        action: TradeAction,
        stats_so_far: &SymbolStats,
    ) -> Option<(Decimal, Decimal)> {
        let bar = window.last()?;
        let price = bar.close;
        let equity = ledger.equity(price);

        let decision = self.risk.size_position(&SizingInputs {
            symbol,
            price,
            portfolio_value: equity,
            signal_strength: strategy.signal_strength(window),
            volatility: stats::annualized_volatility(window),
            stats: stats_so_far,
            heavy_positions: 0,
        });

        let mut quantity = match decision {
            SizeDecision::Sized { quantity, .. } => quantity,
            SizeDecision::Skipped { reason } => {
                debug!(bar = %bar.open_time, reason = %reason, "entry skipped");
                return None;
            }
            SizeDecision::Degenerate => return None,
        };

        if let Some(constraints) = &self.config.constraints {
            quantity = quantizer::legalize_quantity(quantity, constraints);
            if quantizer::validate_quantity(quantity, constraints).is_err() {
                return None;
            }
        }
        if quantity <= Decimal::ZERO {
            return None;
        }

        ledger.open(bar.open_time, action, price, quantity);

        let inputs =
            StopInputs::from_bars(window, self.config.atr_period, self.config.level_lookback);
        let stop = self
            .risk
            .compute_stop_loss(price, side, strategy.stop_method(), &inputs);
        let target = self.risk.compute_take_profit(price, stop, side, &inputs);
        Some((stop, target))
    }
}

fn exit_action(
    ledger: &SimulationLedger,
    price: Decimal,
    stop: Decimal,
    target: Decimal,
) -> Option<TradeAction> {
    if ledger.is_long() {
        if price <= stop {
            return Some(TradeAction::StopLoss);
        }
        if price >= target {
            return Some(TradeAction::TakeProfit);
        }
    } else if !ledger.is_flat() {
        if price >= stop {
            return Some(TradeAction::StopLoss);
        }
        if price <= target {
            return Some(TradeAction::TakeProfit);
        }
    }
    None
}

/// Load bars from a JSON file containing an array of candles.
pub fn load_bars(path: &Path) -> Result<Vec<Bar>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading bar data from {}", path.display()))?;
    let mut bars: Vec<Bar> =
        serde_json::from_str(&raw).with_context(|| format!("parsing bars in {}", path.display()))?;
    bars.sort_by_key(|b| b.open_time);
    Ok(bars)
}

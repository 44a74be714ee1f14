//! Risk-Aware Trading Engine
//!
//! Sizes orders with Kelly-style fractions under hard portfolio limits,
//! quantizes them to exchange filters, and executes them live or replays
//! them against historical bars.

mod backtest;
mod engine;
mod exchange;
mod models;
mod quantizer;
mod risk;
mod store;
mod strategy;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::backtest::{BacktestConfig, BacktestSimulator};
use crate::engine::{EngineConfig, ExecutionEngine};
use crate::exchange::{BinanceGateway, ConstraintsCache, ExchangeGateway};
use crate::risk::{RiskEngine, RiskLimits};
use crate::store::Database;

/// Risk-aware trading engine CLI.
#[derive(Parser)]
#[command(name = "autotrader")]
#[command(about = "Risk-aware order sizing, execution, and backtesting", long_about = None)]
struct Cli {
    /// Database file path
    #[arg(short, long, default_value = "sqlite:./autotrader.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the live trading loop
    Run {
        /// Comma-separated symbols to trade
        #[arg(short, long, default_value = "BTCUSDT")]
        symbols: String,

        /// Strategy to run on every symbol (ma, rsi)
        #[arg(long, default_value = "ma")]
        strategy: String,

        /// Starting capital in quote currency
        #[arg(short, long, default_value = "10000")]
        capital: f64,

        /// Kline interval to trade on
        #[arg(long, default_value = "1h")]
        interval: String,

        /// Polling interval in seconds
        #[arg(short, long, default_value = "60")]
        poll: u64,

        /// Dry run (don't submit orders)
        #[arg(long)]
        dry_run: bool,

        /// File for the instrument constraints snapshot
        #[arg(long, default_value = "constraints.json")]
        filters_snapshot: PathBuf,
    },

    /// Replay a strategy over historical bars
    Backtest {
        /// JSON file with an array of OHLCV bars
        #[arg(long)]
        data: PathBuf,

        /// Symbol label for the report
        #[arg(short, long, default_value = "BTCUSDT")]
        symbol: String,

        /// Strategy to simulate (ma, rsi)
        #[arg(long, default_value = "ma")]
        strategy: String,

        /// Initial capital for simulation
        #[arg(short, long, default_value = "10000")]
        capital: f64,

        /// Commission percentage per fill (0-100)
        #[arg(long, default_value = "0.1")]
        commission: f64,

        /// Allow sell signals on a flat book to open shorts
        #[arg(long)]
        short: bool,

        /// Constraints snapshot to quantize simulated fills against
        #[arg(long)]
        filters_snapshot: Option<PathBuf>,
    },

    /// Show the active risk limits
    Config,

    /// Show exchange trading rules for a symbol
    Filters {
        /// Symbol to inspect
        symbol: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            symbols,
            strategy,
            capital,
            interval,
            poll,
            dry_run,
            filters_snapshot,
        } => {
            let limits = RiskLimits::default();
            limits.validate()?;

            let symbols: Vec<String> = symbols
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();

            let strategies = symbols
                .iter()
                .map(|_| strategy::build(&strategy))
                .collect::<Result<Vec<_>>>()?;

            info!(
                symbols = ?symbols,
                strategy = %strategy,
                capital = capital,
                "Starting trading engine"
            );

            let gateway: Arc<dyn ExchangeGateway> = Arc::new(BinanceGateway::from_env()?);
            let constraints = Arc::new(ConstraintsCache::new(
                Duration::from_secs(3600),
                Some(filters_snapshot),
            ));
            let db = Database::new(&cli.database).await?;

            let config = EngineConfig {
                symbols: symbols.clone(),
                interval,
                poll_interval_secs: poll,
                dry_run,
                initial_capital: Decimal::try_from(capital)?,
                ..Default::default()
            };

            println!("\n=== Risk-Aware Trading Engine ===");
            println!("Symbols:          {}", symbols.join(", "));
            println!("Strategy:         {}", strategy);
            println!("Capital:          ${}", capital);
            println!("Polling interval: {}s", poll);
            println!(
                "Mode:             {}",
                if dry_run { "DRY RUN (no real orders)" } else { "LIVE TRADING" }
            );
            println!("\nPress Ctrl+C to stop.\n");

            let mut engine = ExecutionEngine::new(
                config,
                gateway,
                RiskEngine::new(limits),
                constraints,
                strategies,
                Some(db),
            );
            if let Err(e) = engine.run().await {
                tracing::error!(error = %e, "Engine error");
            }
        }

        Commands::Backtest {
            data,
            symbol,
            strategy,
            capital,
            commission,
            short,
            filters_snapshot,
        } => {
            let limits = RiskLimits::default();
            limits.validate()?;

            let bars = backtest::load_bars(&data)?;
            let strategy = strategy::build(&strategy)?;

            let constraints = match &filters_snapshot {
                Some(path) => {
                    let entry = exchange::load_snapshot_entry(path, &symbol)?;
                    if entry.is_none() {
                        tracing::warn!(
                            symbol = %symbol,
                            path = %path.display(),
                            "symbol missing from constraints snapshot, simulating un-quantized"
                        );
                    }
                    entry
                }
                None => None,
            };

            info!(
                symbol = %symbol,
                strategy = %strategy.name(),
                bars = bars.len(),
                quantized = constraints.is_some(),
                "Starting backtest"
            );

            let config = BacktestConfig {
                initial_capital: Decimal::try_from(capital)?,
                commission_rate: Decimal::try_from(commission / 100.0)?,
                allow_short: short,
                constraints,
                ..Default::default()
            };

            let simulator = BacktestSimulator::new(config, RiskEngine::new(limits));
            let outcome = simulator.run(strategy.as_ref(), &symbol, &bars)?;

            println!("{}", outcome.report);

            if !outcome.ledger.entries.is_empty() {
                println!("\n--- Trade Log ---");
                for entry in &outcome.ledger.entries {
                    println!(
                        "  {} {:<12} {:>12.4} @ {:>12.4}  P&L: {:>10.2}  Capital: {:.2}",
                        entry.timestamp.format("%Y-%m-%d %H:%M"),
                        entry.action.as_str(),
                        entry.quantity,
                        entry.price,
                        entry.profit,
                        entry.capital
                    );
                }
            }
        }

        Commands::Config => {
            let limits = RiskLimits::default();

            println!("\n=== Risk Limits ===\n");
            println!("Position Sizing:");
            println!("  Kelly Cap:            {:.0}%", limits.kelly_cap * 100.0);
            println!("  Fallback Fraction:    {:.0}%", limits.fallback_fraction * 100.0);
            println!("  Min Sample Trades:    {}", limits.min_sample_trades);
            println!("  Target Volatility:    {:.0}%", limits.target_volatility * 100.0);

            println!("\nHard Limits:");
            println!("  Max Asset Weight:     {}%", limits.max_asset_weight * Decimal::from(100));
            println!("  Max Portfolio VaR:    {:.0}%", limits.max_portfolio_var * 100.0);
            println!("  Max Daily Loss:       {}%", limits.max_daily_loss * Decimal::from(100));
            println!("  Max Correlation:      {:.2}", limits.max_correlation);
            println!("  Max Volume Fraction:  {:.1}%", limits.max_volume_fraction * 100.0);
            println!("  Max Spread:           {:.1}%", limits.max_spread_pct * 100.0);

            println!("\nProtective Levels:");
            println!("  Percentage Stop:      {}%", limits.stop_pct * Decimal::from(100));
            println!(
                "  Stop Clamp Band:      {}% - {}%",
                limits.stop_clamp_min * Decimal::from(100),
                limits.stop_clamp_max * Decimal::from(100)
            );
            println!("  ATR Multiple:         {}", limits.atr_multiple);
            println!("  Reward Ratio:         {}", limits.reward_ratio);
            println!("  Level Buffer:         {}%", limits.level_buffer_pct * Decimal::from(100));
        }

        Commands::Filters { symbol } => {
            let gateway = BinanceGateway::from_env()?;
            let constraints = gateway
                .get_instrument_constraints(&symbol.to_uppercase())
                .await?;

            println!("\n=== Trading Rules: {} ===", constraints.symbol);
            println!("Min Quantity:     {}", constraints.min_qty);
            match constraints.max_qty {
                Some(max) => println!("Max Quantity:     {}", max),
                None => println!("Max Quantity:     unbounded"),
            }
            println!("Step Size:        {}", constraints.step_size);
            println!("Qty Precision:    {} dp", constraints.qty_precision());
            println!("Min Price:        {}", constraints.min_price);
            println!("Tick Size:        {}", constraints.tick_size);
            println!("Price Precision:  {} dp", constraints.price_precision());
        }
    }

    Ok(())
}

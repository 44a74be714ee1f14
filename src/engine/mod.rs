//! Live trading engine: the cooperative tick loop.
//!
//! Each tick, per symbol: refresh bars, evaluate protective exits first,
//! then let the strategy propose an entry, size it through the risk
//! engine, quantize it against exchange filters, and submit. Position
//! state has a single owner (this engine); the constraints cache is the
//! only structure shared with other tasks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::exchange::{ConstraintsCache, ExchangeError, ExchangeGateway, OrderRequest};
use crate::models::{Bar, Position, TradeRecord, TradeSide};
use crate::quantizer;
use crate::risk::{
    stats, RiskContext, RiskEngine, RiskVerdict, SizeDecision, SizingInputs, StopInputs,
    SymbolStats,
};
use crate::store::Database;
use crate::strategy::{Signal, Strategy};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub symbols: Vec<String>,

    /// Kline interval fetched each tick
    pub interval: String,

    /// Bars of history per fetch
    pub lookback_bars: u32,

    pub poll_interval_secs: u64,

    /// Simulate fills locally instead of submitting orders
    pub dry_run: bool,

    /// Starting capital in quote currency
    pub initial_capital: Decimal,

    pub atr_period: usize,
    pub level_lookback: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            symbols: vec!["BTCUSDT".to_string()],
            interval: "1h".to_string(),
            lookback_bars: 100,
            poll_interval_secs: 60,
            dry_run: true,
            initial_capital: dec!(10000),
            atr_period: 14,
            level_lookback: 20,
        }
    }
}

/// Lifecycle of a managed position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PositionState {
    Open,
    StopHit,
    TargetHit,
    ManualClose,
}

impl PositionState {
    fn exit_label(&self) -> &'static str {
        match self {
            PositionState::Open => "open",
            PositionState::StopHit => "stop_loss",
            PositionState::TargetHit => "take_profit",
            PositionState::ManualClose => "manual_close",
        }
    }
}

/// A position plus its protective levels.
#[derive(Debug, Clone)]
struct ManagedPosition {
    position: Position,
    stop_loss: Decimal,
    take_profit: Decimal,
    strategy: String,
    state: PositionState,
}

/// Per-symbol view of what the strategy wants this tick.
struct StrategyView {
    name: String,
    signal: Signal,
    strength: f64,
    stop_method: crate::strategy::StopMethod,
    allow_short: bool,
}

/// The live trading loop.
pub struct ExecutionEngine {
    config: EngineConfig,
    gateway: Arc<dyn ExchangeGateway>,
    risk: RiskEngine,
    constraints: Arc<ConstraintsCache>,
    strategies: Vec<Box<dyn Strategy>>,
    db: Option<Database>,

    // Single-owner decision state
    capital: Decimal,
    positions: HashMap<String, ManagedPosition>,
    stats: HashMap<String, SymbolStats>,
    returns: HashMap<String, Vec<f64>>,
    daily_pnl: Decimal,
    trading_day: NaiveDate,

    // Tick-over-tick equity returns feeding the portfolio risk snapshot
    equity_returns: Vec<f64>,
    last_equity: Option<Decimal>,

    shutdown: Arc<AtomicBool>,
}

impl ExecutionEngine {
    pub fn new(
        config: EngineConfig,
        gateway: Arc<dyn ExchangeGateway>,
        risk: RiskEngine,
        constraints: Arc<ConstraintsCache>,
        strategies: Vec<Box<dyn Strategy>>,
        db: Option<Database>,
    ) -> Self {
        assert_eq!(
            config.symbols.len(),
            strategies.len(),
            "one strategy per symbol required"
        );
        let capital = config.initial_capital;
        Self {
            config,
            gateway,
            risk,
            constraints,
            strategies,
            db,
            capital,
            positions: HashMap::new(),
            stats: HashMap::new(),
            returns: HashMap::new(),
            daily_pnl: Decimal::ZERO,
            trading_day: Utc::now().date_naive(),
            equity_returns: Vec::new(),
            last_equity: None,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cooperative stop flag, for external control and Ctrl+C.
    pub fn shutdown_signal(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Current equity: capital plus mark-to-market of open positions.
    pub fn equity(&self) -> Decimal {
        self.capital
            + self
                .positions
                .values()
                .map(|m| m.position.quantity * m.position.last_price)
                .sum::<Decimal>()
    }

    /// Main loop. Runs until the shutdown flag is set.
    pub async fn run(&mut self) -> Result<()> {
        info!(
            symbols = ?self.config.symbols,
            interval = %self.config.interval,
            dry_run = self.config.dry_run,
            "starting engine loop"
        );

        self.reconcile_exchange_state().await;

        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
        });

        let mut poll = interval(Duration::from_secs(self.config.poll_interval_secs));
        while !self.shutdown.load(Ordering::SeqCst) {
            poll.tick().await;
            if let Err(e) = self.tick().await {
                error!(error = %e, "tick failed");
            }
        }

        info!(equity = %self.equity(), "engine stopped");
        if self.equity_returns.len() >= 2 {
            let snapshot = self
                .risk
                .compute_snapshot(&self.equity_returns, self.equity(), None);
            println!("{}", snapshot);
        }
        Ok(())
    }

    /// One pass over every managed symbol.
    pub async fn tick(&mut self) -> Result<()> {
        self.roll_trading_day();

        for idx in 0..self.config.symbols.len() {
            let symbol = self.config.symbols[idx].clone();
            if let Err(e) = self.tick_symbol(idx, &symbol).await {
                warn!(symbol = %symbol, error = %e, "symbol tick failed");
            }
        }

        let equity = self.equity();
        if let Some(prev) = self.last_equity {
            if prev > Decimal::ZERO {
                if let Some(r) = (equity / prev - Decimal::ONE).to_f64() {
                    self.equity_returns.push(r);
                }
            }
        }
        self.last_equity = Some(equity);

        if let Some(db) = &self.db {
            let exposure: Decimal = self.positions.values().map(|m| m.position.notional()).sum();
            if let Err(e) = db.record_equity_point(equity, exposure, self.daily_pnl).await {
                warn!(error = %e, "equity telemetry write failed");
            }
            for managed in self.positions.values() {
                if let Err(e) = db.save_position_snapshot(&managed.position).await {
                    warn!(symbol = %managed.position.symbol, error = %e, "position snapshot write failed");
                }
            }
        }

        Ok(())
    }

    /// Surface exchange-side exposure this engine does not manage. The
    /// exchange is never the in-loop source of truth, so pre-existing
    /// balances are reported rather than adopted.
    async fn reconcile_exchange_state(&self) {
        for symbol in &self.config.symbols {
            match self.gateway.get_position(symbol).await {
                Ok(Some(position)) if !position.is_flat() => {
                    warn!(
                        symbol = %symbol,
                        quantity = %position.quantity,
                        "pre-existing exchange exposure is not managed by this engine"
                    );
                }
                Ok(_) => {}
                Err(e) => warn!(symbol = %symbol, error = %e, "position reconciliation failed"),
            }
        }
    }

    /// Reset the daily loss accumulator at UTC midnight.
    fn roll_trading_day(&mut self) {
        let today = Utc::now().date_naive();
        if today != self.trading_day {
            info!(day = %today, realized = %self.daily_pnl, "new trading day");
            self.trading_day = today;
            self.daily_pnl = Decimal::ZERO;
        }
    }

    async fn tick_symbol(&mut self, idx: usize, symbol: &str) -> Result<()> {
        let bars = self
            .gateway
            .get_recent_bars(symbol, &self.config.interval, self.config.lookback_bars)
            .await?;
        if bars.is_empty() {
            debug!(symbol = %symbol, "no bars returned");
            return Ok(());
        }

        let price = bars[bars.len() - 1].close;
        self.returns.insert(symbol.to_string(), stats::close_returns(&bars));

        if let Some(managed) = self.positions.get_mut(symbol) {
            managed.position.mark(price);
        }

        // Exits are evaluated before any entry logic
        self.evaluate_exits(symbol, price, &bars).await?;

        let view = {
            let strategy = &self.strategies[idx];
            StrategyView {
                name: strategy.name().to_string(),
                signal: strategy.generate_signal(&bars),
                strength: strategy.signal_strength(&bars),
                stop_method: strategy.stop_method(),
                allow_short: strategy.allow_short(),
            }
        };

        if view.signal == Signal::Hold {
            return Ok(());
        }

        self.handle_entry_signal(symbol, price, &bars, &view).await
    }

    /// Transition an open position through the protective-exit states.
    async fn evaluate_exits(&mut self, symbol: &str, price: Decimal, bars: &[Bar]) -> Result<()> {
        let Some(managed) = self.positions.get(symbol) else {
            return Ok(());
        };
        if managed.state != PositionState::Open {
            return Ok(());
        }

        let next_state = if managed.position.is_long() {
            if price <= managed.stop_loss {
                Some(PositionState::StopHit)
            } else if price >= managed.take_profit {
                Some(PositionState::TargetHit)
            } else {
                None
            }
        } else if managed.position.is_short() {
            if price >= managed.stop_loss {
                Some(PositionState::StopHit)
            } else if price <= managed.take_profit {
                Some(PositionState::TargetHit)
            } else {
                None
            }
        } else {
            None
        };

        if let Some(state) = next_state {
            self.close_position(symbol, price, bars, state).await?;
        }
        Ok(())
    }

    async fn handle_entry_signal(
        &mut self,
        symbol: &str,
        price: Decimal,
        bars: &[Bar],
        view: &StrategyView,
    ) -> Result<()> {
        let side = match view.signal {
            Signal::Buy => TradeSide::Buy,
            Signal::Sell => TradeSide::Sell,
            Signal::Hold => return Ok(()),
        };

        // Repeated ticks with the same signal must not stack entries
        if let Some(managed) = self.positions.get(symbol) {
            let same_direction = (side == TradeSide::Buy && managed.position.is_long())
                || (side == TradeSide::Sell && managed.position.is_short());
            if same_direction {
                debug!(symbol = %symbol, side = %side, "already positioned, skipping");
                return Ok(());
            }
            // Opposing signal: close first, then consider a fresh entry
            self.close_position(symbol, price, bars, PositionState::ManualClose)
                .await?;
        }

        if side == TradeSide::Sell && !view.allow_short {
            return Ok(());
        }

        let volatility = stats::annualized_volatility(bars);
        let symbol_stats = self.stats.entry(symbol.to_string()).or_default().clone();
        let portfolio_value = self.equity();
        let heavy_threshold = self.risk.limits().max_asset_weight / Decimal::TWO;
        let heavy_positions = self
            .positions
            .values()
            .filter(|m| {
                portfolio_value > Decimal::ZERO
                    && m.position.notional() / portfolio_value >= heavy_threshold
            })
            .count();

        let decision = self.risk.size_position(&SizingInputs {
            symbol,
            price,
            portfolio_value,
            signal_strength: view.strength,
            volatility,
            stats: &symbol_stats,
            heavy_positions,
        });

        let raw_quantity = match decision {
            SizeDecision::Sized { quantity, .. } => quantity,
            SizeDecision::Skipped { reason } => {
                info!(symbol = %symbol, reason = %reason, "entry skipped by sizing");
                return Ok(());
            }
            SizeDecision::Degenerate => {
                warn!(symbol = %symbol, "degenerate sizing inputs, no entry");
                return Ok(());
            }
        };

        let constraints = match self.constraints.get(self.gateway.as_ref(), symbol).await {
            Ok(c) => c,
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "constraints unavailable, no entry");
                return Ok(());
            }
        };
        let quantity = quantizer::legalize_quantity(raw_quantity, &constraints);
        if let Err(reason) = quantizer::validate_quantity(quantity, &constraints) {
            warn!(symbol = %symbol, reason = %reason, "quantized order still illegal");
            return Ok(());
        }

        // Limits are checked against the final, quantized notional: the lot
        // grid can raise a tiny quantity to the exchange minimum
        let liquidity = self.gateway.get_liquidity(symbol).await.ok();
        let candidate_returns = self.returns.get(symbol).cloned().unwrap_or_default();
        let held_returns: Vec<(String, Vec<f64>)> = self
            .positions
            .keys()
            .filter(|held| held.as_str() != symbol)
            .filter_map(|held| {
                self.returns
                    .get(held)
                    .map(|r| (held.clone(), r.clone()))
            })
            .collect();

        // The daily-loss halt counts open drawdown, not just realized
        let open_unrealized: Decimal = self
            .positions
            .values()
            .map(|m| m.position.unrealized_pnl())
            .sum();

        let verdict = self.risk.check_risk_limits(&RiskContext {
            symbol,
            trade_notional: quantity * price,
            portfolio_value,
            symbol_exposure: self
                .positions
                .get(symbol)
                .map(|m| m.position.notional())
                .unwrap_or(Decimal::ZERO),
            volatility: volatility.unwrap_or(self.risk.limits().default_volatility),
            liquidity: liquidity.as_ref(),
            candidate_returns: &candidate_returns,
            held_returns: &held_returns,
            daily_pnl: self.daily_pnl + open_unrealized,
        });

        if let RiskVerdict::Rejected { reason } = verdict {
            info!(symbol = %symbol, reason = %reason, "entry rejected by risk limits");
            return Ok(());
        }

        let fill = match self
            .submit_order(symbol, side, quantity, price, bars, &constraints)
            .await
        {
            Ok(Some(fill)) => fill,
            Ok(None) => {
                info!(symbol = %symbol, side = %side, "order not executed, no position booked");
                return Ok(());
            }
            Err(e) => {
                error!(symbol = %symbol, error = %e, "order failed, no trade this tick");
                return Ok(());
            }
        };

        self.open_position(symbol, side, fill.quantity, fill.price, bars, view)
            .await
    }

    /// Submit an order, re-quantizing and retrying exactly once when the
    /// exchange reports a filter violation. Returns the executed portion,
    /// or `None` when nothing filled (the order is resting or expired).
    async fn submit_order(
        &self,
        symbol: &str,
        side: TradeSide,
        quantity: Decimal,
        mark_price: Decimal,
        bars: &[Bar],
        constraints: &crate::models::InstrumentConstraints,
    ) -> Result<Option<Fill>, ExchangeError> {
        if self.config.dry_run {
            info!(
                symbol = %symbol,
                side = %side,
                quantity = %quantity,
                price = %mark_price,
                "[DRY RUN] simulated fill"
            );
            return Ok(Some(Fill {
                quantity,
                price: mark_price,
            }));
        }

        // Marketable limit at the tick-legal mark price
        let limit_price = quantizer::legalize_price(mark_price, side, constraints);
        let request = OrderRequest {
            symbol: symbol.to_string(),
            side,
            quantity,
            price: Some(limit_price),
            client_order_id: derive_client_order_id(symbol, side, bars),
        };

        match self.gateway.place_order(&request).await {
            Ok(result) => {
                debug!(
                    symbol = %symbol,
                    status = ?result.status,
                    executed = %result.executed_qty,
                    "order acknowledged"
                );
                Ok(executed_fill(&result, mark_price))
            }
            Err(e) if e.is_filter_violation() => {
                warn!(symbol = %symbol, error = %e, "filter violation, re-quantizing once");
                self.constraints.invalidate(symbol).await;
                let fresh = self.constraints.get(self.gateway.as_ref(), symbol).await?;
                let requantized = quantizer::legalize_quantity(quantity, &fresh);
                if requantized == quantity && fresh == *constraints {
                    // Same rules, same quantity: retrying cannot succeed
                    return Err(e);
                }
                let retry = OrderRequest {
                    quantity: requantized,
                    price: Some(quantizer::legalize_price(mark_price, side, &fresh)),
                    ..request
                };
                let result = self.gateway.place_order(&retry).await?;
                Ok(executed_fill(&result, mark_price))
            }
            Err(e) => Err(e),
        }
    }

    async fn open_position(
        &mut self,
        symbol: &str,
        side: TradeSide,
        quantity: Decimal,
        fill_price: Decimal,
        bars: &[Bar],
        view: &StrategyView,
    ) -> Result<()> {
        let mut position = Position::flat(symbol);
        position.apply_fill(side, quantity, fill_price);
        self.capital -= side.sign() * quantity * fill_price;

        let stop_inputs =
            StopInputs::from_bars(bars, self.config.atr_period, self.config.level_lookback);
        let stop_loss =
            self.risk
                .compute_stop_loss(fill_price, side, view.stop_method, &stop_inputs);
        let take_profit =
            self.risk
                .compute_take_profit(fill_price, stop_loss, side, &stop_inputs);

        info!(
            symbol = %symbol,
            side = %side,
            quantity = %quantity,
            price = %fill_price,
            stop = %stop_loss,
            target = %take_profit,
            strategy = %view.name,
            "position opened"
        );

        self.record_trade(symbol, side, quantity, fill_price, Decimal::ZERO, &view.name)
            .await;

        self.positions.insert(
            symbol.to_string(),
            ManagedPosition {
                position,
                stop_loss,
                take_profit,
                strategy: view.name.clone(),
                state: PositionState::Open,
            },
        );

        Ok(())
    }

    /// Close an open position at the given price and record the outcome.
    async fn close_position(
        &mut self,
        symbol: &str,
        price: Decimal,
        bars: &[Bar],
        state: PositionState,
    ) -> Result<()> {
        let Some(mut managed) = self.positions.remove(symbol) else {
            return Ok(());
        };

        let close_side = if managed.position.is_long() {
            TradeSide::Sell
        } else {
            TradeSide::Buy
        };
        let quantity = managed.position.quantity.abs();

        let fill = if self.config.dry_run {
            Fill { quantity, price }
        } else {
            let request = OrderRequest {
                symbol: symbol.to_string(),
                side: close_side,
                quantity,
                price: None,
                client_order_id: derive_client_order_id(symbol, close_side, bars),
            };
            match self.gateway.place_order(&request).await {
                Ok(result) => match executed_fill(&result, price) {
                    Some(fill) => Fill {
                        quantity: fill.quantity.min(quantity),
                        price: fill.price,
                    },
                    None => {
                        // Nothing executed; the next tick will try again
                        warn!(symbol = %symbol, "close order not executed, keeping position");
                        self.positions.insert(symbol.to_string(), managed);
                        return Ok(());
                    }
                },
                Err(e) => {
                    // Keep the position; the next tick will try again
                    error!(symbol = %symbol, error = %e, "close order failed, keeping position");
                    self.positions.insert(symbol.to_string(), managed);
                    return Ok(());
                }
            }
        };

        let realized = managed
            .position
            .apply_fill(close_side, fill.quantity, fill.price);
        self.capital -= close_side.sign() * fill.quantity * fill.price;
        self.daily_pnl += realized;
        self.stats
            .entry(symbol.to_string())
            .or_default()
            .record(realized);

        info!(
            symbol = %symbol,
            reason = state.exit_label(),
            price = %fill.price,
            quantity = %fill.quantity,
            realized = %realized,
            "position closed"
        );

        self.record_trade(
            symbol,
            close_side,
            fill.quantity,
            fill.price,
            realized,
            &managed.strategy.clone(),
        )
        .await;

        if !managed.position.is_flat() {
            // Partial execution: keep managing the remainder so the exit
            // re-fires next tick
            warn!(
                symbol = %symbol,
                remaining = %managed.position.quantity,
                "close partially executed, position remains"
            );
            self.positions.insert(symbol.to_string(), managed);
        }

        Ok(())
    }

    async fn record_trade(
        &self,
        symbol: &str,
        side: TradeSide,
        quantity: Decimal,
        price: Decimal,
        realized_pnl: Decimal,
        strategy: &str,
    ) {
        let Some(db) = &self.db else {
            return;
        };

        let record = TradeRecord {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            side,
            quantity,
            price,
            realized_pnl,
            commission: Decimal::ZERO,
            strategy: strategy.to_string(),
            timestamp: Utc::now(),
        };
        if let Err(e) = db.save_trade(&record).await {
            warn!(error = %e, "trade telemetry write failed");
        }
    }
}

/// Deterministic idempotency key for one trade intent: same symbol, side,
/// and decision bar always produce the same id, so a resubmitted intent
/// dedupes on the exchange instead of double-filling.
fn derive_client_order_id(symbol: &str, side: TradeSide, bars: &[Bar]) -> String {
    let bar_ts = bars
        .last()
        .map(|b| b.open_time.timestamp())
        .unwrap_or_default();
    format!("at-{}-{}-{}", symbol.to_lowercase(), side.as_str().to_lowercase(), bar_ts)
}

/// Executed portion of an order.
#[derive(Debug, Clone, Copy)]
struct Fill {
    quantity: Decimal,
    price: Decimal,
}

/// Map an exchange acknowledgement to the quantity that actually traded.
/// A resting or expired order executed nothing and yields `None`; a partial
/// fill yields only its executed quantity.
fn executed_fill(result: &crate::exchange::OrderResult, mark: Decimal) -> Option<Fill> {
    if result.executed_qty <= Decimal::ZERO {
        return None;
    }
    let price = if result.avg_fill_price > Decimal::ZERO {
        result.avg_fill_price
    } else {
        mark
    };
    Some(Fill {
        quantity: result.executed_qty,
        price,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{LiquiditySnapshot, OrderResult, OrderStatus};
    use crate::models::InstrumentConstraints;
    use crate::risk::RiskLimits;
    use crate::strategy::MovingAverageStrategy;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use rust_decimal_macros::dec;
    use std::sync::Mutex;

    /// Scripted gateway: fixed bars per symbol, records every order.
    struct MockGateway {
        bars: HashMap<String, Vec<Bar>>,
        orders: Mutex<Vec<OrderRequest>>,
        fill_orders: bool,
    }

    impl MockGateway {
        fn new(bars: Vec<Bar>) -> Self {
            let mut map = HashMap::new();
            map.insert("BTCUSDT".to_string(), bars);
            Self {
                bars: map,
                orders: Mutex::new(Vec::new()),
                fill_orders: true,
            }
        }

        /// Acknowledge every order as resting with nothing executed.
        fn resting(bars: Vec<Bar>) -> Self {
            Self {
                fill_orders: false,
                ..Self::new(bars)
            }
        }

        fn insert_bars(&mut self, symbol: &str, bars: Vec<Bar>) {
            self.bars.insert(symbol.to_string(), bars);
        }

        fn order_count(&self) -> usize {
            self.orders.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ExchangeGateway for MockGateway {
        async fn place_order(&self, request: &OrderRequest) -> Result<OrderResult, ExchangeError> {
            self.orders.lock().unwrap().push(request.clone());
            let (status, executed_qty) = if self.fill_orders {
                (OrderStatus::Filled, request.quantity)
            } else {
                (OrderStatus::New, Decimal::ZERO)
            };
            Ok(OrderResult {
                order_id: "1".to_string(),
                client_order_id: request.client_order_id.clone(),
                status,
                executed_qty,
                avg_fill_price: if self.fill_orders {
                    request.price.unwrap_or_default()
                } else {
                    Decimal::ZERO
                },
            })
        }

        async fn get_instrument_constraints(
            &self,
            symbol: &str,
        ) -> Result<InstrumentConstraints, ExchangeError> {
            Ok(InstrumentConstraints {
                symbol: symbol.to_string(),
                min_qty: dec!(0.01),
                max_qty: None,
                step_size: dec!(0.01),
                min_price: dec!(0.01),
                tick_size: dec!(0.01),
            })
        }

        async fn get_position(&self, _: &str) -> Result<Option<Position>, ExchangeError> {
            Ok(None)
        }

        async fn get_market_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
            Ok(self
                .bars
                .get(symbol)
                .and_then(|bars| bars.last())
                .map(|b| b.close)
                .unwrap_or_default())
        }

        async fn get_recent_bars(
            &self,
            symbol: &str,
            _: &str,
            _: u32,
        ) -> Result<Vec<Bar>, ExchangeError> {
            Ok(self.bars.get(symbol).cloned().unwrap_or_default())
        }

        async fn get_liquidity(&self, _: &str) -> Result<LiquiditySnapshot, ExchangeError> {
            Ok(LiquiditySnapshot {
                bid: dec!(115.99),
                ask: dec!(116.01),
                quote_volume_24h: dec!(100000000),
            })
        }
    }

    fn bars_from_closes(closes: &[Decimal]) -> Vec<Bar> {
        let start = Utc::now();
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Bar {
                open_time: start + ChronoDuration::hours(i as i64),
                open: close,
                high: close + dec!(1),
                low: close - dec!(1),
                close,
                volume: dec!(1000),
            })
            .collect()
    }

    /// Flat history with a rally on the newest bar: a fresh golden cross
    /// for a short=3/long=5 moving-average strategy.
    fn crossing_bars() -> Vec<Bar> {
        let mut closes = vec![dec!(100); 40];
        closes.push(dec!(116));
        bars_from_closes(&closes)
    }

    fn test_engine(gateway: Arc<MockGateway>, dry_run: bool) -> ExecutionEngine {
        let config = EngineConfig {
            symbols: vec!["BTCUSDT".to_string()],
            dry_run,
            initial_capital: dec!(100000),
            ..Default::default()
        };
        let strategy = MovingAverageStrategy {
            short_period: 3,
            long_period: 5,
        };
        ExecutionEngine::new(
            config,
            gateway,
            RiskEngine::new(RiskLimits::default()),
            Arc::new(ConstraintsCache::new(Duration::from_secs(3600), None)),
            vec![Box::new(strategy)],
            None,
        )
    }

    #[tokio::test]
    async fn test_entry_is_idempotent_across_ticks() {
        let gateway = Arc::new(MockGateway::new(crossing_bars()));
        let mut engine = test_engine(gateway.clone(), false);

        engine.tick().await.unwrap();
        assert_eq!(gateway.order_count(), 1);
        assert!(engine.positions.contains_key("BTCUSDT"));

        // Same bars, same signal: no second entry
        engine.tick().await.unwrap();
        assert_eq!(gateway.order_count(), 1);
    }

    #[tokio::test]
    async fn test_entry_opens_long_with_protective_levels() {
        let gateway = Arc::new(MockGateway::new(crossing_bars()));
        let mut engine = test_engine(gateway.clone(), false);

        engine.tick().await.unwrap();

        let managed = engine.positions.get("BTCUSDT").unwrap();
        assert!(managed.position.is_long());
        assert!(managed.stop_loss < managed.position.avg_entry_price);
        assert!(managed.take_profit > managed.position.avg_entry_price);
        assert_eq!(managed.state, PositionState::Open);
    }

    #[tokio::test]
    async fn test_stop_hit_closes_before_entries() {
        let gateway = Arc::new(MockGateway::new(crossing_bars()));
        let mut engine = test_engine(gateway.clone(), false);

        // Open a long whose stop sits above the current price
        let mut position = Position::flat("BTCUSDT");
        position.apply_fill(TradeSide::Buy, dec!(1), dec!(150));
        engine.positions.insert(
            "BTCUSDT".to_string(),
            ManagedPosition {
                position,
                stop_loss: dec!(140),
                take_profit: dec!(200),
                strategy: "moving_average".to_string(),
                state: PositionState::Open,
            },
        );

        engine.tick().await.unwrap();

        // Price 116 <= stop 140: closed; stats recorded the loss
        assert!(gateway.order_count() >= 1);
        let first = gateway.orders.lock().unwrap()[0].clone();
        assert_eq!(first.side, TradeSide::Sell);
        assert_eq!(engine.stats.get("BTCUSDT").unwrap().completed(), 1);
    }

    #[tokio::test]
    async fn test_risk_rejection_produces_no_order() {
        let gateway = Arc::new(MockGateway::new(crossing_bars()));
        let mut engine = test_engine(gateway.clone(), false);
        // A book this small forces the exchange-minimum quantity far above
        // the asset weight cap
        engine.capital = dec!(1);
        engine.config.initial_capital = dec!(1);

        engine.tick().await.unwrap();

        assert_eq!(gateway.order_count(), 0);
        assert!(engine.positions.is_empty());
    }

    #[tokio::test]
    async fn test_resting_order_books_no_position() {
        let gateway = Arc::new(MockGateway::resting(crossing_bars()));
        let mut engine = test_engine(gateway.clone(), false);

        engine.tick().await.unwrap();

        // The order went out but nothing executed: no position, no capital move
        assert_eq!(gateway.order_count(), 1);
        assert!(engine.positions.is_empty());
        assert_eq!(engine.capital, dec!(100000));
    }

    #[tokio::test]
    async fn test_open_drawdown_halts_new_entries() {
        let mut gateway = MockGateway::new(crossing_bars());
        gateway.insert_bars("ETHUSDT", bars_from_closes(&vec![dec!(100); 41]));
        let gateway = Arc::new(gateway);

        let config = EngineConfig {
            symbols: vec!["ETHUSDT".to_string(), "BTCUSDT".to_string()],
            dry_run: false,
            initial_capital: dec!(100000),
            ..Default::default()
        };
        let strategies: Vec<Box<dyn Strategy>> = vec![
            Box::new(MovingAverageStrategy {
                short_period: 3,
                long_period: 5,
            }),
            Box::new(MovingAverageStrategy {
                short_period: 3,
                long_period: 5,
            }),
        ];
        let mut engine = ExecutionEngine::new(
            config,
            gateway.clone(),
            RiskEngine::new(RiskLimits::default()),
            Arc::new(ConstraintsCache::new(Duration::from_secs(3600), None)),
            strategies,
            None,
        );

        // A long bought at 1150, about to be marked at 100: the open
        // drawdown alone breaches the daily loss limit even though no
        // losses have been realized today
        let mut position = Position::flat("ETHUSDT");
        position.apply_fill(TradeSide::Buy, dec!(20), dec!(1150));
        engine.positions.insert(
            "ETHUSDT".to_string(),
            ManagedPosition {
                position,
                stop_loss: dec!(1),
                take_profit: dec!(1000000),
                strategy: "moving_average".to_string(),
                state: PositionState::Open,
            },
        );

        engine.tick().await.unwrap();

        // BTCUSDT crossed but the halt blocks its entry
        assert_eq!(gateway.order_count(), 0);
        assert!(!engine.positions.contains_key("BTCUSDT"));
        assert_eq!(engine.daily_pnl, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_tick_writes_telemetry() {
        let gateway = Arc::new(MockGateway::new(crossing_bars()));
        let db = Database::new("sqlite::memory:").await.unwrap();
        let pool = db.pool().clone();

        let config = EngineConfig {
            symbols: vec!["BTCUSDT".to_string()],
            dry_run: true,
            initial_capital: dec!(100000),
            ..Default::default()
        };
        let mut engine = ExecutionEngine::new(
            config,
            gateway,
            RiskEngine::new(RiskLimits::default()),
            Arc::new(ConstraintsCache::new(Duration::from_secs(3600), None)),
            vec![Box::new(MovingAverageStrategy {
                short_period: 3,
                long_period: 5,
            })],
            Some(db),
        );

        engine.tick().await.unwrap();
        engine.tick().await.unwrap();

        let equity_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM equity_curve")
            .fetch_one(&pool)
            .await
            .unwrap();
        let snapshot_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM position_snapshots")
            .fetch_one(&pool)
            .await
            .unwrap();

        // One equity point per tick, one snapshot per open position per tick
        assert_eq!(equity_rows, 2);
        assert_eq!(snapshot_rows, 2);
        assert_eq!(engine.equity_returns.len(), 1);
    }

    #[test]
    #[should_panic(expected = "one strategy per symbol")]
    fn test_strategy_symbol_mismatch_panics() {
        let gateway = Arc::new(MockGateway::new(crossing_bars()));
        let config = EngineConfig {
            symbols: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            ..Default::default()
        };
        ExecutionEngine::new(
            config,
            gateway,
            RiskEngine::new(RiskLimits::default()),
            Arc::new(ConstraintsCache::new(Duration::from_secs(3600), None)),
            vec![Box::new(MovingAverageStrategy {
                short_period: 3,
                long_period: 5,
            })],
            None,
        );
    }

    #[tokio::test]
    async fn test_dry_run_places_no_orders() {
        let gateway = Arc::new(MockGateway::new(crossing_bars()));
        let mut engine = test_engine(gateway.clone(), true);

        engine.tick().await.unwrap();

        assert_eq!(gateway.order_count(), 0);
        assert!(engine.positions.contains_key("BTCUSDT"));
    }

    #[test]
    fn test_client_order_id_is_deterministic() {
        let bars = crossing_bars();
        let a = derive_client_order_id("BTCUSDT", TradeSide::Buy, &bars);
        let b = derive_client_order_id("BTCUSDT", TradeSide::Buy, &bars);
        assert_eq!(a, b);

        let c = derive_client_order_id("BTCUSDT", TradeSide::Sell, &bars);
        assert_ne!(a, c);
    }
}

//! Exchange integration: gateway trait, REST implementation, constraints cache.

mod binance;
mod constraints;
mod types;

use async_trait::async_trait;
use rust_decimal::Decimal;

pub use binance::BinanceGateway;
pub use constraints::{load_snapshot_entry, ConstraintsCache};
pub use types::{ExchangeError, LiquiditySnapshot, OrderRequest, OrderResult, OrderStatus};

use crate::models::{Bar, InstrumentConstraints, Position};

/// Everything the trading engine needs from an exchange.
///
/// The engine owns decision state; the gateway only moves orders and
/// market data. Implementations are expected to retry transient failures
/// internally and surface classified [`ExchangeError`]s otherwise.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Submit an order. The request's `client_order_id` is the idempotency
    /// key: resubmission with the same id must not double-fill.
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderResult, ExchangeError>;

    /// Current quantity/price filters for a symbol.
    async fn get_instrument_constraints(
        &self,
        symbol: &str,
    ) -> Result<InstrumentConstraints, ExchangeError>;

    /// Exchange-side view of the current position, if any. Used for
    /// reconciliation at startup, never as the in-loop source of truth.
    async fn get_position(&self, symbol: &str) -> Result<Option<Position>, ExchangeError>;

    /// Latest traded price.
    async fn get_market_price(&self, symbol: &str) -> Result<Decimal, ExchangeError>;

    /// Most recent bars, oldest first.
    async fn get_recent_bars(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> Result<Vec<Bar>, ExchangeError>;

    /// Top-of-book and 24h volume for liquidity checks.
    async fn get_liquidity(&self, symbol: &str) -> Result<LiquiditySnapshot, ExchangeError>;
}

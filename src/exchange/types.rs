//! Order types, market snapshots, and the exchange error taxonomy.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::TradeSide;

/// Errors from exchange interaction, classified so callers can decide
/// between retrying, re-quantizing, and giving up.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Timeouts, connection resets, 5xx responses, rate limiting.
    /// Safe to retry with backoff.
    #[error("transient network failure: {0}")]
    Transient(String),

    /// The order broke a quantity/price filter. Re-quantize and retry once.
    #[error("exchange filter violation: {0}")]
    FilterViolation(String),

    /// The exchange refused the order for a non-filter reason
    /// (insufficient balance, closed market). Not retryable.
    #[error("order rejected: {0}")]
    Rejected(String),

    /// Bad or missing credentials.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The response body did not parse into the expected shape.
    #[error("malformed exchange response: {0}")]
    Parse(String),
}

impl ExchangeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ExchangeError::Transient(_))
    }

    pub fn is_filter_violation(&self) -> bool {
        matches!(self, ExchangeError::FilterViolation(_))
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        // Any transport-level failure is worth a retry
        ExchangeError::Transient(e.to_string())
    }
}

/// An order ready for submission.
#[derive(Debug, Clone, Serialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: TradeSide,
    pub quantity: Decimal,

    /// Limit price; `None` submits a market order
    pub price: Option<Decimal>,

    /// Caller-derived idempotency key. Resubmitting the same intent reuses
    /// the same id, so the exchange deduplicates instead of double-filling.
    pub client_order_id: String,
}

/// Terminal state reported for a submitted order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

/// Result of a submitted order.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderResult {
    pub order_id: String,
    pub client_order_id: String,
    pub status: OrderStatus,
    pub executed_qty: Decimal,

    /// Volume-weighted fill price across partial fills
    pub avg_fill_price: Decimal,
}

/// Top-of-book and volume snapshot used for liquidity checks.
#[derive(Debug, Clone, PartialEq)]
pub struct LiquiditySnapshot {
    pub bid: Decimal,
    pub ask: Decimal,

    /// Quote-asset volume over the trailing 24 hours
    pub quote_volume_24h: Decimal,
}

impl LiquiditySnapshot {
    /// Bid/ask spread relative to the mid price.
    pub fn spread_pct(&self) -> f64 {
        let mid = (self.bid + self.ask) / Decimal::TWO;
        if mid <= Decimal::ZERO {
            return f64::MAX;
        }
        ((self.ask - self.bid) / mid).to_f64().unwrap_or(f64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_spread_pct() {
        let liq = LiquiditySnapshot {
            bid: dec!(99.95),
            ask: dec!(100.05),
            quote_volume_24h: dec!(1000000),
        };
        assert!((liq.spread_pct() - 0.001).abs() < 1e-9);
    }

    #[test]
    fn test_error_classification() {
        assert!(ExchangeError::Transient("timeout".into()).is_transient());
        assert!(ExchangeError::FilterViolation("LOT_SIZE".into()).is_filter_violation());
        assert!(!ExchangeError::Rejected("balance".into()).is_transient());
    }
}

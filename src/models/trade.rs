//! Trade records emitted by the live engine and the backtester.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of an order or fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "BUY",
            TradeSide::Sell => "SELL",
        }
    }

    /// Signed direction multiplier: +1 for buys, -1 for sells.
    pub fn sign(&self) -> Decimal {
        match self {
            TradeSide::Buy => Decimal::ONE,
            TradeSide::Sell => -Decimal::ONE,
        }
    }
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A completed fill with its realized outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    /// Unique record identifier
    pub id: String,

    pub symbol: String,
    pub side: TradeSide,
    pub quantity: Decimal,
    pub price: Decimal,

    /// Realized P&L from the portion of an existing position this fill closed.
    /// Zero for pure entries.
    pub realized_pnl: Decimal,

    /// Commission charged for this fill
    pub commission: Decimal,

    /// Name of the strategy that produced the order
    pub strategy: String,

    pub timestamp: DateTime<Utc>,
}

//! Signed position model with volume-weighted entry price.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::Signed;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::TradeSide;

/// An open position in a single instrument.
///
/// Quantity is signed: positive for long, negative for short. The average
/// entry price is the volume-weighted price of the fills that built the
/// current exposure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,

    /// Signed base-asset quantity (+long / -short)
    pub quantity: Decimal,

    /// Volume-weighted average entry price
    pub avg_entry_price: Decimal,

    /// Most recent mark price
    pub last_price: Decimal,

    pub opened_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// Create a flat position for a symbol.
    pub fn flat(symbol: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            symbol: symbol.into(),
            quantity: Decimal::ZERO,
            avg_entry_price: Decimal::ZERO,
            last_price: Decimal::ZERO,
            opened_at: now,
            updated_at: now,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.quantity.is_zero()
    }

    pub fn is_long(&self) -> bool {
        self.quantity > Decimal::ZERO
    }

    pub fn is_short(&self) -> bool {
        self.quantity < Decimal::ZERO
    }

    /// Update the mark price without changing exposure.
    pub fn mark(&mut self, price: Decimal) {
        self.last_price = price;
        self.updated_at = Utc::now();
    }

    /// Absolute exposure at the current mark.
    pub fn notional(&self) -> Decimal {
        self.quantity.abs() * self.last_price
    }

    /// Unrealized P&L at the current mark. Signed quantity makes this
    /// correct for shorts without special casing.
    pub fn unrealized_pnl(&self) -> Decimal {
        self.quantity * (self.last_price - self.avg_entry_price)
    }

    /// Apply a fill and return the realized P&L from any closed portion.
    ///
    /// Same-direction fills blend the average entry price weighted by
    /// quantity. Reducing fills keep the average unchanged. A fill that
    /// crosses through zero closes the old exposure at the fill price and
    /// opens the remainder with the fill price as the new average. An
    /// exact-zero result flattens the position entirely.
    pub fn apply_fill(&mut self, side: TradeSide, quantity: Decimal, price: Decimal) -> Decimal {
        let delta = side.sign() * quantity;
        let old_qty = self.quantity;
        let new_qty = old_qty + delta;

        let mut realized = Decimal::ZERO;

        if old_qty.is_zero() || old_qty.signum() == delta.signum() {
            // Opening or adding: blend the average
            let total = old_qty.abs() + delta.abs();
            if !total.is_zero() {
                self.avg_entry_price = (self.avg_entry_price * old_qty.abs()
                    + price * delta.abs())
                    / total;
            }
            if old_qty.is_zero() {
                self.opened_at = Utc::now();
            }
        } else {
            // Reducing, closing, or crossing through zero
            let closed = delta.abs().min(old_qty.abs());
            realized = closed * (price - self.avg_entry_price) * old_qty.signum();

            if new_qty.is_zero() {
                self.avg_entry_price = Decimal::ZERO;
            } else if new_qty.signum() != old_qty.signum() {
                // Crossed through zero: the surviving exposure was opened here
                self.avg_entry_price = price;
                self.opened_at = Utc::now();
            }
            // Plain reduction keeps the average untouched
        }

        self.quantity = new_qty;
        self.last_price = price;
        self.updated_at = Utc::now();

        realized
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn long_position(qty: Decimal, avg: Decimal) -> Position {
        let mut pos = Position::flat("BTCUSDT");
        pos.apply_fill(TradeSide::Buy, qty, avg);
        pos
    }

    #[test]
    fn test_add_blends_average() {
        let mut pos = long_position(dec!(1), dec!(100));
        pos.apply_fill(TradeSide::Buy, dec!(1), dec!(110));

        assert_eq!(pos.quantity, dec!(2));
        assert_eq!(pos.avg_entry_price, dec!(105));
    }

    #[test]
    fn test_reduce_keeps_average() {
        let mut pos = long_position(dec!(2), dec!(100));
        let realized = pos.apply_fill(TradeSide::Sell, dec!(1), dec!(120));

        assert_eq!(pos.quantity, dec!(1));
        assert_eq!(pos.avg_entry_price, dec!(100));
        assert_eq!(realized, dec!(20));
    }

    #[test]
    fn test_exact_close_flattens() {
        let mut pos = long_position(dec!(2), dec!(100));
        let realized = pos.apply_fill(TradeSide::Sell, dec!(2), dec!(90));

        assert!(pos.is_flat());
        assert_eq!(pos.avg_entry_price, Decimal::ZERO);
        assert_eq!(realized, dec!(-20));
    }

    #[test]
    fn test_cross_through_zero_resets_average() {
        let mut pos = long_position(dec!(1), dec!(100));
        let realized = pos.apply_fill(TradeSide::Sell, dec!(3), dec!(110));

        // Long 1 closed at 110 (+10), now short 2 from 110
        assert_eq!(realized, dec!(10));
        assert_eq!(pos.quantity, dec!(-2));
        assert_eq!(pos.avg_entry_price, dec!(110));
        assert!(pos.is_short());
    }

    #[test]
    fn test_short_pnl() {
        let mut pos = Position::flat("ETHUSDT");
        pos.apply_fill(TradeSide::Sell, dec!(2), dec!(100));
        pos.mark(dec!(90));

        // Short profits when price falls
        assert_eq!(pos.unrealized_pnl(), dec!(20));

        let realized = pos.apply_fill(TradeSide::Buy, dec!(2), dec!(90));
        assert_eq!(realized, dec!(20));
        assert!(pos.is_flat());
    }

    #[test]
    fn test_notional_is_unsigned() {
        let mut pos = Position::flat("ETHUSDT");
        pos.apply_fill(TradeSide::Sell, dec!(2), dec!(100));
        assert_eq!(pos.notional(), dec!(200));
    }
}

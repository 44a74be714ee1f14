//! Exchange trading rules for a single instrument.

use anyhow::{anyhow, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Quantity and price filters an exchange enforces on a symbol.
///
/// Mirrors the LOT_SIZE and PRICE_FILTER rules from the exchange's symbol
/// metadata. `max_qty` is `None` when the exchange publishes no upper bound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentConstraints {
    pub symbol: String,

    /// Smallest accepted order quantity
    pub min_qty: Decimal,

    /// Largest accepted order quantity, if bounded
    pub max_qty: Option<Decimal>,

    /// Quantity increment above `min_qty`
    pub step_size: Decimal,

    /// Smallest accepted order price
    pub min_price: Decimal,

    /// Price increment
    pub tick_size: Decimal,
}

impl InstrumentConstraints {
    /// Decimal places implied by the quantity step.
    ///
    /// Derived from the normalized step so `0.00100000` and `1E-3` both
    /// yield 3.
    pub fn qty_precision(&self) -> u32 {
        self.step_size.normalize().scale()
    }

    /// Decimal places implied by the price tick.
    pub fn price_precision(&self) -> u32 {
        self.tick_size.normalize().scale()
    }
}

/// Parse a filter value the way exchanges actually serialize them:
/// plain decimal strings, but occasionally exponential notation ("1E-4").
pub fn parse_filter_decimal(s: &str) -> Result<Decimal> {
    Decimal::from_str(s)
        .or_else(|_| Decimal::from_scientific(s))
        .map_err(|e| anyhow!("invalid filter value {:?}: {}", s, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn constraints(min_qty: Decimal, step: Decimal) -> InstrumentConstraints {
        InstrumentConstraints {
            symbol: "BTCUSDT".to_string(),
            min_qty,
            max_qty: None,
            step_size: step,
            min_price: dec!(0.01),
            tick_size: dec!(0.01),
        }
    }

    #[test]
    fn test_precision_from_trailing_zero_step() {
        let c = constraints(dec!(0.001), dec!(0.00100000));
        assert_eq!(c.qty_precision(), 3);
    }

    #[test]
    fn test_precision_from_exponential_step() {
        let step = parse_filter_decimal("1E-4").unwrap();
        let c = constraints(dec!(0.0001), step);
        assert_eq!(c.qty_precision(), 4);
    }

    #[test]
    fn test_precision_from_integer_step() {
        let c = constraints(dec!(1), dec!(1));
        assert_eq!(c.qty_precision(), 0);
    }

    #[test]
    fn test_parse_filter_decimal() {
        assert_eq!(parse_filter_decimal("0.00100000").unwrap(), dec!(0.001));
        assert_eq!(parse_filter_decimal("1E-4").unwrap(), dec!(0.0001));
        assert!(parse_filter_decimal("abc").is_err());
    }
}

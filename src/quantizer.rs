//! Order quantization against exchange filters.
//!
//! Raw quantities from position sizing almost never land on an exchange's
//! lot grid. These functions snap them to the nearest legal value so orders
//! are not rejected with filter violations.

use rust_decimal::Decimal;

use crate::models::{InstrumentConstraints, TradeSide};

/// Snap a raw quantity to the instrument's lot grid.
///
/// Clamps into `[min_qty, max_qty]`, then floors to a whole number of steps
/// above `min_qty`, then rounds to the precision implied by the step size.
/// The result is always a legal quantity; a raw value below the minimum is
/// raised to the minimum rather than zeroed.
pub fn legalize_quantity(raw: Decimal, c: &InstrumentConstraints) -> Decimal {
    if c.step_size <= Decimal::ZERO {
        return raw.max(c.min_qty);
    }

    let mut q = raw.max(c.min_qty);
    if let Some(max_qty) = c.max_qty {
        q = q.min(max_qty);
    }

    // Whole steps above the minimum, truncated so we never round up into
    // a quantity the caller did not ask for
    let steps = ((q - c.min_qty) / c.step_size).floor();
    let legal = c.min_qty + steps * c.step_size;

    legal.max(c.min_qty).round_dp(c.qty_precision())
}

/// Snap a raw price to the instrument's tick grid, clamped to `min_price`.
///
/// Rounds in the direction that does not worsen the order for the given
/// side: buys round down, sells round up.
pub fn legalize_price(raw: Decimal, side: TradeSide, c: &InstrumentConstraints) -> Decimal {
    if c.tick_size <= Decimal::ZERO {
        return raw.max(c.min_price);
    }

    let ticks = raw / c.tick_size;
    let ticks = match side {
        TradeSide::Buy => ticks.floor(),
        TradeSide::Sell => ticks.ceil(),
    };

    (ticks * c.tick_size)
        .max(c.min_price)
        .round_dp(c.price_precision())
}

/// Check a quantity against the instrument filters, reporting the specific
/// rule it breaks. Diagnostics only; `legalize_quantity` is the fix.
pub fn validate_quantity(quantity: Decimal, c: &InstrumentConstraints) -> Result<(), String> {
    if quantity < c.min_qty {
        return Err(format!(
            "quantity {} below minimum {} for {}",
            quantity, c.min_qty, c.symbol
        ));
    }

    if let Some(max_qty) = c.max_qty {
        if quantity > max_qty {
            return Err(format!(
                "quantity {} above maximum {} for {}",
                quantity, max_qty, c.symbol
            ));
        }
    }

    if c.step_size > Decimal::ZERO {
        let remainder = (quantity - c.min_qty) % c.step_size;
        if !remainder.normalize().is_zero() {
            return Err(format!(
                "quantity {} not aligned to step {} for {}",
                quantity, c.step_size, c.symbol
            ));
        }
    }

    Ok(())
}

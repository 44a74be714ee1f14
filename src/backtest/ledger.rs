//! Double-entry style ledger for simulated trading.
//!
//! The ledger is the single source of truth during a simulation: cash,
//! the signed open quantity, and an append-only list of every action
//! taken. Equity is always `capital + quantity * price`, for shorts too.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

/// What happened at one ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeAction {
    /// Open or add to a long
    Buy,
    /// Close a long on a strategy signal
    Sell,
    /// Open a short
    Short,
    /// Close a short on a strategy signal
    Cover,
    /// Close forced by the protective stop
    StopLoss,
    /// Close at the profit target
    TakeProfit,
    /// Close forced at the end of the simulation
    FinalClose,
}

impl TradeAction {
    /// Whether this action closes a round trip.
    pub fn is_exit(&self) -> bool {
        !matches!(self, TradeAction::Buy | TradeAction::Short)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TradeAction::Buy => "BUY",
            TradeAction::Sell => "SELL",
            TradeAction::Short => "SHORT",
            TradeAction::Cover => "COVER",
            TradeAction::StopLoss => "STOP_LOSS",
            TradeAction::TakeProfit => "TAKE_PROFIT",
            TradeAction::FinalClose => "FINAL_CLOSE",
        }
    }
}

/// One executed simulation action.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub timestamp: DateTime<Utc>,
    pub action: TradeAction,
    pub price: Decimal,
    pub quantity: Decimal,
    /// Realized profit net of commission; zero for entries
    pub profit: Decimal,
    /// Cash after this action
    pub capital: Decimal,
}

/// Cash, open position, and action history for one simulated account.
#[derive(Debug)]
pub struct SimulationLedger {
    pub capital: Decimal,
    /// Signed open quantity: positive long, negative short
    pub position_qty: Decimal,
    pub entry_price: Decimal,
    pub commission_rate: Decimal,
    pub total_commission: Decimal,
    pub entries: Vec<LedgerEntry>,
    pub equity_curve: Vec<(DateTime<Utc>, Decimal)>,
}

impl SimulationLedger {
    pub fn new(initial_capital: Decimal, commission_rate: Decimal) -> Self {
        Self {
            capital: initial_capital,
            position_qty: Decimal::ZERO,
            entry_price: Decimal::ZERO,
            commission_rate,
            total_commission: Decimal::ZERO,
            entries: Vec::new(),
            equity_curve: Vec::new(),
        }
    }

    pub fn is_flat(&self) -> bool {
        self.position_qty.is_zero()
    }

    pub fn is_long(&self) -> bool {
        self.position_qty > Decimal::ZERO
    }

    /// Mark-to-market equity at the given price.
    pub fn equity(&self, price: Decimal) -> Decimal {
        self.capital + self.position_qty * price
    }

    pub fn mark(&mut self, timestamp: DateTime<Utc>, price: Decimal) {
        let equity = self.equity(price);
        self.equity_curve.push((timestamp, equity));
    }

    /// Open a position. Cash moves by the signed notional; commission is
    /// charged on the gross notional.
    pub fn open(
        &mut self,
        timestamp: DateTime<Utc>,
        action: TradeAction,
        price: Decimal,
        quantity: Decimal,
    ) {
        debug_assert!(self.is_flat());
        debug_assert!(!action.is_exit());

        let signed = match action {
            TradeAction::Buy => quantity,
            _ => -quantity,
        };
        let commission = quantity * price * self.commission_rate;

        self.capital -= signed * price + commission;
        self.total_commission += commission;
        self.position_qty = signed;
        self.entry_price = price;

        self.entries.push(LedgerEntry {
            timestamp,
            action,
            price,
            quantity,
            profit: Decimal::ZERO,
            capital: self.capital,
        });
    }

    /// Close the open position at `price` and return the realized profit
    /// net of commission.
    pub fn close(&mut self, timestamp: DateTime<Utc>, action: TradeAction, price: Decimal) -> Decimal {
        debug_assert!(!self.is_flat());
        debug_assert!(action.is_exit());

        let quantity = self.position_qty.abs();
        let commission = quantity * price * self.commission_rate;
        let gross = self.position_qty * (price - self.entry_price);
        let profit = gross - commission;

        self.capital += self.position_qty * price - commission;
        self.total_commission += commission;
        self.position_qty = Decimal::ZERO;
        self.entry_price = Decimal::ZERO;

        self.entries.push(LedgerEntry {
            timestamp,
            action,
            price,
            quantity,
            profit,
            capital: self.capital,
        });
        profit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn test_long_round_trip() {
        let mut ledger = SimulationLedger::new(dec!(10000), dec!(0.001));

        ledger.open(now(), TradeAction::Buy, dec!(100), dec!(10));
        // 10000 - 1000 - 1 commission
        assert_eq!(ledger.capital, dec!(8999));
        assert_eq!(ledger.equity(dec!(100)), dec!(9999));

        let profit = ledger.close(now(), TradeAction::Sell, dec!(110));
        // Gross 100, minus 1.1 exit commission
        assert_eq!(profit, dec!(98.9));
        assert_eq!(ledger.capital, dec!(10097.9));
        assert!(ledger.is_flat());
    }

    #[test]
    fn test_short_round_trip() {
        let mut ledger = SimulationLedger::new(dec!(10000), Decimal::ZERO);

        ledger.open(now(), TradeAction::Short, dec!(100), dec!(5));
        assert_eq!(ledger.capital, dec!(10500));
        assert_eq!(ledger.position_qty, dec!(-5));
        // Equity unchanged at the entry price
        assert_eq!(ledger.equity(dec!(100)), dec!(10000));

        let profit = ledger.close(now(), TradeAction::Cover, dec!(90));
        assert_eq!(profit, dec!(50));
        assert_eq!(ledger.capital, dec!(10050));
    }

    #[test]
    fn test_equity_invariant_through_marks() {
        let mut ledger = SimulationLedger::new(dec!(10000), Decimal::ZERO);
        ledger.open(now(), TradeAction::Buy, dec!(100), dec!(10));

        for price in [dec!(95), dec!(105), dec!(120)] {
            assert_eq!(
                ledger.equity(price),
                ledger.capital + ledger.position_qty * price
            );
        }
        // Losses and gains flow through the mark, not through cash
        assert_eq!(ledger.equity(dec!(95)), dec!(9950));
        assert_eq!(ledger.equity(dec!(120)), dec!(10200));
    }

    #[test]
    fn test_commission_accumulates() {
        let mut ledger = SimulationLedger::new(dec!(10000), dec!(0.001));
        ledger.open(now(), TradeAction::Buy, dec!(100), dec!(10));
        ledger.close(now(), TradeAction::Sell, dec!(100));

        assert_eq!(ledger.total_commission, dec!(2));
        assert_eq!(ledger.entries.len(), 2);
    }
}

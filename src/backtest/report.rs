//! Performance summary computed from a finished simulation.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use statrs::statistics::Statistics;

use crate::risk::stats::{max_drawdown, PERIODS_PER_YEAR};

use super::ledger::LedgerEntry;

/// Annualized risk-free rate used for Sharpe.
const RISK_FREE_RATE: f64 = 0.02;

/// Cap on the annualized-return figure so a lucky week on a short sample
/// does not print a five-digit percentage.
const ANNUALIZED_CAP: f64 = 9.99;

/// Sentinel reported when a run has winners but zero losers.
const PROFIT_FACTOR_NO_LOSSES: f64 = 999.99;

/// Summary statistics for one backtest run.
#[derive(Debug, Clone)]
pub struct BacktestReport {
    pub symbol: String,
    pub strategy: String,
    pub initial_capital: Decimal,
    pub final_equity: Decimal,
    pub total_return: f64,
    pub annualized_return: f64,
    pub volatility: f64,
    pub sharpe_ratio: f64,
    pub max_drawdown: f64,
    pub calmar_ratio: f64,
    pub total_trades: usize,
    pub winning_trades: usize,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub total_commission: Decimal,
}

impl BacktestReport {
    pub fn compute(
        symbol: &str,
        strategy: &str,
        initial_capital: Decimal,
        final_equity: Decimal,
        entries: &[LedgerEntry],
        equity_curve: &[(DateTime<Utc>, Decimal)],
        total_commission: Decimal,
    ) -> Self {
        let initial = initial_capital.to_f64().unwrap_or(1.0).max(f64::MIN_POSITIVE);
        let total_return = (final_equity.to_f64().unwrap_or(0.0) - initial) / initial;

        let annualized_return = annualize(total_return, equity_curve);

        let equity: Vec<Decimal> = equity_curve.iter().map(|(_, e)| *e).collect();
        let dd = max_drawdown(&equity);

        let returns = period_returns(&equity);
        let volatility = if returns.len() >= 2 {
            returns.std_dev() * PERIODS_PER_YEAR.sqrt()
        } else {
            0.0
        };

        let sharpe_ratio = if volatility > 0.0 {
            (annualized_return - RISK_FREE_RATE) / volatility
        } else {
            0.0
        };
        let calmar_ratio = if dd > 0.0 { annualized_return / dd } else { 0.0 };

        // A round trip closes with exactly one exit action
        let closed: Vec<&LedgerEntry> = entries
            .iter()
            .filter(|e| e.action.is_exit())
            .collect();
        let total_trades = closed.len();
        let winning_trades = closed.iter().filter(|e| e.profit > Decimal::ZERO).count();
        let win_rate = if total_trades > 0 {
            winning_trades as f64 / total_trades as f64
        } else {
            0.0
        };

        let gross_win: Decimal = closed
            .iter()
            .filter(|e| e.profit > Decimal::ZERO)
            .map(|e| e.profit)
            .sum();
        let gross_loss: Decimal = closed
            .iter()
            .filter(|e| e.profit < Decimal::ZERO)
            .map(|e| -e.profit)
            .sum();
        let profit_factor = if total_trades == 0 {
            0.0
        } else if gross_loss.is_zero() {
            if gross_win > Decimal::ZERO {
                PROFIT_FACTOR_NO_LOSSES
            } else {
                0.0
            }
        } else {
            (gross_win / gross_loss).to_f64().unwrap_or(0.0)
        };

        Self {
            symbol: symbol.to_string(),
            strategy: strategy.to_string(),
            initial_capital,
            final_equity,
            total_return,
            annualized_return,
            volatility,
            sharpe_ratio,
            max_drawdown: dd,
            calmar_ratio,
            total_trades,
            winning_trades,
            win_rate,
            profit_factor,
            total_commission,
        }
    }
}

/// Geometric annualization over the simulated span, with a pro-rata
/// fallback when the account lost everything (log of a non-positive
/// growth factor is undefined).
fn annualize(total_return: f64, equity_curve: &[(DateTime<Utc>, Decimal)]) -> f64 {
    let (Some((start, _)), Some((end, _))) = (equity_curve.first(), equity_curve.last()) else {
        return 0.0;
    };
    let days = (*end - *start).num_seconds() as f64 / 86_400.0;
    if days <= 0.0 {
        return 0.0;
    }
    let years = days / 365.25;

    let growth = 1.0 + total_return;
    let annualized = if growth > 0.0 {
        growth.powf(1.0 / years) - 1.0
    } else {
        total_return / years
    };
    annualized.clamp(-ANNUALIZED_CAP, ANNUALIZED_CAP)
}

fn period_returns(equity: &[Decimal]) -> Vec<f64> {
    equity
        .windows(2)
        .filter_map(|w| {
            let prev = w[0].to_f64()?;
            let curr = w[1].to_f64()?;
            if prev > 0.0 {
                Some(curr / prev - 1.0)
            } else {
                None
            }
        })
        .collect()
}

impl fmt::Display for BacktestReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\n{:=^60}", " BACKTEST RESULTS ")?;
        writeln!(f, "Symbol:            {}", self.symbol)?;
        writeln!(f, "Strategy:          {}", self.strategy)?;
        writeln!(f, "Initial Capital:   {:.2}", self.initial_capital)?;
        writeln!(f, "Final Equity:      {:.2}", self.final_equity)?;
        writeln!(f, "Total Return:      {:.2}%", self.total_return * 100.0)?;
        writeln!(f, "Annualized Return: {:.2}%", self.annualized_return * 100.0)?;
        writeln!(f, "Volatility:        {:.2}%", self.volatility * 100.0)?;
        writeln!(f, "Sharpe Ratio:      {:.2}", self.sharpe_ratio)?;
        writeln!(f, "Max Drawdown:      {:.2}%", self.max_drawdown * 100.0)?;
        writeln!(f, "Calmar Ratio:      {:.2}", self.calmar_ratio)?;
        writeln!(f, "{:-^60}", "")?;
        writeln!(f, "Total Trades:      {}", self.total_trades)?;
        writeln!(
            f,
            "Win Rate:          {:.1}% ({}/{})",
            self.win_rate * 100.0,
            self.winning_trades,
            self.total_trades
        )?;
        writeln!(f, "Profit Factor:     {:.2}", self.profit_factor)?;
        writeln!(f, "Total Commission:  {:.2}", self.total_commission)?;
        writeln!(f, "{:=^60}", "")?;
        Ok(())
    }
}

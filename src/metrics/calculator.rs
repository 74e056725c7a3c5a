//! Calculator for closed-trade statistics: win rate, payoff ratio, drawdown, Sharpe.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use statrs::statistics::Statistics;

use crate::models::{Outcome, PerformanceRecord};

/// Aggregate statistics over a set of closed trades.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TradeStats {
    pub samples: u32,
    pub wins: u32,
    pub losses: u32,
    pub breakevens: u32,
    /// wins / samples (breakevens count as non-wins)
    pub win_rate: f64,
    pub total_pnl: Decimal,
    pub avg_win: Decimal,
    /// Absolute value of the mean losing P&L
    pub avg_loss: Decimal,
    /// avg_win / avg_loss; infinite with wins and no losses, 0 without wins
    pub payoff_ratio: f64,
    pub profit_factor: f64,
    /// Peak-to-trough of the cumulative P&L, as a fraction of the peak
    pub max_drawdown: f64,
    /// Mean over standard deviation of per-trade P&L (not annualized)
    pub sharpe_ratio: f64,
}

/// Calculator for closed-trade statistics.
pub struct MetricsCalculator;

impl MetricsCalculator {
    /// Statistics for records in the order given (oldest first for drawdown).
    pub fn calculate(records: &[&PerformanceRecord]) -> TradeStats {
        let mut stats = TradeStats::default();
        if records.is_empty() {
            return stats;
        }

        stats.samples = records.len() as u32;
        let mut gross_profit = Decimal::ZERO;
        let mut gross_loss = Decimal::ZERO;

        for r in records {
            stats.total_pnl += r.pnl;
            match r.outcome {
                Outcome::Win => {
                    stats.wins += 1;
                    gross_profit += r.pnl.abs();
                }
                Outcome::Loss => {
                    stats.losses += 1;
                    gross_loss += r.pnl.abs();
                }
                Outcome::Breakeven => stats.breakevens += 1,
            }
        }

        stats.win_rate = stats.wins as f64 / stats.samples as f64;

        if stats.wins > 0 {
            stats.avg_win = gross_profit / Decimal::from(stats.wins);
        }
        if stats.losses > 0 {
            stats.avg_loss = gross_loss / Decimal::from(stats.losses);
        }

        if stats.avg_loss > Decimal::ZERO {
            stats.payoff_ratio = (stats.avg_win / stats.avg_loss).to_f64().unwrap_or(0.0);
        } else if stats.avg_win > Decimal::ZERO {
            stats.payoff_ratio = f64::INFINITY;
        }
        if gross_loss > Decimal::ZERO {
            stats.profit_factor = (gross_profit / gross_loss).to_f64().unwrap_or(0.0);
        }

        let pnls: Vec<Decimal> = records.iter().map(|r| r.pnl).collect();
        stats.max_drawdown = Self::max_drawdown(&pnls);
        stats.sharpe_ratio = Self::sharpe(&pnls);

        stats
    }

    /// Maximum drawdown of the cumulative P&L curve as a fraction of its peak.
    fn max_drawdown(pnls: &[Decimal]) -> f64 {
        let mut equity = Decimal::ZERO;
        let mut peak = Decimal::ZERO;
        let mut max_dd_pct = 0.0f64;

        for pnl in pnls {
            equity += pnl;
            if equity > peak {
                peak = equity;
            }
            if peak > Decimal::ZERO {
                let dd = ((peak - equity) / peak).to_f64().unwrap_or(0.0);
                max_dd_pct = max_dd_pct.max(dd);
            }
        }

        max_dd_pct
    }

    fn sharpe(pnls: &[Decimal]) -> f64 {
        if pnls.len() < 2 {
            return 0.0;
        }
        let returns: Vec<f64> = pnls.iter().filter_map(|p| p.to_f64()).collect();
        let mean = returns.iter().mean();
        let std_dev = returns.iter().std_dev();
        if std_dev.is_finite() && std_dev > 0.0 {
            mean / std_dev
        } else {
            0.0
        }
    }
}

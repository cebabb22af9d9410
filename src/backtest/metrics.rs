use crate::models::{Direction, Transaction};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One closed position: an open leg and its close leg
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub coin_id: i64,
    pub direction: Direction,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: f64,
    pub pnl: f64,     // Before commissions
    pub pnl_pct: f64, // Net, as stored on the close leg
    pub holding_period_minutes: i64,
    pub transaction_cost: f64, // Open + close commission
    pub net_pnl: f64,
}

fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

impl TradeRecord {
    pub fn from_legs(open: &Transaction, close: &Transaction) -> Option<Self> {
        let net_pnl = to_f64(close.profit?);
        let transaction_cost = to_f64(open.commission + close.commission);

        Some(Self {
            coin_id: open.coin_id,
            direction: open.direction,
            entry_time: open.created_at,
            exit_time: close.created_at,
            entry_price: to_f64(open.price),
            exit_price: to_f64(close.price),
            quantity: to_f64(close.amount),
            pnl: net_pnl + transaction_cost,
            pnl_pct: close.percent_profit.unwrap_or(0.0),
            holding_period_minutes: (close.created_at - open.created_at).num_minutes(),
            transaction_cost,
            net_pnl,
        })
    }
}

/// Pair every close leg with its open leg, ordered by exit time
pub fn pair_trades(transactions: &[Transaction]) -> Vec<TradeRecord> {
    let by_id: HashMap<i64, &Transaction> = transactions
        .iter()
        .filter_map(|t| t.id.map(|id| (id, t)))
        .collect();

    let mut trades: Vec<TradeRecord> = transactions
        .iter()
        .filter(|t| t.is_close_leg())
        .filter_map(|close| {
            let open = by_id.get(&close.related_transaction_id?)?;
            TradeRecord::from_legs(open, close)
        })
        .collect();

    trades.sort_by_key(|t| t.exit_time);
    trades
}

/// Backtest summary over the closed trades of a run
///
/// Wins and losses are judged on net P&L, after commissions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BacktestMetrics {
    pub initial_portfolio_value: f64,
    pub final_portfolio_value: f64,
    pub gross_pnl: f64,
    pub commissions: f64,
    pub net_pnl: f64,
    pub net_return_pct: f64,

    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub profit_factor: f64,

    pub max_drawdown: f64,
    pub max_drawdown_pct: f64,
    pub sharpe_ratio: f64,
    pub avg_holding_minutes: f64,

    pub ticks: usize,
    pub failed_ticks: usize,

    pub trades: Vec<TradeRecord>,
}

impl BacktestMetrics {
    pub fn from_transactions(transactions: &[Transaction], initial_portfolio_value: f64) -> Self {
        let trades = pair_trades(transactions);
        let n = trades.len();

        let gross_pnl: f64 = trades.iter().map(|t| t.pnl).sum();
        let commissions: f64 = trades.iter().map(|t| t.transaction_cost).sum();
        let net_pnl: f64 = trades.iter().map(|t| t.net_pnl).sum();

        let (wins, losses): (Vec<f64>, Vec<f64>) = trades
            .iter()
            .map(|t| t.net_pnl)
            .partition(|pnl| *pnl > 0.0);
        let won: f64 = wins.iter().sum();
        let lost: f64 = losses.iter().map(|l| l.abs()).sum();

        let curve = equity_curve(&trades, initial_portfolio_value);
        let (max_drawdown, max_drawdown_pct) = max_drawdown(&curve);
        let returns: Vec<f64> = trades.iter().map(|t| t.pnl_pct).collect();

        Self {
            initial_portfolio_value,
            final_portfolio_value: initial_portfolio_value + net_pnl,
            gross_pnl,
            commissions,
            net_pnl,
            net_return_pct: ratio(net_pnl, initial_portfolio_value) * 100.0,
            total_trades: n,
            winning_trades: wins.len(),
            losing_trades: losses.len(),
            win_rate: ratio(wins.len() as f64, n as f64) * 100.0,
            profit_factor: if lost > 0.0 { won / lost } else if won > 0.0 { f64::INFINITY } else { 0.0 },
            max_drawdown,
            max_drawdown_pct,
            sharpe_ratio: sharpe(&returns),
            avg_holding_minutes: ratio(
                trades.iter().map(|t| t.holding_period_minutes as f64).sum(),
                n as f64,
            ),
            ticks: 0,
            failed_ticks: 0,
            trades,
        }
    }

    pub fn print_report(&self) {
        println!("\n---------------- BACKTEST REPORT ----------------");
        println!(
            "💵 Balance  {:.2} -> {:.2}  net {:+.2} ({:+.2}%)",
            self.initial_portfolio_value, self.final_portfolio_value, self.net_pnl, self.net_return_pct
        );
        println!("   Gross {:+.2}, commissions {:.2}", self.gross_pnl, self.commissions);
        println!(
            "📈 Trades   {} ({} won / {} lost, {:.1}% win rate, PF {:.2})",
            self.total_trades, self.winning_trades, self.losing_trades, self.win_rate, self.profit_factor
        );
        println!(
            "⚠️  Risk     max DD {:.2} ({:.2}%), sharpe {:.2}, avg hold {:.0} min",
            self.max_drawdown, self.max_drawdown_pct, self.sharpe_ratio, self.avg_holding_minutes
        );
        println!("🔁 Replay   {} ticks, {} failed", self.ticks, self.failed_ticks);
        println!("-------------------------------------------------\n");
    }
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}

/// Balance after each closed trade, starting with the initial balance
fn equity_curve(trades: &[TradeRecord], initial: f64) -> Vec<f64> {
    std::iter::once(initial)
        .chain(trades.iter().scan(initial, |equity, t| {
            *equity += t.net_pnl;
            Some(*equity)
        }))
        .collect()
}

/// Largest peak-to-trough drop, absolute and in percent of that peak
fn max_drawdown(curve: &[f64]) -> (f64, f64) {
    let mut peak = f64::MIN;
    let mut worst = (0.0, 0.0);
    for &equity in curve {
        peak = peak.max(equity);
        let drop = peak - equity;
        if drop > worst.0 {
            worst = (drop, ratio(drop, peak) * 100.0);
        }
    }
    worst
}

/// Per-trade return mean over its population deviation
fn sharpe(returns: &[f64]) -> f64 {
    let n = returns.len() as f64;
    let mean = ratio(returns.iter().sum(), n);
    let deviation = ratio(returns.iter().map(|r| (r - mean).powi(2)).sum(), n).sqrt();
    ratio(mean, deviation)
}

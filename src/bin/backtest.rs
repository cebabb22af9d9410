use chrono::{TimeZone, Utc};
use marginbot::backtest::{BacktestMetrics, BacktestRunner, MarketScenario, SyntheticDataGenerator};
use marginbot::config::{BacktestConfig, BreakoutConfig, TradingConfig};
use marginbot::db::InMemoryStore;
use marginbot::models::{Coin, TradingType};
use marginbot::strategy::{BreakoutStrategy, Strategy};
use marginbot::Result;
use rust_decimal::Decimal;
use std::sync::Arc;

const CANDLES: usize = 500;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("marginbot=info")
        .init();

    println!("\n=========================================================");
    println!("           MARGINBOT BACKTESTING SUITE");
    println!("=========================================================");

    let trading = TradingConfig::default();
    let backtest = BacktestConfig::default();
    let coin = Coin::new(1, "SYNTHUSDT");
    let start = Utc
        .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_else(Utc::now);
    let end = start + trading.kline_interval.duration() * CANDLES as i32;

    let mut all_metrics = Vec::new();

    for scenario in MarketScenario::all() {
        // Generate synthetic data
        let klines = SyntheticDataGenerator::new(42).generate(
            scenario,
            coin.id,
            trading.kline_interval,
            start,
            CANDLES,
        );

        let runner = BacktestRunner::new(
            trading.clone(),
            backtest.clone(),
            Arc::new(InMemoryStore::with_klines(klines)),
            vec![coin.clone()],
        );

        let breakout = BreakoutConfig {
            name: "breakout_synth".to_string(),
            coin: coin.clone(),
            cost: Decimal::new(500, 0),
            lookback: 20,
            reward_ratio: Decimal::TWO,
            trading_type: TradingType::Futures,
        };

        let result = runner
            .run_and_report(start, end, scenario.label(), move |manager| {
                vec![Arc::new(BreakoutStrategy::new(breakout, manager)) as Arc<dyn Strategy>]
            })
            .await;

        match result {
            Ok(metrics) => all_metrics.push((scenario.label().to_string(), metrics)),
            Err(e) => eprintln!("❌ Backtest failed for {}: {}", scenario.label(), e),
        }
    }

    // Summary comparison
    print_summary_comparison(&all_metrics);

    Ok(())
}

fn print_summary_comparison(results: &[(String, BacktestMetrics)]) {
    println!("\n=========================================================");
    println!("                 SCENARIO COMPARISON");
    println!("=========================================================\n");

    println!(
        "{:<24} {:>10} {:>10} {:>8} {:>8} {:>8}",
        "Scenario", "Net P&L", "Return%", "Trades", "Win%", "MaxDD%"
    );
    println!("{}", "-".repeat(72));

    for (name, metrics) in results {
        println!(
            "{:<24} {:>10.2} {:>10.2} {:>8} {:>8.1} {:>8.2}",
            name,
            metrics.net_pnl,
            metrics.net_return_pct,
            metrics.total_trades,
            metrics.win_rate,
            metrics.max_drawdown_pct
        );
    }

    println!();

    // Find best/worst
    if let Some((best_name, best)) = results
        .iter()
        .max_by(|a, b| a.1.net_return_pct.total_cmp(&b.1.net_return_pct))
    {
        println!("🏆 Best Scenario: {} ({:+.2}%)", best_name, best.net_return_pct);
    }

    if let Some((worst_name, worst)) = results
        .iter()
        .min_by(|a, b| a.1.net_return_pct.total_cmp(&b.1.net_return_pct))
    {
        println!("⚠️  Worst Scenario: {} ({:+.2}%)", worst_name, worst.net_return_pct);
    }

    // Overall statistics
    let total_trades: usize = results.iter().map(|(_, m)| m.total_trades).sum();
    let failed_ticks: usize = results.iter().map(|(_, m)| m.failed_ticks).sum();
    let avg_win_rate = if results.is_empty() {
        0.0
    } else {
        results.iter().map(|(_, m)| m.win_rate).sum::<f64>() / results.len() as f64
    };

    println!("\n📊 Overall Statistics:");
    println!("   Total Trades Across All Scenarios: {}", total_trades);
    println!("   Average Win Rate: {:.1}%", avg_win_rate);
    println!("   Failed Ticks: {}", failed_ticks);

    println!("\n=========================================================\n");
}


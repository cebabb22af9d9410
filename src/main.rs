use anyhow::Context;
use chrono::{DateTime, NaiveDate, Timelike, Utc};
use clap::{Parser, Subcommand};
use marginbot::backtest::BacktestRunner;
use marginbot::config::BotConfig;
use marginbot::db::PostgresPersistence;
use marginbot::exchange::SimulatedExchange;
use marginbot::execution::{Collaborators, OrderManager};
use marginbot::strategy::{self, Strategy};
use marginbot::{notify, RealClock};
use std::sync::Arc;
use tokio::time::{interval_at, Duration, Instant};

/// Delay after a candle boundary so the closed candle is stored before we read it
const TICK_DELAY_SECS: u64 = 30;

// ============================================================================
// CLI
// ============================================================================

#[derive(Parser)]
#[command(name = "marginbot")]
#[command(about = "Order lifecycle and risk management engine", long_about = None)]
struct Cli {
    /// Configuration file (TOML, extension optional)
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured strategies against live time with a paper exchange
    Paper,

    /// Replay the configured strategies over stored klines
    Backtest {
        /// Window start (RFC 3339 or YYYY-MM-DD)
        #[arg(long)]
        from: String,

        /// Window end, exclusive (RFC 3339 or YYYY-MM-DD)
        #[arg(long)]
        to: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();
    let config = BotConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    if config.strategies.is_empty() {
        anyhow::bail!("No strategies configured, nothing to run");
    }

    match cli.command {
        Commands::Paper => run_paper(config).await,
        Commands::Backtest { from, to } => {
            let from = parse_moment(&from)?;
            let to = parse_moment(&to)?;
            if from >= to {
                anyhow::bail!("--from must be before --to");
            }
            run_backtest(config, from, to).await
        }
    }
}

// ============================================================================
// Initialization Functions
// ============================================================================

fn setup_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "marginbot=info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn parse_moment(value: &str) -> anyhow::Result<DateTime<Utc>> {
    if let Ok(moment) = DateTime::parse_from_rfc3339(value) {
        return Ok(moment.with_timezone(&Utc));
    }

    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .with_context(|| format!("Invalid moment '{}'", value))?;
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .with_context(|| format!("Invalid date '{}'", value))?;
    Ok(midnight.and_utc())
}

/// Next candle boundary plus the settle delay
fn next_tick_start(interval_secs: u64) -> Instant {
    let now = Utc::now();
    let seconds_of_day = now.num_seconds_from_midnight() as u64;
    let into_candle = seconds_of_day % interval_secs;
    let until_boundary = interval_secs - into_candle;

    Instant::now() + Duration::from_secs(until_boundary + TICK_DELAY_SECS)
}

// ============================================================================
// Paper Trading
// ============================================================================

async fn run_paper(config: BotConfig) -> anyhow::Result<()> {
    tracing::info!("🚀 marginbot starting in paper mode");

    let persistence = Arc::new(
        PostgresPersistence::new(&config.database_url)
            .await
            .context("Failed to connect to Postgres")?,
    );
    tracing::info!("✅ Connected to Postgres");

    let clock = Arc::new(RealClock);
    let exchange = Arc::new(SimulatedExchange::new(
        clock.clone(),
        persistence.clone(),
        config.trading.kline_interval,
        config.backtest.commission_rate,
        config.backtest.initial_balance,
    ));

    let manager = Arc::new(OrderManager::new(
        Collaborators {
            exchange: exchange.clone(),
            transactions: persistence.clone(),
            klines: persistence.clone(),
            price_changes: persistence.clone(),
            notifier: notify::from_config(&config.notifications),
            clock,
        },
        config.trading.clone(),
    ));

    let strategies = strategy::from_config(&config.strategies, manager);
    for s in &strategies {
        tracing::info!("  📋 {} (needs {} candles)", s.name(), s.min_candles_required());
    }

    let names: Vec<&str> = strategies.iter().map(|s| s.name()).collect();
    let restored = exchange
        .restore_open_positions(persistence.as_ref(), &names, config.trading.leverage)
        .await
        .context("Failed to restore open positions")?;
    tracing::info!("♻️  Restored {} open position(s) into the paper exchange", restored);

    let interval = config.trading.kline_interval;
    let interval_secs = interval.duration().num_seconds().max(1) as u64;
    let start = next_tick_start(interval_secs);
    tracing::info!(
        "Ticking every {} ({}s after each boundary), first tick in {:?}",
        interval,
        TICK_DELAY_SECS,
        start - Instant::now()
    );

    let trading_task = tokio::spawn(trading_loop(strategies, start, interval_secs));

    tracing::info!("\nPress Ctrl+C to stop...\n");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("⚠️  Received Ctrl+C, shutting down...");
        }
        result = trading_task => {
            tracing::error!("Trading loop exited: {:?}", result);
        }
    }

    tracing::info!("👋 marginbot stopped");
    Ok(())
}

async fn trading_loop(strategies: Vec<Arc<dyn Strategy>>, start: Instant, interval_secs: u64) {
    let mut ticker = interval_at(start, Duration::from_secs(interval_secs));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        tracing::info!("💹 [TRADING] Tick at {}", Utc::now().format("%H:%M:%S"));

        for s in &strategies {
            if let Err(e) = s.on_tick().await {
                tracing::error!("Strategy {} failed: {}", s.name(), e);
            }
        }
    }
}

// ============================================================================
// Backtest
// ============================================================================

async fn run_backtest(config: BotConfig, from: DateTime<Utc>, to: DateTime<Utc>) -> anyhow::Result<()> {
    let persistence = Arc::new(
        PostgresPersistence::new(&config.database_url)
            .await
            .context("Failed to connect to Postgres")?,
    );

    let runner = BacktestRunner::new(
        config.trading.clone(),
        config.backtest.clone(),
        persistence,
        config.strategies.coins(),
    )
    .with_notifier(notify::from_config(&config.notifications));

    let strategies_config = config.strategies.clone();
    runner
        .run_and_report(from, to, "stored klines", move |manager| {
            strategy::from_config(&strategies_config, manager)
        })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_moment_accepts_dates_and_rfc3339() {
        assert_eq!(
            parse_moment("2024-03-01").unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(
            parse_moment("2024-03-01T12:30:00+02:00").unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 30, 0).unwrap()
        );
        assert!(parse_moment("yesterday").is_err());
    }

    #[test]
    fn test_cli_parses_backtest_window() {
        let cli = Cli::parse_from([
            "marginbot",
            "--config",
            "config/prod",
            "backtest",
            "--from",
            "2024-01-01",
            "--to",
            "2024-02-01",
        ]);

        assert_eq!(cli.config.as_deref(), Some("config/prod"));
        match cli.command {
            Commands::Backtest { from, to } => {
                assert_eq!(from, "2024-01-01");
                assert_eq!(to, "2024-02-01");
            }
            Commands::Paper => panic!("expected backtest"),
        }
    }
}

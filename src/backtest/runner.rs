use crate::backtest::metrics::BacktestMetrics;
use crate::backtest::replay::ReplayDriver;
use crate::clock::SimulatedClock;
use crate::config::{BacktestConfig, TradingConfig};
use crate::db::{InMemoryStore, KlineRepository, TransactionRepository};
use crate::exchange::SimulatedExchange;
use crate::execution::{Collaborators, ExitReason, OrderManager};
use crate::models::{Coin, Transaction};
use crate::notify::{LogNotifier, Notifier};
use crate::strategy::Strategy;
use crate::Result;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use std::collections::HashMap;
use std::sync::Arc;

/// Everything one backtest shares: a single simulated clock, exchange and
/// transaction store wired into the live order manager
pub struct BacktestEnvironment {
    pub clock: Arc<SimulatedClock>,
    pub exchange: Arc<SimulatedExchange>,
    pub store: Arc<InMemoryStore>,
    pub manager: Arc<OrderManager>,
}

/// Backtest runner that replays strategies over stored klines
pub struct BacktestRunner {
    trading: TradingConfig,
    backtest: BacktestConfig,
    klines: Arc<dyn KlineRepository>,
    coins: HashMap<i64, Coin>,
    notifier: Arc<dyn Notifier>,
}

impl BacktestRunner {
    pub fn new(
        trading: TradingConfig,
        backtest: BacktestConfig,
        klines: Arc<dyn KlineRepository>,
        coins: Vec<Coin>,
    ) -> Self {
        Self {
            trading,
            backtest,
            klines,
            coins: coins.into_iter().map(|c| (c.id, c)).collect(),
            notifier: Arc::new(LogNotifier),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Fresh environment with the clock at `from`
    pub fn environment(&self, from: DateTime<Utc>) -> BacktestEnvironment {
        let clock = Arc::new(SimulatedClock::new(from));
        let store = Arc::new(InMemoryStore::new());
        let exchange = Arc::new(SimulatedExchange::new(
            clock.clone(),
            self.klines.clone(),
            self.trading.kline_interval,
            self.backtest.commission_rate,
            self.backtest.initial_balance,
        ));

        let manager = Arc::new(OrderManager::new(
            Collaborators {
                exchange: exchange.clone(),
                transactions: store.clone(),
                klines: self.klines.clone(),
                price_changes: store.clone(),
                notifier: self.notifier.clone(),
                clock: clock.clone(),
            },
            self.trading.clone(),
        ));

        BacktestEnvironment {
            clock,
            exchange,
            store,
            manager,
        }
    }

    /// Replay `[from, to)` with the strategies built by `build_strategies`
    ///
    /// Positions still open at the end are closed at the last known price.
    pub async fn run<F>(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        build_strategies: F,
    ) -> Result<BacktestMetrics>
    where
        F: FnOnce(Arc<OrderManager>) -> Vec<Arc<dyn Strategy>>,
    {
        let env = self.environment(from);
        let strategies = build_strategies(env.manager.clone());
        let driver = ReplayDriver::new(env.clock.clone(), Duration::minutes(self.backtest.step_minutes))?;

        tracing::info!(
            "Starting backtest: {} -> {}, strategies: {}",
            from,
            to,
            strategies
                .iter()
                .map(|s| s.name().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );

        let report = driver.run(&strategies, from, to).await;

        env.clock.set_moment(to);
        let mut transactions = Vec::new();
        for strategy in &strategies {
            self.close_leftovers(&env.manager, strategy.name()).await;
            transactions.extend(env.store.find_all_by_strategy(strategy.name()).await?);
        }

        let initial = self.backtest.initial_balance.to_f64().unwrap_or(0.0);
        let mut metrics = BacktestMetrics::from_transactions(&transactions, initial);
        metrics.ticks = report.ticks;
        metrics.failed_ticks = report.failed_ticks;

        tracing::info!(
            "Backtest complete: {} trades, P&L: ${:.2} ({:.2}%)",
            metrics.total_trades,
            metrics.net_pnl,
            metrics.net_return_pct
        );

        Ok(metrics)
    }

    /// Run backtest and print report
    pub async fn run_and_report<F>(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        scenario_name: &str,
        build_strategies: F,
    ) -> Result<BacktestMetrics>
    where
        F: FnOnce(Arc<OrderManager>) -> Vec<Arc<dyn Strategy>>,
    {
        println!("\n🔬 Running backtest: {}", scenario_name);
        println!("   Window: {} -> {}", from, to);
        println!("   Initial Balance: ${}", self.backtest.initial_balance);

        let metrics = self.run(from, to, build_strategies).await?;
        metrics.print_report();

        Ok(metrics)
    }

    async fn close_leftovers(&self, manager: &OrderManager, strategy: &str) {
        let opened: Vec<Transaction> = match manager.opened_transactions(strategy).await {
            Ok(opened) => opened,
            Err(e) => {
                tracing::error!("Could not load open positions of {}: {}", strategy, e);
                return;
            }
        };

        for open in opened {
            let coin = self
                .coins
                .get(&open.coin_id)
                .cloned()
                .unwrap_or_else(|| Coin::new(open.coin_id, format!("coin-{}", open.coin_id)));

            let closed = match manager.current_price(&coin).await {
                Ok(price) => {
                    manager
                        .close_with_reason(&coin, &open, price, open.trading_type, ExitReason::Manual)
                        .await
                }
                Err(e) => Err(e),
            };

            if let Err(e) = closed {
                tracing::warn!(
                    "Could not close leftover {} #{:?}: {}",
                    coin.code,
                    open.id,
                    e
                );
            }
        }
    }
}

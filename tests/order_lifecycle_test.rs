use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use marginbot::backtest::ReplayDriver;
use marginbot::db::{InMemoryStore, TransactionRepository};
use marginbot::exchange::{
    CloseTradeRecord, ExchangeApi, OrderFill, OrderRequest, PositionInfo, SimulatedExchange,
};
use marginbot::execution::{Collaborators, CombinedLeg, OpenOrderRequest, OrderManager};
use marginbot::notify::LogNotifier;
use marginbot::strategy::Strategy;
use marginbot::*;
use marginbot::config::TradingConfig;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap()
}

fn btc() -> Coin {
    Coin::new(1, "BTCUSDT")
}

fn eth() -> Coin {
    Coin::new(2, "ETHUSDT")
}

fn candle(coin: &Coin, minute: i64, open: Decimal, high: Decimal, low: Decimal, close: Decimal) -> Kline {
    Kline::new(
        coin.id,
        KlineInterval::FiveMinutes,
        start() + Duration::minutes(minute),
        open,
        high,
        low,
        close,
    )
}

fn flat(coin: &Coin, minute: i64, price: Decimal) -> Kline {
    candle(coin, minute, price, price, price, price)
}

struct Harness {
    clock: Arc<SimulatedClock>,
    store: Arc<InMemoryStore>,
    exchange: Arc<SimulatedExchange>,
    manager: Arc<OrderManager>,
}

fn harness(klines: Vec<Kline>) -> Harness {
    let clock = Arc::new(SimulatedClock::new(start()));
    let store = Arc::new(InMemoryStore::with_klines(klines));
    let exchange = Arc::new(SimulatedExchange::new(
        clock.clone(),
        store.clone(),
        KlineInterval::FiveMinutes,
        dec!(0.0004),
        dec!(10000),
    ));
    let manager = Arc::new(OrderManager::new(
        Collaborators {
            exchange: exchange.clone(),
            transactions: store.clone(),
            klines: store.clone(),
            price_changes: store.clone(),
            notifier: Arc::new(LogNotifier),
            clock: clock.clone(),
        },
        TradingConfig::default(),
    ));

    Harness {
        clock,
        store,
        exchange,
        manager,
    }
}

fn long_btc(stop_loss: Option<Decimal>) -> OpenOrderRequest {
    OpenOrderRequest {
        coin: btc(),
        direction: Direction::Long,
        cost: dec!(100),
        stop_loss,
        take_profit: None,
        trading_type: TradingType::Futures,
        strategy: "lifecycle".to_string(),
    }
}

#[tokio::test]
async fn test_stop_loss_lifecycle() {
    tracing_subscriber::fmt()
        .with_env_filter("marginbot=debug")
        .try_init()
        .ok();

    println!("=== Starting Order Lifecycle Test ===\n");

    let h = harness(vec![
        candle(&btc(), 0, dec!(10000), dec!(10050), dec!(9700), dec!(9900)),
        flat(&btc(), 5, dec!(9900)),
    ]);

    // 1. Open a long position
    println!("1. Opening LONG BTC for 100 at 10:00...");
    let open = h.manager.open(long_btc(Some(dec!(9750)))).await.unwrap();
    println!("   ✓ Opened #{:?} amount {} @ {}", open.id, open.amount, open.price);
    assert_eq!(open.amount, dec!(0.01));
    assert_eq!(open.price, dec!(10000));
    assert_eq!(open.stop_loss_price, Some(dec!(9750)));
    assert!(open.is_open());

    // 2. The wick of the 10:00 candle touches the stop
    println!("\n2. Checking stop-loss after the 10:00 candle closes...");
    h.clock.set_moment(start() + Duration::minutes(5));
    let close = h
        .manager
        .close_order_by_fixed_stop_loss_or_take_profit(&btc(), &open, KlineInterval::FiveMinutes)
        .await
        .unwrap()
        .expect("stop-loss should have triggered");
    println!("   ✓ Closed @ {} profit {:?}", close.price, close.profit);
    assert_eq!(close.price, dec!(9750));
    // 97.5 - 100 - (0.04 + 0.039)
    assert_eq!(close.profit, Some(dec!(-2.579)));
    assert_eq!(close.percent_profit, Some(-2.58));

    // 3. Both legs are linked
    println!("\n3. Verifying the stored legs...");
    let stored_open = h.store.find_by_id(open.id.unwrap()).await.unwrap().unwrap();
    assert_eq!(stored_open.related_transaction_id, close.id);
    assert_eq!(close.related_transaction_id, open.id);
    assert!(h
        .manager
        .opened_transaction("lifecycle", &btc())
        .await
        .unwrap()
        .is_none());

    // 4. A second close of the same position is rejected
    println!("\n4. Closing the same position again...");
    let err = h
        .manager
        .close(&btc(), &open, dec!(9900), TradingType::Futures)
        .await
        .unwrap_err();
    println!("   ✓ Rejected: {}", err);
    assert!(matches!(err, BotError::AlreadyClosed(_)));
    assert_eq!(h.store.transaction_count(), 2);

    println!("\n=== Order Lifecycle Test Complete ===");
}

/// Exchange that quotes prices but rejects every order
struct RejectingExchange;

#[async_trait]
impl ExchangeApi for RejectingExchange {
    async fn get_current_price(&self, _coin: &Coin) -> Result<Decimal> {
        Ok(dec!(10000))
    }

    async fn open_futures_order(&self, _order: &OrderRequest) -> Result<OrderFill> {
        Err(BotError::Exchange("order rejected: insufficient liquidity".into()))
    }

    async fn close_futures_order(&self, _order: &OrderRequest) -> Result<OrderFill> {
        Err(BotError::Exchange("order rejected".into()))
    }

    async fn buy_coin_by_market(&self, _order: &OrderRequest) -> Result<OrderFill> {
        Err(BotError::Exchange("order rejected".into()))
    }

    async fn sell_coin_by_market(&self, _order: &OrderRequest) -> Result<OrderFill> {
        Err(BotError::Exchange("order rejected".into()))
    }

    async fn get_wallet_balance(&self) -> Result<Decimal> {
        Ok(dec!(10000))
    }

    async fn set_futures_leverage(&self, _coin: &Coin, _leverage: u32) -> Result<()> {
        Ok(())
    }

    async fn set_isolated_margin(&self, _coin: &Coin) -> Result<()> {
        Ok(())
    }

    async fn get_position(&self, _coin: &Coin, _direction: Direction) -> Result<Option<PositionInfo>> {
        Ok(None)
    }

    async fn get_close_trade_record(
        &self,
        _coin: &Coin,
        _direction: Direction,
        _since: DateTime<Utc>,
    ) -> Result<Option<CloseTradeRecord>> {
        Ok(None)
    }
}

#[tokio::test]
async fn test_rejected_order_persists_nothing() {
    let store = Arc::new(InMemoryStore::new());
    let manager = OrderManager::new(
        Collaborators {
            exchange: Arc::new(RejectingExchange),
            transactions: store.clone(),
            klines: store.clone(),
            price_changes: store.clone(),
            notifier: Arc::new(LogNotifier),
            clock: Arc::new(SimulatedClock::new(start())),
        },
        TradingConfig::default(),
    );

    let err = manager.open(long_btc(None)).await.unwrap_err();

    assert!(matches!(err, BotError::Exchange(_)));
    assert_eq!(store.transaction_count(), 0);
    assert!(manager.opened_transactions("lifecycle").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_combined_close_sums_leg_profits() {
    let h = harness(vec![
        flat(&btc(), 0, dec!(10000)),
        flat(&eth(), 0, dec!(2000)),
        flat(&btc(), 5, dec!(10100)),
        flat(&eth(), 5, dec!(1980)),
    ]);

    let btc_leg = h.manager.open(long_btc(None)).await.unwrap();
    let eth_leg = h
        .manager
        .open(OpenOrderRequest {
            coin: eth(),
            direction: Direction::Short,
            ..long_btc(None)
        })
        .await
        .unwrap();

    h.clock.set_moment(start() + Duration::minutes(5));
    let result = h
        .manager
        .close_combined_order(&[
            CombinedLeg {
                coin: btc(),
                transaction: btc_leg,
            },
            CombinedLeg {
                coin: eth(),
                transaction: eth_leg,
            },
        ])
        .await;

    assert!(result.is_complete());
    assert_eq!(result.closed.len(), 2);

    let summed: Decimal = result.closed.iter().filter_map(|t| t.profit).sum();
    assert_eq!(result.total_profit, summed);
    // Long: 101 - 100 - (0.04 + 0.0404), short: 100 - 99 - (0.04 + 0.0396)
    assert_eq!(result.total_profit, dec!(0.9196) + dec!(0.9204));
}

#[tokio::test]
async fn test_exchange_side_close_is_reconciled() {
    let h = harness(vec![flat(&btc(), 0, dec!(10000)), flat(&btc(), 5, dec!(9200))]);

    let open = h.manager.open(long_btc(Some(dec!(9000)))).await.unwrap();

    h.clock.set_moment(start() + Duration::minutes(7));
    h.exchange
        .force_close(btc().id, Direction::Long, dec!(9100), "liquidation")
        .unwrap();

    let close = h
        .manager
        .close_order_by_fixed_stop_loss_or_take_profit(&btc(), &open, KlineInterval::FiveMinutes)
        .await
        .unwrap()
        .expect("exchange close should be recorded");

    assert_eq!(close.price, dec!(9100));
    assert_eq!(close.api_error.as_deref(), Some("liquidation"));
    assert!(close.profit.unwrap() < Decimal::ZERO);
    assert!(h.manager.opened_transactions("lifecycle").await.unwrap().is_empty());
}

/// Opens once, then only watches its stored stop-loss
struct OpenOnceStrategy {
    manager: Arc<OrderManager>,
    opened: AtomicBool,
}

#[async_trait]
impl Strategy for OpenOnceStrategy {
    fn name(&self) -> &str {
        "lifecycle"
    }

    fn min_candles_required(&self) -> usize {
        0
    }

    async fn on_tick(&self) -> Result<()> {
        if let Some(open) = self.manager.opened_transaction(self.name(), &btc()).await? {
            self.manager
                .close_order_by_fixed_stop_loss_or_take_profit(&btc(), &open, KlineInterval::FiveMinutes)
                .await?;
            return Ok(());
        }

        if !self.opened.swap(true, Ordering::SeqCst) {
            self.manager.open(long_btc(Some(dec!(9750)))).await?;
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_replay_drives_the_live_code_path() {
    let h = harness(vec![
        candle(&btc(), 0, dec!(10000), dec!(10050), dec!(9700), dec!(9900)),
        flat(&btc(), 5, dec!(9900)),
        flat(&btc(), 10, dec!(9900)),
    ]);
    let strategies: Vec<Arc<dyn Strategy>> = vec![Arc::new(OpenOnceStrategy {
        manager: h.manager.clone(),
        opened: AtomicBool::new(false),
    })];

    let driver = ReplayDriver::new(h.clock.clone(), Duration::minutes(5)).unwrap();
    let report = driver
        .run(&strategies, start(), start() + Duration::minutes(15))
        .await;

    assert_eq!(report.ticks, 3);
    assert_eq!(report.failed_ticks, 0);
    assert_eq!(report.last_tick, Some(start() + Duration::minutes(10)));

    let legs = h.store.find_all_by_strategy("lifecycle").await.unwrap();
    assert_eq!(legs.len(), 2);
    let close = legs.iter().find(|t| t.is_close_leg()).unwrap();
    assert_eq!(close.price, dec!(9750));
    assert_eq!(close.created_at, start() + Duration::minutes(5));
    assert!(legs.iter().all(|t| t.is_fake));
}

#[tokio::test]
async fn test_open_positions_survive_a_paper_restart() {
    let klines = vec![
        flat(&btc(), 0, dec!(10000)),
        candle(&btc(), 5, dec!(10000), dec!(10000), dec!(9000), dec!(9500)),
        flat(&btc(), 10, dec!(9500)),
    ];
    let first = harness(klines);
    let open = first.manager.open(long_btc(Some(dec!(9750)))).await.unwrap();

    // New session: same store, fresh exchange with an empty book
    let clock = Arc::new(SimulatedClock::new(start() + Duration::minutes(10)));
    let exchange = Arc::new(SimulatedExchange::new(
        clock.clone(),
        first.store.clone(),
        KlineInterval::FiveMinutes,
        dec!(0.0004),
        dec!(10000),
    ));
    let restored = exchange
        .restore_open_positions(first.store.as_ref(), &["lifecycle"], 10)
        .await
        .unwrap();
    assert_eq!(restored, 1);

    let manager = OrderManager::new(
        Collaborators {
            exchange: exchange.clone(),
            transactions: first.store.clone(),
            klines: first.store.clone(),
            price_changes: first.store.clone(),
            notifier: Arc::new(LogNotifier),
            clock: clock.clone(),
        },
        TradingConfig::default(),
    );

    let close = manager
        .close_order_by_fixed_stop_loss_or_take_profit(&btc(), &open, KlineInterval::FiveMinutes)
        .await
        .unwrap()
        .expect("stop-loss should trigger after the restart");

    assert_eq!(close.price, dec!(9750));
    assert!(close.api_error.is_none());
    assert!(exchange.get_position(&btc(), Direction::Long).await.unwrap().is_none());
}

pub mod memory;
pub mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PostgresPersistence;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{Kline, KlineInterval, PriceChange, Transaction};
use crate::Result;

/// Read/write access to stored candles
#[async_trait]
pub trait KlineRepository: Send + Sync {
    /// The candle whose `[open_time, close_time)` contains `moment`
    async fn find_opened_at_moment(
        &self,
        coin_id: i64,
        moment: DateTime<Utc>,
        interval: KlineInterval,
    ) -> Result<Option<Kline>>;

    /// The `limit` most recent candles with `close_time <= at_or_before`,
    /// ascending by open time
    async fn find_latest_closed(
        &self,
        coin_id: i64,
        interval: KlineInterval,
        at_or_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Kline>>;

    /// Candles opened at or after `from` and closed at or before `to`, ascending
    async fn find_closed_in_range(
        &self,
        coin_id: i64,
        interval: KlineInterval,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Kline>>;

    /// Insert or replace by (coin_id, interval, open_time)
    async fn save_kline(&self, kline: &Kline) -> Result<()>;
}

/// Storage of position legs
#[async_trait]
pub trait TransactionRepository: Send + Sync {
    /// Insert when `id` is unset, otherwise update exactly one row. Returns the id.
    async fn save_transaction(&self, transaction: &Transaction) -> Result<i64>;

    async fn find_by_id(&self, id: i64) -> Result<Option<Transaction>>;

    /// Most recent open leg of a strategy
    async fn find_opened_transaction(&self, strategy: &str) -> Result<Option<Transaction>>;

    async fn find_opened_transaction_by_coin(
        &self,
        strategy: &str,
        coin_id: i64,
    ) -> Result<Option<Transaction>>;

    async fn find_all_opened_transactions(&self, strategy: &str) -> Result<Vec<Transaction>>;

    /// Every leg of a strategy, ascending by id
    async fn find_all_by_strategy(&self, strategy: &str) -> Result<Vec<Transaction>>;
}

#[async_trait]
pub trait PriceChangeRepository: Send + Sync {
    async fn find_by_transaction_id(&self, transaction_id: i64) -> Result<Option<PriceChange>>;

    /// Insert or replace by transaction id
    async fn save_price_change(&self, price_change: &PriceChange) -> Result<()>;
}

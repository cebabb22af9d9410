use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use super::{KlineRepository, PriceChangeRepository, TransactionRepository};
use crate::error::BotError;
use crate::models::{Kline, KlineInterval, PriceChange, Transaction};
use crate::Result;

#[derive(Default)]
struct StoreState {
    klines: HashMap<(i64, KlineInterval), BTreeMap<DateTime<Utc>, Kline>>,
    transactions: BTreeMap<i64, Transaction>,
    price_changes: HashMap<i64, PriceChange>,
    next_transaction_id: i64,
}

/// Process-local implementation of every repository
///
/// Backtests keep their transactions here so replays never touch the live
/// tables.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_klines(klines: impl IntoIterator<Item = Kline>) -> Self {
        let store = Self::new();
        {
            let mut state = store.lock();
            for kline in klines {
                insert_kline(&mut state, kline);
            }
        }
        store
    }

    pub fn transaction_count(&self) -> usize {
        self.lock().transactions.len()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn insert_kline(state: &mut StoreState, kline: Kline) {
    state
        .klines
        .entry((kline.coin_id, kline.interval))
        .or_default()
        .insert(kline.open_time, kline);
}

#[async_trait]
impl KlineRepository for InMemoryStore {
    async fn find_opened_at_moment(
        &self,
        coin_id: i64,
        moment: DateTime<Utc>,
        interval: KlineInterval,
    ) -> Result<Option<Kline>> {
        let state = self.lock();
        let found = state.klines.get(&(coin_id, interval)).and_then(|series| {
            series
                .range(..=moment)
                .next_back()
                .map(|(_, k)| k)
                .filter(|k| k.contains(moment))
                .cloned()
        });
        Ok(found)
    }

    async fn find_latest_closed(
        &self,
        coin_id: i64,
        interval: KlineInterval,
        at_or_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Kline>> {
        let state = self.lock();
        let Some(series) = state.klines.get(&(coin_id, interval)) else {
            return Ok(Vec::new());
        };

        let mut latest: Vec<Kline> = series
            .values()
            .rev()
            .filter(|k| k.close_time <= at_or_before)
            .take(limit)
            .cloned()
            .collect();
        latest.reverse();
        Ok(latest)
    }

    async fn find_closed_in_range(
        &self,
        coin_id: i64,
        interval: KlineInterval,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Kline>> {
        let state = self.lock();
        let Some(series) = state.klines.get(&(coin_id, interval)) else {
            return Ok(Vec::new());
        };

        Ok(series
            .range(from..)
            .map(|(_, k)| k)
            .take_while(|k| k.close_time <= to)
            .cloned()
            .collect())
    }

    async fn save_kline(&self, kline: &Kline) -> Result<()> {
        insert_kline(&mut self.lock(), kline.clone());
        Ok(())
    }
}

#[async_trait]
impl TransactionRepository for InMemoryStore {
    async fn save_transaction(&self, transaction: &Transaction) -> Result<i64> {
        let mut state = self.lock();

        match transaction.id {
            Some(id) => {
                let Some(existing) = state.transactions.get_mut(&id) else {
                    return Err(BotError::Persistence(format!(
                        "update of transaction {} affected 0 rows",
                        id
                    )));
                };
                *existing = transaction.clone();
                Ok(id)
            }
            None => {
                state.next_transaction_id += 1;
                let id = state.next_transaction_id;
                let mut stored = transaction.clone();
                stored.id = Some(id);
                state.transactions.insert(id, stored);
                Ok(id)
            }
        }
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<Transaction>> {
        Ok(self.lock().transactions.get(&id).cloned())
    }

    async fn find_opened_transaction(&self, strategy: &str) -> Result<Option<Transaction>> {
        Ok(self
            .lock()
            .transactions
            .values()
            .rev()
            .find(|t| t.strategy == strategy && t.is_open())
            .cloned())
    }

    async fn find_opened_transaction_by_coin(
        &self,
        strategy: &str,
        coin_id: i64,
    ) -> Result<Option<Transaction>> {
        Ok(self
            .lock()
            .transactions
            .values()
            .rev()
            .find(|t| t.strategy == strategy && t.coin_id == coin_id && t.is_open())
            .cloned())
    }

    async fn find_all_opened_transactions(&self, strategy: &str) -> Result<Vec<Transaction>> {
        Ok(self
            .lock()
            .transactions
            .values()
            .filter(|t| t.strategy == strategy && t.is_open())
            .cloned()
            .collect())
    }

    async fn find_all_by_strategy(&self, strategy: &str) -> Result<Vec<Transaction>> {
        Ok(self
            .lock()
            .transactions
            .values()
            .filter(|t| t.strategy == strategy)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl PriceChangeRepository for InMemoryStore {
    async fn find_by_transaction_id(&self, transaction_id: i64) -> Result<Option<PriceChange>> {
        Ok(self.lock().price_changes.get(&transaction_id).cloned())
    }

    async fn save_price_change(&self, price_change: &PriceChange) -> Result<()> {
        self.lock()
            .price_changes
            .insert(price_change.transaction_id, price_change.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Direction, TradingType, TransactionType};
    use chrono::{Duration, TimeZone};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap()
    }

    fn series(count: i64) -> Vec<Kline> {
        (0..count)
            .map(|i| {
                let price = Decimal::from(100 + i);
                Kline::new(
                    1,
                    KlineInterval::FiveMinutes,
                    start() + Duration::minutes(5 * i),
                    price,
                    price,
                    price,
                    price,
                )
            })
            .collect()
    }

    fn open_leg(strategy: &str, coin_id: i64) -> Transaction {
        Transaction {
            id: None,
            coin_id,
            transaction_type: TransactionType::Buy,
            direction: Direction::Long,
            strategy: strategy.to_string(),
            trading_type: TradingType::Futures,
            amount: dec!(0.01),
            price: dec!(10000),
            total_cost: dec!(100),
            commission: dec!(0.04),
            created_at: start(),
            stop_loss_price: Some(dec!(9750)),
            take_profit_price: None,
            related_transaction_id: None,
            profit: None,
            percent_profit: None,
            is_fake: true,
            client_order_id: None,
            api_error: None,
        }
    }

    #[tokio::test]
    async fn test_find_opened_at_moment_uses_half_open_interval() {
        let store = InMemoryStore::with_klines(series(3));

        let at_open = store
            .find_opened_at_moment(1, start(), KlineInterval::FiveMinutes)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(at_open.open_time, start());

        let at_boundary = store
            .find_opened_at_moment(1, start() + Duration::minutes(5), KlineInterval::FiveMinutes)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(at_boundary.open_time, start() + Duration::minutes(5));

        let after_last = store
            .find_opened_at_moment(1, start() + Duration::minutes(15), KlineInterval::FiveMinutes)
            .await
            .unwrap();
        assert!(after_last.is_none());
    }

    #[tokio::test]
    async fn test_find_latest_closed_excludes_candle_in_progress() {
        let store = InMemoryStore::with_klines(series(10));
        let now = start() + Duration::minutes(22); // Candle 4 is still open

        let latest = store
            .find_latest_closed(1, KlineInterval::FiveMinutes, now, 3)
            .await
            .unwrap();

        assert_eq!(latest.len(), 3);
        assert_eq!(latest[0].close, dec!(101));
        assert_eq!(latest[2].close, dec!(103));
    }

    #[tokio::test]
    async fn test_find_closed_in_range() {
        let store = InMemoryStore::with_klines(series(10));

        let range = store
            .find_closed_in_range(
                1,
                KlineInterval::FiveMinutes,
                start() + Duration::minutes(5),
                start() + Duration::minutes(20),
            )
            .await
            .unwrap();

        let opens: Vec<_> = range.iter().map(|k| k.close).collect();
        assert_eq!(opens, vec![dec!(101), dec!(102), dec!(103)]);
    }

    #[tokio::test]
    async fn test_save_transaction_assigns_ids_and_updates() {
        let store = InMemoryStore::new();

        let first = store.save_transaction(&open_leg("s", 1)).await.unwrap();
        let second = store.save_transaction(&open_leg("s", 2)).await.unwrap();
        assert_eq!((first, second), (1, 2));

        let mut updated = store.find_by_id(first).await.unwrap().unwrap();
        updated.related_transaction_id = Some(second);
        store.save_transaction(&updated).await.unwrap();

        let opened = store.find_all_opened_transactions("s").await.unwrap();
        assert_eq!(opened.len(), 1);
        assert_eq!(opened[0].coin_id, 2);
        assert_eq!(
            store.find_opened_transaction_by_coin("s", 2).await.unwrap().unwrap().id,
            Some(second)
        );
        assert!(store.find_opened_transaction("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_of_unknown_id_fails() {
        let store = InMemoryStore::new();
        let mut leg = open_leg("s", 1);
        leg.id = Some(42);

        let err = store.save_transaction(&leg).await.unwrap_err();
        assert!(matches!(err, BotError::Persistence(_)));
    }
}

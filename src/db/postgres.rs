use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, postgres::PgRow, PgPool, Row};

use super::{KlineRepository, PriceChangeRepository, TransactionRepository};
use crate::error::BotError;
use crate::models::{Kline, KlineInterval, PriceChange, Transaction};
use crate::Result;

const TRANSACTION_COLUMNS: &str = r#"
    id, coin_id, transaction_type, direction, strategy, trading_type,
    amount, price, total_cost, commission, created_at,
    stop_loss_price, take_profit_price, related_transaction_id,
    profit, percent_profit, is_fake, client_order_id, api_error
"#;

const KLINE_COLUMNS: &str = r#"
    coin_id, kline_interval, open_time, close_time, open, high, low, close, volume
"#;

/// Postgres persistence for klines, transactions and price changes
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Connect to Postgres and run pending migrations
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!("Connected to Postgres at {}", database_url);

        Ok(Self { pool })
    }

    /// Delete every leg of a strategy (testing only)
    #[cfg(test)]
    pub async fn clear_strategy(&self, strategy: &str) -> Result<()> {
        sqlx::query(
            "DELETE FROM price_changes WHERE transaction_id IN (SELECT id FROM transactions WHERE strategy = $1)",
        )
        .bind(strategy)
        .execute(&self.pool)
        .await?;

        // Break the self references before deleting
        sqlx::query("UPDATE transactions SET related_transaction_id = NULL WHERE strategy = $1")
            .bind(strategy)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM transactions WHERE strategy = $1")
            .bind(strategy)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

fn kline_from_row(row: &PgRow) -> Result<Kline> {
    let interval: String = row.try_get("kline_interval")?;

    Ok(Kline {
        coin_id: row.try_get("coin_id")?,
        interval: interval.parse::<KlineInterval>()?,
        open_time: row.try_get("open_time")?,
        close_time: row.try_get("close_time")?,
        open: row.try_get("open")?,
        high: row.try_get("high")?,
        low: row.try_get("low")?,
        close: row.try_get("close")?,
        volume: row.try_get("volume")?,
    })
}

fn transaction_from_row(row: &PgRow) -> Result<Transaction> {
    let transaction_type: String = row.try_get("transaction_type")?;
    let direction: String = row.try_get("direction")?;
    let trading_type: String = row.try_get("trading_type")?;

    Ok(Transaction {
        id: Some(row.try_get("id")?),
        coin_id: row.try_get("coin_id")?,
        transaction_type: transaction_type.parse()?,
        direction: direction.parse()?,
        strategy: row.try_get("strategy")?,
        trading_type: trading_type.parse()?,
        amount: row.try_get("amount")?,
        price: row.try_get("price")?,
        total_cost: row.try_get("total_cost")?,
        commission: row.try_get("commission")?,
        created_at: row.try_get("created_at")?,
        stop_loss_price: row.try_get("stop_loss_price")?,
        take_profit_price: row.try_get("take_profit_price")?,
        related_transaction_id: row.try_get("related_transaction_id")?,
        profit: row.try_get("profit")?,
        percent_profit: row.try_get("percent_profit")?,
        is_fake: row.try_get("is_fake")?,
        client_order_id: row.try_get("client_order_id")?,
        api_error: row.try_get("api_error")?,
    })
}

#[async_trait]
impl KlineRepository for PostgresPersistence {
    async fn find_opened_at_moment(
        &self,
        coin_id: i64,
        moment: DateTime<Utc>,
        interval: KlineInterval,
    ) -> Result<Option<Kline>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {KLINE_COLUMNS}
            FROM klines
            WHERE coin_id = $1 AND kline_interval = $2
              AND open_time <= $3 AND close_time > $3
            ORDER BY open_time DESC
            LIMIT 1
            "#
        ))
        .bind(coin_id)
        .bind(interval.as_str())
        .bind(moment)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(kline_from_row).transpose()
    }

    async fn find_latest_closed(
        &self,
        coin_id: i64,
        interval: KlineInterval,
        at_or_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Kline>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {KLINE_COLUMNS}
            FROM klines
            WHERE coin_id = $1 AND kline_interval = $2 AND close_time <= $3
            ORDER BY open_time DESC
            LIMIT $4
            "#
        ))
        .bind(coin_id)
        .bind(interval.as_str())
        .bind(at_or_before)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut klines = rows.iter().map(kline_from_row).collect::<Result<Vec<_>>>()?;
        klines.reverse();
        Ok(klines)
    }

    async fn find_closed_in_range(
        &self,
        coin_id: i64,
        interval: KlineInterval,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Kline>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {KLINE_COLUMNS}
            FROM klines
            WHERE coin_id = $1 AND kline_interval = $2
              AND open_time >= $3 AND close_time <= $4
            ORDER BY open_time ASC
            "#
        ))
        .bind(coin_id)
        .bind(interval.as_str())
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(kline_from_row).collect()
    }

    async fn save_kline(&self, kline: &Kline) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO klines (
                coin_id, kline_interval, open_time, close_time,
                open, high, low, close, volume
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (coin_id, kline_interval, open_time) DO UPDATE SET
                close_time = EXCLUDED.close_time,
                open = EXCLUDED.open,
                high = EXCLUDED.high,
                low = EXCLUDED.low,
                close = EXCLUDED.close,
                volume = EXCLUDED.volume
            "#,
        )
        .bind(kline.coin_id)
        .bind(kline.interval.as_str())
        .bind(kline.open_time)
        .bind(kline.close_time)
        .bind(kline.open)
        .bind(kline.high)
        .bind(kline.low)
        .bind(kline.close)
        .bind(kline.volume)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl TransactionRepository for PostgresPersistence {
    async fn save_transaction(&self, t: &Transaction) -> Result<i64> {
        match t.id {
            None => {
                let row = sqlx::query(
                    r#"
                    INSERT INTO transactions (
                        coin_id, transaction_type, direction, strategy, trading_type,
                        amount, price, total_cost, commission, created_at,
                        stop_loss_price, take_profit_price, related_transaction_id,
                        profit, percent_profit, is_fake, client_order_id, api_error
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
                    RETURNING id
                    "#,
                )
                .bind(t.coin_id)
                .bind(t.transaction_type.as_str())
                .bind(t.direction.as_str())
                .bind(&t.strategy)
                .bind(t.trading_type.as_str())
                .bind(t.amount)
                .bind(t.price)
                .bind(t.total_cost)
                .bind(t.commission)
                .bind(t.created_at)
                .bind(t.stop_loss_price)
                .bind(t.take_profit_price)
                .bind(t.related_transaction_id)
                .bind(t.profit)
                .bind(t.percent_profit)
                .bind(t.is_fake)
                .bind(&t.client_order_id)
                .bind(&t.api_error)
                .fetch_one(&self.pool)
                .await?;

                let id: i64 = row.try_get("id")?;
                tracing::debug!("Inserted transaction {} ({})", id, t.strategy);
                Ok(id)
            }
            Some(id) => {
                let result = sqlx::query(
                    r#"
                    UPDATE transactions SET
                        stop_loss_price = $2,
                        take_profit_price = $3,
                        related_transaction_id = $4,
                        profit = $5,
                        percent_profit = $6,
                        client_order_id = $7,
                        api_error = $8
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(t.stop_loss_price)
                .bind(t.take_profit_price)
                .bind(t.related_transaction_id)
                .bind(t.profit)
                .bind(t.percent_profit)
                .bind(&t.client_order_id)
                .bind(&t.api_error)
                .execute(&self.pool)
                .await?;

                if result.rows_affected() != 1 {
                    return Err(BotError::Persistence(format!(
                        "update of transaction {} affected {} rows",
                        id,
                        result.rows_affected()
                    )));
                }

                tracing::debug!("Updated transaction {}", id);
                Ok(id)
            }
        }
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<Transaction>> {
        let row = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(transaction_from_row).transpose()
    }

    async fn find_opened_transaction(&self, strategy: &str) -> Result<Option<Transaction>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {TRANSACTION_COLUMNS}
            FROM transactions
            WHERE strategy = $1 AND related_transaction_id IS NULL
            ORDER BY id DESC
            LIMIT 1
            "#
        ))
        .bind(strategy)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(transaction_from_row).transpose()
    }

    async fn find_opened_transaction_by_coin(
        &self,
        strategy: &str,
        coin_id: i64,
    ) -> Result<Option<Transaction>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {TRANSACTION_COLUMNS}
            FROM transactions
            WHERE strategy = $1 AND coin_id = $2 AND related_transaction_id IS NULL
            ORDER BY id DESC
            LIMIT 1
            "#
        ))
        .bind(strategy)
        .bind(coin_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(transaction_from_row).transpose()
    }

    async fn find_all_opened_transactions(&self, strategy: &str) -> Result<Vec<Transaction>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {TRANSACTION_COLUMNS}
            FROM transactions
            WHERE strategy = $1 AND related_transaction_id IS NULL
            ORDER BY id ASC
            "#
        ))
        .bind(strategy)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(transaction_from_row).collect()
    }

    async fn find_all_by_strategy(&self, strategy: &str) -> Result<Vec<Transaction>> {
        let rows = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE strategy = $1 ORDER BY id ASC"
        ))
        .bind(strategy)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(transaction_from_row).collect()
    }
}

#[async_trait]
impl PriceChangeRepository for PostgresPersistence {
    async fn find_by_transaction_id(&self, transaction_id: i64) -> Result<Option<PriceChange>> {
        let row = sqlx::query(
            r#"
            SELECT transaction_id, low_price, high_price, created_at, updated_at
            FROM price_changes
            WHERE transaction_id = $1
            "#,
        )
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(PriceChange {
            transaction_id: row.try_get("transaction_id")?,
            low_price: row.try_get("low_price")?,
            high_price: row.try_get("high_price")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }

    async fn save_price_change(&self, price_change: &PriceChange) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO price_changes (transaction_id, low_price, high_price, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (transaction_id) DO UPDATE SET
                low_price = EXCLUDED.low_price,
                high_price = EXCLUDED.high_price,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(price_change.transaction_id)
        .bind(price_change.low_price)
        .bind(price_change.high_price)
        .bind(price_change.created_at)
        .bind(price_change.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Direction, TradingType, TransactionType};
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    async fn get_test_db() -> PostgresPersistence {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/marginbot_test".to_string());

        PostgresPersistence::new(&database_url)
            .await
            .expect("Failed to connect to test database")
    }

    fn open_leg(strategy: &str) -> Transaction {
        Transaction {
            id: None,
            coin_id: 1,
            transaction_type: TransactionType::Buy,
            direction: Direction::Long,
            strategy: strategy.to_string(),
            trading_type: TradingType::Futures,
            amount: dec!(0.01),
            price: dec!(10000),
            total_cost: dec!(100),
            commission: dec!(0.04),
            created_at: Utc::now(),
            stop_loss_price: Some(dec!(9750)),
            take_profit_price: Some(dec!(10500)),
            related_transaction_id: None,
            profit: None,
            percent_profit: None,
            is_fake: true,
            client_order_id: Some("test-order".to_string()),
            api_error: None,
        }
    }

    #[tokio::test]
    #[ignore] // Requires Postgres running
    async fn test_save_and_load_transaction() {
        let db = get_test_db().await;
        db.clear_strategy("pg_save_load").await.unwrap();

        let id = db.save_transaction(&open_leg("pg_save_load")).await.unwrap();

        let loaded = db.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(loaded.id, Some(id));
        assert_eq!(loaded.direction, Direction::Long);
        assert_eq!(loaded.price, dec!(10000));
        assert_eq!(loaded.stop_loss_price, Some(dec!(9750)));
        assert!(loaded.is_open());

        db.clear_strategy("pg_save_load").await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Postgres running
    async fn test_close_pair_leaves_no_opened_transaction() {
        let db = get_test_db().await;
        db.clear_strategy("pg_close_pair").await.unwrap();

        let open_id = db.save_transaction(&open_leg("pg_close_pair")).await.unwrap();

        let mut close = open_leg("pg_close_pair");
        close.transaction_type = TransactionType::Sell;
        close.related_transaction_id = Some(open_id);
        close.profit = Some(dec!(-2.58));
        close.percent_profit = Some(-2.58);
        let close_id = db.save_transaction(&close).await.unwrap();

        let mut open = db.find_by_id(open_id).await.unwrap().unwrap();
        open.related_transaction_id = Some(close_id);
        db.save_transaction(&open).await.unwrap();

        assert!(db
            .find_opened_transaction("pg_close_pair")
            .await
            .unwrap()
            .is_none());
        assert_eq!(db.find_all_by_strategy("pg_close_pair").await.unwrap().len(), 2);

        db.clear_strategy("pg_close_pair").await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Postgres running
    async fn test_update_unknown_transaction_fails() {
        let db = get_test_db().await;

        let mut leg = open_leg("pg_unknown");
        leg.id = Some(i64::MAX);

        let err = db.save_transaction(&leg).await.unwrap_err();
        assert!(matches!(err, BotError::Persistence(_)));
    }

    #[tokio::test]
    #[ignore] // Requires Postgres running
    async fn test_price_change_upsert() {
        let db = get_test_db().await;
        db.clear_strategy("pg_price_change").await.unwrap();

        let id = db.save_transaction(&open_leg("pg_price_change")).await.unwrap();
        let now = Utc::now();
        let mut change = PriceChange {
            transaction_id: id,
            low_price: dec!(9900),
            high_price: dec!(10100),
            created_at: now,
            updated_at: now,
        };
        db.save_price_change(&change).await.unwrap();

        change.high_price = dec!(10300);
        db.save_price_change(&change).await.unwrap();

        let loaded = db.find_by_transaction_id(id).await.unwrap().unwrap();
        assert_eq!(loaded.low_price, dec!(9900));
        assert_eq!(loaded.high_price, dec!(10300));

        db.clear_strategy("pg_price_change").await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Postgres running
    async fn test_kline_queries() {
        let db = get_test_db().await;
        let start = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();

        for i in 0..4 {
            let price = dec!(100) + rust_decimal::Decimal::from(i);
            let kline = Kline::new(
                999,
                KlineInterval::FiveMinutes,
                start + Duration::minutes(5 * i),
                price,
                price,
                price,
                price,
            );
            db.save_kline(&kline).await.unwrap();
        }

        let current = db
            .find_opened_at_moment(999, start + Duration::minutes(7), KlineInterval::FiveMinutes)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.open, dec!(101));

        let latest = db
            .find_latest_closed(999, KlineInterval::FiveMinutes, start + Duration::minutes(15), 2)
            .await
            .unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[1].close, dec!(102));
    }
}

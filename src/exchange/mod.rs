pub mod simulated;

pub use simulated::SimulatedExchange;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::{Coin, Direction};
use crate::Result;

/// Market order sent to the exchange
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub coin: Coin,
    pub direction: Direction,
    pub amount: Decimal,
    /// Reference price the order is expected to fill around
    pub price: Decimal,
    pub client_order_id: String,
}

/// What the exchange actually executed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderFill {
    pub price: Decimal,
    pub amount: Decimal,
    pub commission: Decimal,
    pub client_order_id: String,
}

impl OrderFill {
    pub fn total_cost(&self) -> Decimal {
        self.price * self.amount
    }
}

/// A position the exchange still holds open
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionInfo {
    pub coin_id: i64,
    pub direction: Direction,
    pub amount: Decimal,
    pub entry_price: Decimal,
}

/// How the exchange closed a position on its own (liquidation, exchange-side stop)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseTradeRecord {
    pub price: Decimal,
    pub amount: Decimal,
    pub commission: Decimal,
    pub closed_at: DateTime<Utc>,
    pub reason: String,
}

#[async_trait]
pub trait ExchangeApi: Send + Sync {
    async fn get_current_price(&self, coin: &Coin) -> Result<Decimal>;

    async fn open_futures_order(&self, order: &OrderRequest) -> Result<OrderFill>;

    async fn close_futures_order(&self, order: &OrderRequest) -> Result<OrderFill>;

    async fn buy_coin_by_market(&self, order: &OrderRequest) -> Result<OrderFill>;

    async fn sell_coin_by_market(&self, order: &OrderRequest) -> Result<OrderFill>;

    /// Free quote balance available for margin
    async fn get_wallet_balance(&self) -> Result<Decimal>;

    async fn set_futures_leverage(&self, coin: &Coin, leverage: u32) -> Result<()>;

    async fn set_isolated_margin(&self, coin: &Coin) -> Result<()>;

    async fn get_position(&self, coin: &Coin, direction: Direction) -> Result<Option<PositionInfo>>;

    /// Latest exchange-side close of a position in `direction` since `since`
    async fn get_close_trade_record(
        &self,
        coin: &Coin,
        direction: Direction,
        since: DateTime<Utc>,
    ) -> Result<Option<CloseTradeRecord>>;

    /// Legs recorded through a simulated exchange are flagged as fake
    fn is_simulated(&self) -> bool {
        false
    }
}

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{CloseTradeRecord, ExchangeApi, OrderFill, OrderRequest, PositionInfo};
use crate::clock::SharedClock;
use crate::db::{KlineRepository, TransactionRepository};
use crate::error::BotError;
use crate::models::{Coin, Direction, KlineInterval, TradingType, Transaction};
use crate::Result;

const AMOUNT_PRECISION: u32 = 8;
const DEFAULT_LEVERAGE: u32 = 1;

#[derive(Debug, Clone)]
struct SimPosition {
    amount: Decimal,
    entry_price: Decimal,
    margin: Decimal,
}

#[derive(Default)]
struct ExchangeState {
    balance: Decimal,
    positions: HashMap<(i64, Direction), SimPosition>,
    spot_holdings: HashMap<i64, Decimal>,
    close_records: HashMap<(i64, Direction), Vec<CloseTradeRecord>>,
    leverage: HashMap<i64, u32>,
}

/// Exchange stand-in driven by stored klines and the injected clock
///
/// Market orders fill at the reference price of the request. The price of a
/// coin is the open of the candle in progress at the clock moment, so a replay
/// never sees prices from its future.
pub struct SimulatedExchange {
    clock: SharedClock,
    klines: Arc<dyn KlineRepository>,
    interval: KlineInterval,
    commission_rate: Decimal,
    state: Mutex<ExchangeState>,
}

impl SimulatedExchange {
    pub fn new(
        clock: SharedClock,
        klines: Arc<dyn KlineRepository>,
        interval: KlineInterval,
        commission_rate: Decimal,
        initial_balance: Decimal,
    ) -> Self {
        Self {
            clock,
            klines,
            interval,
            commission_rate,
            state: Mutex::new(ExchangeState {
                balance: initial_balance,
                ..Default::default()
            }),
        }
    }

    /// Close a position as the exchange would on liquidation
    pub fn force_close(
        &self,
        coin_id: i64,
        direction: Direction,
        price: Decimal,
        reason: &str,
    ) -> Result<CloseTradeRecord> {
        let now = self.clock.now();
        let mut state = self.lock();

        let position = state.positions.remove(&(coin_id, direction)).ok_or_else(|| {
            BotError::Exchange(format!("no {} position for coin {}", direction, coin_id))
        })?;

        let commission = self.commission(price, position.amount);
        let pnl = position_pnl(direction, position.entry_price, price, position.amount);
        state.balance += position.margin + pnl - commission;

        let record = CloseTradeRecord {
            price,
            amount: position.amount,
            commission,
            closed_at: now,
            reason: reason.to_string(),
        };
        state
            .close_records
            .entry((coin_id, direction))
            .or_default()
            .push(record.clone());

        tracing::warn!(
            "Simulated exchange force-closed {} coin {} at {} ({})",
            direction,
            coin_id,
            price,
            reason
        );

        Ok(record)
    }

    /// Rebuild the book entry of a still-open leg after a restart
    ///
    /// The leg's margin is taken from the balance again; no commission is
    /// charged since it was paid when the leg was opened.
    pub fn restore_position(&self, open: &Transaction, leverage: u32) -> Result<()> {
        if !open.is_open() || open.is_close_leg() {
            return Err(BotError::InvalidState(format!(
                "transaction {:?} is not an open leg",
                open.id
            )));
        }

        let mut state = self.lock();
        match open.trading_type {
            TradingType::Futures => {
                let margin = open.total_cost / Decimal::from(leverage.max(DEFAULT_LEVERAGE));
                state.balance -= margin;
                state.leverage.insert(open.coin_id, leverage.max(DEFAULT_LEVERAGE));

                let position = state
                    .positions
                    .entry((open.coin_id, open.direction))
                    .or_insert(SimPosition {
                        amount: Decimal::ZERO,
                        entry_price: open.price,
                        margin: Decimal::ZERO,
                    });
                let total = position.amount + open.amount;
                position.entry_price =
                    (position.entry_price * position.amount + open.price * open.amount) / total;
                position.amount = total;
                position.margin += margin;
            }
            TradingType::Spot => {
                state.balance -= open.total_cost;
                *state.spot_holdings.entry(open.coin_id).or_default() += open.amount;
            }
        }

        tracing::debug!(
            "Restored {} {} leg #{:?}: {} @ {}",
            open.direction,
            open.trading_type.as_str(),
            open.id,
            open.amount,
            open.price
        );
        Ok(())
    }

    /// Restore every open leg of `strategies` from the transaction store
    ///
    /// The book lives in memory only while open legs outlive a restart, so a
    /// paper session must call this before its first tick.
    pub async fn restore_open_positions(
        &self,
        transactions: &dyn TransactionRepository,
        strategies: &[&str],
        leverage: u32,
    ) -> Result<usize> {
        let mut restored = 0;
        for strategy in strategies {
            for open in transactions.find_all_opened_transactions(strategy).await? {
                self.restore_position(&open, leverage)?;
                restored += 1;
            }
        }
        Ok(restored)
    }

    fn lock(&self) -> MutexGuard<'_, ExchangeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn commission(&self, price: Decimal, amount: Decimal) -> Decimal {
        price * amount * self.commission_rate
    }

    async fn fill_price(&self, order: &OrderRequest) -> Result<Decimal> {
        if order.price > Decimal::ZERO {
            return Ok(order.price);
        }
        self.get_current_price(&order.coin).await
    }

    fn validate_amount(order: &OrderRequest) -> Result<Decimal> {
        let amount = order.amount.round_dp(AMOUNT_PRECISION);
        if amount <= Decimal::ZERO {
            return Err(BotError::Exchange(format!(
                "order amount {} for {} rounds to zero",
                order.amount, order.coin.code
            )));
        }
        Ok(amount)
    }
}

fn position_pnl(direction: Direction, entry: Decimal, exit: Decimal, amount: Decimal) -> Decimal {
    match direction {
        Direction::Long => (exit - entry) * amount,
        Direction::Short => (entry - exit) * amount,
    }
}

#[async_trait]
impl ExchangeApi for SimulatedExchange {
    async fn get_current_price(&self, coin: &Coin) -> Result<Decimal> {
        let now = self.clock.now();

        if let Some(kline) = self
            .klines
            .find_opened_at_moment(coin.id, now, self.interval)
            .await?
        {
            return Ok(kline.open);
        }

        let latest = self
            .klines
            .find_latest_closed(coin.id, self.interval, now, 1)
            .await?;

        latest
            .last()
            .map(|k| k.close)
            .ok_or_else(|| BotError::Exchange(format!("no price for {} at {}", coin.code, now)))
    }

    async fn open_futures_order(&self, order: &OrderRequest) -> Result<OrderFill> {
        let price = self.fill_price(order).await?;
        let amount = Self::validate_amount(order)?;
        let commission = self.commission(price, amount);

        let mut state = self.lock();
        let leverage = state
            .leverage
            .get(&order.coin.id)
            .copied()
            .unwrap_or(DEFAULT_LEVERAGE);
        let margin = price * amount / Decimal::from(leverage);

        if state.balance < margin + commission {
            return Err(BotError::Exchange(format!(
                "insufficient balance {} for margin {}",
                state.balance, margin
            )));
        }
        state.balance -= margin + commission;

        let key = (order.coin.id, order.direction);
        let position = state.positions.entry(key).or_insert(SimPosition {
            amount: Decimal::ZERO,
            entry_price: price,
            margin: Decimal::ZERO,
        });
        let total = position.amount + amount;
        position.entry_price = (position.entry_price * position.amount + price * amount) / total;
        position.amount = total;
        position.margin += margin;

        Ok(OrderFill {
            price,
            amount,
            commission,
            client_order_id: order.client_order_id.clone(),
        })
    }

    async fn close_futures_order(&self, order: &OrderRequest) -> Result<OrderFill> {
        let price = self.fill_price(order).await?;
        let requested = Self::validate_amount(order)?;

        let mut state = self.lock();
        let key = (order.coin.id, order.direction);
        let Some(position) = state.positions.get_mut(&key) else {
            return Err(BotError::Exchange(format!(
                "no {} position for {}",
                order.direction, order.coin.code
            )));
        };

        let amount = requested.min(position.amount);
        let released_margin = position.margin * amount / position.amount;
        let pnl = position_pnl(order.direction, position.entry_price, price, amount);
        position.amount -= amount;
        position.margin -= released_margin;
        if position.amount.is_zero() {
            state.positions.remove(&key);
        }

        let commission = self.commission(price, amount);
        state.balance += released_margin + pnl - commission;

        Ok(OrderFill {
            price,
            amount,
            commission,
            client_order_id: order.client_order_id.clone(),
        })
    }

    async fn buy_coin_by_market(&self, order: &OrderRequest) -> Result<OrderFill> {
        let price = self.fill_price(order).await?;
        let amount = Self::validate_amount(order)?;
        let commission = self.commission(price, amount);

        let mut state = self.lock();
        let cost = price * amount + commission;
        if state.balance < cost {
            return Err(BotError::Exchange(format!(
                "insufficient balance {} for spot buy {}",
                state.balance, cost
            )));
        }
        state.balance -= cost;
        *state.spot_holdings.entry(order.coin.id).or_default() += amount;

        Ok(OrderFill {
            price,
            amount,
            commission,
            client_order_id: order.client_order_id.clone(),
        })
    }

    async fn sell_coin_by_market(&self, order: &OrderRequest) -> Result<OrderFill> {
        let price = self.fill_price(order).await?;
        let requested = Self::validate_amount(order)?;

        let mut state = self.lock();
        let held = state
            .spot_holdings
            .get(&order.coin.id)
            .copied()
            .unwrap_or_default();
        if held.is_zero() {
            return Err(BotError::Exchange(format!(
                "no {} holdings to sell",
                order.coin.code
            )));
        }

        let amount = requested.min(held);
        let commission = self.commission(price, amount);
        state.spot_holdings.insert(order.coin.id, held - amount);
        state.balance += price * amount - commission;

        Ok(OrderFill {
            price,
            amount,
            commission,
            client_order_id: order.client_order_id.clone(),
        })
    }

    async fn get_wallet_balance(&self) -> Result<Decimal> {
        Ok(self.lock().balance)
    }

    async fn set_futures_leverage(&self, coin: &Coin, leverage: u32) -> Result<()> {
        if leverage == 0 {
            return Err(BotError::Exchange("leverage must be at least 1".into()));
        }
        self.lock().leverage.insert(coin.id, leverage);
        Ok(())
    }

    async fn set_isolated_margin(&self, _coin: &Coin) -> Result<()> {
        // Every simulated position is isolated
        Ok(())
    }

    async fn get_position(&self, coin: &Coin, direction: Direction) -> Result<Option<PositionInfo>> {
        Ok(self
            .lock()
            .positions
            .get(&(coin.id, direction))
            .map(|p| PositionInfo {
                coin_id: coin.id,
                direction,
                amount: p.amount,
                entry_price: p.entry_price,
            }))
    }

    async fn get_close_trade_record(
        &self,
        coin: &Coin,
        direction: Direction,
        since: DateTime<Utc>,
    ) -> Result<Option<CloseTradeRecord>> {
        Ok(self
            .lock()
            .close_records
            .get(&(coin.id, direction))
            .and_then(|records| records.iter().rev().find(|r| r.closed_at >= since))
            .cloned())
    }

    fn is_simulated(&self) -> bool {
        true
    }
}

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use super::price_change::PriceChangeTracker;
use crate::clock::SharedClock;
use crate::config::TradingConfig;
use crate::db::{KlineRepository, PriceChangeRepository, TransactionRepository};
use crate::error::BotError;
use crate::exchange::{ExchangeApi, OrderFill, OrderRequest};
use crate::models::{Coin, Direction, Kline, KlineInterval, TradingType, Transaction};
use crate::notify::Notifier;
use crate::risk::ProfitLossFinder;
use crate::Result;

#[derive(Debug, Clone, PartialEq)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    BreakEven,
    TrailingTakeProfit,
    StrategySignal,
    Manual,
    Exchange(String), // Closed by the exchange itself, e.g. liquidation
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::StopLoss => f.write_str("stop-loss"),
            ExitReason::TakeProfit => f.write_str("take-profit"),
            ExitReason::BreakEven => f.write_str("breakeven"),
            ExitReason::TrailingTakeProfit => f.write_str("trailing take-profit"),
            ExitReason::StrategySignal => f.write_str("strategy signal"),
            ExitReason::Manual => f.write_str("manual"),
            ExitReason::Exchange(reason) => write!(f, "exchange ({})", reason),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OpenOrderRequest {
    pub coin: Coin,
    pub direction: Direction,
    /// Notional size in quote currency
    pub cost: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub trading_type: TradingType,
    pub strategy: String,
}

/// One leg of a multi-coin position
#[derive(Debug, Clone)]
pub struct CombinedLeg {
    pub coin: Coin,
    pub transaction: Transaction,
}

#[derive(Debug, Default)]
pub struct CombinedCloseResult {
    pub closed: Vec<Transaction>,
    pub failed: Vec<(Option<i64>, String)>,
    pub total_profit: Decimal,
}

impl CombinedCloseResult {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Everything the order manager talks to
#[derive(Clone)]
pub struct Collaborators {
    pub exchange: Arc<dyn ExchangeApi>,
    pub transactions: Arc<dyn TransactionRepository>,
    pub klines: Arc<dyn KlineRepository>,
    pub price_changes: Arc<dyn PriceChangeRepository>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: SharedClock,
}

/// Execution of a closing order, from our own order or the exchange's record
struct CloseExecution {
    price: Decimal,
    amount: Decimal,
    commission: Decimal,
    client_order_id: Option<String>,
    api_error: Option<String>,
}

impl From<OrderFill> for CloseExecution {
    fn from(fill: OrderFill) -> Self {
        Self {
            price: fill.price,
            amount: fill.amount,
            commission: fill.commission,
            client_order_id: Some(fill.client_order_id),
            api_error: None,
        }
    }
}

/// Opens and closes positions and decides when stored exits trigger
///
/// All money-moving transitions go through here. Calls for the same position
/// must be serialized by the caller.
pub struct OrderManager {
    exchange: Arc<dyn ExchangeApi>,
    transactions: Arc<dyn TransactionRepository>,
    klines: Arc<dyn KlineRepository>,
    price_changes: PriceChangeTracker,
    profit_loss: ProfitLossFinder,
    notifier: Arc<dyn Notifier>,
    clock: SharedClock,
    config: TradingConfig,
}

impl OrderManager {
    pub fn new(collaborators: Collaborators, config: TradingConfig) -> Self {
        let Collaborators {
            exchange,
            transactions,
            klines,
            price_changes,
            notifier,
            clock,
        } = collaborators;

        Self {
            price_changes: PriceChangeTracker::new(price_changes, clock.clone()),
            profit_loss: ProfitLossFinder::new(klines.clone(), config.dynamic_stop_loss.clone()),
            exchange,
            transactions,
            klines,
            notifier,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &TradingConfig {
        &self.config
    }

    pub async fn current_price(&self, coin: &Coin) -> Result<Decimal> {
        self.exchange.get_current_price(coin).await
    }

    /// Dynamic stop-loss for a position opened at the clock's current moment
    pub async fn find_stop_loss(
        &self,
        coin: &Coin,
        interval: KlineInterval,
        direction: Direction,
    ) -> Result<Decimal> {
        self.profit_loss
            .find_stop_loss(coin, self.clock.now(), interval, direction)
            .await
    }

    /// Most recent candles closed at the clock's current moment
    pub async fn closed_klines(
        &self,
        coin: &Coin,
        interval: KlineInterval,
        limit: usize,
    ) -> Result<Vec<Kline>> {
        self.klines
            .find_latest_closed(coin.id, interval, self.clock.now(), limit)
            .await
    }

    pub async fn opened_transaction(&self, strategy: &str, coin: &Coin) -> Result<Option<Transaction>> {
        self.transactions
            .find_opened_transaction_by_coin(strategy, coin.id)
            .await
    }

    pub async fn opened_transactions(&self, strategy: &str) -> Result<Vec<Transaction>> {
        self.transactions.find_all_opened_transactions(strategy).await
    }

    /// Open a position and persist its open leg
    ///
    /// Nothing is persisted unless the exchange accepted the order.
    pub async fn open(&self, request: OpenOrderRequest) -> Result<Transaction> {
        match self.submit_open(&request).await {
            Ok(transaction) => {
                self.notify(format!(
                    "🟢 Opened {} {} ({}) {} @ {} [{}]",
                    transaction.direction,
                    request.coin.code,
                    transaction.trading_type.as_str(),
                    transaction.amount,
                    transaction.price,
                    transaction.strategy
                ));
                Ok(transaction)
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to open {} {} for {}: {}",
                    request.direction,
                    request.coin.code,
                    request.strategy,
                    e
                );
                self.notify(format!(
                    "❌ Failed to open {} {} [{}]: {}",
                    request.direction, request.coin.code, request.strategy, e
                ));
                Err(e)
            }
        }
    }

    async fn submit_open(&self, request: &OpenOrderRequest) -> Result<Transaction> {
        if request.cost <= Decimal::ZERO {
            return Err(BotError::InvalidOrder(format!(
                "cost must be positive, got {}",
                request.cost
            )));
        }
        if request.trading_type == TradingType::Spot && request.direction == Direction::Short {
            return Err(BotError::InvalidOrder(format!(
                "cannot open SHORT {} on spot",
                request.coin.code
            )));
        }

        let price = self.exchange.get_current_price(&request.coin).await?;
        if price <= Decimal::ZERO {
            return Err(BotError::Exchange(format!(
                "invalid price {} for {}",
                price, request.coin.code
            )));
        }

        let margin = match request.trading_type {
            TradingType::Futures => request.cost / Decimal::from(self.config.leverage),
            TradingType::Spot => request.cost,
        };
        let balance = self.exchange.get_wallet_balance().await?;
        if balance < margin {
            return Err(BotError::InvalidOrder(format!(
                "balance {} does not cover margin {}",
                balance, margin
            )));
        }

        if request.trading_type == TradingType::Futures {
            self.exchange.set_isolated_margin(&request.coin).await?;
            self.exchange
                .set_futures_leverage(&request.coin, self.config.leverage)
                .await?;
        }

        let order = OrderRequest {
            coin: request.coin.clone(),
            direction: request.direction,
            amount: request.cost / price,
            price,
            client_order_id: Uuid::new_v4().to_string(),
        };
        let fill = match request.trading_type {
            TradingType::Futures => self.exchange.open_futures_order(&order).await?,
            TradingType::Spot => self.exchange.buy_coin_by_market(&order).await?,
        };

        let mut transaction = Transaction {
            id: None,
            coin_id: request.coin.id,
            transaction_type: request.direction.opening_type(),
            direction: request.direction,
            strategy: request.strategy.clone(),
            trading_type: request.trading_type,
            amount: fill.amount,
            price: fill.price,
            total_cost: fill.total_cost(),
            commission: fill.commission,
            created_at: self.clock.now(),
            stop_loss_price: request.stop_loss,
            take_profit_price: request.take_profit,
            related_transaction_id: None,
            profit: None,
            percent_profit: None,
            is_fake: self.exchange.is_simulated(),
            client_order_id: Some(fill.client_order_id),
            api_error: None,
        };

        let id = self
            .transactions
            .save_transaction(&transaction)
            .await
            .inspect_err(|e| {
                tracing::error!(
                    "Exchange opened {} {} (order {:?}) but the open leg was not saved: {}",
                    request.direction,
                    request.coin.code,
                    transaction.client_order_id,
                    e
                );
            })?;
        transaction.id = Some(id);

        tracing::info!(
            "Opened {} {} #{}: {} @ {} (SL {:?}, TP {:?})",
            transaction.direction,
            request.coin.code,
            id,
            transaction.amount,
            transaction.price,
            transaction.stop_loss_price,
            transaction.take_profit_price
        );

        Ok(transaction)
    }

    /// Close an open leg at `price`
    pub async fn close(
        &self,
        coin: &Coin,
        open: &Transaction,
        price: Decimal,
        trading_type: TradingType,
    ) -> Result<Transaction> {
        self.close_with_reason(coin, open, price, trading_type, ExitReason::Manual)
            .await
    }

    pub async fn close_with_reason(
        &self,
        coin: &Coin,
        open: &Transaction,
        price: Decimal,
        trading_type: TradingType,
        reason: ExitReason,
    ) -> Result<Transaction> {
        let stored = self.load_open_leg(open).await?;
        if stored.coin_id != coin.id {
            return Err(BotError::InvalidOrder(format!(
                "transaction {:?} belongs to coin {}, not {}",
                stored.id, stored.coin_id, coin.code
            )));
        }
        if stored.trading_type != trading_type {
            return Err(BotError::InvalidOrder(format!(
                "transaction {:?} was opened on {}, cannot close on {}",
                stored.id,
                stored.trading_type.as_str(),
                trading_type.as_str()
            )));
        }

        let order = OrderRequest {
            coin: coin.clone(),
            direction: stored.direction,
            amount: stored.amount,
            price,
            client_order_id: Uuid::new_v4().to_string(),
        };
        let submitted = match trading_type {
            TradingType::Futures => self.exchange.close_futures_order(&order).await,
            TradingType::Spot => self.exchange.sell_coin_by_market(&order).await,
        };

        let fill = match submitted {
            Ok(fill) => fill,
            Err(e) => {
                tracing::warn!("Failed to close {} #{:?}: {}", coin.code, stored.id, e);
                self.notify(format!(
                    "❌ Failed to close {} {} [{}]: {}",
                    stored.direction, coin.code, stored.strategy, e
                ));
                return Err(e);
            }
        };

        self.commit_close(coin, &stored, fill.into(), reason).await
    }

    /// Reload the open leg and reject anything that is not an open leg anymore
    async fn load_open_leg(&self, open: &Transaction) -> Result<Transaction> {
        let id = open
            .id
            .ok_or_else(|| BotError::InvalidState("transaction was never saved".into()))?;

        let stored = self
            .transactions
            .find_by_id(id)
            .await?
            .ok_or_else(|| BotError::InvalidState(format!("transaction {} not found", id)))?;

        if stored.is_close_leg() {
            return Err(BotError::InvalidState(format!(
                "transaction {} is a close leg",
                id
            )));
        }
        if !stored.is_open() {
            return Err(BotError::AlreadyClosed(id));
        }

        Ok(stored)
    }

    /// Persist the close leg, then link it back onto the open leg
    ///
    /// The two writes are not atomic. A failure of the second leaves a close
    /// leg whose open leg still looks open; it is logged with both ids.
    async fn commit_close(
        &self,
        coin: &Coin,
        open: &Transaction,
        execution: CloseExecution,
        reason: ExitReason,
    ) -> Result<Transaction> {
        let open_id = open
            .id
            .ok_or_else(|| BotError::InvalidState("transaction was never saved".into()))?;

        let close_cost = execution.price * execution.amount;
        let commissions = open.commission + execution.commission;
        let profit = match open.direction {
            Direction::Long => close_cost - open.total_cost - commissions,
            Direction::Short => open.total_cost - close_cost - commissions,
        };
        let percent_profit = if open.total_cost.is_zero() {
            0.0
        } else {
            (profit / open.total_cost * Decimal::ONE_HUNDRED)
                .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
                .to_f64()
                .unwrap_or(0.0)
        };

        let mut close = Transaction {
            id: None,
            coin_id: open.coin_id,
            transaction_type: open.direction.closing_type(),
            direction: open.direction,
            strategy: open.strategy.clone(),
            trading_type: open.trading_type,
            amount: execution.amount,
            price: execution.price,
            total_cost: close_cost,
            commission: execution.commission,
            created_at: self.clock.now(),
            stop_loss_price: None,
            take_profit_price: None,
            related_transaction_id: Some(open_id),
            profit: Some(profit),
            percent_profit: Some(percent_profit),
            is_fake: self.exchange.is_simulated(),
            client_order_id: execution.client_order_id,
            api_error: execution.api_error,
        };

        let close_id = self
            .transactions
            .save_transaction(&close)
            .await
            .inspect_err(|e| {
                tracing::error!(
                    "Position #{} closed on the exchange but the close leg was not saved: {}",
                    open_id,
                    e
                );
            })?;
        close.id = Some(close_id);

        let mut closed_open = open.clone();
        closed_open.related_transaction_id = Some(close_id);
        self.transactions
            .save_transaction(&closed_open)
            .await
            .inspect_err(|e| {
                tracing::error!(
                    "Close leg #{} saved but open leg #{} was not linked to it: {}",
                    close_id,
                    open_id,
                    e
                );
            })?;

        tracing::info!(
            "Closed {} {} #{} -> #{} by {} @ {}: profit {} ({}%)",
            open.direction,
            coin.code,
            open_id,
            close_id,
            reason,
            close.price,
            profit,
            percent_profit
        );
        let icon = if profit >= Decimal::ZERO { "✅" } else { "🔻" };
        self.notify(format!(
            "{} Closed {} {} by {} @ {}: {} ({}%) [{}]",
            icon, open.direction, coin.code, reason, close.price, profit, percent_profit, open.strategy
        ));

        Ok(close)
    }

    /// Close the position if its stored stop-loss or take-profit was touched
    ///
    /// Futures positions the exchange already closed on its own are reconciled
    /// from the exchange's record instead.
    pub async fn close_order_by_fixed_stop_loss_or_take_profit(
        &self,
        coin: &Coin,
        open: &Transaction,
        interval: KlineInterval,
    ) -> Result<Option<Transaction>> {
        if open.trading_type == TradingType::Futures
            && self
                .exchange
                .get_position(coin, open.direction)
                .await?
                .is_none()
        {
            return self.reconcile_exchange_close(coin, open).await.map(Some);
        }

        if open.stop_loss_price.is_none() && open.take_profit_price.is_none() {
            return Ok(None);
        }

        let candles = self
            .klines
            .find_closed_in_range(coin.id, interval, open.created_at, self.clock.now())
            .await?;

        for candle in &candles {
            if let Some((price, reason)) = exit_trigger(open, candle) {
                tracing::debug!(
                    "{} #{:?} hit {} at {} in candle {}",
                    coin.code,
                    open.id,
                    reason,
                    price,
                    candle.open_time
                );
                let closed = self
                    .close_with_reason(coin, open, price, open.trading_type, reason)
                    .await?;
                return Ok(Some(closed));
            }
        }

        Ok(None)
    }

    async fn reconcile_exchange_close(&self, coin: &Coin, open: &Transaction) -> Result<Transaction> {
        let stored = self.load_open_leg(open).await?;

        let record = self
            .exchange
            .get_close_trade_record(coin, stored.direction, stored.created_at)
            .await?
            .ok_or_else(|| {
                BotError::Exchange(format!(
                    "{} {} position is gone but the exchange reports no close",
                    stored.direction, coin.code
                ))
            })?;

        tracing::warn!(
            "{} #{:?} was closed by the exchange at {} ({}), reconciling",
            coin.code,
            stored.id,
            record.price,
            record.reason
        );

        let reason = ExitReason::Exchange(record.reason.clone());
        let execution = CloseExecution {
            price: record.price,
            amount: record.amount,
            commission: record.commission,
            client_order_id: None,
            api_error: Some(record.reason),
        };
        self.commit_close(coin, &stored, execution, reason).await
    }

    /// Price retraced to (almost) the entry after having been in profit
    pub async fn should_close_by_break_even(
        &self,
        open: &Transaction,
        current_price: Decimal,
    ) -> Result<bool> {
        let (best, current) = self.profit_percents(open, current_price).await?;
        let config = &self.config.break_even;

        Ok(best >= config.activation_percent && current <= config.close_percent)
    }

    /// Price fell back from its best level by more than the trailing distance
    pub async fn should_close_by_trailing_take_profit(
        &self,
        open: &Transaction,
        current_price: Decimal,
    ) -> Result<bool> {
        let (best, current) = self.profit_percents(open, current_price).await?;
        let config = &self.config.trailing_take_profit;

        Ok(best >= config.activation_percent && best - current >= config.trailing_percent)
    }

    /// Best and current profit, in percent of the entry price
    async fn profit_percents(&self, open: &Transaction, current_price: Decimal) -> Result<(f64, f64)> {
        let id = open
            .id
            .ok_or_else(|| BotError::InvalidState("transaction was never saved".into()))?;
        let change = self.price_changes.get_or_update(id, current_price).await?;

        let best_price = match open.direction {
            Direction::Long => change.high_price,
            Direction::Short => change.low_price,
        };

        Ok((
            open.direction.profit_percent(open.price, best_price),
            open.direction.profit_percent(open.price, current_price),
        ))
    }

    /// Close every leg at its own current price
    ///
    /// A failing leg is reported and does not stop the others.
    pub async fn close_combined_order(&self, legs: &[CombinedLeg]) -> CombinedCloseResult {
        let mut result = CombinedCloseResult::default();

        for leg in legs {
            let closed = match self.exchange.get_current_price(&leg.coin).await {
                Ok(price) => {
                    self.close_with_reason(
                        &leg.coin,
                        &leg.transaction,
                        price,
                        leg.transaction.trading_type,
                        ExitReason::StrategySignal,
                    )
                    .await
                }
                Err(e) => Err(e),
            };

            match closed {
                Ok(close) => {
                    result.total_profit += close.profit.unwrap_or_default();
                    result.closed.push(close);
                }
                Err(e) => {
                    tracing::error!(
                        "Combined close of {} #{:?} failed: {}",
                        leg.coin.code,
                        leg.transaction.id,
                        e
                    );
                    result.failed.push((leg.transaction.id, e.to_string()));
                }
            }
        }

        tracing::info!(
            "Combined close: {} closed, {} failed, total profit {}",
            result.closed.len(),
            result.failed.len(),
            result.total_profit
        );

        result
    }

    fn notify(&self, message: String) {
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            if let Err(e) = notifier.send(&message).await {
                tracing::warn!("Failed to send notification: {}", e);
            }
        });
    }
}

/// Exit price and reason if `candle` touched a stored exit; stop-loss first
fn exit_trigger(open: &Transaction, candle: &Kline) -> Option<(Decimal, ExitReason)> {
    let (stop_hit, take_hit) = match open.direction {
        Direction::Long => (
            open.stop_loss_price.filter(|sl| candle.low <= *sl),
            open.take_profit_price.filter(|tp| candle.high >= *tp),
        ),
        Direction::Short => (
            open.stop_loss_price.filter(|sl| candle.high >= *sl),
            open.take_profit_price.filter(|tp| candle.low <= *tp),
        ),
    };

    stop_hit
        .map(|price| (price, ExitReason::StopLoss))
        .or_else(|| take_hit.map(|price| (price, ExitReason::TakeProfit)))
}

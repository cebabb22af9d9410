use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;

use super::{no_signal_on_missing_data, Signal, Strategy};
use crate::config::BreakoutConfig;
use crate::execution::{ExitReason, OpenOrderRequest, OrderManager};
use crate::models::{Direction, Kline, KlineInterval, Transaction};
use crate::Result;

/// Single-coin range breakout
///
/// Enters when a candle closes outside the range of the previous `lookback`
/// candles, with a dynamic stop-loss and a take-profit at `reward_ratio` times
/// the risk. Exits on the stored stop/target, trailing take-profit, or
/// breakeven, in that order.
pub struct BreakoutStrategy {
    config: BreakoutConfig,
    interval: KlineInterval,
    manager: Arc<OrderManager>,
}

impl BreakoutStrategy {
    pub fn new(config: BreakoutConfig, manager: Arc<OrderManager>) -> Self {
        let interval = manager.config().kline_interval;
        Self {
            config,
            interval,
            manager,
        }
    }

    /// Signal from the most recent closed candles, oldest first
    pub fn generate_signal(&self, candles: &[Kline]) -> Signal {
        let Some((last, previous)) = candles.split_last() else {
            return Signal::Hold;
        };
        if previous.len() < self.config.lookback {
            return Signal::Hold;
        }

        let range = &previous[previous.len() - self.config.lookback..];
        let high = range.iter().map(|k| k.high).max().unwrap_or(last.close);
        let low = range.iter().map(|k| k.low).min().unwrap_or(last.close);

        if last.close > high {
            Signal::Long
        } else if last.close < low {
            Signal::Short
        } else {
            Signal::Hold
        }
    }

    /// Take-profit `reward_ratio` times the entry-to-stop distance away
    fn take_profit(&self, direction: Direction, entry: Decimal, stop_loss: Decimal) -> Decimal {
        let reward = (entry - stop_loss).abs() * self.config.reward_ratio;
        match direction {
            Direction::Long => entry + reward,
            Direction::Short => entry - reward,
        }
    }

    async fn try_open(&self, direction: Direction) -> Result<()> {
        let coin = &self.config.coin;

        let stop_loss = self.manager.find_stop_loss(coin, self.interval, direction).await;
        let Some(stop_loss) = no_signal_on_missing_data(stop_loss)? else {
            return Ok(());
        };
        let entry = self.manager.current_price(coin).await?;
        let take_profit = self.take_profit(direction, entry, stop_loss);

        tracing::info!(
            "📈 {} breakout on {}: entry ~{}, SL {}, TP {}",
            direction,
            coin.code,
            entry,
            stop_loss,
            take_profit
        );

        self.manager
            .open(OpenOrderRequest {
                coin: coin.clone(),
                direction,
                cost: self.config.cost,
                stop_loss: Some(stop_loss),
                take_profit: Some(take_profit),
                trading_type: self.config.trading_type,
                strategy: self.config.name.clone(),
            })
            .await?;

        Ok(())
    }

    async fn manage_open(&self, open: Transaction) -> Result<()> {
        let coin = &self.config.coin;

        if self
            .manager
            .close_order_by_fixed_stop_loss_or_take_profit(coin, &open, self.interval)
            .await?
            .is_some()
        {
            return Ok(());
        }

        let price = self.manager.current_price(coin).await?;
        let reason = if self
            .manager
            .should_close_by_trailing_take_profit(&open, price)
            .await?
        {
            Some(ExitReason::TrailingTakeProfit)
        } else if self.manager.should_close_by_break_even(&open, price).await? {
            Some(ExitReason::BreakEven)
        } else {
            None
        };

        if let Some(reason) = reason {
            self.manager
                .close_with_reason(coin, &open, price, open.trading_type, reason)
                .await?;
        }

        Ok(())
    }
}

#[async_trait]
impl Strategy for BreakoutStrategy {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn min_candles_required(&self) -> usize {
        self.config.lookback + 1
    }

    async fn on_tick(&self) -> Result<()> {
        if let Some(open) = self
            .manager
            .opened_transaction(&self.config.name, &self.config.coin)
            .await?
        {
            return self.manage_open(open).await;
        }

        let candles = self
            .manager
            .closed_klines(&self.config.coin, self.interval, self.min_candles_required())
            .await?;

        match self.generate_signal(&candles) {
            Signal::Long => self.try_open(Direction::Long).await,
            Signal::Short => self.try_open(Direction::Short).await,
            Signal::Hold => Ok(()),
        }
    }
}

use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::Arc;

use super::{Signal, Strategy};
use crate::config::PairRatioConfig;
use crate::execution::{CombinedLeg, OpenOrderRequest, OrderManager};
use crate::models::{build_synthetic_klines, Coin, Direction, KlineInterval, SyntheticKline, TradingType};
use crate::Result;

/// Two-coin mean reversion on the base/quote price ratio
///
/// When the ratio strays `entry_deviation_percent` from its mean, the rich leg
/// is shorted and the cheap leg bought. Both legs are closed together once the
/// ratio is back within `exit_deviation_percent`.
pub struct PairRatioStrategy {
    config: PairRatioConfig,
    interval: KlineInterval,
    manager: Arc<OrderManager>,
}

/// Deviation of the latest ratio close from the mean close, in percent
pub fn ratio_deviation_percent(ratios: &[SyntheticKline]) -> Option<f64> {
    let last = ratios.last()?;
    let sum: Decimal = ratios.iter().map(|k| k.close).sum();
    let mean = sum / Decimal::from(ratios.len());
    if mean.is_zero() {
        return None;
    }

    ((last.close - mean) / mean * Decimal::ONE_HUNDRED).to_f64()
}

impl PairRatioStrategy {
    pub fn new(config: PairRatioConfig, manager: Arc<OrderManager>) -> Self {
        let interval = manager.config().kline_interval;
        Self {
            config,
            interval,
            manager,
        }
    }

    /// Long means long base / short quote
    pub fn entry_signal(&self, deviation: f64) -> Signal {
        if deviation >= self.config.entry_deviation_percent {
            Signal::Short
        } else if deviation <= -self.config.entry_deviation_percent {
            Signal::Long
        } else {
            Signal::Hold
        }
    }

    pub fn should_exit(&self, deviation: f64) -> bool {
        deviation.abs() <= self.config.exit_deviation_percent
    }

    async fn ratios(&self) -> Result<Vec<SyntheticKline>> {
        let lookback = self.config.lookback;
        let base = self
            .manager
            .closed_klines(&self.config.base, self.interval, lookback)
            .await?;
        let quote = self
            .manager
            .closed_klines(&self.config.quote, self.interval, lookback)
            .await?;

        Ok(build_synthetic_klines(&base, &quote))
    }

    fn coin_for(&self, coin_id: i64) -> Option<&Coin> {
        [&self.config.base, &self.config.quote]
            .into_iter()
            .find(|c| c.id == coin_id)
    }

    fn leg_request(&self, coin: &Coin, direction: Direction) -> OpenOrderRequest {
        OpenOrderRequest {
            coin: coin.clone(),
            direction,
            cost: self.config.cost,
            stop_loss: None,
            take_profit: None,
            trading_type: TradingType::Futures,
            strategy: self.config.name.clone(),
        }
    }

    async fn enter(&self, base_direction: Direction) -> Result<()> {
        let first = self
            .manager
            .open(self.leg_request(&self.config.base, base_direction))
            .await?;

        let second = self
            .manager
            .open(self.leg_request(&self.config.quote, base_direction.opposite()))
            .await;

        if let Err(e) = second {
            // Never keep a single unhedged leg
            tracing::warn!(
                "{}: quote leg failed ({}), closing base leg #{:?}",
                self.config.name,
                e,
                first.id
            );
            self.manager
                .close_combined_order(&[CombinedLeg {
                    coin: self.config.base.clone(),
                    transaction: first,
                }])
                .await;
            return Err(e);
        }

        Ok(())
    }

    async fn exit(&self) -> Result<()> {
        let opened = self.manager.opened_transactions(&self.config.name).await?;
        let legs: Vec<CombinedLeg> = opened
            .into_iter()
            .filter_map(|transaction| {
                self.coin_for(transaction.coin_id).map(|coin| CombinedLeg {
                    coin: coin.clone(),
                    transaction,
                })
            })
            .collect();

        let result = self.manager.close_combined_order(&legs).await;
        tracing::info!(
            "{}: ratio reverted, closed {} legs for {}",
            self.config.name,
            result.closed.len(),
            result.total_profit
        );

        Ok(())
    }
}

#[async_trait]
impl Strategy for PairRatioStrategy {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn min_candles_required(&self) -> usize {
        self.config.lookback
    }

    async fn on_tick(&self) -> Result<()> {
        let ratios = self.ratios().await?;
        if ratios.len() < self.min_candles_required() {
            tracing::debug!(
                "{}: {} ratio candles, need {}",
                self.config.name,
                ratios.len(),
                self.min_candles_required()
            );
            return Ok(());
        }
        let Some(deviation) = ratio_deviation_percent(&ratios) else {
            return Ok(());
        };

        let has_position = !self
            .manager
            .opened_transactions(&self.config.name)
            .await?
            .is_empty();

        if has_position {
            if self.should_exit(deviation) {
                self.exit().await?;
            }
            return Ok(());
        }

        match self.entry_signal(deviation) {
            Signal::Long => self.enter(Direction::Long).await,
            Signal::Short => self.enter(Direction::Short).await,
            Signal::Hold => Ok(()),
        }
    }
}

use chrono::{DateTime, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use std::sync::Arc;

use crate::config::DynamicStopLossConfig;
use crate::db::KlineRepository;
use crate::error::BotError;
use crate::models::{Coin, Direction, KlineInterval};
use crate::Result;

/// Stop-loss prices derived from the extremes of recent candles
pub struct ProfitLossFinder {
    klines: Arc<dyn KlineRepository>,
    config: DynamicStopLossConfig,
}

impl ProfitLossFinder {
    pub fn new(klines: Arc<dyn KlineRepository>, config: DynamicStopLossConfig) -> Self {
        Self { klines, config }
    }

    /// Stop-loss for a position opened now, from the last `candles` closed candles
    pub async fn find_stop_loss(
        &self,
        coin: &Coin,
        now: DateTime<Utc>,
        interval: KlineInterval,
        direction: Direction,
    ) -> Result<Decimal> {
        let wanted = self.config.candles;
        let window = self
            .klines
            .find_latest_closed(coin.id, interval, now, wanted)
            .await?;

        if window.len() < wanted {
            return Err(BotError::Data(format!(
                "{} has {} closed {} candles before {}, need {}",
                coin.code,
                window.len(),
                interval,
                now,
                wanted
            )));
        }

        let min_low = window.iter().map(|k| k.low).min().unwrap_or_default();
        let max_high = window.iter().map(|k| k.high).max().unwrap_or_default();
        let reference = window.last().map(|k| k.close).unwrap_or_default();

        let stop = self.stop_loss_in_config_range(direction, reference, min_low, max_high);
        tracing::debug!(
            "{} {} stop-loss {} (ref {}, low {}, high {})",
            coin.code,
            direction,
            stop,
            reference,
            min_low,
            max_high
        );

        Ok(stop)
    }

    /// Clamp the distance between `reference` and the adverse extremum into
    /// `[min_percent, max_percent]`
    pub fn stop_loss_in_config_range(
        &self,
        direction: Direction,
        reference: Decimal,
        min_low: Decimal,
        max_high: Decimal,
    ) -> Decimal {
        if reference.is_zero() {
            return reference;
        }

        let extremum = match direction {
            Direction::Long => min_low,
            Direction::Short => max_high,
        };
        let distance = ((reference - extremum).abs() / reference * Decimal::ONE_HUNDRED)
            .to_f64()
            .unwrap_or(0.0);

        if distance > self.config.max_percent {
            offset(direction, reference, self.config.max_percent)
        } else if distance < self.config.min_percent {
            offset(direction, reference, self.config.min_percent)
        } else {
            offset(direction, extremum, self.config.deviation_percent)
        }
    }
}

/// Move `price` by `percent` of itself against the position
fn offset(direction: Direction, price: Decimal, percent: f64) -> Decimal {
    let delta = price * percent_fraction(percent);
    match direction {
        Direction::Long => price - delta,
        Direction::Short => price + delta,
    }
}

fn percent_fraction(percent: f64) -> Decimal {
    Decimal::from_f64(percent).unwrap_or_default() / Decimal::ONE_HUNDRED
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::InMemoryStore;
    use crate::models::Kline;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn finder(store: Arc<InMemoryStore>) -> ProfitLossFinder {
        ProfitLossFinder::new(
            store,
            DynamicStopLossConfig {
                candles: 3,
                min_percent: 0.5,
                max_percent: 3.0,
                deviation_percent: 0.1,
            },
        )
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap()
    }

    #[test]
    fn test_flat_market_uses_min_percent() {
        let finder = finder(Arc::new(InMemoryStore::new()));
        let r = dec!(10000);

        assert_eq!(finder.stop_loss_in_config_range(Direction::Long, r, r, r), dec!(9950));
        assert_eq!(finder.stop_loss_in_config_range(Direction::Short, r, r, r), dec!(10050));
    }

    #[test]
    fn test_wide_range_is_capped_at_max_percent() {
        let finder = finder(Arc::new(InMemoryStore::new()));
        let r = dec!(10000);

        assert_eq!(
            finder.stop_loss_in_config_range(Direction::Long, r, dec!(9600), dec!(10400)),
            dec!(9700)
        );
        assert_eq!(
            finder.stop_loss_in_config_range(Direction::Short, r, dec!(9600), dec!(10400)),
            dec!(10300)
        );
    }

    #[test]
    fn test_in_range_uses_extremum_with_deviation() {
        let finder = finder(Arc::new(InMemoryStore::new()));

        // 1% below reference: inside [0.5, 3], so 9900 - 0.1%
        assert_eq!(
            finder.stop_loss_in_config_range(Direction::Long, dec!(10000), dec!(9900), dec!(10000)),
            dec!(9890.1)
        );
        assert_eq!(
            finder.stop_loss_in_config_range(Direction::Short, dec!(10000), dec!(10000), dec!(10100)),
            dec!(10110.1)
        );
    }

    #[tokio::test]
    async fn test_find_stop_loss_reads_closed_window() {
        let klines = [
            (dec!(10000), dec!(10050), dec!(9920), dec!(10010)),
            (dec!(10010), dec!(10080), dec!(9950), dec!(10020)),
            (dec!(10020), dec!(10060), dec!(9980), dec!(10000)),
            // Still in progress at `now`, must be ignored
            (dec!(10000), dec!(10000), dec!(5000), dec!(10000)),
        ]
        .into_iter()
        .enumerate()
        .map(|(i, (o, h, l, c))| {
            Kline::new(1, KlineInterval::FiveMinutes, start() + Duration::minutes(5 * i as i64), o, h, l, c)
        });

        let finder = finder(Arc::new(InMemoryStore::with_klines(klines)));
        let stop = finder
            .find_stop_loss(
                &Coin::new(1, "BTCUSDT"),
                start() + Duration::minutes(17),
                KlineInterval::FiveMinutes,
                Direction::Long,
            )
            .await
            .unwrap();

        // Reference 10000, min low 9920: 0.8% away, so 9920 - 0.1%
        assert_eq!(stop, dec!(9910.08));
    }

    #[tokio::test]
    async fn test_insufficient_history_is_data_error() {
        let finder = finder(Arc::new(InMemoryStore::new()));
        let err = finder
            .find_stop_loss(
                &Coin::new(1, "BTCUSDT"),
                start(),
                KlineInterval::FiveMinutes,
                Direction::Short,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, BotError::Data(_)));
    }
}

use crate::models::{Kline, KlineInterval};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;

const PRICE_DECIMALS: u32 = 4;

/// Market scenario types for synthetic data generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketScenario {
    /// Steady uptrend with noise (+2% daily average)
    Uptrend,
    /// Steady downtrend with noise (-2% daily average)
    Downtrend,
    /// Sideways/choppy market (±1% around mean)
    Sideways,
    /// High volatility (±5% large swings)
    Volatile,
    /// Contains time gaps (missing candles)
    WithGaps,
    /// Rapid 25% drop in the second half
    Crash,
}

impl MarketScenario {
    pub fn all() -> [MarketScenario; 6] {
        [
            MarketScenario::Uptrend,
            MarketScenario::Downtrend,
            MarketScenario::Sideways,
            MarketScenario::Volatile,
            MarketScenario::WithGaps,
            MarketScenario::Crash,
        ]
    }

    pub fn label(&self) -> &'static str {
        match self {
            MarketScenario::Uptrend => "📈 Uptrend (+2% daily)",
            MarketScenario::Downtrend => "📉 Downtrend (-2% daily)",
            MarketScenario::Sideways => "↔️  Sideways (mean-reverting)",
            MarketScenario::Volatile => "⚡ Volatile (±5% swings)",
            MarketScenario::WithGaps => "🕳️  With Time Gaps",
            MarketScenario::Crash => "💥 Crash (25% drop)",
        }
    }
}

/// Generates seeded klines for backtesting
pub struct SyntheticDataGenerator {
    rng: StdRng,
    base_price: f64,
    base_volume: f64,
}

impl SyntheticDataGenerator {
    /// Create a new generator with a seed for reproducibility
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            base_price: 10_000.0,
            base_volume: 1_000.0,
        }
    }

    pub fn with_base_price(mut self, base_price: f64) -> Self {
        self.base_price = base_price;
        self
    }

    /// Generate `num_candles` klines of `coin_id` starting at `start`
    pub fn generate(
        &mut self,
        scenario: MarketScenario,
        coin_id: i64,
        interval: KlineInterval,
        start: DateTime<Utc>,
        num_candles: usize,
    ) -> Vec<Kline> {
        let interval_minutes = interval.duration().num_minutes().max(1) as f64;
        let mut klines = Vec::with_capacity(num_candles);
        let mut price = self.base_price;
        let mut slot: i32 = 0;

        for i in 0..num_candles {
            if scenario == MarketScenario::WithGaps && i % 50 == 49 {
                slot += 2; // Skip two candles
                continue;
            }

            price = self.next_price(scenario, price, i, num_candles, interval_minutes);
            let open_time = start + interval.duration() * slot;
            klines.push(self.create_kline(coin_id, interval, open_time, price));
            slot += 1;
        }

        klines
    }

    fn next_price(
        &mut self,
        scenario: MarketScenario,
        price: f64,
        index: usize,
        num_candles: usize,
        interval_minutes: f64,
    ) -> f64 {
        let next = match scenario {
            MarketScenario::Uptrend | MarketScenario::Downtrend => {
                let daily = if scenario == MarketScenario::Uptrend { 0.02 } else { -0.02 };
                let drift = price * daily / (24.0 * 60.0 / interval_minutes);
                let noise = price * self.rng.gen_range(-0.001..0.001);
                price + drift + noise
            }
            MarketScenario::Sideways => {
                let reversion = (self.base_price - price) * 0.1;
                let noise = price * self.rng.gen_range(-0.01..0.01);
                price + reversion + noise
            }
            MarketScenario::Volatile => price + price * self.rng.gen_range(-0.05..0.05),
            MarketScenario::WithGaps => price + price * self.rng.gen_range(-0.01..0.01),
            MarketScenario::Crash => {
                if index < num_candles / 2 {
                    price + price * self.rng.gen_range(-0.005..0.01)
                } else {
                    let drop = price * (-0.25 / (num_candles as f64 / 2.0));
                    price + drop + price * self.rng.gen_range(-0.005..0.005)
                }
            }
        };

        next.max(self.base_price * 0.05)
    }

    /// OHLC around the close with ±0.2% intrabar movement
    fn create_kline(
        &mut self,
        coin_id: i64,
        interval: KlineInterval,
        open_time: DateTime<Utc>,
        close: f64,
    ) -> Kline {
        let noise_pct = 0.002;
        let high = close * (1.0 + self.rng.gen_range(0.0..noise_pct));
        let low = close * (1.0 - self.rng.gen_range(0.0..noise_pct));
        let open = (close * (1.0 + self.rng.gen_range(-noise_pct..noise_pct))).clamp(low, high);
        let volume = self.base_volume * self.rng.gen_range(0.7..1.3);

        let mut kline = Kline::new(
            coin_id,
            interval,
            open_time,
            to_price(open),
            to_price(high),
            to_price(low),
            to_price(close),
        );
        // Rounding may not move a bound inside open/close
        kline.high = kline.high.max(kline.open).max(kline.close);
        kline.low = kline.low.min(kline.open).min(kline.close);
        kline.volume = to_price(volume);
        kline
    }
}

fn to_price(value: f64) -> Decimal {
    Decimal::from_f64(value)
        .unwrap_or_default()
        .round_dp(PRICE_DECIMALS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn generate(scenario: MarketScenario, n: usize) -> Vec<Kline> {
        SyntheticDataGenerator::new(42).generate(scenario, 1, KlineInterval::FiveMinutes, start(), n)
    }

    #[test]
    fn test_generate_uptrend() {
        let klines = generate(MarketScenario::Uptrend, 500);
        assert_eq!(klines.len(), 500);

        let first = klines.first().unwrap().close;
        let last = klines.last().unwrap().close;
        assert!(last > first, "Uptrend should end higher: {} -> {}", first, last);
    }

    #[test]
    fn test_generate_downtrend() {
        let klines = generate(MarketScenario::Downtrend, 500);

        let first = klines.first().unwrap().close;
        let last = klines.last().unwrap().close;
        assert!(last < first, "Downtrend should end lower: {} -> {}", first, last);
    }

    #[test]
    fn test_generate_sideways_stays_near_base() {
        let klines = generate(MarketScenario::Sideways, 500);
        for kline in &klines {
            assert!(
                kline.close > Decimal::from(9_000) && kline.close < Decimal::from(11_000),
                "Sideways should stay near base: {}",
                kline.close
            );
        }
    }

    #[test]
    fn test_generate_with_gaps() {
        let klines = generate(MarketScenario::WithGaps, 100);
        assert!(klines.len() < 100);

        let has_gap = klines
            .windows(2)
            .any(|w| w[1].open_time - w[0].open_time > Duration::minutes(5));
        assert!(has_gap, "Should contain time gaps");
    }

    #[test]
    fn test_klines_are_contiguous_and_consistent() {
        let klines = generate(MarketScenario::Volatile, 200);

        assert_eq!(klines[0].open_time, start());
        for w in klines.windows(2) {
            assert_eq!(w[0].close_time, w[1].open_time);
        }
        for k in &klines {
            assert!(k.high >= k.close && k.high >= k.open);
            assert!(k.low <= k.close && k.low <= k.open);
            assert!(k.low > Decimal::ZERO);
        }
    }

    #[test]
    fn test_same_seed_same_data() {
        assert_eq!(generate(MarketScenario::Crash, 50), generate(MarketScenario::Crash, 50));
    }
}

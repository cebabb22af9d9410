use config::{Config, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::error::BotError;
use crate::models::{Coin, KlineInterval, TradingType};
use crate::Result;

pub const ENV_PREFIX: &str = "MARGINBOT";

/// Top-level configuration, injected into every component at construction
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub database_url: String,
    pub trading: TradingConfig,
    pub backtest: BacktestConfig,
    pub notifications: NotificationConfig,
    pub strategies: StrategiesConfig,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/marginbot".to_string(),
            trading: TradingConfig::default(),
            backtest: BacktestConfig::default(),
            notifications: NotificationConfig::default(),
            strategies: StrategiesConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    pub leverage: u32,
    pub kline_interval: KlineInterval,
    pub dynamic_stop_loss: DynamicStopLossConfig,
    pub break_even: BreakEvenConfig,
    pub trailing_take_profit: TrailingTakeProfitConfig,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            leverage: 10,
            kline_interval: KlineInterval::FiveMinutes,
            dynamic_stop_loss: DynamicStopLossConfig::default(),
            break_even: BreakEvenConfig::default(),
            trailing_take_profit: TrailingTakeProfitConfig::default(),
        }
    }
}

/// Bounds for stop-loss prices derived from recent candles (all in percent)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DynamicStopLossConfig {
    pub candles: usize,
    pub min_percent: f64,
    pub max_percent: f64,
    pub deviation_percent: f64,
}

impl Default for DynamicStopLossConfig {
    fn default() -> Self {
        Self {
            candles: 12,
            min_percent: 0.5,
            max_percent: 3.0,
            deviation_percent: 0.1,
        }
    }
}

/// Percent of entry price, unleveraged
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakEvenConfig {
    pub activation_percent: f64,
    pub close_percent: f64,
}

impl Default for BreakEvenConfig {
    fn default() -> Self {
        Self {
            activation_percent: 1.0,
            close_percent: 0.1,
        }
    }
}

/// Percent of entry price, unleveraged
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrailingTakeProfitConfig {
    pub activation_percent: f64,
    pub trailing_percent: f64,
}

impl Default for TrailingTakeProfitConfig {
    fn default() -> Self {
        Self {
            activation_percent: 2.0,
            trailing_percent: 0.5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    pub step_minutes: i64,
    pub commission_rate: Decimal,
    pub initial_balance: Decimal,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            step_minutes: 5,
            commission_rate: Decimal::new(4, 4), // 0.04%
            initial_balance: Decimal::new(10_000, 0),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StrategiesConfig {
    pub breakout: Option<BreakoutConfig>,
    pub pair_ratio: Option<PairRatioConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BreakoutConfig {
    #[serde(default = "default_breakout_name")]
    pub name: String,
    pub coin: Coin,
    pub cost: Decimal,
    #[serde(default = "default_lookback")]
    pub lookback: usize,
    #[serde(default = "default_reward_ratio")]
    pub reward_ratio: Decimal,
    #[serde(default = "default_trading_type")]
    pub trading_type: TradingType,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PairRatioConfig {
    #[serde(default = "default_pair_ratio_name")]
    pub name: String,
    pub base: Coin,
    pub quote: Coin,
    pub cost: Decimal,
    #[serde(default = "default_lookback")]
    pub lookback: usize,
    #[serde(default = "default_entry_deviation")]
    pub entry_deviation_percent: f64,
    #[serde(default = "default_exit_deviation")]
    pub exit_deviation_percent: f64,
}

impl StrategiesConfig {
    /// Every coin some configured strategy trades, without duplicates
    pub fn coins(&self) -> Vec<Coin> {
        let mut coins: Vec<Coin> = Vec::new();
        let configured = self
            .breakout
            .iter()
            .map(|b| &b.coin)
            .chain(self.pair_ratio.iter().flat_map(|p| [&p.base, &p.quote]));

        for coin in configured {
            if !coins.iter().any(|c| c.id == coin.id) {
                coins.push(coin.clone());
            }
        }
        coins
    }

    pub fn is_empty(&self) -> bool {
        self.breakout.is_none() && self.pair_ratio.is_none()
    }
}

fn default_breakout_name() -> String {
    "breakout".to_string()
}

fn default_pair_ratio_name() -> String {
    "pair_ratio".to_string()
}

fn default_lookback() -> usize {
    20
}

fn default_reward_ratio() -> Decimal {
    Decimal::TWO
}

fn default_trading_type() -> TradingType {
    TradingType::Futures
}

fn default_entry_deviation() -> f64 {
    2.0
}

fn default_exit_deviation() -> f64 {
    0.5
}

impl BotConfig {
    /// Layer an optional TOML file with `MARGINBOT__*` environment variables
    pub fn load(path: Option<&str>) -> Result<Self> {
        let path = path.unwrap_or("config/default");

        let config = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let bot_config: BotConfig = config.try_deserialize()?;
        bot_config.validate()?;

        tracing::debug!("Loaded configuration from {}", path);
        Ok(bot_config)
    }

    pub fn validate(&self) -> Result<()> {
        let trading = &self.trading;
        if trading.leverage == 0 {
            return Err(BotError::Configuration("leverage must be at least 1".into()));
        }

        let stop = &trading.dynamic_stop_loss;
        if stop.candles == 0 {
            return Err(BotError::Configuration(
                "dynamic_stop_loss.candles must be positive".into(),
            ));
        }
        if stop.min_percent < 0.0 || stop.deviation_percent < 0.0 {
            return Err(BotError::Configuration(
                "dynamic_stop_loss percents must not be negative".into(),
            ));
        }
        if stop.min_percent > stop.max_percent {
            return Err(BotError::Configuration(format!(
                "dynamic_stop_loss.min_percent ({}) exceeds max_percent ({})",
                stop.min_percent, stop.max_percent
            )));
        }

        if trading.break_even.close_percent > trading.break_even.activation_percent {
            return Err(BotError::Configuration(
                "break_even.close_percent must not exceed activation_percent".into(),
            ));
        }
        if trading.trailing_take_profit.trailing_percent <= 0.0 {
            return Err(BotError::Configuration(
                "trailing_take_profit.trailing_percent must be positive".into(),
            ));
        }

        if self.backtest.step_minutes <= 0 {
            return Err(BotError::Configuration(
                "backtest.step_minutes must be positive".into(),
            ));
        }
        if self.backtest.commission_rate.is_sign_negative() {
            return Err(BotError::Configuration(
                "backtest.commission_rate must not be negative".into(),
            ));
        }

        if let Some(breakout) = &self.strategies.breakout {
            if breakout.cost <= Decimal::ZERO || breakout.lookback == 0 {
                return Err(BotError::Configuration(format!(
                    "strategy {} needs a positive cost and lookback",
                    breakout.name
                )));
            }
        }
        if let Some(pair) = &self.strategies.pair_ratio {
            if pair.cost <= Decimal::ZERO || pair.lookback == 0 {
                return Err(BotError::Configuration(format!(
                    "strategy {} needs a positive cost and lookback",
                    pair.name
                )));
            }
            if pair.base.id == pair.quote.id {
                return Err(BotError::Configuration(format!(
                    "strategy {} needs two different coins",
                    pair.name
                )));
            }
            if pair.exit_deviation_percent >= pair.entry_deviation_percent {
                return Err(BotError::Configuration(format!(
                    "strategy {}: exit deviation must be below entry deviation",
                    pair.name
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = BotConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.trading.dynamic_stop_loss.min_percent, 0.5);
        assert_eq!(config.trading.dynamic_stop_loss.max_percent, 3.0);
    }

    #[test]
    fn test_min_above_max_is_rejected() {
        let mut config = BotConfig::default();
        config.trading.dynamic_stop_loss.min_percent = 5.0;

        let err = config.validate().unwrap_err();
        assert!(matches!(err, BotError::Configuration(_)));
    }

    #[test]
    fn test_zero_leverage_and_step_rejected() {
        let mut config = BotConfig::default();
        config.trading.leverage = 0;
        assert!(config.validate().is_err());

        let mut config = BotConfig::default();
        config.backtest.step_minutes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_from_toml() {
        let toml = r#"
            database_url = "postgres://db/test"

            [trading]
            leverage = 5
            kline_interval = "15m"

            [trading.dynamic_stop_loss]
            candles = 6

            [strategies.breakout]
            coin = { id = 1, code = "BTCUSDT" }
            cost = "100"
        "#;

        let config: BotConfig = Config::builder()
            .add_source(File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.database_url, "postgres://db/test");
        assert_eq!(config.trading.leverage, 5);
        assert_eq!(config.trading.kline_interval, KlineInterval::FifteenMinutes);
        assert_eq!(config.trading.dynamic_stop_loss.candles, 6);
        // Untouched keys keep their defaults
        assert_eq!(config.trading.dynamic_stop_loss.max_percent, 3.0);

        let breakout = config.strategies.breakout.unwrap();
        assert_eq!(breakout.name, "breakout");
        assert_eq!(breakout.coin.code, "BTCUSDT");
        assert_eq!(breakout.cost, Decimal::ONE_HUNDRED);
        assert_eq!(breakout.trading_type, TradingType::Futures);
    }
}

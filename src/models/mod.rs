use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::BotError;

/// A tradable instrument
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Coin {
    pub id: i64,
    pub code: String, // Exchange symbol, e.g. BTCUSDT
}

impl Coin {
    pub fn new(id: i64, code: impl Into<String>) -> Self {
        Self {
            id,
            code: code.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionType {
    Buy,
    Sell,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Buy => "BUY",
            TransactionType::Sell => "SELL",
        }
    }
}

impl FromStr for TransactionType {
    type Err = BotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BUY" => Ok(TransactionType::Buy),
            "SELL" => Ok(TransactionType::Sell),
            other => Err(BotError::Persistence(format!(
                "unknown transaction type {}",
                other
            ))),
        }
    }
}

/// Which price movement a leg profits from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "LONG",
            Direction::Short => "SHORT",
        }
    }

    /// Transaction type of the leg that opens a position in this direction
    pub fn opening_type(&self) -> TransactionType {
        match self {
            Direction::Long => TransactionType::Buy,
            Direction::Short => TransactionType::Sell,
        }
    }

    /// Transaction type of the leg that closes a position in this direction
    pub fn closing_type(&self) -> TransactionType {
        match self {
            Direction::Long => TransactionType::Sell,
            Direction::Short => TransactionType::Buy,
        }
    }

    pub fn opposite(&self) -> Direction {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }

    /// Profit of a move from `entry` to `price`, in percent of `entry`
    pub fn profit_percent(&self, entry: Decimal, price: Decimal) -> f64 {
        use rust_decimal::prelude::ToPrimitive;

        if entry.is_zero() {
            return 0.0;
        }
        let change = match self {
            Direction::Long => price - entry,
            Direction::Short => entry - price,
        };
        (change / entry * Decimal::ONE_HUNDRED)
            .to_f64()
            .unwrap_or(0.0)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = BotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LONG" => Ok(Direction::Long),
            "SHORT" => Ok(Direction::Short),
            other => Err(BotError::Persistence(format!("unknown direction {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradingType {
    Futures,
    Spot,
}

impl TradingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradingType::Futures => "FUTURES",
            TradingType::Spot => "SPOT",
        }
    }
}

impl FromStr for TradingType {
    type Err = BotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FUTURES" => Ok(TradingType::Futures),
            "SPOT" => Ok(TradingType::Spot),
            other => Err(BotError::Persistence(format!(
                "unknown trading type {}",
                other
            ))),
        }
    }
}

/// One leg of a position
///
/// Created by an open, mutated exactly once by the matching close (which sets
/// `related_transaction_id`), never deleted. Close legs carry the profit and
/// point back to the open leg.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transaction {
    pub id: Option<i64>, // Assigned by the repository on insert
    pub coin_id: i64,
    pub transaction_type: TransactionType,
    pub direction: Direction,
    pub strategy: String,
    pub trading_type: TradingType,
    pub amount: Decimal,
    pub price: Decimal,
    pub total_cost: Decimal,
    pub commission: Decimal,
    pub created_at: DateTime<Utc>,
    pub stop_loss_price: Option<Decimal>,
    pub take_profit_price: Option<Decimal>,
    pub related_transaction_id: Option<i64>,
    pub profit: Option<Decimal>,
    pub percent_profit: Option<f64>,
    pub is_fake: bool,
    pub client_order_id: Option<String>,
    pub api_error: Option<String>,
}

impl Transaction {
    /// True for an open leg that has not been closed yet
    pub fn is_open(&self) -> bool {
        self.related_transaction_id.is_none()
    }

    /// Close legs are the only ones carrying a profit
    pub fn is_close_leg(&self) -> bool {
        self.profit.is_some()
    }
}

/// Lifetime price extremes observed since a position opened
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceChange {
    pub transaction_id: i64,
    pub low_price: Decimal,
    pub high_price: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum KlineInterval {
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "15m")]
    FifteenMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "4h")]
    FourHours,
    #[serde(rename = "1d")]
    OneDay,
}

impl KlineInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            KlineInterval::OneMinute => "1m",
            KlineInterval::FiveMinutes => "5m",
            KlineInterval::FifteenMinutes => "15m",
            KlineInterval::OneHour => "1h",
            KlineInterval::FourHours => "4h",
            KlineInterval::OneDay => "1d",
        }
    }

    pub fn duration(&self) -> Duration {
        match self {
            KlineInterval::OneMinute => Duration::minutes(1),
            KlineInterval::FiveMinutes => Duration::minutes(5),
            KlineInterval::FifteenMinutes => Duration::minutes(15),
            KlineInterval::OneHour => Duration::hours(1),
            KlineInterval::FourHours => Duration::hours(4),
            KlineInterval::OneDay => Duration::days(1),
        }
    }
}

impl fmt::Display for KlineInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KlineInterval {
    type Err = BotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(KlineInterval::OneMinute),
            "5m" => Ok(KlineInterval::FiveMinutes),
            "15m" => Ok(KlineInterval::FifteenMinutes),
            "1h" => Ok(KlineInterval::OneHour),
            "4h" => Ok(KlineInterval::FourHours),
            "1d" => Ok(KlineInterval::OneDay),
            other => Err(BotError::Configuration(format!(
                "unknown kline interval {}",
                other
            ))),
        }
    }
}

/// OHLC candle keyed by (coin_id, interval, open_time)
///
/// `close_time` is the exclusive end of the candle: it is final once
/// `close_time <= now`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Kline {
    pub coin_id: i64,
    pub interval: KlineInterval,
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Kline {
    pub fn new(
        coin_id: i64,
        interval: KlineInterval,
        open_time: DateTime<Utc>,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
    ) -> Self {
        Self {
            coin_id,
            interval,
            open_time,
            close_time: open_time + interval.duration(),
            open,
            high,
            low,
            close,
            volume: Decimal::ZERO,
        }
    }

    pub fn contains(&self, moment: DateTime<Utc>) -> bool {
        self.open_time <= moment && moment < self.close_time
    }
}

/// Pair-ratio candle derived from two coins' klines at the same open time
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyntheticKline {
    pub base_coin_id: i64,
    pub quote_coin_id: i64,
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
}

impl SyntheticKline {
    /// Ratio candle of `base / quote`, or None when the timestamps differ or a
    /// quote price is zero
    pub fn from_pair(base: &Kline, quote: &Kline) -> Option<Self> {
        if base.open_time != quote.open_time {
            return None;
        }
        if quote.open.is_zero()
            || quote.close.is_zero()
            || quote.high.is_zero()
            || quote.low.is_zero()
        {
            return None;
        }

        let open = base.open / quote.open;
        let close = base.close / quote.close;
        let high = (base.high / quote.high).max(open).max(close);
        let low = (base.low / quote.low).min(open).min(close);

        Some(Self {
            base_coin_id: base.coin_id,
            quote_coin_id: quote.coin_id,
            open_time: base.open_time,
            close_time: base.close_time,
            open,
            high,
            low,
            close,
        })
    }
}

/// Build ratio candles for every open time present in both series
///
/// Both inputs must be sorted ascending by open time.
pub fn build_synthetic_klines(base: &[Kline], quote: &[Kline]) -> Vec<SyntheticKline> {
    let mut result = Vec::with_capacity(base.len().min(quote.len()));
    let (mut i, mut j) = (0, 0);

    while i < base.len() && j < quote.len() {
        match base[i].open_time.cmp(&quote[j].open_time) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                if let Some(kline) = SyntheticKline::from_pair(&base[i], &quote[j]) {
                    result.push(kline);
                }
                i += 1;
                j += 1;
            }
        }
    }

    result
}

// Trading strategy module
pub mod breakout;
pub mod pair_ratio;

pub use breakout::BreakoutStrategy;
pub use pair_ratio::PairRatioStrategy;

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::StrategiesConfig;
use crate::error::BotError;
use crate::execution::OrderManager;
use crate::Result;

/// Entry decision of a strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Long,
    Short,
    Hold,
}

/// Base trait for all trading strategies
///
/// A strategy only decides when to open or close; every order goes through
/// the [`OrderManager`](crate::execution::OrderManager). The same instance runs
/// under live time and under a replay.
#[async_trait]
pub trait Strategy: Send + Sync {
    /// Get strategy name, also the tag stored on its transactions
    fn name(&self) -> &str;

    /// Minimum closed candles required before the first signal
    fn min_candles_required(&self) -> usize;

    /// Evaluate once at the clock's current moment
    async fn on_tick(&self) -> Result<()>;
}

/// Missing candle history means "no signal", not a failure
pub(crate) fn no_signal_on_missing_data<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(BotError::Data(reason)) => {
            tracing::debug!("No signal: {}", reason);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Instantiate every configured strategy against one order manager
pub fn from_config(config: &StrategiesConfig, manager: Arc<OrderManager>) -> Vec<Arc<dyn Strategy>> {
    let mut strategies: Vec<Arc<dyn Strategy>> = Vec::new();

    if let Some(breakout) = &config.breakout {
        strategies.push(Arc::new(BreakoutStrategy::new(breakout.clone(), manager.clone())));
    }
    if let Some(pair) = &config.pair_ratio {
        strategies.push(Arc::new(PairRatioStrategy::new(pair.clone(), manager.clone())));
    }

    strategies
}

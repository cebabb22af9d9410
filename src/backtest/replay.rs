use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use crate::clock::SimulatedClock;
use crate::error::BotError;
use crate::strategy::Strategy;
use crate::Result;

/// Outcome of one replay
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayReport {
    pub ticks: usize,
    pub failed_ticks: usize,
    pub first_tick: Option<DateTime<Utc>>,
    pub last_tick: Option<DateTime<Utc>>,
}

/// Walks a [`SimulatedClock`] over a historical window
///
/// Every tick sets the clock, then runs each strategy's `on_tick` in order.
/// The strategies see exactly the same code path as in live trading.
pub struct ReplayDriver {
    clock: Arc<SimulatedClock>,
    step: Duration,
}

impl ReplayDriver {
    pub fn new(clock: Arc<SimulatedClock>, step: Duration) -> Result<Self> {
        if step <= Duration::zero() {
            return Err(BotError::Configuration(format!(
                "replay step must be positive, got {}",
                step
            )));
        }
        Ok(Self { clock, step })
    }

    pub fn clock(&self) -> &Arc<SimulatedClock> {
        &self.clock
    }

    /// Number of ticks a replay of `[from, to)` performs
    pub fn tick_count(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> usize {
        if to <= from {
            return 0;
        }
        let span = (to - from).num_milliseconds();
        let step = self.step.num_milliseconds();
        ((span + step - 1) / step) as usize
    }

    /// Replay `[from, to)`. Failing ticks are logged and counted, never fatal.
    pub async fn run(
        &self,
        strategies: &[Arc<dyn Strategy>],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> ReplayReport {
        let mut report = ReplayReport {
            ticks: 0,
            failed_ticks: 0,
            first_tick: None,
            last_tick: None,
        };

        tracing::info!(
            "Replaying {} -> {} every {} min ({} ticks, {} strategies)",
            from,
            to,
            self.step.num_minutes(),
            self.tick_count(from, to),
            strategies.len()
        );

        let mut cursor = from;
        while cursor < to {
            self.clock.set_moment(cursor);

            let mut failed = false;
            for strategy in strategies {
                if let Err(e) = strategy.on_tick().await {
                    tracing::warn!("Tick {} failed for {}: {}", cursor, strategy.name(), e);
                    failed = true;
                }
            }

            report.ticks += 1;
            if failed {
                report.failed_ticks += 1;
            }
            report.first_tick.get_or_insert(cursor);
            report.last_tick = Some(cursor);

            cursor += self.step;
        }

        tracing::info!(
            "Replay finished: {} ticks, {} failed",
            report.ticks,
            report.failed_ticks
        );

        report
    }
}

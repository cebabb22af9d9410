// Time source shared by every time-dependent component
use chrono::{DateTime, Utc};
use std::sync::{Arc, RwLock};

/// Supplies "now"
///
/// Live trading injects a [`RealClock`]; backtests inject a [`SimulatedClock`]
/// owned by the replay driver. Every component of one scope must share the same
/// instance so a single tick is observed identically everywhere.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub type SharedClock = Arc<dyn Clock>;

/// Wall-clock time
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl Clock for RealClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Scripted time for replays
///
/// Returns the moment last set with [`SimulatedClock::set_moment`], no matter
/// how long the computation between two ticks takes.
#[derive(Debug)]
pub struct SimulatedClock {
    moment: RwLock<DateTime<Utc>>,
}

impl SimulatedClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            moment: RwLock::new(start),
        }
    }

    pub fn set_moment(&self, moment: DateTime<Utc>) {
        // A poisoned lock only means a writer panicked mid-assignment of a Copy value
        let mut guard = self.moment.write().unwrap_or_else(|e| e.into_inner());
        *guard = moment;
    }
}

impl Clock for SimulatedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.moment.read().unwrap_or_else(|e| e.into_inner())
    }
}

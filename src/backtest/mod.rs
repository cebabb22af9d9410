pub mod metrics;
pub mod replay;
pub mod runner;
pub mod synthetic;

pub use metrics::{BacktestMetrics, TradeRecord};
pub use replay::{ReplayDriver, ReplayReport};
pub use runner::{BacktestEnvironment, BacktestRunner};
pub use synthetic::{MarketScenario, SyntheticDataGenerator};

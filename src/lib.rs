// Core modules
pub mod backtest;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod exchange;
pub mod execution;
pub mod models;
pub mod notify;
pub mod risk;
pub mod strategy;

// Re-export commonly used types
pub use clock::{Clock, RealClock, SharedClock, SimulatedClock};
pub use error::BotError;
pub use models::*;
pub use strategy::Strategy;

// Error handling
pub type Result<T> = std::result::Result<T, BotError>;

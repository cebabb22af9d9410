// Risk management module
pub mod profit_loss;

pub use profit_loss::ProfitLossFinder;

// Order lifecycle: opening, closing and exit triggers
pub mod order_manager;
pub mod price_change;

pub use order_manager::{
    Collaborators, CombinedCloseResult, CombinedLeg, ExitReason, OpenOrderRequest, OrderManager,
};
pub use price_change::PriceChangeTracker;

use rust_decimal::Decimal;
use std::sync::Arc;

use crate::clock::SharedClock;
use crate::db::PriceChangeRepository;
use crate::models::PriceChange;
use crate::Result;

/// Lifetime low/high of a position since it opened
pub struct PriceChangeTracker {
    repository: Arc<dyn PriceChangeRepository>,
    clock: SharedClock,
}

impl PriceChangeTracker {
    pub fn new(repository: Arc<dyn PriceChangeRepository>, clock: SharedClock) -> Self {
        Self { repository, clock }
    }

    /// Record `current_price` and return the accumulated extremes
    ///
    /// The record is created on first observation and only written again when
    /// one of its bounds widens.
    pub async fn get_or_update(&self, position_id: i64, current_price: Decimal) -> Result<PriceChange> {
        let now = self.clock.now();

        let Some(mut change) = self.repository.find_by_transaction_id(position_id).await? else {
            let change = PriceChange {
                transaction_id: position_id,
                low_price: current_price,
                high_price: current_price,
                created_at: now,
                updated_at: now,
            };
            self.repository.save_price_change(&change).await?;
            tracing::debug!("Tracking price of position {} from {}", position_id, current_price);
            return Ok(change);
        };

        let mut moved = false;
        if current_price < change.low_price {
            change.low_price = current_price;
            moved = true;
        }
        if current_price > change.high_price {
            change.high_price = current_price;
            moved = true;
        }

        if moved {
            change.updated_at = now;
            self.repository.save_price_change(&change).await?;
        }

        Ok(change)
    }
}

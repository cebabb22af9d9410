// Outbound notifications about opened/closed positions and failures
pub mod telegram;

pub use telegram::TelegramNotifier;

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::NotificationConfig;
use crate::Result;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &str) -> Result<()>;
}

/// Writes notifications to the log only
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, message: &str) -> Result<()> {
        tracing::info!("📣 {}", message);
        Ok(())
    }
}

/// Telegram when a token and chat are configured, otherwise the log
pub fn from_config(config: &NotificationConfig) -> Arc<dyn Notifier> {
    match (&config.telegram_bot_token, &config.telegram_chat_id) {
        (Some(token), Some(chat_id)) if !token.is_empty() && !chat_id.is_empty() => {
            Arc::new(TelegramNotifier::new(token.clone(), chat_id.clone()))
        }
        _ => Arc::new(LogNotifier),
    }
}

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use super::Notifier;
use crate::error::BotError;
use crate::Result;

const TELEGRAM_API_URL: &str = "https://api.telegram.org";

/// Sends messages through the Telegram Bot API
pub struct TelegramNotifier {
    client: Client,
    base_url: String,
    bot_token: String,
    chat_id: String,
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
}

impl TelegramNotifier {
    pub fn new(bot_token: String, chat_id: String) -> Self {
        Self::with_base_url(TELEGRAM_API_URL.to_string(), bot_token, chat_id)
    }

    pub fn with_base_url(base_url: String, bot_token: String, chat_id: String) -> Self {
        Self {
            client: Client::new(),
            base_url,
            bot_token,
            chat_id,
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, message: &str) -> Result<()> {
        let url = format!("{}/bot{}/sendMessage", self.base_url, self.bot_token);

        let response = self
            .client
            .post(&url)
            .json(&SendMessage {
                chat_id: &self.chat_id,
                text: message,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BotError::Notification(format!(
                "Telegram returned {}: {}",
                status, body
            )));
        }

        Ok(())
    }
}

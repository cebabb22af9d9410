use thiserror::Error;

/// Errors raised by the order lifecycle engine and its collaborators
#[derive(Debug, Error)]
pub enum BotError {
    /// Exchange call failed or returned a non-success answer
    #[error("exchange error: {0}")]
    Exchange(String),

    /// A database write or read failed
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Not enough candle history to answer the request
    #[error("insufficient data: {0}")]
    Data(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("transaction {0} is already closed")]
    AlreadyClosed(i64),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid order: {0}")]
    InvalidOrder(String),

    #[error("notification error: {0}")]
    Notification(String),
}

impl From<sqlx::Error> for BotError {
    fn from(e: sqlx::Error) -> Self {
        BotError::Persistence(e.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for BotError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        BotError::Persistence(e.to_string())
    }
}

impl From<config::ConfigError> for BotError {
    fn from(e: config::ConfigError) -> Self {
        BotError::Configuration(e.to_string())
    }
}

impl From<reqwest::Error> for BotError {
    fn from(e: reqwest::Error) -> Self {
        BotError::Notification(e.to_string())
    }
}

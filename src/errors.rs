//! Error taxonomy for the trading core

use thiserror::Error;

/// Failures surfaced by the exchange gateway.
///
/// Only `Transient` is retried; everything else fails fast. The REST layer
/// translates exchange-specific error codes into this taxonomy so the rest
/// of the engine never sees raw exchange text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    #[error("transient exchange failure: {0}")]
    Transient(String),

    #[error("invalid API credentials")]
    InvalidCredentials,

    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("invalid order: {0}")]
    InvalidOrder(String),

    #[error("order not found: {0}")]
    OrderNotFound(String),

    #[error("unknown symbol: {0}")]
    SymbolNotFound(String),
}

impl ExchangeError {
    /// Whether the gateway retry loop may re-attempt the call.
    pub fn is_transient(&self) -> bool {
        matches!(self, ExchangeError::Transient(_))
    }
}

/// Errors that cross component boundaries inside the engine.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("bot {0} not found")]
    BotNotFound(i64),

    #[error("order {0} not found")]
    OrderNotFound(i64),

    #[error("user {0} not found")]
    UserNotFound(i64),

    #[error("user {0} has no API credentials configured")]
    MissingCredentials(i64),

    #[error("invalid bot configuration: {0}")]
    InvalidConfig(String),

    #[error("insufficient balance: available {available}, required {required}")]
    InsufficientBalance {
        available: rust_decimal::Decimal,
        required: rust_decimal::Decimal,
    },

    #[error("bot is in invalid state for operation: {0}")]
    InvalidState(String),

    #[error("credential cipher error: {0}")]
    Cipher(String),

    #[error("configuration error: {0}")]
    Settings(#[from] config::ConfigError),

    #[error("internal invariant violated: {0}")]
    Invariant(String),
}

/// Result type for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(ExchangeError::Transient("503".into()).is_transient());
        assert!(!ExchangeError::InvalidCredentials.is_transient());
        assert!(!ExchangeError::InsufficientFunds("balance too low".into()).is_transient());
        assert!(!ExchangeError::InvalidOrder("price below minimum".into()).is_transient());
        assert!(!ExchangeError::OrderNotFound("42".into()).is_transient());
    }

    #[test]
    fn test_engine_error_wraps_exchange_error() {
        let err: EngineError = ExchangeError::InvalidCredentials.into();
        assert!(matches!(
            err,
            EngineError::Exchange(ExchangeError::InvalidCredentials)
        ));
    }
}

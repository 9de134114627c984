//! Error taxonomy shared by the trading core.
//!
//! Leaf operations convert everything they see into one of these values;
//! nothing crosses a component boundary as a panic.

use thiserror::Error;

use crate::position::PositionKey;

/// Coarse classification of an exchange rejection, used by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeErrorKind {
    /// Position would exceed the limit allowed at the current leverage.
    MaxLeverageExceeded,
    /// Order value below the symbol's minimum notional.
    MinNotional,
    /// Setting was already at the requested value.
    NotModified,
    /// Network / decoding failure before the exchange answered.
    Transport,
    Other,
}

/// An exchange (or other collaborator) rejected the call.
#[derive(Debug, Clone, Error)]
#[error("exchange error {code}: {message}")]
pub struct ExchangeError {
    pub code: i64,
    pub message: String,
    pub kind: ExchangeErrorKind,
}

impl ExchangeError {
    pub fn new(code: i64, message: impl Into<String>, kind: ExchangeErrorKind) -> Self {
        Self {
            code,
            message: message.into(),
            kind,
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(-1, message, ExchangeErrorKind::Transport)
    }

    pub fn is(&self, kind: ExchangeErrorKind) -> bool {
        self.kind == kind
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        ExchangeError::transport(err.to_string())
    }
}

impl From<serde_json::Error> for ExchangeError {
    fn from(err: serde_json::Error) -> Self {
        ExchangeError::transport(format!("decode: {}", err))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ExchangeError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ExchangeError::transport(format!("websocket: {}", err))
    }
}

/// Position store misuse. These are logic errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("position {0} already tracked")]
    DuplicatePosition(PositionKey),
}

/// Result taxonomy of every trading operation: `Ok` is success.
#[derive(Debug, Clone, Error)]
pub enum TradeError {
    #[error("client error: {0}")]
    Client(#[from] ExchangeError),

    #[error("system error: {0}")]
    System(String),

    #[error("cancellation requested")]
    Cancelled,
}

impl TradeError {
    pub fn system(message: impl Into<String>) -> Self {
        TradeError::System(message.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TradeError::Cancelled)
    }
}

impl From<StoreError> for TradeError {
    fn from(err: StoreError) -> Self {
        TradeError::System(err.to_string())
    }
}

impl From<tokio::task::JoinError> for TradeError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            TradeError::Cancelled
        } else {
            TradeError::System(format!("task panicked: {}", err))
        }
    }
}

pub type TradeResult<T> = std::result::Result<T, TradeError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::PositionSide;

    #[test]
    fn test_store_error_becomes_system_error() {
        let key = PositionKey::new("BTCUSDT", PositionSide::Long);
        let err: TradeError = StoreError::DuplicatePosition(key).into();
        assert!(matches!(err, TradeError::System(msg) if msg.contains("BTCUSDT")));
    }

    #[test]
    fn test_exchange_error_kind() {
        let err = ExchangeError::new(110094, "min value", ExchangeErrorKind::MinNotional);
        assert!(err.is(ExchangeErrorKind::MinNotional));
        assert!(!err.is(ExchangeErrorKind::Other));

        let trade: TradeError = err.into();
        assert!(matches!(trade, TradeError::Client(_)));
        assert!(!trade.is_cancelled());
    }
}

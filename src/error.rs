// =============================================================================
// Error taxonomy — domain errors layered under anyhow::Result at the edges
// =============================================================================

use thiserror::Error;

/// Errors raised by the engine's own state machine, as opposed to transport
/// or serialization failures surfaced via `anyhow::Context`.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("config error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("position already exists for {account}/{symbol}")]
    PositionAlreadyExists { account: String, symbol: String },

    #[error("stop-loss placement failed for {account}/{symbol}: {reason}")]
    StopLossPlacementFailed {
        account: String,
        symbol: String,
        reason: String,
    },

    #[error("missing candle history for {symbol}")]
    MissingHistory { symbol: String },

    #[error("invariant violation in {account}/{symbol}: {detail}")]
    InvariantViolation {
        account: String,
        symbol: String,
        detail: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_account_and_symbol() {
        let err = EngineError::PositionAlreadyExists {
            account: "acct-a".to_string(),
            symbol: "BTCUSDT".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("acct-a"));
        assert!(msg.contains("BTCUSDT"));
    }
}

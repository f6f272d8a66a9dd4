// =============================================================================
// OrderGateway — exchange adapter port
// =============================================================================

pub mod binance;
pub mod rate_limit;

use anyhow::Result;
use async_trait::async_trait;

use crate::types::TriggerSide;

/// Price and quantity decimal precision for a symbol, as reported by the
/// exchange's instrument metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolPrecision {
    pub price_precision: u32,
    pub quantity_precision: u32,
}

/// Order ids returned by a successful paired entry submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryOrders {
    pub entry_order_id: u64,
    pub stop_order_id: u64,
}

/// Outcome of a paired entry+stop submission. The two legs are sent as one
/// batch, but the exchange may still accept one and reject the other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntrySubmission {
    /// Both legs accepted.
    BothPlaced(EntryOrders),
    /// The entry filled but the protective stop was rejected; the caller
    /// must treat this as `StopLossPlacementFailed` and close the position.
    EntryOnlyStopRejected { entry_order_id: u64, reason: String },
}

/// Exchange adapter boundary. `submit_entry_with_stop` and `place_trail_stop`
/// are the only calls allowed to mutate exchange-side order state; everything
/// else is read-only or best-effort cleanup.
#[async_trait]
pub trait OrderGateway: Send + Sync {
    async fn symbol_precision(&self, symbol: &str) -> Result<SymbolPrecision>;

    /// `true` if the exchange currently reports a non-zero position for
    /// `symbol` — used as the race guard in entry processing (P-race).
    async fn position_exists(&self, symbol: &str) -> Result<bool>;

    /// Submit a MARKET entry paired with a reduce-only STOP_MARKET
    /// protective stop in one logical unit.
    async fn submit_entry_with_stop(
        &self,
        symbol: &str,
        side: TriggerSide,
        quantity: f64,
        stop_price: f64,
    ) -> Result<EntrySubmission>;

    /// Idempotently install a trailing stop: if an equal STOP_MARKET already
    /// exists, this is a no-op success; otherwise cancel all open orders for
    /// the symbol and submit the new one.
    async fn place_trail_stop(&self, symbol: &str, for_side: TriggerSide, stop_price: f64) -> Result<()>;

    async fn cancel_all_open_orders(&self, symbol: &str) -> Result<()>;

    /// Close any open position on `symbol` with an opposite-side MARKET
    /// order sized to the exchange-reported quantity.
    async fn close_position(&self, symbol: &str) -> Result<()>;

    /// Age out locally cached rate-limit usage on the engine's periodic
    /// schedule. A no-op for adapters with no rate tracking of their own.
    fn reset_rate_limit_window(&self, window: RateLimitWindow) {
        let _ = window;
    }
}

/// Which local rate-limit counter a periodic reset call targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitWindow {
    TenSeconds,
    OneMinute,
    OneDay,
}

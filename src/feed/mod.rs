// =============================================================================
// Market data and user-stream adapter ports
// =============================================================================

pub mod market;
pub mod user_stream;

pub use market::MarketFeed;
pub use user_stream::{AccountUpdateEvent, OrderTradeUpdateEvent, UserStream};

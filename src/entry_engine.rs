// =============================================================================
// EntryEngine (ArmCheck) — breach detection and paired entry submission
// =============================================================================

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::account_state::AccountState;
use crate::config::PairConfig;
use crate::error::EngineError;
use crate::gateway::{EntrySubmission, OrderGateway};
use crate::locks::KeyedTryLock;
use crate::types::{PositionStatus, TriggerSide};

type AccountSymbolKey = (String, String);

/// Detects upward/downward threshold breaches on armed positions and drives
/// them through `armed -> entering -> open`.
pub struct EntryEngine {
    account_state: Arc<AccountState>,
    gateway: Arc<dyn OrderGateway>,
    entry_locks: KeyedTryLock<AccountSymbolKey>,
}

/// A detected breach, before any exchange interaction.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Breach {
    side: TriggerSide,
    stop_price: f64,
}

fn detect_breach(current_price: f64, lock_close_price: f64, movement_threshold_pct: f64) -> Option<Breach> {
    let m = movement_threshold_pct / 100.0;
    if current_price >= lock_close_price * (1.0 + m) {
        Some(Breach {
            side: TriggerSide::Long,
            stop_price: current_price * (1.0 - m),
        })
    } else if current_price <= lock_close_price * (1.0 - m) {
        Some(Breach {
            side: TriggerSide::Short,
            stop_price: current_price * (1.0 + m),
        })
    } else {
        None
    }
}

impl EntryEngine {
    pub fn new(account_state: Arc<AccountState>, gateway: Arc<dyn OrderGateway>) -> Self {
        Self {
            account_state,
            gateway,
            entry_locks: KeyedTryLock::new(),
        }
    }

    /// Evaluate one price tick for `(account, symbol)`. A no-op unless the
    /// position is armed and the price has breached the entry threshold.
    #[tracing::instrument(skip(self, pair), name = "entry_engine::on_tick")]
    pub async fn on_tick(
        &self,
        account: &str,
        symbol: &str,
        current_price: f64,
        pair: &PairConfig,
    ) -> Result<(), EngineError> {
        let position = match self.account_state.get_position(account, symbol) {
            Some(p) => p,
            None => return Ok(()),
        };

        if position.status != PositionStatus::Armed {
            return Ok(());
        }

        let (lock_close_price, movement_threshold) = match (position.lock_close_price, position.movement_threshold) {
            (Some(l), Some(m)) => (l, m),
            _ => return Ok(()),
        };

        let breach = match detect_breach(current_price, lock_close_price, movement_threshold) {
            Some(b) => b,
            None => return Ok(()),
        };

        let key = (account.to_string(), symbol.to_string());
        let _guard = match self.entry_locks.try_acquire(&key) {
            Some(g) => g,
            None => {
                debug!(account, symbol, "entry lock held, skipping breach this tick");
                return Ok(());
            }
        };

        self.account_state
            .update_position(account, symbol, |p| p.status = PositionStatus::Entering);

        match self.gateway.position_exists(symbol).await {
            Ok(true) => {
                warn!(account, symbol, "position already exists on exchange, aborting entry");
                self.account_state
                    .update_position(account, symbol, |p| p.status = PositionStatus::Armed);
                return Err(EngineError::PositionAlreadyExists {
                    account: account.to_string(),
                    symbol: symbol.to_string(),
                });
            }
            Ok(false) => {}
            Err(e) => {
                warn!(account, symbol, error = %e, "failed to check exchange position state, aborting entry");
                self.account_state
                    .update_position(account, symbol, |p| p.status = PositionStatus::Armed);
                return Err(EngineError::Transport(e.to_string()));
            }
        }

        let precision = match self.gateway.symbol_precision(symbol).await {
            Ok(p) => p,
            Err(e) => {
                self.account_state
                    .update_position(account, symbol, |p| p.status = PositionStatus::Armed);
                return Err(EngineError::Transport(e.to_string()));
            }
        };
        let raw_qty = pair.usdt_amount / current_price;
        let factor = 10f64.powi(precision.quantity_precision as i32);
        let qty = (raw_qty * factor).round() / factor;

        let submission = self
            .gateway
            .submit_entry_with_stop(symbol, breach.side, qty, breach.stop_price)
            .await;

        match submission {
            Ok(EntrySubmission::BothPlaced(orders)) => {
                info!(
                    account,
                    symbol,
                    side = %breach.side,
                    entry_order_id = orders.entry_order_id,
                    stop_order_id = orders.stop_order_id,
                    "entry and protective stop placed"
                );
                // Remains `entering` until the user-data stream confirms the
                // fill (§4.3 step 7); that confirmation drives the
                // entering -> open transition and the ladder build.
                Ok(())
            }
            Ok(EntrySubmission::EntryOnlyStopRejected { entry_order_id, reason }) => {
                warn!(account, symbol, entry_order_id, reason = %reason, "stop-loss rejected, closing just-opened position");
                if let Err(e) = self.gateway.close_position(symbol).await {
                    warn!(account, symbol, error = %e, "failed to close position after stop-loss rejection");
                }
                self.account_state.update_position(account, symbol, |p| p.clear());
                Err(EngineError::StopLossPlacementFailed {
                    account: account.to_string(),
                    symbol: symbol.to_string(),
                    reason,
                })
            }
            Err(e) => {
                warn!(account, symbol, error = %e, "entry submission failed, reverting to armed");
                self.account_state
                    .update_position(account, symbol, |p| p.status = PositionStatus::Armed);
                Err(EngineError::Transport(e.to_string()))
            }
        }
    }
}

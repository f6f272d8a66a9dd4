// =============================================================================
// TriggerRunner — ladder advance and trailing-stop maintenance for open
// positions
// =============================================================================

use std::sync::Arc;

use tracing::{info, warn};

use crate::account_state::AccountState;
use crate::error::EngineError;
use crate::gateway::OrderGateway;
use crate::locks::KeyedTryLock;
use crate::types::{Position, PositionStatus};

/// Exactly 3 attempts, no backoff, per ladder-crossing event (§4.5/§5).
const MAX_RETRIES: u32 = 3;

type AccountSymbolKey = (String, String);

/// Drives an `open` position's trigger ladder: on each tick, checks whether
/// price has crossed the next rung, and if so installs the paired trailing
/// stop before popping that rung off the ladder. Stop placement is
/// idempotent at the gateway layer, so a retried tick after a transient
/// failure is safe to repeat.
pub struct TriggerRunner {
    account_state: Arc<AccountState>,
    gateway: Arc<dyn OrderGateway>,
    trigger_locks: KeyedTryLock<AccountSymbolKey>,
}

impl TriggerRunner {
    pub fn new(account_state: Arc<AccountState>, gateway: Arc<dyn OrderGateway>) -> Self {
        Self {
            account_state,
            gateway,
            trigger_locks: KeyedTryLock::new(),
        }
    }

    /// Evaluate one price tick for `(account, symbol)`. A no-op unless the
    /// position is open and a ladder rung remains.
    #[tracing::instrument(skip(self), name = "trigger_runner::on_tick")]
    pub async fn on_tick(&self, account: &str, symbol: &str, current_price: f64) -> Result<(), EngineError> {
        let position = match self.account_state.get_position(account, symbol) {
            Some(p) => p,
            None => return Ok(()),
        };

        if position.status != PositionStatus::Open {
            return Ok(());
        }

        let side = match position.trigger_side {
            Some(s) => s,
            None => return Ok(()),
        };

        let crossed = match side {
            crate::types::TriggerSide::Long => position.triggers.first().is_some_and(|&t| current_price >= t),
            crate::types::TriggerSide::Short => position.triggers.first().is_some_and(|&t| current_price <= t),
        };
        if !crossed {
            return Ok(());
        }

        let key = (account.to_string(), symbol.to_string());
        let _guard = match self.trigger_locks.try_acquire(&key) {
            Some(g) => g,
            None => return Ok(()),
        };

        // Re-read under the lock: another task may have already advanced the
        // ladder between the unguarded check above and acquiring the lock.
        let position = match self.account_state.get_position(account, symbol) {
            Some(p) if p.status == PositionStatus::Open => p,
            _ => return Ok(()),
        };
        let stop_price = match position.stop_prices.first() {
            Some(&s) => s,
            None => return Ok(()),
        };

        // Retry the placement up to MAX_RETRIES times within this single
        // crossing event, tight loop with no backoff, rather than spreading
        // attempts across separate ticks.
        let mut last_err = None;
        for attempt in 1..=MAX_RETRIES {
            match self.gateway.place_trail_stop(symbol, side, stop_price).await {
                Ok(()) => {
                    self.advance_ladder(account, symbol, &position);
                    return Ok(());
                }
                Err(e) => {
                    warn!(account, symbol, attempt, error = %e, "trailing stop placement failed");
                    last_err = Some(e);
                }
            }
        }

        warn!(account, symbol, "trigger ladder exhausted retries, closing position");
        if let Err(close_err) = self.gateway.close_position(symbol).await {
            warn!(account, symbol, error = %close_err, "failed to close position after ladder exhaustion");
        }
        self.account_state.update_position(account, symbol, |p| p.clear());
        Err(EngineError::Transport(last_err.expect("loop ran at least once").to_string()))
    }

    fn advance_ladder(&self, account: &str, symbol: &str, before: &Position) {
        let next_trigger = before.triggers.first().copied();
        let next_stop = before.stop_prices.first().copied();
        self.account_state.update_position(account, symbol, |p| {
            if !p.triggers.is_empty() {
                p.triggers.remove(0);
            }
            if !p.stop_prices.is_empty() {
                p.stop_prices.remove(0);
            }
        });
        info!(
            account,
            symbol,
            trigger = next_trigger,
            stop = next_stop,
            remaining = before.triggers.len().saturating_sub(1),
            "ladder rung advanced"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PairConfig;
    use crate::gateway::{EntrySubmission, SymbolPrecision};
    use crate::state_store::{AccountDocument, StateStore};
    use crate::types::TriggerSide;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct InMemoryStore {
        docs: parking_lot::Mutex<HashMap<String, AccountDocument>>,
    }
    impl InMemoryStore {
        fn new() -> Self {
            Self {
                docs: parking_lot::Mutex::new(HashMap::new()),
            }
        }
    }
    impl StateStore for InMemoryStore {
        fn load(&self, account: &str) -> Result<AccountDocument> {
            Ok(self.docs.lock().get(account).cloned().unwrap_or_default())
        }
        fn save(&self, account: &str, document: &AccountDocument) -> Result<()> {
            self.docs.lock().insert(account.to_string(), document.clone());
            Ok(())
        }
    }

    struct StubGateway {
        stop_calls: AtomicU32,
        fail_stop: bool,
    }

    #[async_trait]
    impl OrderGateway for StubGateway {
        async fn symbol_precision(&self, _symbol: &str) -> Result<SymbolPrecision> {
            Ok(SymbolPrecision {
                price_precision: 2,
                quantity_precision: 3,
            })
        }
        async fn position_exists(&self, _symbol: &str) -> Result<bool> {
            Ok(true)
        }
        async fn submit_entry_with_stop(
            &self,
            _symbol: &str,
            _side: TriggerSide,
            _quantity: f64,
            _stop_price: f64,
        ) -> Result<EntrySubmission> {
            unreachable!("not exercised in trigger runner tests")
        }
        async fn place_trail_stop(&self, _symbol: &str, _for_side: TriggerSide, _stop_price: f64) -> Result<()> {
            self.stop_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_stop {
                anyhow::bail!("simulated stop placement failure");
            }
            Ok(())
        }
        async fn cancel_all_open_orders(&self, _symbol: &str) -> Result<()> {
            Ok(())
        }
        async fn close_position(&self, _symbol: &str) -> Result<()> {
            Ok(())
        }
    }

    fn open_long_position() -> Position {
        Position {
            status: PositionStatus::Open,
            entry_price: Some(100.0),
            trigger_side: Some(TriggerSide::Long),
            triggers: vec![101.0, 102.0, 103.0],
            stop_prices: vec![99.0, 100.0, 101.0],
            ..Position::default()
        }
    }

    fn pair() -> PairConfig {
        PairConfig {
            symbol: "BTCUSDT".to_string(),
            threshold: 1.0,
            fees_exemption_percentage: 0.1,
            num_previous_candles: 3,
            usdt_amount: 100.0,
            webhook_url: None,
            trigger_count: 5,
        }
    }

    #[tokio::test]
    async fn crossing_trigger_advances_ladder() {
        let store = Arc::new(InMemoryStore::new());
        let state = Arc::new(AccountState::new(store));
        state.initialize(&["acct-a".to_string()], &[pair()]);
        state.update_position("acct-a", "BTCUSDT", |p| *p = open_long_position());

        let gateway = Arc::new(StubGateway {
            stop_calls: AtomicU32::new(0),
            fail_stop: false,
        });
        let runner = TriggerRunner::new(Arc::clone(&state), gateway.clone() as Arc<dyn OrderGateway>);

        runner.on_tick("acct-a", "BTCUSDT", 101.5).await.unwrap();

        let after = state.get_position("acct-a", "BTCUSDT").unwrap();
        assert_eq!(after.triggers, vec![102.0, 103.0]);
        assert_eq!(after.stop_prices, vec![100.0, 101.0]);
        assert_eq!(gateway.stop_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn below_trigger_is_a_no_op() {
        let store = Arc::new(InMemoryStore::new());
        let state = Arc::new(AccountState::new(store));
        state.initialize(&["acct-a".to_string()], &[pair()]);
        state.update_position("acct-a", "BTCUSDT", |p| *p = open_long_position());

        let gateway = Arc::new(StubGateway {
            stop_calls: AtomicU32::new(0),
            fail_stop: false,
        });
        let runner = TriggerRunner::new(Arc::clone(&state), gateway.clone() as Arc<dyn OrderGateway>);

        runner.on_tick("acct-a", "BTCUSDT", 100.5).await.unwrap();
        assert_eq!(gateway.stop_calls.load(Ordering::SeqCst), 0);
        let after = state.get_position("acct-a", "BTCUSDT").unwrap();
        assert_eq!(after.triggers.len(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_closes_position() {
        let store = Arc::new(InMemoryStore::new());
        let state = Arc::new(AccountState::new(store));
        state.initialize(&["acct-a".to_string()], &[pair()]);
        state.update_position("acct-a", "BTCUSDT", |p| *p = open_long_position());

        let gateway = Arc::new(StubGateway {
            stop_calls: AtomicU32::new(0),
            fail_stop: true,
        });
        let runner = TriggerRunner::new(Arc::clone(&state), gateway.clone() as Arc<dyn OrderGateway>);

        let err = runner.on_tick("acct-a", "BTCUSDT", 101.5).await.unwrap_err();
        assert!(matches!(err, EngineError::Transport(_)));
        assert_eq!(gateway.stop_calls.load(Ordering::SeqCst), MAX_RETRIES);

        let after = state.get_position("acct-a", "BTCUSDT").unwrap();
        assert_eq!(after.status, PositionStatus::Idle);
    }
}

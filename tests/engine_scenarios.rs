// =============================================================================
// Multi-module scenario tests: arm -> enter -> open -> ladder sweep -> flat,
// exercising AccountState + EntryEngine + TriggerRunner together against a
// mock OrderGateway, the same way production wires them in Engine::dispatch_tick.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use momentum_ladder::account_state::AccountState;
use momentum_ladder::config::PairConfig;
use momentum_ladder::engine::can_arm;
use momentum_ladder::entry_engine::EntryEngine;
use momentum_ladder::error::EngineError;
use momentum_ladder::gateway::{EntryOrders, EntrySubmission, OrderGateway, SymbolPrecision};
use momentum_ladder::state_store::{AccountDocument, StateStore};
use momentum_ladder::trigger_ladder;
use momentum_ladder::trigger_runner::TriggerRunner;
use momentum_ladder::types::{Position, PositionStatus, TriggerSide};

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

/// A gateway stub whose entry submission and stop placement behavior is
/// steered per-test: always succeeds unless told otherwise, and counts calls
/// so tests can assert exactly how many times the exchange was touched.
struct MockGateway {
    position_exists: bool,
    entry_calls: AtomicU32,
    stop_calls: AtomicU32,
    next_entry_order_id: AtomicU32,
}

impl MockGateway {
    fn new() -> Self {
        Self {
            position_exists: false,
            entry_calls: AtomicU32::new(0),
            stop_calls: AtomicU32::new(0),
            next_entry_order_id: AtomicU32::new(1),
        }
    }
}

#[async_trait]
impl OrderGateway for MockGateway {
    async fn symbol_precision(&self, _symbol: &str) -> Result<SymbolPrecision> {
        Ok(SymbolPrecision {
            price_precision: 2,
            quantity_precision: 3,
        })
    }
    async fn position_exists(&self, _symbol: &str) -> Result<bool> {
        Ok(self.position_exists)
    }
    async fn submit_entry_with_stop(
        &self,
        _symbol: &str,
        _side: TriggerSide,
        _quantity: f64,
        _stop_price: f64,
    ) -> Result<EntrySubmission> {
        self.entry_calls.fetch_add(1, Ordering::SeqCst);
        let id = self.next_entry_order_id.fetch_add(1, Ordering::SeqCst) as u64;
        Ok(EntrySubmission::BothPlaced(EntryOrders {
            entry_order_id: id,
            stop_order_id: id + 1,
        }))
    }
    async fn place_trail_stop(&self, _symbol: &str, _for_side: TriggerSide, _stop_price: f64) -> Result<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    async fn cancel_all_open_orders(&self, _symbol: &str) -> Result<()> {
        Ok(())
    }
    async fn close_position(&self, _symbol: &str) -> Result<()> {
        Ok(())
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

fn armed_position(lock_close_price: f64, movement_threshold: f64) -> Position {
    Position {
        status: PositionStatus::Armed,
        lock_close_price: Some(lock_close_price),
        movement_threshold: Some(movement_threshold),
        ..Position::default()
    }
}

fn new_state() -> Arc<AccountState> {
    Arc::new(AccountState::new(Arc::new(InMemoryStore::new())))
}

/// Simulates the `AccountUpdateEvent` handling `Engine::handle_account_update`
/// performs once the user-data stream confirms an entering position's fill:
/// builds the ladder and transitions `entering -> open`.
fn confirm_fill(state: &AccountState, account: &str, symbol: &str, entry_price: f64, side: TriggerSide, pair: &PairConfig) {
    let position = state.get_position(account, symbol).unwrap();
    let movement_threshold = position.movement_threshold.unwrap_or(0.0);
    let ladder = trigger_ladder::build(entry_price, side, movement_threshold, pair.fees_exemption_percentage, pair.trigger_count);
    state.update_position(account, symbol, |p| {
        p.status = PositionStatus::Open;
        p.entry_price = Some(entry_price);
        p.trigger_side = Some(side);
        p.triggers = ladder.triggers;
        p.stop_prices = ladder.stop_prices;
    });
}

// S2: a full sweep of all 5 rungs advances the ladder exactly once per rung
// and closes no position along the way.
#[tokio::test]
async fn s2_full_ladder_sweep_advances_every_rung() {
    let state = new_state();
    state.initialize(&["acct-a".to_string()], &[pair()]);

    let gateway = Arc::new(MockGateway::new());
    confirm_fill_direct(&state, "acct-a", "BTCUSDT", 100.0, TriggerSide::Long, &pair());
    let runner = TriggerRunner::new(Arc::clone(&state), gateway.clone() as Arc<dyn OrderGateway>);

    let rungs = state.get_position("acct-a", "BTCUSDT").unwrap().triggers.clone();
    assert_eq!(rungs.len(), 5);

    for trigger_price in &rungs {
        runner.on_tick("acct-a", "BTCUSDT", *trigger_price).await.unwrap();
    }

    let after = state.get_position("acct-a", "BTCUSDT").unwrap();
    assert!(after.triggers.is_empty());
    assert!(after.stop_prices.is_empty());
    assert_eq!(after.status, PositionStatus::Open);
    assert_eq!(gateway.stop_calls.load(Ordering::SeqCst), 5);
}

fn confirm_fill_direct(state: &AccountState, account: &str, symbol: &str, lock_close_price: f64, side: TriggerSide, pair: &PairConfig) {
    state.update_position(account, symbol, |p| {
        p.status = PositionStatus::Armed;
        p.lock_close_price = Some(lock_close_price);
        p.movement_threshold = Some(1.0);
    });
    confirm_fill(state, account, symbol, lock_close_price, side, pair);
}

// S3: armed -> entering -> open, driven by EntryEngine.on_tick then the
// fill-confirmation path, with no exchange position already present.
#[tokio::test]
async fn s3_arm_to_open_full_flow() {
    let pair = pair();
    let state = new_state();
    state.initialize(&["acct-a".to_string()], &[pair.clone()]);
    state.update_position("acct-a", "BTCUSDT", |p| *p = armed_position(100.0, 1.0));

    let gateway = Arc::new(MockGateway::new());
    let entry_engine = EntryEngine::new(Arc::clone(&state), gateway.clone() as Arc<dyn OrderGateway>);

    entry_engine.on_tick("acct-a", "BTCUSDT", 101.01, &pair).await.unwrap();

    let entering = state.get_position("acct-a", "BTCUSDT").unwrap();
    assert_eq!(entering.status, PositionStatus::Entering);
    assert_eq!(gateway.entry_calls.load(Ordering::SeqCst), 1);

    confirm_fill(&state, "acct-a", "BTCUSDT", 101.01, TriggerSide::Long, &pair);

    let open = state.get_position("acct-a", "BTCUSDT").unwrap();
    assert_eq!(open.status, PositionStatus::Open);
    assert_eq!(open.triggers.len(), pair.trigger_count);
    assert_eq!(open.entry_price, Some(101.01));
}

// S4: once open, a fresh arm-worthy movement must not re-arm the position —
// mirrors the engine's `run_movement_detector` skip for entering/open.
#[tokio::test]
async fn s4_no_rearm_while_open() {
    let pair = pair();
    let state = new_state();
    state.initialize(&["acct-a".to_string()], &[pair.clone()]);
    confirm_fill_direct(&state, "acct-a", "BTCUSDT", 100.0, TriggerSide::Long, &pair);

    let position = state.get_position("acct-a", "BTCUSDT").unwrap();
    assert_eq!(position.status, PositionStatus::Open);
    assert!(!can_arm(position.status));

    if can_arm(position.status) {
        state.update_position("acct-a", "BTCUSDT", |p| p.status = PositionStatus::Armed);
    }

    let after = state.get_position("acct-a", "BTCUSDT").unwrap();
    assert_eq!(after.status, PositionStatus::Open);
    assert_eq!(after.triggers.len(), pair.trigger_count);
}

// S5: two ticks racing the same crossed rung must install the stop exactly
// once — the second tick observes the lock already held and is a no-op.
#[tokio::test]
async fn s5_concurrent_ticks_suppress_double_fire() {
    let pair = pair();
    let state = new_state();
    state.initialize(&["acct-a".to_string()], &[pair.clone()]);
    confirm_fill_direct(&state, "acct-a", "BTCUSDT", 100.0, TriggerSide::Long, &pair);

    let trigger_price = state.get_position("acct-a", "BTCUSDT").unwrap().triggers[0];
    let gateway = Arc::new(MockGateway::new());
    let runner = Arc::new(TriggerRunner::new(Arc::clone(&state), gateway.clone() as Arc<dyn OrderGateway>));

    let r1 = Arc::clone(&runner);
    let r2 = Arc::clone(&runner);
    let (res1, res2) = tokio::join!(
        tokio::spawn(async move { r1.on_tick("acct-a", "BTCUSDT", trigger_price).await }),
        tokio::spawn(async move { r2.on_tick("acct-a", "BTCUSDT", trigger_price).await }),
    );
    res1.unwrap().unwrap();
    res2.unwrap().unwrap();

    assert_eq!(gateway.stop_calls.load(Ordering::SeqCst), 1);
    let after = state.get_position("acct-a", "BTCUSDT").unwrap();
    assert_eq!(after.triggers.len(), pair.trigger_count - 1);
}

// S6: the exchange reporting a flat position resets the record to idle
// regardless of what state it was previously in.
#[tokio::test]
async fn s6_flat_from_exchange_resets_to_idle() {
    let pair = pair();
    let state = new_state();
    state.initialize(&["acct-a".to_string()], &[pair.clone()]);
    confirm_fill_direct(&state, "acct-a", "BTCUSDT", 100.0, TriggerSide::Long, &pair);
    assert_eq!(state.get_position("acct-a", "BTCUSDT").unwrap().status, PositionStatus::Open);

    // Mirrors Engine::handle_account_update's `position_amount == 0.0` branch.
    state.update_position("acct-a", "BTCUSDT", |p| p.clear());

    let after = state.get_position("acct-a", "BTCUSDT").unwrap();
    assert_eq!(after, Position::default());
    assert_eq!(after.status, PositionStatus::Idle);
}

// Invariant violation path (§7): a corrupt patch is caught, logged, and the
// position is forced back to idle rather than left invalid.
#[tokio::test]
async fn invariant_violation_forces_idle() {
    let state = new_state();
    state.initialize(&["acct-a".to_string()], &[pair()]);

    let result = state.update_position("acct-a", "BTCUSDT", |p| {
        p.status = PositionStatus::Open;
        // entry_price/trigger_side left unset: violates the Open invariant.
    });

    let after = result.unwrap();
    assert_eq!(after.status, PositionStatus::Idle);
    assert_eq!(after, Position::default());
}

#[test]
fn invariant_violation_variant_is_constructible() {
    let err = EngineError::InvariantViolation {
        account: "acct-a".to_string(),
        symbol: "BTCUSDT".to_string(),
        detail: "test".to_string(),
    };
    assert!(err.to_string().contains("acct-a"));
}

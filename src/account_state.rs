// =============================================================================
// AccountState — per-(account, symbol) position records, write-through
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{error, info, warn};

use crate::config::PairConfig;
use crate::error::EngineError;
use crate::state_store::{self, AccountDocument, StateStore};
use crate::types::Position;

/// Owns every `Position` in the process. All reads return an owned snapshot;
/// nothing outside this module ever holds a live reference into the map.
pub struct AccountState {
    positions: RwLock<HashMap<(String, String), Position>>,
    store: Arc<dyn StateStore>,
}

impl AccountState {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            positions: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// Load persisted state for each account and create `idle` positions for
    /// any configured pair the account has no record of yet. Persists once
    /// per account if any new entries were created.
    pub fn initialize(&self, account_names: &[String], pairs: &[PairConfig]) {
        for account in account_names {
            let document = match self.store.load(account) {
                Ok(doc) => doc,
                Err(e) => {
                    warn!(account, error = %e, "failed to load account state, starting fresh");
                    AccountDocument::default()
                }
            };

            let mut created_new = false;
            let mut positions = self.positions.write();
            for pair in pairs {
                let key = (account.clone(), pair.symbol.clone());
                let position = document
                    .positions
                    .get(&pair.symbol)
                    .cloned()
                    .unwrap_or_else(|| {
                        created_new = true;
                        Position::default()
                    });
                positions.insert(key, position);
            }
            drop(positions);

            if created_new {
                self.persist_account(account);
            }

            info!(account, pairs = pairs.len(), "account state initialized");
        }
    }

    /// Snapshot of one (account, symbol) position, or `None` if the pair is
    /// not configured for that account.
    pub fn get_position(&self, account: &str, symbol: &str) -> Option<Position> {
        self.positions
            .read()
            .get(&(account.to_string(), symbol.to_string()))
            .cloned()
    }

    /// Mutate the (account, symbol) position in place via `patch`, then
    /// persist the account's whole document. Returns the mutated snapshot,
    /// or `None` if the pair is not tracked for that account.
    pub fn update_position(
        &self,
        account: &str,
        symbol: &str,
        patch: impl FnOnce(&mut Position),
    ) -> Option<Position> {
        let key = (account.to_string(), symbol.to_string());
        let updated = {
            let mut positions = self.positions.write();
            let position = positions.get_mut(&key)?;
            patch(position);
            if let Err(detail) = position.check_invariants() {
                // §7: an invariant violation forces the position to idle; the
                // next exchange ACCOUNT_UPDATE reconciles it from the real
                // position rather than this layer reaching for the gateway.
                let violation = EngineError::InvariantViolation {
                    account: account.to_string(),
                    symbol: symbol.to_string(),
                    detail,
                };
                error!(account, symbol, error = %violation, "position invariant violated, forcing idle");
                position.clear();
            }
            position.clone()
        };
        self.persist_account(account);
        Some(updated)
    }

    fn persist_account(&self, account: &str) {
        let document = {
            let positions = self.positions.read();
            let mut doc = AccountDocument::default();
            for ((acct, symbol), position) in positions.iter() {
                if acct == account {
                    doc.positions.insert(symbol.clone(), position.clone());
                }
            }
            doc
        };
        state_store::save_best_effort(self.store.as_ref(), account, &document);
    }

    /// All (account, symbol) pairs currently tracked, for iteration in the
    /// engine loop.
    pub fn tracked_keys(&self) -> Vec<(String, String)> {
        self.positions.read().keys().cloned().collect()
    }
}

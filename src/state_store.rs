// =============================================================================
// StateStore — per-account JSON persistence, atomic tmp + rename write
// =============================================================================
//
// Adapted from the runtime-config load/save pattern this project used for a
// single hot-reloadable document: here each account gets its own file, and
// a save failure is logged rather than propagated, since the in-memory
// `AccountState` is the authority during a running session — persistence
// only matters for the next restart.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::Position;

/// On-disk shape of one account's state file:
/// `{ "<account_name>": { "positions": { "<symbol>": Position } } }`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountDocument {
    pub positions: HashMap<String, Position>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(flatten)]
    accounts: HashMap<String, AccountDocument>,
}

/// Port over account-state persistence. The concrete implementation writes
/// one `account-data-<name>.json` file per account in `dir`.
pub trait StateStore: Send + Sync {
    fn load(&self, account: &str) -> Result<AccountDocument>;
    fn save(&self, account: &str, document: &AccountDocument) -> Result<()>;
}

/// Filesystem-backed `StateStore` using the same atomic tmp+rename write
/// discipline as the config persistence layer.
pub struct JsonFileStateStore {
    dir: PathBuf,
}

impl JsonFileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, account: &str) -> PathBuf {
        self.dir.join(format!("account-data-{account}.json"))
    }
}

impl StateStore for JsonFileStateStore {
    fn load(&self, account: &str) -> Result<AccountDocument> {
        let path = self.path_for(account);
        if !path.exists() {
            info!(account, path = %path.display(), "no existing state file, starting fresh");
            return Ok(AccountDocument::default());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read account state from {}", path.display()))?;

        let mut file: StateFile = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse account state from {}", path.display()))?;

        let mut document = file.accounts.remove(account).unwrap_or_default();
        for position in document.positions.values_mut() {
            position.is_placing_stop_loss_running = false;
        }

        info!(account, positions = document.positions.len(), "account state loaded");
        Ok(document)
    }

    fn save(&self, account: &str, document: &AccountDocument) -> Result<()> {
        let path = self.path_for(account);

        let mut accounts = HashMap::new();
        accounts.insert(account.to_string(), document.clone());
        let file = StateFile { accounts };

        let content = serde_json::to_string_pretty(&file)
            .context("failed to serialize account state to JSON")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp account state to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &path)
            .with_context(|| format!("failed to rename tmp account state to {}", path.display()))?;

        Ok(())
    }
}

/// Write-through save that only logs on failure, matching the engine's
/// "in-memory is the source of truth during a session" policy.
pub fn save_best_effort(store: &dyn StateStore, account: &str, document: &AccountDocument) {
    if let Err(e) = store.save(account, document) {
        warn!(account, error = %e, "failed to persist account state");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PositionStatus;

    #[test]
    fn round_trip_preserves_positions() {
        let dir = std::env::temp_dir().join(format!("momentum-ladder-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let store = JsonFileStateStore::new(&dir);

        let mut document = AccountDocument::default();
        let mut position = Position::default();
        position.status = PositionStatus::Armed;
        position.lock_close_price = Some(100.0);
        position.movement_threshold = Some(1.0);
        document.positions.insert("BTCUSDT".to_string(), position.clone());

        store.save("acct-a", &document).unwrap();
        let loaded = store.load("acct-a").unwrap();

        assert_eq!(loaded.positions.get("BTCUSDT"), Some(&position));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn loading_missing_file_returns_empty_document() {
        let dir = std::env::temp_dir().join(format!("momentum-ladder-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let store = JsonFileStateStore::new(&dir);
        let loaded = store.load("nonexistent").unwrap();
        assert!(loaded.positions.is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn load_resets_stop_loss_running_flag() {
        let dir = std::env::temp_dir().join(format!("momentum-ladder-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let store = JsonFileStateStore::new(&dir);

        let mut document = AccountDocument::default();
        let mut position = Position::default();
        position.is_placing_stop_loss_running = true;
        document.positions.insert("BTCUSDT".to_string(), position);
        store.save("acct-a", &document).unwrap();

        let loaded = store.load("acct-a").unwrap();
        assert!(!loaded.positions["BTCUSDT"].is_placing_stop_loss_running);
        std::fs::remove_dir_all(&dir).ok();
    }
}

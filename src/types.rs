// =============================================================================
// Core value types — candles, positions, and the directional enums that
// thread through the arm/entry/trigger state machine
// =============================================================================

use serde::{Deserialize, Serialize};

/// One closed-or-forming OHLCV bar for a symbol at a given interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Absolute close-to-open move as a percentage, as used throughout the
    /// movement detector and ladder math: `|close - open| / open * 100`.
    pub fn abs_diff_pct(&self) -> f64 {
        if self.open == 0.0 {
            return 0.0;
        }
        (self.close - self.open).abs() / self.open * 100.0
    }
}

/// Directional side of an open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerSide {
    Long,
    Short,
}

impl std::fmt::Display for TriggerSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
        }
    }
}

/// Lifecycle stage of a single (account, symbol) position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    /// No lock price set; waiting for a movement-detector arm.
    Idle,
    /// Lock price and movement threshold set; waiting for a breach.
    Armed,
    /// Entry orders submitted; waiting for the exchange fill confirmation.
    Entering,
    /// Position is live on the exchange with an active trigger ladder.
    Open,
}

impl Default for PositionStatus {
    fn default() -> Self {
        Self::Idle
    }
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Armed => write!(f, "armed"),
            Self::Entering => write!(f, "entering"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Per-(account, symbol) position record. Exclusively owned and mutated by
/// `AccountState`; every other component only ever sees an owned snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    #[serde(default)]
    pub status: PositionStatus,
    #[serde(default)]
    pub entry_price: Option<f64>,
    #[serde(default)]
    pub lock_close_price: Option<f64>,
    #[serde(default)]
    pub movement_threshold: Option<f64>,
    #[serde(default)]
    pub trigger_side: Option<TriggerSide>,
    #[serde(default)]
    pub triggers: Vec<f64>,
    #[serde(default)]
    pub stop_prices: Vec<f64>,
    /// Persisted for document-shape compatibility only; always reset to
    /// `false` on load. The authoritative mutual-exclusion mechanism is the
    /// trigger lock in `locks.rs`.
    #[serde(default)]
    pub is_placing_stop_loss_running: bool,
}

impl Default for Position {
    fn default() -> Self {
        Self {
            status: PositionStatus::Idle,
            entry_price: None,
            lock_close_price: None,
            movement_threshold: None,
            trigger_side: None,
            triggers: Vec::new(),
            stop_prices: Vec::new(),
            is_placing_stop_loss_running: false,
        }
    }
}

impl Position {
    /// Check the field-nullability and shape invariants that must hold after
    /// every mutation (P1, P2, P4 and the triggers/stop_prices length
    /// pairing).
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.triggers.len() != self.stop_prices.len() {
            return Err(format!(
                "triggers len {} != stop_prices len {}",
                self.triggers.len(),
                self.stop_prices.len()
            ));
        }
        match self.status {
            PositionStatus::Open => {
                if !matches!(self.entry_price, Some(p) if p > 0.0) {
                    return Err("open position missing positive entry_price".to_string());
                }
                if self.trigger_side.is_none() {
                    return Err("open position missing trigger_side".to_string());
                }
            }
            PositionStatus::Armed | PositionStatus::Entering => {
                if !matches!(self.lock_close_price, Some(p) if p > 0.0) {
                    return Err(format!("{} position missing positive lock_close_price", self.status));
                }
                if !matches!(self.movement_threshold, Some(m) if m > 0.0) {
                    return Err(format!("{} position missing positive movement_threshold", self.status));
                }
            }
            PositionStatus::Idle => {}
        }
        Ok(())
    }

    /// Reset to a fully cleared idle position, as done when the exchange
    /// reports a flat position (`positionAmount == 0`).
    pub fn clear(&mut self) {
        *self = Position::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abs_diff_pct_matches_formula() {
        let c = Candle {
            open_time: 0,
            close_time: 1,
            open: 100.0,
            high: 101.0,
            low: 99.0,
            close: 102.0,
            volume: 1.0,
        };
        assert!((c.abs_diff_pct() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn default_position_is_idle_and_valid() {
        let p = Position::default();
        assert_eq!(p.status, PositionStatus::Idle);
        assert!(p.check_invariants().is_ok());
    }

    #[test]
    fn open_position_requires_entry_price_and_side() {
        let mut p = Position::default();
        p.status = PositionStatus::Open;
        assert!(p.check_invariants().is_err());
        p.entry_price = Some(100.0);
        p.trigger_side = Some(TriggerSide::Long);
        assert!(p.check_invariants().is_ok());
    }

    #[test]
    fn mismatched_ladder_lengths_are_invalid() {
        let mut p = Position::default();
        p.triggers = vec![1.0, 2.0];
        p.stop_prices = vec![1.0];
        assert!(p.check_invariants().is_err());
    }

    #[test]
    fn clear_resets_to_default() {
        let mut p = Position {
            status: PositionStatus::Open,
            entry_price: Some(1.0),
            trigger_side: Some(TriggerSide::Short),
            triggers: vec![1.0],
            stop_prices: vec![1.0],
            ..Position::default()
        };
        p.clear();
        assert_eq!(p, Position::default());
    }
}

// =============================================================================
// CandleHistory — fixed-capacity rolling window of closed candles per symbol
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;

use crate::error::EngineError;
use crate::types::Candle;

/// Thread-safe rolling history of closed candles, one ring per symbol.
///
/// Capacity is fixed at construction (20 per the ladder/movement-detector
/// math) and FIFO-evicted, the way `CandleBuffer` trims its per-key ring in
/// the kline-stream consumer this module is adapted from — but here every
/// entry is a finalized candle, never an in-progress one.
pub struct CandleHistory {
    rings: RwLock<HashMap<String, VecDeque<Candle>>>,
    capacity: usize,
    known_symbols: Vec<String>,
}

impl CandleHistory {
    pub fn new(capacity: usize, known_symbols: Vec<String>) -> Self {
        Self {
            rings: RwLock::new(HashMap::new()),
            capacity,
            known_symbols,
        }
    }

    fn ensure_known(&self, symbol: &str) -> Result<(), EngineError> {
        if self.known_symbols.iter().any(|s| s == symbol) {
            Ok(())
        } else {
            Err(EngineError::Config(format!("unknown symbol: {symbol}")))
        }
    }

    /// Append a closed candle. If the last stored candle shares the same
    /// `open_time`, it is replaced in place (a late revision of the same
    /// bar) rather than appended as a duplicate.
    pub fn append(&self, symbol: &str, candle: Candle) -> Result<(), EngineError> {
        self.ensure_known(symbol)?;
        let mut rings = self.rings.write();
        let ring = rings
            .entry(symbol.to_string())
            .or_insert_with(|| VecDeque::with_capacity(self.capacity));

        match ring.back() {
            Some(last) if last.open_time == candle.open_time => {
                ring.pop_back();
                ring.push_back(candle);
            }
            _ => {
                ring.push_back(candle);
                while ring.len() > self.capacity {
                    ring.pop_front();
                }
            }
        }
        Ok(())
    }

    /// Oldest-first snapshot of the currently stored closed candles.
    pub fn snapshot(&self, symbol: &str) -> Result<Vec<Candle>, EngineError> {
        self.ensure_known(symbol)?;
        let rings = self.rings.read();
        Ok(rings
            .get(symbol)
            .map(|ring| ring.iter().copied().collect())
            .unwrap_or_default())
    }

    pub fn len(&self, symbol: &str) -> usize {
        self.rings
            .read()
            .get(symbol)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    pub fn is_empty(&self, symbol: &str) -> bool {
        self.len(symbol) == 0
    }
}

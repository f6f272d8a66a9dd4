// =============================================================================
// MovementDetector — anomaly rule applied to a freshly closed candle
// =============================================================================

use crate::config::PairConfig;
use crate::error::EngineError;
use crate::types::Candle;

/// Result of evaluating the anomaly rule against one closed candle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MovementResult {
    pub triggered: bool,
    pub average_diff: f64,
    pub dynamic_threshold: f64,
    pub current_diff: f64,
    pub past_sum: f64,
}

/// Evaluate the movement-anomaly rule.
///
/// `history` is the rolling window *as seen after* the just-closed candle
/// has been folded in — i.e. its last element is `candle` itself. This
/// mirrors the upstream behaviour this project preserves: `past_sum` is
/// computed over the same windowed diffs that produced `average_diff`, so it
/// includes the current candle (see the open question on this in the design
/// notes — not silently resolved, carried forward as-is).
pub fn evaluate(
    history: &[Candle],
    candle: &Candle,
    pair: &PairConfig,
) -> Result<MovementResult, EngineError> {
    if history.is_empty() {
        return Err(EngineError::MissingHistory {
            symbol: pair.symbol.clone(),
        });
    }

    let diffs: Vec<f64> = history.iter().map(Candle::abs_diff_pct).collect();
    let average_diff = diffs.iter().sum::<f64>() / diffs.len() as f64;
    let dynamic_threshold = pair.threshold * average_diff;
    let current_diff = candle.abs_diff_pct();

    let n = pair.num_previous_candles.min(diffs.len());
    let past_sum: f64 = diffs[diffs.len() - n..].iter().sum();

    let triggered = current_diff > dynamic_threshold && current_diff > past_sum;

    Ok(MovementResult {
        triggered,
        average_diff,
        dynamic_threshold,
        current_diff,
        past_sum,
    })
}

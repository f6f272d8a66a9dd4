// =============================================================================
// TriggerLadder — geometric ladder of profit targets and trailing stops
// =============================================================================

use crate::types::TriggerSide;

/// Round to 8 decimal places, the precision the ladder is stored and
/// persisted at (exchange-side rounding to the symbol's tick size happens
/// separately, in the order gateway, at submission time).
fn round8(x: f64) -> f64 {
    (x * 1e8).round() / 1e8
}

/// Computed ladder: `triggers[i]` paired with the trailing stop to install
/// once `triggers[i]` is crossed (`stop_prices[i]`), both oldest-first.
pub struct Ladder {
    pub triggers: Vec<f64>,
    pub stop_prices: Vec<f64>,
}

/// Build the ladder for a position opened at `entry_price` in `direction`,
/// with movement threshold `movement_threshold_pct` and fee exemption
/// `fees_exemption_pct` (both already expressed as percentages, matching the
/// values stored on `Position`), producing `count` rungs.
pub fn build(
    entry_price: f64,
    direction: TriggerSide,
    movement_threshold_pct: f64,
    fees_exemption_pct: f64,
    count: usize,
) -> Ladder {
    let m = movement_threshold_pct / 100.0;
    let f = fees_exemption_pct / 100.0;

    let mut triggers = Vec::with_capacity(count);
    let mut stop_prices = Vec::with_capacity(count);

    let mut prev_stop = match direction {
        TriggerSide::Long => entry_price * (1.0 - m - f),
        TriggerSide::Short => entry_price * (1.0 + m + f),
    };

    for i in 1..=count {
        let trigger = match direction {
            TriggerSide::Long => entry_price * (1.0 + i as f64 * m),
            TriggerSide::Short => entry_price * (1.0 - i as f64 * m),
        };
        let stop = match direction {
            TriggerSide::Long => prev_stop * (1.0 + m + f),
            TriggerSide::Short => prev_stop * (1.0 - m - f),
        };
        triggers.push(round8(trigger));
        stop_prices.push(round8(stop));
        prev_stop = stop;
    }

    Ladder {
        triggers,
        stop_prices,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s1_long_ladder_matches_scenario() {
        // E=0.5, m=1.0%, f=0.1%, N=5
        let ladder = build(0.5, TriggerSide::Long, 1.0, 0.1, 5);
        assert_eq!(
            ladder.triggers,
            vec![0.505, 0.510, 0.515, 0.520, 0.525]
        );
        // S0 = 0.5 * (1 - 0.01 - 0.001) = 0.4945
        let s0 = 0.5 * (1.0 - 0.01 - 0.001);
        assert!((s0 - 0.4945).abs() < 1e-12);
        let s1 = s0 * (1.0 + 0.01 + 0.001);
        assert!((ladder.stop_prices[0] - round8(s1)).abs() < 1e-12);
    }

    #[test]
    fn long_triggers_strictly_increasing() {
        let ladder = build(100.0, TriggerSide::Long, 2.0, 0.2, 10);
        for w in ladder.triggers.windows(2) {
            assert!(w[1] > w[0]);
        }
        for w in ladder.stop_prices.windows(2) {
            assert!(w[1] >= w[0]);
        }
    }

    #[test]
    fn short_triggers_strictly_decreasing() {
        let ladder = build(100.0, TriggerSide::Short, 2.0, 0.2, 10);
        for w in ladder.triggers.windows(2) {
            assert!(w[1] < w[0]);
        }
        for w in ladder.stop_prices.windows(2) {
            assert!(w[1] <= w[0]);
        }
    }

    #[test]
    fn triggers_and_stops_same_length() {
        let ladder = build(50.0, TriggerSide::Long, 1.5, 0.1, 7);
        assert_eq!(ladder.triggers.len(), 7);
        assert_eq!(ladder.stop_prices.len(), 7);
    }

    #[test]
    fn rebuilding_with_same_inputs_is_deterministic() {
        let a = build(321.45, TriggerSide::Short, 0.8, 0.05, 12);
        let b = build(321.45, TriggerSide::Short, 0.8, 0.05, 12);
        assert_eq!(a.triggers, b.triggers);
        assert_eq!(a.stop_prices, b.stop_prices);
    }
}

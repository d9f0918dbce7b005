//! Watermark monotonicity under arbitrary input sequences.

use chrono::{DateTime, TimeZone, Utc};
use proptest::prelude::*;
use virta_runtime::WatermarkCoordinator;

fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

proptest! {
    /// For any sequence of input-watermark advances and holds, the emitted
    /// output watermark is strictly increasing and never exceeds the input
    /// watermark at emission time.
    #[test]
    fn output_watermark_is_monotonic(
        steps in prop::collection::vec((0i64..1000, prop::option::of(0i64..1000)), 0..64),
    ) {
        let mut coordinator = WatermarkCoordinator::new();
        let mut emitted = Vec::new();

        for (input, hold) in steps {
            coordinator.advance_input(ts(input));
            if let Some(watermark) = coordinator.refresh_output(hold.map(ts)) {
                prop_assert!(watermark <= coordinator.input().unwrap());
                emitted.push(watermark);
            }
        }

        prop_assert!(emitted.windows(2).all(|w| w[0] < w[1]));
    }

    /// Rejected (non-advancing) input watermarks leave all state untouched.
    #[test]
    fn non_advancing_input_is_a_no_op(advances in prop::collection::vec(0i64..100, 1..32)) {
        let mut coordinator = WatermarkCoordinator::new();
        let mut high = None;

        for advance in advances {
            let accepted = coordinator.advance_input(ts(advance));
            match high {
                Some(h) if advance <= h => prop_assert!(!accepted),
                _ => {
                    prop_assert!(accepted);
                    high = Some(advance);
                }
            }
            prop_assert_eq!(coordinator.input(), high.map(ts));
        }
    }
}

#[test]
fn regressing_and_duplicate_advances_emit_nothing() {
    let mut coordinator = WatermarkCoordinator::new();
    let mut emitted = Vec::new();

    for advance in [5, 3, 5, 7] {
        coordinator.advance_input(ts(advance));
        if let Some(watermark) = coordinator.refresh_output(None) {
            emitted.push(watermark);
        }
    }

    assert_eq!(emitted, vec![ts(5), ts(7)]);
}

//! Watermark coordination
//!
//! Tracks the input watermark received from upstream and derives the output
//! watermark as the minimum of the input watermark and the earliest pending
//! hold. Both watermarks are monotonically non-decreasing, and the output
//! watermark is surfaced only when it strictly advances, so downstream
//! systems never observe a regression.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Serializable snapshot of the coordinator state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatermarkSnapshot {
    pub input_ms: Option<i64>,
    pub output_ms: Option<i64>,
}

/// Input/output watermark pair for one step instance.
///
/// The scheduler exclusively owns an instance of this; holds are computed
/// from the timer store and passed in on each refresh.
#[derive(Debug, Default)]
pub struct WatermarkCoordinator {
    input: Option<DateTime<Utc>>,
    output: Option<DateTime<Utc>>,
}

impl WatermarkCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the input watermark. Returns false (and changes nothing) if
    /// `new` does not strictly exceed the current input watermark.
    pub fn advance_input(&mut self, new: DateTime<Utc>) -> bool {
        match self.input {
            Some(current) if new <= current => false,
            _ => {
                self.input = Some(new);
                true
            }
        }
    }

    pub fn input(&self) -> Option<DateTime<Utc>> {
        self.input
    }

    pub fn output(&self) -> Option<DateTime<Utc>> {
        self.output
    }

    /// Recompute the output watermark as `min(input, hold)`, defaulting to
    /// the input watermark when no hold is pending. Returns the new output
    /// watermark only when it strictly advanced; the caller publishes
    /// exactly what is returned.
    pub fn refresh_output(&mut self, hold: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
        let input = self.input?;
        let candidate = match hold {
            Some(h) => input.min(h),
            None => input,
        };

        match self.output {
            Some(current) if candidate <= current => None,
            _ => {
                self.output = Some(candidate);
                Some(candidate)
            }
        }
    }

    pub fn snapshot(&self) -> WatermarkSnapshot {
        WatermarkSnapshot {
            input_ms: self.input.map(|w| w.timestamp_millis()),
            output_ms: self.output.map(|w| w.timestamp_millis()),
        }
    }

    pub fn restore(&mut self, snapshot: &WatermarkSnapshot) {
        self.input = snapshot.input_ms.and_then(DateTime::from_timestamp_millis);
        self.output = snapshot.output_ms.and_then(DateTime::from_timestamp_millis);
    }
}

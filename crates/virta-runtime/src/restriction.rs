//! Restriction state persistence
//!
//! The runtime treats restrictions and watermark-estimator states as opaque
//! byte blobs: it persists them, hands them back to the user function, and
//! never inspects them. [`RestrictionState`] is the durable record kept per
//! key between partial invocations; the element itself is stored alongside
//! the residual so a timer firing can re-invoke without upstream
//! redelivering it.
//!
//! [`OffsetRange`] is the reference restriction shipped with the runtime: a
//! half-open `[start, end)` offset range with a JSON codec, used by the test
//! suite and as a template for user-defined restrictions.

use crate::event::Event;
use crate::state::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Namespace within the keyed state store for one step's restriction states.
pub fn restriction_namespace(step_id: &str) -> String {
    format!("{}/restriction", step_id)
}

/// Durable per-key record of a restriction in progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestrictionState {
    pub element: Event,
    pub element_timestamp_ms: i64,
    pub restriction: Vec<u8>,
    pub estimator_state: Vec<u8>,
}

impl RestrictionState {
    pub fn new(
        element: Event,
        element_timestamp: DateTime<Utc>,
        restriction: Vec<u8>,
        estimator_state: Vec<u8>,
    ) -> Self {
        Self {
            element,
            element_timestamp_ms: element_timestamp.timestamp_millis(),
            restriction,
            estimator_state,
        }
    }

    pub fn element_timestamp(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.element_timestamp_ms).unwrap_or_default()
    }

    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        serde_json::to_vec(self).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
    }
}

/// A half-open `[start, end)` offset range restriction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetRange {
    pub start: i64,
    pub end: i64,
}

impl OffsetRange {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn len(&self) -> i64 {
        (self.end - self.start).max(0)
    }

    /// Split off the first `count` offsets, returning `(claimed, residual)`.
    pub fn split_at(&self, count: i64) -> (OffsetRange, OffsetRange) {
        let mid = (self.start + count).min(self.end);
        (
            OffsetRange::new(self.start, mid),
            OffsetRange::new(mid, self.end),
        )
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("offset range serializes")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
    }
}

//! Keyed work items and output records
//!
//! A keyed work item is the delivery unit handed to the scheduler by the
//! upstream grouping stage: new `(value, restriction)` elements for one key,
//! fired timers for that key, or both. Outputs leave the runtime as tagged
//! records so multiplexed sinks can match on the tag instead of inspecting
//! the payload.

use crate::event::Event;
use crate::timer::TimerData;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// A value paired with its event-time timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowedValue<T> {
    pub value: T,
    pub timestamp: DateTime<Utc>,
}

impl<T> WindowedValue<T> {
    pub fn new(value: T, timestamp: DateTime<Utc>) -> Self {
        Self { value, timestamp }
    }
}

/// Identifies one output stream of a multi-output step.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputTag(Arc<str>);

impl OutputTag {
    pub fn new(tag: impl Into<Arc<str>>) -> Self {
        Self(tag.into())
    }

    /// The main (untagged) output of a step.
    pub fn main() -> Self {
        Self::new("main")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OutputTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One output record: a tagged, timestamped event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaggedOutput {
    pub tag: OutputTag,
    pub value: WindowedValue<Event>,
}

impl TaggedOutput {
    pub fn new(tag: OutputTag, value: WindowedValue<Event>) -> Self {
        Self { tag, value }
    }
}

/// An element awaiting splittable processing: the opaque value, its initial
/// restriction, and the watermark-estimator state, all as the upstream stage
/// encoded them.
#[derive(Debug, Clone)]
pub struct WorkElement {
    pub value: Event,
    pub restriction: Vec<u8>,
    pub estimator_state: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

impl WorkElement {
    pub fn new(value: Event, restriction: Vec<u8>, estimator_state: Vec<u8>) -> Self {
        let timestamp = value.timestamp;
        Self {
            value,
            restriction,
            estimator_state,
            timestamp,
        }
    }
}

/// A delivery unit scoped to one partitioning key. Consumed exactly once;
/// never retained after processing.
#[derive(Debug, Clone)]
pub struct KeyedWorkItem {
    pub key: Vec<u8>,
    pub elements: Vec<WorkElement>,
    pub timers: Vec<TimerData>,
}

impl KeyedWorkItem {
    /// A work item carrying new elements for `key`.
    pub fn elements_work_item(key: impl Into<Vec<u8>>, elements: Vec<WorkElement>) -> Self {
        Self {
            key: key.into(),
            elements,
            timers: Vec::new(),
        }
    }

    /// A work item carrying fired timers for `key`.
    pub fn timers_work_item(key: impl Into<Vec<u8>>, timers: Vec<TimerData>) -> Self {
        Self {
            key: key.into(),
            elements: Vec::new(),
            timers,
        }
    }
}

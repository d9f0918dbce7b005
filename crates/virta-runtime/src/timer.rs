//! Timer store
//!
//! Ordered collection of per-key timers. Event-time entries become ready as
//! the input watermark passes their fire timestamp; processing-time entries
//! become ready against the wall clock. Identity is `(key, timer_id)`:
//! scheduling overwrites any live entry for the same identity, in either
//! domain.

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Which clock a timer fires against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeDomain {
    EventTime,
    ProcessingTime,
}

impl TimeDomain {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeDomain::EventTime => "event_time",
            TimeDomain::ProcessingTime => "processing_time",
        }
    }
}

/// One pending timer.
///
/// `fire_timestamp` decides readiness; `output_timestamp` is the hold this
/// timer places on the output watermark while it is pending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerData {
    pub key: Vec<u8>,
    pub timer_id: String,
    pub domain: TimeDomain,
    pub fire_timestamp: DateTime<Utc>,
    pub output_timestamp: DateTime<Utc>,
}

/// Ordering key within a domain: fire time ascending, then insertion order.
type TimerKey = (DateTime<Utc>, u64);

/// Serializable snapshot of the pending timer set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimerSnapshot {
    pub entries: Vec<TimerSnapshotEntry>,
    pub next_seq: u64,
}

/// One timer in a snapshot, timestamps in epoch milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerSnapshotEntry {
    pub key: Vec<u8>,
    pub timer_id: String,
    pub domain: TimeDomain,
    pub fire_ms: i64,
    pub output_ms: i64,
    pub seq: u64,
}

/// Pending timers for one step instance.
#[derive(Debug, Default)]
pub struct TimerStore {
    event_time: BTreeMap<TimerKey, TimerData>,
    processing_time: BTreeMap<TimerKey, TimerData>,
    /// (key, timer_id) -> location of the live entry
    index: FxHashMap<(Vec<u8>, String), (TimeDomain, TimerKey)>,
    next_seq: u64,
}

impl TimerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn domain_set(&mut self, domain: TimeDomain) -> &mut BTreeMap<TimerKey, TimerData> {
        match domain {
            TimeDomain::EventTime => &mut self.event_time,
            TimeDomain::ProcessingTime => &mut self.processing_time,
        }
    }

    /// Upsert a timer. Any live entry for the same `(key, timer_id)` is
    /// replaced, even across domains.
    pub fn schedule(&mut self, timer: TimerData) {
        let identity = (timer.key.clone(), timer.timer_id.clone());
        if let Some((domain, at)) = self.index.remove(&identity) {
            self.domain_set(domain).remove(&at);
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        let at = (timer.fire_timestamp, seq);
        self.index.insert(identity, (timer.domain, at));
        self.domain_set(timer.domain).insert(at, timer);
    }

    /// Remove a timer if present; no-op otherwise.
    pub fn cancel(&mut self, key: &[u8], timer_id: &str) {
        if let Some((domain, at)) = self.index.remove(&(key.to_vec(), timer_id.to_string())) {
            self.domain_set(domain).remove(&at);
        }
    }

    /// Remove and return every event-time timer with
    /// `fire_timestamp <= watermark`, ascending by fire time, ties broken by
    /// insertion order. A returned entry is no longer pending.
    pub fn poll_ready_event_time(&mut self, watermark: DateTime<Utc>) -> Vec<TimerData> {
        Self::poll_ready(&mut self.event_time, &mut self.index, watermark)
    }

    /// Same as [`poll_ready_event_time`](Self::poll_ready_event_time), for
    /// processing-time timers against the wall clock.
    pub fn poll_ready_processing_time(&mut self, now: DateTime<Utc>) -> Vec<TimerData> {
        Self::poll_ready(&mut self.processing_time, &mut self.index, now)
    }

    fn poll_ready(
        set: &mut BTreeMap<TimerKey, TimerData>,
        index: &mut FxHashMap<(Vec<u8>, String), (TimeDomain, TimerKey)>,
        up_to: DateTime<Utc>,
    ) -> Vec<TimerData> {
        let mut ready = Vec::new();
        loop {
            let Some((&at, timer)) = set.first_key_value() else {
                break;
            };
            if timer.fire_timestamp > up_to {
                break;
            }
            index.remove(&(timer.key.clone(), timer.timer_id.clone()));
            if let Some((_, timer)) = set.remove_entry(&at) {
                ready.push(timer);
            }
        }
        ready
    }

    /// Earliest fire timestamp among pending event-time timers.
    pub fn earliest_event_time_fire(&self) -> Option<DateTime<Utc>> {
        self.event_time
            .first_key_value()
            .map(|(_, t)| t.fire_timestamp)
    }

    /// Earliest output-timestamp hold among all pending timers, either domain.
    pub fn earliest_output_hold(&self) -> Option<DateTime<Utc>> {
        self.event_time
            .values()
            .chain(self.processing_time.values())
            .map(|t| t.output_timestamp)
            .min()
    }

    /// True if any timer is pending for `key`.
    pub fn has_pending_for_key(&self, key: &[u8]) -> bool {
        self.index.keys().any(|(k, _)| k == key)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Snapshot the pending set for checkpointing.
    pub fn snapshot(&self) -> TimerSnapshot {
        let entries = self
            .event_time
            .iter()
            .chain(self.processing_time.iter())
            .map(|(&(_, seq), t)| TimerSnapshotEntry {
                key: t.key.clone(),
                timer_id: t.timer_id.clone(),
                domain: t.domain,
                fire_ms: t.fire_timestamp.timestamp_millis(),
                output_ms: t.output_timestamp.timestamp_millis(),
                seq,
            })
            .collect();
        TimerSnapshot {
            entries,
            next_seq: self.next_seq,
        }
    }

    /// Rebuild the pending set from a snapshot, replacing current contents.
    /// Insertion-order tie-breaks are preserved.
    pub fn restore(&mut self, snapshot: &TimerSnapshot) {
        self.event_time.clear();
        self.processing_time.clear();
        self.index.clear();
        self.next_seq = snapshot.next_seq;

        for entry in &snapshot.entries {
            let fire = DateTime::from_timestamp_millis(entry.fire_ms).unwrap_or_default();
            let output = DateTime::from_timestamp_millis(entry.output_ms).unwrap_or_default();
            let timer = TimerData {
                key: entry.key.clone(),
                timer_id: entry.timer_id.clone(),
                domain: entry.domain,
                fire_timestamp: fire,
                output_timestamp: output,
            };
            let at = (fire, entry.seq);
            self.index
                .insert((timer.key.clone(), timer.timer_id.clone()), (timer.domain, at));
            self.domain_set(timer.domain).insert(at, timer);
            self.next_seq = self.next_seq.max(entry.seq + 1);
        }
    }
}

//! Checkpointing and recovery
//!
//! Periodic snapshots of a step's timers and watermarks, written through the
//! same keyed state store that holds restriction state. Restriction states
//! are not part of a checkpoint; they are already durable per key, so
//! recovery is restore-checkpoint plus resume-from-store.

use crate::state::{KeyedStateStore, StoreError};
use crate::timer::TimerSnapshot;
use crate::watermark::WatermarkSnapshot;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Namespace in the keyed state store reserved for checkpoints.
const CHECKPOINT_NAMESPACE: &str = "__checkpoints";
const LATEST_KEY: &[u8] = b"latest";

/// Configuration for checkpointing
#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    /// Interval between checkpoints
    pub interval: Duration,
    /// Maximum number of checkpoints to retain
    pub max_checkpoints: usize,
    /// Whether to checkpoint on shutdown
    pub checkpoint_on_shutdown: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_checkpoints: 3,
            checkpoint_on_shutdown: true,
        }
    }
}

/// Snapshot of one step instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpCheckpoint {
    /// Checkpoint ID (monotonically increasing)
    pub id: u64,
    /// Timestamp when checkpoint was created
    pub timestamp_ms: i64,
    /// Number of work items processed at checkpoint time
    pub work_items_processed: u64,
    /// Pending timer set
    pub timers: TimerSnapshot,
    /// Input/output watermarks
    pub watermarks: WatermarkSnapshot,
    /// Custom metadata
    pub metadata: HashMap<String, String>,
}

fn checkpoint_key(id: u64) -> Vec<u8> {
    // Zero-padded so store ordering matches numeric ordering.
    format!("checkpoint/{:020}", id).into_bytes()
}

fn parse_checkpoint_key(key: &[u8]) -> Option<u64> {
    std::str::from_utf8(key)
        .ok()?
        .strip_prefix("checkpoint/")?
        .parse()
        .ok()
}

/// Checkpoint manager that handles periodic checkpointing
pub struct CheckpointManager {
    store: Arc<dyn KeyedStateStore>,
    config: CheckpointConfig,
    last_checkpoint: Instant,
    next_checkpoint_id: u64,
}

impl CheckpointManager {
    /// Create a new checkpoint manager
    pub fn new(
        store: Arc<dyn KeyedStateStore>,
        config: CheckpointConfig,
    ) -> Result<Self, StoreError> {
        let next_id = Self::load_latest(&store)?.map(|c| c.id + 1).unwrap_or(1);

        Ok(Self {
            store,
            config,
            last_checkpoint: Instant::now(),
            next_checkpoint_id: next_id,
        })
    }

    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    /// Check if it's time to create a checkpoint
    pub fn should_checkpoint(&self) -> bool {
        self.last_checkpoint.elapsed() >= self.config.interval
    }

    /// Persist a checkpoint, assigning its id and timestamp, then prune old
    /// checkpoints and flush.
    pub fn save(&mut self, mut checkpoint: OpCheckpoint) -> Result<u64, StoreError> {
        checkpoint.id = self.next_checkpoint_id;
        checkpoint.timestamp_ms = chrono::Utc::now().timestamp_millis();

        let data = serde_json::to_vec(&checkpoint)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.store
            .put(CHECKPOINT_NAMESPACE, &checkpoint_key(checkpoint.id), &data)?;
        self.store.put(
            CHECKPOINT_NAMESPACE,
            LATEST_KEY,
            &checkpoint.id.to_le_bytes(),
        )?;

        self.prune(self.config.max_checkpoints)?;
        self.store.flush()?;

        self.last_checkpoint = Instant::now();
        self.next_checkpoint_id += 1;

        info!(
            checkpoint = checkpoint.id,
            work_items = checkpoint.work_items_processed,
            "created checkpoint"
        );
        Ok(checkpoint.id)
    }

    /// Load the latest checkpoint for recovery
    pub fn recover(&self) -> Result<Option<OpCheckpoint>, StoreError> {
        Self::load_latest(&self.store)
    }

    /// Load a specific checkpoint by ID
    pub fn load(&self, id: u64) -> Result<Option<OpCheckpoint>, StoreError> {
        Self::load_by_id(&self.store, id)
    }

    /// List all checkpoint IDs, ascending
    pub fn list(&self) -> Result<Vec<u64>, StoreError> {
        let keys = self.store.list_keys(CHECKPOINT_NAMESPACE)?;
        Ok(keys.iter().filter_map(|k| parse_checkpoint_key(k)).collect())
    }

    /// Delete old checkpoints, keeping only the most recent N
    pub fn prune(&self, keep: usize) -> Result<usize, StoreError> {
        let ids = self.list()?;
        let to_delete = ids.len().saturating_sub(keep);
        for id in ids.iter().take(to_delete) {
            self.store
                .delete(CHECKPOINT_NAMESPACE, &checkpoint_key(*id))?;
        }
        if to_delete > 0 {
            info!("pruned {} old checkpoints", to_delete);
        }
        Ok(to_delete)
    }

    fn load_latest(store: &Arc<dyn KeyedStateStore>) -> Result<Option<OpCheckpoint>, StoreError> {
        let Some(id_bytes) = store.get(CHECKPOINT_NAMESPACE, LATEST_KEY)? else {
            return Ok(None);
        };
        let Ok(bytes) = <[u8; 8]>::try_from(id_bytes.as_slice()) else {
            return Ok(None);
        };
        Self::load_by_id(store, u64::from_le_bytes(bytes))
    }

    fn load_by_id(
        store: &Arc<dyn KeyedStateStore>,
        id: u64,
    ) -> Result<Option<OpCheckpoint>, StoreError> {
        match store.get(CHECKPOINT_NAMESPACE, &checkpoint_key(id))? {
            Some(data) => {
                let checkpoint: OpCheckpoint = serde_json::from_slice(&data)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                Ok(Some(checkpoint))
            }
            None => Ok(None),
        }
    }
}

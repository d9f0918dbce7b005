//! Keyed shard pool
//!
//! Deployment helper for running one logical step across several engine
//! shards. Work items route by a stable hash of their key, so a key always
//! lands on the same shard and the one-invocation-per-key rule holds across
//! the whole pool. Watermark advances broadcast to every shard, and
//! [`WatermarkMergeSink`] folds the per-shard output watermarks back into a
//! single monotonic stream for the downstream sink.

use crate::engine::{Engine, EngineInput};
use crate::operator::{OpError, SplittableOp};
use crate::sink::OutputSink;
use crate::work_item::{KeyedWorkItem, TaggedOutput};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rustc_hash::FxHasher;
use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Configuration for a shard pool
#[derive(Debug, Clone)]
pub struct ShardPoolConfig {
    /// Pool name for identification
    pub name: String,
    /// Number of engine shards
    pub shards: usize,
    /// Input queue capacity per shard
    pub queue_size: usize,
}

impl Default for ShardPoolConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            shards: 4,
            queue_size: 1024,
        }
    }
}

/// Error returned when a shard's input channel has closed.
#[derive(Debug, Clone)]
pub struct PoolClosed {
    pub pool_name: String,
    pub shard: usize,
}

impl std::fmt::Display for PoolClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Pool '{}' shard {} is no longer accepting input",
            self.pool_name, self.shard
        )
    }
}

impl std::error::Error for PoolClosed {}

/// Counters for a shard pool
#[derive(Debug, Clone, Default)]
pub struct ShardPoolMetrics {
    pub shards: usize,
    pub items_submitted: u64,
    pub watermarks_broadcast: u64,
}

/// Stable shard routing: the same key always maps to the same shard.
pub fn shard_for_key(key: &[u8], shards: usize) -> usize {
    let mut hasher = FxHasher::default();
    hasher.write(key);
    (hasher.finish() % shards.max(1) as u64) as usize
}

/// A pool of engine shards processing one logical step.
pub struct KeyedShardPool {
    config: ShardPoolConfig,
    senders: Vec<mpsc::Sender<EngineInput>>,
    handles: Vec<JoinHandle<Result<(), OpError>>>,
    items_submitted: AtomicU64,
    watermarks_broadcast: AtomicU64,
}

impl KeyedShardPool {
    /// Spawn one engine per shard. `build_op` constructs each shard's
    /// operator; pair it with [`WatermarkMergeSink::shard_sink`] so the
    /// downstream watermark stays monotonic across shards.
    pub fn spawn<F>(config: ShardPoolConfig, mut build_op: F) -> Result<Self, OpError>
    where
        F: FnMut(usize) -> Result<SplittableOp, OpError>,
    {
        let shards = config.shards.max(1);
        let mut senders = Vec::with_capacity(shards);
        let mut handles = Vec::with_capacity(shards);

        for shard in 0..shards {
            let (tx, rx) = mpsc::channel(config.queue_size);
            let engine = Engine::new(build_op(shard)?, rx);
            handles.push(tokio::spawn(engine.run()));
            senders.push(tx);
        }

        info!(
            "Shard pool '{}' started with {} shards",
            config.name, shards
        );
        Ok(Self {
            config,
            senders,
            handles,
            items_submitted: AtomicU64::new(0),
            watermarks_broadcast: AtomicU64::new(0),
        })
    }

    pub fn shard_count(&self) -> usize {
        self.senders.len()
    }

    /// Route a work item to its key's shard.
    pub async fn submit(&self, item: KeyedWorkItem) -> Result<(), PoolClosed> {
        let shard = shard_for_key(&item.key, self.senders.len());
        self.senders[shard]
            .send(EngineInput::WorkItem(item))
            .await
            .map_err(|_| PoolClosed {
                pool_name: self.config.name.clone(),
                shard,
            })?;
        self.items_submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Broadcast an input-watermark advance to every shard.
    pub async fn advance_watermark(&self, watermark: DateTime<Utc>) -> Result<(), PoolClosed> {
        for (shard, tx) in self.senders.iter().enumerate() {
            tx.send(EngineInput::Watermark(watermark))
                .await
                .map_err(|_| PoolClosed {
                    pool_name: self.config.name.clone(),
                    shard,
                })?;
        }
        self.watermarks_broadcast.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn metrics(&self) -> ShardPoolMetrics {
        ShardPoolMetrics {
            shards: self.senders.len(),
            items_submitted: self.items_submitted.load(Ordering::Relaxed),
            watermarks_broadcast: self.watermarks_broadcast.load(Ordering::Relaxed),
        }
    }

    /// Close all shard inputs and wait for the engines to drain and stop.
    /// The first operator error is returned after every shard has stopped.
    pub async fn shutdown(self) -> Result<(), OpError> {
        drop(self.senders);

        let mut first_error = None;
        for handle in self.handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("shard engine failed: {}", e);
                    first_error.get_or_insert(e);
                }
                Err(e) => error!("shard task join failed: {}", e),
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

struct MergeState {
    shard_watermarks: Vec<Option<DateTime<Utc>>>,
    emitted: Option<DateTime<Utc>>,
}

/// Folds per-shard output watermarks into one monotonic stream.
///
/// Each shard writes through its own [`shard_sink`](Self::shard_sink)
/// handle; outputs pass straight through, watermarks are merged as the
/// minimum across shards that have reported one. Shards that have not
/// reported yet do not block emission; the monotonic guard ensures a
/// late-starting shard can never pull the merged watermark backwards.
pub struct WatermarkMergeSink {
    inner: Arc<dyn OutputSink>,
    state: Arc<Mutex<MergeState>>,
}

impl WatermarkMergeSink {
    pub fn new(inner: Arc<dyn OutputSink>, shards: usize) -> Self {
        Self {
            inner,
            state: Arc::new(Mutex::new(MergeState {
                shard_watermarks: vec![None; shards.max(1)],
                emitted: None,
            })),
        }
    }

    /// The sink handle for one shard's operator.
    pub fn shard_sink(&self, shard: usize) -> ShardOutputSink {
        ShardOutputSink {
            inner: self.inner.clone(),
            state: self.state.clone(),
            shard,
        }
    }

    /// The merged watermark emitted so far, if any.
    pub fn merged_watermark(&self) -> Option<DateTime<Utc>> {
        self.state.lock().ok().and_then(|s| s.emitted)
    }
}

/// One shard's view of a [`WatermarkMergeSink`].
pub struct ShardOutputSink {
    inner: Arc<dyn OutputSink>,
    state: Arc<Mutex<MergeState>>,
    shard: usize,
}

#[async_trait]
impl OutputSink for ShardOutputSink {
    fn name(&self) -> &str {
        "watermark-merge"
    }

    async fn emit(&self, output: &TaggedOutput) -> Result<()> {
        self.inner.emit(output).await
    }

    async fn emit_watermark(&self, watermark: DateTime<Utc>) -> Result<()> {
        let advanced = {
            let mut state = self
                .state
                .lock()
                .map_err(|e| anyhow!("merge state lock poisoned: {}", e))?;

            let slot = &mut state.shard_watermarks[self.shard];
            if slot.map_or(true, |current| watermark > current) {
                *slot = Some(watermark);
            }

            let merged = state.shard_watermarks.iter().flatten().copied().min();
            match merged {
                Some(m) if state.emitted.map_or(true, |prev| m > prev) => {
                    state.emitted = Some(m);
                    Some(m)
                }
                _ => None,
            }
        };

        if let Some(merged) = advanced {
            self.inner.emit_watermark(merged).await?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.inner.flush().await
    }

    async fn close(&self) -> Result<()> {
        // The shared downstream sink is closed by its owner, not per shard.
        self.inner.flush().await
    }
}

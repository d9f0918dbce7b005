//! Virta Runtime - execution engine for splittable, keyed work
//!
//! This crate drives a long-lived, resumable unit of work (a restriction
//! over an element) through repeated invocation: it tracks per-key timers
//! and watermarks, persists incremental progress in a keyed state store,
//! and guarantees that state mutations, timer firings, and output emission
//! are correctly ordered per key.

pub mod checkpoint;
pub mod engine;
pub mod event;
pub mod invoker;
pub mod metrics;
pub mod operator;
pub mod restriction;
pub mod sink;
pub mod state;
pub mod timer;
pub mod watermark;
pub mod work_item;
pub mod worker_pool;

pub use checkpoint::{CheckpointConfig, CheckpointManager, OpCheckpoint};
pub use engine::{Engine, EngineInput};
pub use event::{Event, FxIndexMap};
pub use invoker::{
    ChunkContext, ChunkResult, InvokerConfig, Outcome, ProcessElementInvoker, ProcessFn,
    ProcessFnError, TimerRequest,
};
pub use metrics::Metrics;
pub use operator::{OpConfig, OpError, SplittableOp, CONTINUATION_TIMER_ID};
pub use restriction::{restriction_namespace, OffsetRange, RestrictionState};
pub use sink::{CollectingSink, ConsoleSink, FileSink, MultiSink, OutputSink};
pub use timer::{TimeDomain, TimerData, TimerSnapshot, TimerStore};
pub use watermark::{WatermarkCoordinator, WatermarkSnapshot};
pub use work_item::{KeyedWorkItem, OutputTag, TaggedOutput, WindowedValue, WorkElement};
pub use worker_pool::{
    shard_for_key, KeyedShardPool, PoolClosed, ShardOutputSink, ShardPoolConfig,
    ShardPoolMetrics, WatermarkMergeSink,
};

// State store exports (always available, RocksDB impl requires "persistence" feature)
#[cfg(feature = "persistence")]
pub use state::RocksDbStateStore;
pub use state::{FileStateStore, KeyedStateStore, MemoryStateStore, StoreError};

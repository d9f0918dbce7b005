//! Engine loop for one step instance
//!
//! A single tokio task owns the operator and drains three event sources:
//! keyed work items and watermark advances from the input channel, and a
//! wall-clock ticker for processing-time timers and checkpoint cadence.
//! Because everything runs on this one task, the at-most-one-invocation-
//! per-key rule holds without any locking.

use crate::checkpoint::CheckpointManager;
use crate::operator::{OpError, SplittableOp};
use crate::work_item::KeyedWorkItem;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::info;

/// One delivery to the engine: a keyed work item or an input-watermark
/// advance notification from the upstream grouping stage.
#[derive(Debug)]
pub enum EngineInput {
    WorkItem(KeyedWorkItem),
    Watermark(DateTime<Utc>),
}

/// Drives one [`SplittableOp`] to completion of its input stream.
pub struct Engine {
    op: SplittableOp,
    rx: mpsc::Receiver<EngineInput>,
    tick_interval: Duration,
    checkpoints: Option<CheckpointManager>,
}

impl Engine {
    pub fn new(op: SplittableOp, rx: mpsc::Receiver<EngineInput>) -> Self {
        Self {
            op,
            rx,
            tick_interval: Duration::from_millis(100),
            checkpoints: None,
        }
    }

    /// How often processing-time timers are polled and the checkpoint
    /// interval is checked.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_checkpoints(mut self, manager: CheckpointManager) -> Self {
        self.checkpoints = Some(manager);
        self
    }

    /// Run until the input channel closes. Recovers from the latest
    /// checkpoint first when a checkpoint manager is configured.
    pub async fn run(self) -> Result<(), OpError> {
        let Engine {
            mut op,
            mut rx,
            tick_interval,
            mut checkpoints,
        } = self;

        if let Some(manager) = &checkpoints {
            if let Some(checkpoint) = manager.recover()? {
                op.restore(&checkpoint);
            }
        }

        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                input = rx.recv() => match input {
                    Some(EngineInput::WorkItem(item)) => {
                        op.process_work_item(item).await?;
                        // Immediate continuations fire without waiting for
                        // the next tick.
                        op.drain_ready_processing_timers(Utc::now()).await?;
                    }
                    Some(EngineInput::Watermark(watermark)) => {
                        op.advance_input_watermark(watermark).await?;
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    op.drain_ready_processing_timers(Utc::now()).await?;
                    if let Some(manager) = &mut checkpoints {
                        if manager.should_checkpoint() {
                            manager.save(op.checkpoint())?;
                        }
                    }
                }
            }
        }

        if let Some(manager) = &mut checkpoints {
            if manager.config().checkpoint_on_shutdown {
                manager.save(op.checkpoint())?;
            }
        }
        op.close().await?;
        info!("engine stopped");
        Ok(())
    }
}

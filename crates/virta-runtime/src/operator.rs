//! Work scheduler for one splittable step instance
//!
//! `SplittableOp` owns the per-step timer store and watermark state and
//! drives the bundle-scoped state machine: receive a keyed work item, invoke
//! the restriction invoker for each element, persist residuals as
//! continuation timers, fire ready timers in order, and publish the output
//! watermark when it advances. All of it runs on one logical task, so at
//! most one invocation is ever in flight per key.

use crate::checkpoint::OpCheckpoint;
use crate::event::Event;
use crate::invoker::{
    InvocationResult, InvokeError, InvokerConfig, Outcome, ProcessElementInvoker, ProcessFn,
};
use crate::metrics::Metrics;
use crate::restriction::{restriction_namespace, RestrictionState};
use crate::sink::OutputSink;
use crate::state::{KeyedStateStore, StoreError};
use crate::timer::{TimeDomain, TimerData, TimerStore};
use crate::watermark::WatermarkCoordinator;
use crate::work_item::{KeyedWorkItem, WorkElement};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info};

/// Timer id reserved for rescheduling a key's own residual.
pub const CONTINUATION_TIMER_ID: &str = "__continuation";

/// Configuration for one step instance.
#[derive(Debug, Clone)]
pub struct OpConfig {
    /// Step identifier; scopes the restriction-state namespace and metrics.
    pub step_id: String,
    /// Invocation budget.
    pub invoker: InvokerConfig,
}

impl OpConfig {
    pub fn new(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            invoker: InvokerConfig::default(),
        }
    }

    pub fn with_invoker(mut self, invoker: InvokerConfig) -> Self {
        self.invoker = invoker;
        self
    }
}

#[derive(Debug, Error)]
pub enum OpError {
    #[error("state store: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Invoke(#[from] InvokeError),
    #[error("output sink: {0}")]
    Sink(anyhow::Error),
    #[error("unsupported capability: {0}")]
    Unsupported(String),
}

/// The orchestration loop for one splittable step instance.
pub struct SplittableOp {
    config: OpConfig,
    namespace: String,
    state: Arc<dyn KeyedStateStore>,
    timers: TimerStore,
    watermarks: WatermarkCoordinator,
    invoker: ProcessElementInvoker,
    sink: Arc<dyn OutputSink>,
    metrics: Option<Metrics>,
    work_items_processed: u64,
}

impl SplittableOp {
    /// Build a step instance. Fails immediately if the processing function
    /// needs a capability this engine does not support.
    pub fn new(
        config: OpConfig,
        process_fn: Arc<dyn ProcessFn>,
        state: Arc<dyn KeyedStateStore>,
        sink: Arc<dyn OutputSink>,
    ) -> Result<Self, OpError> {
        if process_fn.requires_bundle_finalization() {
            return Err(OpError::Unsupported(
                "bundle finalization is not supported by this engine".to_string(),
            ));
        }

        let namespace = restriction_namespace(&config.step_id);
        let invoker = ProcessElementInvoker::new(process_fn, sink.clone(), config.invoker.clone());
        Ok(Self {
            config,
            namespace,
            state,
            timers: TimerStore::new(),
            watermarks: WatermarkCoordinator::new(),
            invoker,
            sink,
            metrics: None,
            work_items_processed: 0,
        })
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Process one keyed work item: new elements, delivered timer firings,
    /// or both, inside a single bundle. Does not publish a watermark; that
    /// happens on watermark advances and timer drains.
    pub async fn process_work_item(&mut self, item: KeyedWorkItem) -> Result<(), OpError> {
        self.start_bundle();
        for element in &item.elements {
            self.dispatch_element(&item.key, element).await?;
        }
        for timer in &item.timers {
            self.fire_timer(timer).await?;
        }
        self.finish_bundle().await?;

        self.work_items_processed += 1;
        if let Some(m) = &self.metrics {
            m.record_work_item(&self.config.step_id);
            m.set_pending_timers(&self.config.step_id, self.timers.len());
        }
        Ok(())
    }

    /// Advance the input watermark. A non-advancing watermark is a complete
    /// no-op. Otherwise ready event-time timers fire in watermark order, and
    /// the output watermark is recomputed and published if it advanced.
    pub async fn advance_input_watermark(
        &mut self,
        watermark: DateTime<Utc>,
    ) -> Result<(), OpError> {
        if !self.watermarks.advance_input(watermark) {
            return Ok(());
        }

        let ready = self.timers.poll_ready_event_time(watermark);
        if !ready.is_empty() {
            self.fire_all(ready).await?;
        }

        self.publish_watermark().await
    }

    /// Fire every processing-time timer that is ready at `now`, looping so
    /// that immediate continuations scheduled while firing are picked up in
    /// the same drain. Returns the number of timers fired.
    pub async fn drain_ready_processing_timers(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<usize, OpError> {
        let mut fired = 0usize;
        loop {
            let poll_at = now.max(Utc::now());
            let ready = self.timers.poll_ready_processing_time(poll_at);
            if ready.is_empty() {
                break;
            }
            fired += ready.len();
            self.fire_all(ready).await?;
        }

        if fired > 0 {
            self.publish_watermark().await?;
        }
        Ok(fired)
    }

    /// Fire a batch of polled timers inside one bundle. On failure the
    /// failed and unfired timers go back into the store so a redelivered
    /// advance can fire them again from the last persisted state.
    async fn fire_all(&mut self, ready: Vec<TimerData>) -> Result<(), OpError> {
        self.start_bundle();
        let mut pending = ready.into_iter();
        while let Some(timer) = pending.next() {
            if let Err(e) = self.fire_timer(&timer).await {
                self.timers.schedule(timer);
                for unfired in pending {
                    self.timers.schedule(unfired);
                }
                return Err(e);
            }
        }
        self.finish_bundle().await
    }

    /// True once a key has neither persisted restriction state nor pending
    /// timers: quiescent until new input arrives.
    pub fn is_quiescent(&self, key: &[u8]) -> Result<bool, OpError> {
        Ok(self.state.get(&self.namespace, key)?.is_none()
            && !self.timers.has_pending_for_key(key))
    }

    pub fn input_watermark(&self) -> Option<DateTime<Utc>> {
        self.watermarks.input()
    }

    pub fn output_watermark(&self) -> Option<DateTime<Utc>> {
        self.watermarks.output()
    }

    pub fn pending_timer_count(&self) -> usize {
        self.timers.len()
    }

    pub fn work_items_processed(&self) -> u64 {
        self.work_items_processed
    }

    /// Snapshot timers and watermarks for checkpointing. Restriction states
    /// already live in the durable store and are not duplicated here.
    pub fn checkpoint(&self) -> OpCheckpoint {
        OpCheckpoint {
            id: 0,
            timestamp_ms: 0,
            work_items_processed: self.work_items_processed,
            timers: self.timers.snapshot(),
            watermarks: self.watermarks.snapshot(),
            metadata: HashMap::new(),
        }
    }

    /// Restore timers and watermarks from a checkpoint.
    pub fn restore(&mut self, checkpoint: &OpCheckpoint) {
        self.timers.restore(&checkpoint.timers);
        self.watermarks.restore(&checkpoint.watermarks);
        self.work_items_processed = checkpoint.work_items_processed;
        info!(
            step = %self.config.step_id,
            checkpoint = checkpoint.id,
            pending_timers = self.timers.len(),
            "restored step state from checkpoint"
        );
    }

    pub async fn close(&self) -> Result<(), OpError> {
        self.sink.close().await.map_err(OpError::Sink)
    }

    async fn dispatch_element(&mut self, key: &[u8], element: &WorkElement) -> Result<(), OpError> {
        let state = match self.state.get(&self.namespace, key)? {
            Some(bytes) => {
                // Redelivery: resume from the persisted residual. The
                // delivered restriction is ignored so progress never
                // regresses to an already-surpassed point.
                debug!(key = ?key, "resuming from persisted restriction state");
                RestrictionState::decode(&bytes)?
            }
            None => RestrictionState::new(
                element.value.clone(),
                element.timestamp,
                element.restriction.clone(),
                element.estimator_state.clone(),
            ),
        };
        self.invoke_and_reconcile(key, state).await
    }

    async fn fire_timer(&mut self, timer: &TimerData) -> Result<(), OpError> {
        let Some(bytes) = self.state.get(&self.namespace, &timer.key)? else {
            // The restriction completed after this timer was set.
            debug!(timer_id = %timer.timer_id, "skipping stale timer");
            return Ok(());
        };
        debug!(timer_id = %timer.timer_id, domain = timer.domain.as_str(), "firing timer");
        if let Some(m) = &self.metrics {
            m.record_timer_fired(&self.config.step_id, timer.domain.as_str());
        }

        let state = RestrictionState::decode(&bytes)?;
        self.invoke_and_reconcile(&timer.key, state).await
    }

    async fn invoke_and_reconcile(
        &mut self,
        key: &[u8],
        state: RestrictionState,
    ) -> Result<(), OpError> {
        let RestrictionState {
            element,
            element_timestamp_ms,
            restriction,
            estimator_state,
        } = state;

        let started = Instant::now();
        let result = self
            .invoker
            .invoke(&element, restriction, estimator_state)
            .await?;
        if let Some(m) = &self.metrics {
            m.record_invocation(
                &self.config.step_id,
                result.outcome.label(),
                result.outputs_emitted,
                started.elapsed().as_secs_f64(),
            );
        }

        self.reconcile(key, element, element_timestamp_ms, result)
    }

    /// Apply an invocation's outcome: schedule requested timers, then either
    /// clear the key or persist the residual and schedule its continuation.
    fn reconcile(
        &mut self,
        key: &[u8],
        element: Event,
        element_timestamp_ms: i64,
        result: InvocationResult,
    ) -> Result<(), OpError> {
        for request in result.timer_requests {
            self.timers.schedule(TimerData {
                key: key.to_vec(),
                timer_id: request.timer_id,
                domain: request.domain,
                fire_timestamp: request.fire_timestamp,
                output_timestamp: request.output_timestamp,
            });
        }

        match result.outcome {
            Outcome::Done => {
                self.state.delete(&self.namespace, key)?;
                self.timers.cancel(key, CONTINUATION_TIMER_ID);
                debug!(key = ?key, "restriction complete, state cleared");
                Ok(())
            }
            Outcome::ResumeAfter {
                restriction,
                estimator_state,
                delay,
            } => {
                let delay = Duration::from_std(delay).unwrap_or_else(|_| Duration::zero());
                self.persist_residual(key, element, element_timestamp_ms, restriction, estimator_state, delay)
            }
            Outcome::ResumeNow {
                restriction,
                estimator_state,
            } => self.persist_residual(
                key,
                element,
                element_timestamp_ms,
                restriction,
                estimator_state,
                Duration::zero(),
            ),
        }
    }

    /// Persist the residual, then schedule its continuation timer. The state
    /// write happens first: a crash between the two resumes from the
    /// persisted residual on redelivery instead of losing the claim.
    fn persist_residual(
        &mut self,
        key: &[u8],
        element: Event,
        element_timestamp_ms: i64,
        restriction: Vec<u8>,
        estimator_state: Vec<u8>,
        delay: Duration,
    ) -> Result<(), OpError> {
        let state = RestrictionState {
            element,
            element_timestamp_ms,
            restriction,
            estimator_state,
        };
        self.state.put(&self.namespace, key, &state.encode()?)?;

        self.timers.schedule(TimerData {
            key: key.to_vec(),
            timer_id: CONTINUATION_TIMER_ID.to_string(),
            domain: TimeDomain::ProcessingTime,
            fire_timestamp: Utc::now() + delay,
            output_timestamp: state.element_timestamp(),
        });
        Ok(())
    }

    fn start_bundle(&mut self) {
        debug!(step = %self.config.step_id, "bundle start");
    }

    async fn finish_bundle(&mut self) -> Result<(), OpError> {
        self.sink.flush().await.map_err(OpError::Sink)?;
        debug!(step = %self.config.step_id, "bundle finish");
        Ok(())
    }

    /// Recompute the output watermark from the current holds and publish it
    /// if it advanced.
    async fn publish_watermark(&mut self) -> Result<(), OpError> {
        let hold = match (
            self.timers.earliest_event_time_fire(),
            self.timers.earliest_output_hold(),
        ) {
            (Some(fire), Some(held)) => Some(fire.min(held)),
            (fire, held) => fire.or(held),
        };

        if let Some(watermark) = self.watermarks.refresh_output(hold) {
            self.sink
                .emit_watermark(watermark)
                .await
                .map_err(OpError::Sink)?;
            if let Some(m) = &self.metrics {
                m.set_output_watermark(&self.config.step_id, watermark.timestamp_millis());
                m.set_pending_timers(&self.config.step_id, self.timers.len());
            }
            debug!(step = %self.config.step_id, watermark = %watermark, "advanced output watermark");
        }
        Ok(())
    }
}

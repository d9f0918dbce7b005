//! Restriction tracker and invoker
//!
//! Wraps the user-supplied processing function. One invocation claims chunks
//! of the restriction in a loop, forwarding every emitted output to the sink
//! as it is produced, until the restriction is exhausted, the user function
//! defers, or the invocation budget (output count or wall clock) runs out.
//! Budget exhaustion is not an error; it becomes a residual the scheduler
//! resumes later.

use crate::event::Event;
use crate::sink::OutputSink;
use crate::timer::TimeDomain;
use crate::work_item::{OutputTag, TaggedOutput, WindowedValue};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Invocation budget. These are tuning values, not correctness requirements:
/// they bound tail latency and memory use per invocation.
#[derive(Debug, Clone)]
pub struct InvokerConfig {
    /// Self-preempt after this many outputs in one invocation
    pub max_outputs_per_invocation: usize,
    /// Self-preempt after this much wall-clock time in one invocation
    pub max_invocation_duration: Duration,
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self {
            max_outputs_per_invocation: 10_000,
            max_invocation_duration: Duration::from_secs(10),
        }
    }
}

/// Irrecoverable failure reported by the user processing function.
#[derive(Debug, Error)]
#[error("process function failed: {0}")]
pub struct ProcessFnError(pub String);

/// A user-requested timer, recorded during an invocation and scheduled by
/// the operator when the invocation is reconciled.
#[derive(Debug, Clone)]
pub struct TimerRequest {
    pub timer_id: String,
    pub domain: TimeDomain,
    pub fire_timestamp: DateTime<Utc>,
    pub output_timestamp: DateTime<Utc>,
}

/// Per-chunk context handed to the user function.
pub struct ChunkContext<'a> {
    outputs: &'a mut Vec<TaggedOutput>,
    timers: &'a mut Vec<TimerRequest>,
}

impl ChunkContext<'_> {
    /// Emit one output record. It reaches the sink before the next chunk is
    /// processed.
    pub fn emit(&mut self, tag: OutputTag, value: WindowedValue<Event>) {
        self.outputs.push(TaggedOutput::new(tag, value));
    }

    /// Request a timer for this key. Scheduling overwrites any live timer
    /// with the same id.
    pub fn set_timer(
        &mut self,
        timer_id: impl Into<String>,
        domain: TimeDomain,
        fire_timestamp: DateTime<Utc>,
        output_timestamp: DateTime<Utc>,
    ) {
        self.timers.push(TimerRequest {
            timer_id: timer_id.into(),
            domain,
            fire_timestamp,
            output_timestamp,
        });
    }
}

/// What one chunk of processing produced.
#[derive(Debug, Clone)]
pub enum ChunkResult {
    /// The restriction is fully consumed.
    Complete,
    /// A chunk was claimed; more remains and processing can continue now.
    Partial {
        restriction: Vec<u8>,
        estimator_state: Vec<u8>,
    },
    /// A chunk was claimed; the function asks to be resumed after a
    /// wall-clock delay (backpressure, polling a slow source, ...).
    Deferred {
        restriction: Vec<u8>,
        estimator_state: Vec<u8>,
        resume_after: Duration,
    },
}

/// The user processing function.
///
/// Each call claims a bounded chunk of the restriction. The runtime treats
/// the restriction and estimator-state blobs as opaque; only this function
/// interprets them.
pub trait ProcessFn: Send + Sync {
    fn process_chunk(
        &self,
        element: &Event,
        restriction: &[u8],
        estimator_state: &[u8],
        ctx: &mut ChunkContext<'_>,
    ) -> Result<ChunkResult, ProcessFnError>;

    /// Whether this function needs bundle-finalization callbacks. The
    /// runtime has no engine support for them and rejects such functions at
    /// construction time.
    fn requires_bundle_finalization(&self) -> bool {
        false
    }
}

/// How one invocation ended.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Restriction fully consumed; all output emitted.
    Done,
    /// Partial progress; reschedule after `delay`.
    ResumeAfter {
        restriction: Vec<u8>,
        estimator_state: Vec<u8>,
        delay: Duration,
    },
    /// Partial progress; the invocation was preempted by its budget.
    /// Reschedule immediately.
    ResumeNow {
        restriction: Vec<u8>,
        estimator_state: Vec<u8>,
    },
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Done => "done",
            Outcome::ResumeAfter { .. } => "resume_after",
            Outcome::ResumeNow { .. } => "resume_now",
        }
    }
}

#[derive(Debug, Error)]
pub enum InvokeError {
    #[error(transparent)]
    UserFunction(#[from] ProcessFnError),
    #[error("output sink rejected output: {0}")]
    Sink(anyhow::Error),
}

/// Everything one invocation produced besides its sink side effects.
#[derive(Debug)]
pub struct InvocationResult {
    pub outcome: Outcome,
    pub outputs_emitted: usize,
    pub timer_requests: Vec<TimerRequest>,
}

/// Drives the user function for one invocation under the configured budget.
pub struct ProcessElementInvoker {
    config: InvokerConfig,
    process_fn: Arc<dyn ProcessFn>,
    sink: Arc<dyn OutputSink>,
}

impl ProcessElementInvoker {
    pub fn new(
        process_fn: Arc<dyn ProcessFn>,
        sink: Arc<dyn OutputSink>,
        config: InvokerConfig,
    ) -> Self {
        Self {
            config,
            process_fn,
            sink,
        }
    }

    pub fn config(&self) -> &InvokerConfig {
        &self.config
    }

    /// Run one invocation over `restriction`, claiming chunks until the
    /// restriction completes, the function defers, or the budget runs out.
    pub async fn invoke(
        &self,
        element: &Event,
        mut restriction: Vec<u8>,
        mut estimator_state: Vec<u8>,
    ) -> Result<InvocationResult, InvokeError> {
        let deadline = Instant::now() + self.config.max_invocation_duration;
        let mut outputs_emitted = 0usize;
        let mut timer_requests = Vec::new();

        loop {
            let mut outputs = Vec::new();
            let chunk = {
                let mut ctx = ChunkContext {
                    outputs: &mut outputs,
                    timers: &mut timer_requests,
                };
                self.process_fn
                    .process_chunk(element, &restriction, &estimator_state, &mut ctx)?
            };

            outputs_emitted += outputs.len();
            for output in &outputs {
                self.sink.emit(output).await.map_err(InvokeError::Sink)?;
            }

            match chunk {
                ChunkResult::Complete => {
                    return Ok(InvocationResult {
                        outcome: Outcome::Done,
                        outputs_emitted,
                        timer_requests,
                    });
                }
                ChunkResult::Deferred {
                    restriction,
                    estimator_state,
                    resume_after,
                } => {
                    return Ok(InvocationResult {
                        outcome: Outcome::ResumeAfter {
                            restriction,
                            estimator_state,
                            delay: resume_after,
                        },
                        outputs_emitted,
                        timer_requests,
                    });
                }
                ChunkResult::Partial {
                    restriction: residual,
                    estimator_state: estimator,
                } => {
                    restriction = residual;
                    estimator_state = estimator;

                    let budget_spent = outputs_emitted >= self.config.max_outputs_per_invocation
                        || Instant::now() >= deadline;
                    if budget_spent {
                        return Ok(InvocationResult {
                            outcome: Outcome::ResumeNow {
                                restriction,
                                estimator_state,
                            },
                            outputs_emitted,
                            timer_requests,
                        });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::restriction::OffsetRange;
    use crate::sink::CollectingSink;

    /// Claims one offset per chunk, emitting one output for it.
    struct PerOffsetFn;

    impl ProcessFn for PerOffsetFn {
        fn process_chunk(
            &self,
            element: &Event,
            restriction: &[u8],
            _estimator_state: &[u8],
            ctx: &mut ChunkContext<'_>,
        ) -> Result<ChunkResult, ProcessFnError> {
            let range = OffsetRange::decode(restriction)
                .map_err(|e| ProcessFnError(e.to_string()))?;
            if range.is_empty() {
                return Ok(ChunkResult::Complete);
            }

            let (claimed, residual) = range.split_at(1);
            let out = Event::new("Out").with_field("offset", claimed.start);
            let ts = element.timestamp;
            ctx.emit(OutputTag::main(), WindowedValue::new(out, ts));

            if residual.is_empty() {
                Ok(ChunkResult::Complete)
            } else {
                Ok(ChunkResult::Partial {
                    restriction: residual.encode(),
                    estimator_state: Vec::new(),
                })
            }
        }
    }

    struct DeferringFn;

    impl ProcessFn for DeferringFn {
        fn process_chunk(
            &self,
            _element: &Event,
            restriction: &[u8],
            _estimator_state: &[u8],
            _ctx: &mut ChunkContext<'_>,
        ) -> Result<ChunkResult, ProcessFnError> {
            Ok(ChunkResult::Deferred {
                restriction: restriction.to_vec(),
                estimator_state: Vec::new(),
                resume_after: Duration::from_secs(5),
            })
        }
    }

    struct FailingFn;

    impl ProcessFn for FailingFn {
        fn process_chunk(
            &self,
            _element: &Event,
            _restriction: &[u8],
            _estimator_state: &[u8],
            _ctx: &mut ChunkContext<'_>,
        ) -> Result<ChunkResult, ProcessFnError> {
            Err(ProcessFnError("boom".into()))
        }
    }

    fn invoker(config: InvokerConfig) -> (ProcessElementInvoker, Arc<CollectingSink>) {
        let sink = Arc::new(CollectingSink::new());
        (
            ProcessElementInvoker::new(Arc::new(PerOffsetFn), sink.clone(), config),
            sink,
        )
    }

    #[tokio::test]
    async fn test_small_restriction_completes() {
        let (invoker, sink) = invoker(InvokerConfig::default());
        let result = invoker
            .invoke(&Event::new("E"), OffsetRange::new(0, 3).encode(), vec![])
            .await
            .unwrap();

        assert!(matches!(result.outcome, Outcome::Done));
        assert_eq!(result.outputs_emitted, 3);
        assert_eq!(sink.output_count(), 3);
    }

    #[tokio::test]
    async fn test_output_budget_preempts() {
        let config = InvokerConfig {
            max_outputs_per_invocation: 10,
            ..Default::default()
        };
        let (invoker, sink) = invoker(config);
        let result = invoker
            .invoke(&Event::new("E"), OffsetRange::new(0, 100).encode(), vec![])
            .await
            .unwrap();

        let restriction = match result.outcome {
            Outcome::ResumeNow { restriction, .. } => restriction,
            other => panic!("expected ResumeNow, got {:?}", other),
        };
        assert_eq!(result.outputs_emitted, 10);
        assert_eq!(sink.output_count(), 10);
        assert_eq!(OffsetRange::decode(&restriction).unwrap(), OffsetRange::new(10, 100));
    }

    #[tokio::test]
    async fn test_time_budget_preempts() {
        let config = InvokerConfig {
            max_invocation_duration: Duration::ZERO,
            ..Default::default()
        };
        let (invoker, _sink) = invoker(config);
        let result = invoker
            .invoke(&Event::new("E"), OffsetRange::new(0, 100).encode(), vec![])
            .await
            .unwrap();

        // One chunk gets claimed, then the expired deadline preempts
        assert!(matches!(result.outcome, Outcome::ResumeNow { .. }));
        assert_eq!(result.outputs_emitted, 1);
    }

    #[tokio::test]
    async fn test_deferred_becomes_resume_after() {
        let sink = Arc::new(CollectingSink::new());
        let invoker = ProcessElementInvoker::new(
            Arc::new(DeferringFn),
            sink.clone(),
            InvokerConfig::default(),
        );
        let result = invoker
            .invoke(&Event::new("E"), b"r".to_vec(), vec![])
            .await
            .unwrap();

        let Outcome::ResumeAfter { restriction, delay, .. } = result.outcome else {
            panic!("expected ResumeAfter");
        };
        assert_eq!(restriction, b"r".to_vec());
        assert_eq!(delay, Duration::from_secs(5));
        assert_eq!(sink.output_count(), 0);
    }

    #[tokio::test]
    async fn test_user_failure_surfaces() {
        let sink = Arc::new(CollectingSink::new());
        let invoker =
            ProcessElementInvoker::new(Arc::new(FailingFn), sink, InvokerConfig::default());
        let err = invoker
            .invoke(&Event::new("E"), vec![], vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::UserFunction(_)));
    }
}

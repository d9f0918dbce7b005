//! End-to-end scenarios for the splittable work scheduler.

use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use virta_runtime::{
    ChunkContext, ChunkResult, CollectingSink, Event, InvokerConfig, KeyedStateStore,
    KeyedWorkItem, MemoryStateStore, Metrics, OffsetRange, OpConfig, OutputTag, ProcessFn,
    ProcessFnError, SplittableOp, TimeDomain, WindowedValue, WorkElement,
};

fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

/// Claims one offset per chunk and emits one output for it.
struct OffsetFn;

impl ProcessFn for OffsetFn {
    fn process_chunk(
        &self,
        element: &Event,
        restriction: &[u8],
        _estimator_state: &[u8],
        ctx: &mut ChunkContext<'_>,
    ) -> Result<ChunkResult, ProcessFnError> {
        let range =
            OffsetRange::decode(restriction).map_err(|e| ProcessFnError(e.to_string()))?;
        if range.is_empty() {
            return Ok(ChunkResult::Complete);
        }

        let (claimed, residual) = range.split_at(1);
        ctx.emit(
            OutputTag::main(),
            WindowedValue::new(
                Event::new("Out").with_field("offset", claimed.start),
                element.timestamp,
            ),
        );

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

fn budgeted_op(
    max_outputs: usize,
    process_fn: Arc<dyn ProcessFn>,
    store: Arc<dyn KeyedStateStore>,
    sink: Arc<CollectingSink>,
) -> SplittableOp {
    let config = OpConfig::new("test-step").with_invoker(InvokerConfig {
        max_outputs_per_invocation: max_outputs,
        ..Default::default()
    });
    SplittableOp::new(config, process_fn, store, sink).unwrap()
}

fn offsets_seen(sink: &CollectingSink) -> Vec<i64> {
    sink.outputs()
        .iter()
        .map(|o| o.value.value.get_int("offset").unwrap())
        .collect()
}

/// The canonical scenario: restriction [0,100) with a 10-output budget takes
/// one element invocation plus nine continuation firings, emitting exactly
/// 100 outputs, and leaves the key quiescent.
#[tokio::test]
async fn test_budgeted_restriction_runs_to_completion() {
    let store: Arc<dyn KeyedStateStore> = Arc::new(MemoryStateStore::new());
    let sink = Arc::new(CollectingSink::new());
    let metrics = Metrics::new();
    let mut op =
        budgeted_op(10, Arc::new(OffsetFn), store, sink.clone()).with_metrics(metrics.clone());

    let element = Event::new("E").with_timestamp(ts(1));
    let item = KeyedWorkItem::elements_work_item(
        b"k1".to_vec(),
        vec![WorkElement::new(
            element,
            OffsetRange::new(0, 100).encode(),
            Vec::new(),
        )],
    );
    op.process_work_item(item).await.unwrap();

    // First invocation stopped at the budget, residual persisted
    assert_eq!(sink.output_count(), 10);
    assert!(!op.is_quiescent(b"k1").unwrap());
    assert_eq!(op.pending_timer_count(), 1);

    // The engine fires continuation timers until the restriction is done
    let fired = op
        .drain_ready_processing_timers(Utc::now() + chrono::Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(fired, 9);

    assert_eq!(offsets_seen(&sink), (0..100).collect::<Vec<_>>());
    assert!(op.is_quiescent(b"k1").unwrap());
    assert_eq!(op.pending_timer_count(), 0);

    let gathered = metrics.gather();
    assert!(gathered.contains("virta_work_items_total"));
    assert!(gathered.contains("resume_now"));
    assert!(gathered.contains("virta_timers_fired_total"));
}

/// Redelivering the same work item after partial progress resumes from the
/// persisted residual; it never regresses to the delivered restriction and
/// never duplicates already-claimed offsets.
#[tokio::test]
async fn test_redelivery_resumes_from_persisted_state() {
    let store: Arc<dyn KeyedStateStore> = Arc::new(MemoryStateStore::new());
    let sink = Arc::new(CollectingSink::new());
    let mut op = budgeted_op(10, Arc::new(OffsetFn), store, sink.clone());

    let make_item = || {
        KeyedWorkItem::elements_work_item(
            b"k1".to_vec(),
            vec![WorkElement::new(
                Event::new("E").with_timestamp(ts(1)),
                OffsetRange::new(0, 100).encode(),
                Vec::new(),
            )],
        )
    };

    op.process_work_item(make_item()).await.unwrap();
    op.process_work_item(make_item()).await.unwrap();

    // Second delivery continued at offset 10 rather than restarting
    assert_eq!(offsets_seen(&sink), (0..20).collect::<Vec<_>>());
}

/// Sets an event-time timer at T3 during phase one, then completes when that
/// timer fires.
struct PhasedFn {
    fires: Arc<AtomicUsize>,
}

impl ProcessFn for PhasedFn {
    fn process_chunk(
        &self,
        _element: &Event,
        restriction: &[u8],
        _estimator_state: &[u8],
        ctx: &mut ChunkContext<'_>,
    ) -> Result<ChunkResult, ProcessFnError> {
        match restriction {
            b"phase1" => {
                ctx.set_timer("t3", TimeDomain::EventTime, ts(3), ts(3));
                Ok(ChunkResult::Deferred {
                    restriction: b"phase2".to_vec(),
                    estimator_state: Vec::new(),
                    resume_after: Duration::from_secs(3600),
                })
            }
            b"phase2" => {
                self.fires.fetch_add(1, Ordering::SeqCst);
                Ok(ChunkResult::Complete)
            }
            other => Err(ProcessFnError(format!("unexpected restriction {:?}", other))),
        }
    }
}

/// The watermark scenario: a timer scheduled at T3 fires exactly once when
/// the input watermark passes it, and the output watermark clears T3 only
/// after the key's residual no longer holds it back.
#[tokio::test]
async fn test_event_timer_fires_once_and_releases_hold() {
    let store: Arc<dyn KeyedStateStore> = Arc::new(MemoryStateStore::new());
    let sink = Arc::new(CollectingSink::new());
    let fires = Arc::new(AtomicUsize::new(0));
    let mut op = budgeted_op(
        10,
        Arc::new(PhasedFn {
            fires: fires.clone(),
        }),
        store,
        sink.clone(),
    );

    let item = KeyedWorkItem::elements_work_item(
        b"k2".to_vec(),
        vec![WorkElement::new(
            Event::new("E").with_timestamp(ts(1)),
            b"phase1".to_vec(),
            Vec::new(),
        )],
    );
    op.process_work_item(item).await.unwrap();

    // Phase one deferred: residual persisted, continuation pending, user
    // timer at T3 pending. The residual holds the output watermark at T1.
    op.advance_input_watermark(ts(0)).await.unwrap();
    assert_eq!(op.output_watermark(), Some(ts(0)));

    op.advance_input_watermark(ts(2)).await.unwrap();
    assert_eq!(op.output_watermark(), Some(ts(1)));

    // A non-advancing watermark is a complete no-op
    op.advance_input_watermark(ts(2)).await.unwrap();
    assert_eq!(fires.load(Ordering::SeqCst), 0);

    // T5 passes the timer: it fires exactly once, the restriction completes,
    // and the output watermark is free to reach T5.
    op.advance_input_watermark(ts(5)).await.unwrap();
    assert_eq!(fires.load(Ordering::SeqCst), 1);
    assert_eq!(op.output_watermark(), Some(ts(5)));
    assert!(op.is_quiescent(b"k2").unwrap());

    assert_eq!(sink.watermarks(), vec![ts(0), ts(1), ts(5)]);
}

/// Defers once with a persisted residual, then fails on resume.
struct FaultyFn;

impl ProcessFn for FaultyFn {
    fn process_chunk(
        &self,
        _element: &Event,
        restriction: &[u8],
        _estimator_state: &[u8],
        _ctx: &mut ChunkContext<'_>,
    ) -> Result<ChunkResult, ProcessFnError> {
        match restriction {
            b"armed" => Ok(ChunkResult::Deferred {
                restriction: b"boom".to_vec(),
                estimator_state: Vec::new(),
                resume_after: Duration::ZERO,
            }),
            _ => Err(ProcessFnError("irrecoverable".to_string())),
        }
    }
}

/// A failed key keeps its last persisted state, stalls the watermark at its
/// hold, and does not halt other keys.
#[tokio::test]
async fn test_failed_key_stalls_watermark_but_not_other_keys() {
    let store: Arc<dyn KeyedStateStore> = Arc::new(MemoryStateStore::new());
    let sink = Arc::new(CollectingSink::new());
    let mut op = budgeted_op(10, Arc::new(FaultyFn), store.clone(), sink.clone());

    let item = KeyedWorkItem::elements_work_item(
        b"bad".to_vec(),
        vec![WorkElement::new(
            Event::new("E").with_timestamp(ts(1)),
            b"armed".to_vec(),
            Vec::new(),
        )],
    );
    op.process_work_item(item).await.unwrap();

    // The continuation fires and the user function fails hard
    let err = op
        .drain_ready_processing_timers(Utc::now() + chrono::Duration::hours(1))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("irrecoverable"));

    // Last persisted state survives for a supervised restart, and the timer
    // went back into the store
    assert!(!op.is_quiescent(b"bad").unwrap());
    assert_eq!(op.pending_timer_count(), 1);

    // The stuck key holds the watermark at its element timestamp
    op.advance_input_watermark(ts(50)).await.unwrap();
    assert_eq!(op.output_watermark(), Some(ts(1)));

    // Other keys are unaffected: quiescent after their element completes
    struct DoneFn;
    impl ProcessFn for DoneFn {
        fn process_chunk(
            &self,
            _element: &Event,
            _restriction: &[u8],
            _estimator_state: &[u8],
            _ctx: &mut ChunkContext<'_>,
        ) -> Result<ChunkResult, ProcessFnError> {
            Ok(ChunkResult::Complete)
        }
    }
    let mut healthy = budgeted_op(10, Arc::new(DoneFn), store, sink);
    let item = KeyedWorkItem::elements_work_item(
        b"good".to_vec(),
        vec![WorkElement::new(Event::new("E"), Vec::new(), Vec::new())],
    );
    healthy.process_work_item(item).await.unwrap();
    assert!(healthy.is_quiescent(b"good").unwrap());
}

/// ResumeAfter delays the continuation: nothing fires before the delay
/// elapses on the wall clock.
#[tokio::test]
async fn test_resume_after_waits_for_delay() {
    struct DeferFn;
    impl ProcessFn for DeferFn {
        fn process_chunk(
            &self,
            _element: &Event,
            restriction: &[u8],
            _estimator_state: &[u8],
            _ctx: &mut ChunkContext<'_>,
        ) -> Result<ChunkResult, ProcessFnError> {
            match restriction {
                b"wait" => Ok(ChunkResult::Deferred {
                    restriction: b"go".to_vec(),
                    estimator_state: Vec::new(),
                    resume_after: Duration::from_secs(600),
                }),
                _ => Ok(ChunkResult::Complete),
            }
        }
    }

    let store: Arc<dyn KeyedStateStore> = Arc::new(MemoryStateStore::new());
    let sink = Arc::new(CollectingSink::new());
    let mut op = budgeted_op(10, Arc::new(DeferFn), store, sink);

    let item = KeyedWorkItem::elements_work_item(
        b"k".to_vec(),
        vec![WorkElement::new(
            Event::new("E"),
            b"wait".to_vec(),
            Vec::new(),
        )],
    );
    op.process_work_item(item).await.unwrap();

    // Not ready yet: the continuation sits 10 minutes out
    let fired = op
        .drain_ready_processing_timers(Utc::now() + chrono::Duration::seconds(60))
        .await
        .unwrap();
    assert_eq!(fired, 0);
    assert!(!op.is_quiescent(b"k").unwrap());

    // Past the delay it fires and completes
    let fired = op
        .drain_ready_processing_timers(Utc::now() + chrono::Duration::seconds(700))
        .await
        .unwrap();
    assert_eq!(fired, 1);
    assert!(op.is_quiescent(b"k").unwrap());
}

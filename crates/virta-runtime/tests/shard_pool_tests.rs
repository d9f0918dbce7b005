//! Sharded deployment: key-stable routing and merged watermark emission.

use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use virta_runtime::{
    ChunkContext, ChunkResult, CollectingSink, Event, InvokerConfig, KeyedShardPool,
    KeyedStateStore, KeyedWorkItem, MemoryStateStore, OffsetRange, OpConfig, OutputSink,
    OutputTag, ProcessFn, ProcessFnError, ShardPoolConfig, SplittableOp, WatermarkMergeSink,
    WindowedValue, WorkElement,
};

fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

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

#[tokio::test]
async fn test_sharded_pool_processes_all_keys() {
    let collector = Arc::new(CollectingSink::new());
    let store: Arc<dyn KeyedStateStore> = Arc::new(MemoryStateStore::new());
    let merge = WatermarkMergeSink::new(collector.clone(), 2);

    let pool = KeyedShardPool::spawn(
        ShardPoolConfig {
            name: "test-pool".to_string(),
            shards: 2,
            queue_size: 64,
        },
        |shard| {
            let sink: Arc<dyn OutputSink> = Arc::new(merge.shard_sink(shard));
            let config = OpConfig::new("pool-step").with_invoker(InvokerConfig {
                max_outputs_per_invocation: 10,
                ..Default::default()
            });
            SplittableOp::new(config, Arc::new(OffsetFn), store.clone(), sink)
        },
    )
    .unwrap();

    // Four keys, 25 offsets each: 100 outputs once every residual drains
    for key in [b"alpha".as_slice(), b"beta", b"gamma", b"delta"] {
        let item = KeyedWorkItem::elements_work_item(
            key.to_vec(),
            vec![WorkElement::new(
                Event::new("E").with_timestamp(ts(1)),
                OffsetRange::new(0, 25).encode(),
                Vec::new(),
            )],
        );
        pool.submit(item).await.unwrap();
    }
    pool.advance_watermark(ts(30)).await.unwrap();

    let metrics = pool.metrics();
    assert_eq!(metrics.shards, 2);
    assert_eq!(metrics.items_submitted, 4);
    assert_eq!(metrics.watermarks_broadcast, 1);

    pool.shutdown().await.unwrap();

    assert_eq!(collector.output_count(), 100);
    // Both shards processed their keys to completion and reported, so the
    // merged watermark reached the broadcast value
    assert_eq!(merge.merged_watermark(), Some(ts(30)));
    assert_eq!(collector.watermarks().last(), Some(&ts(30)));
}

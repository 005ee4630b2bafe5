//! End-to-end tests for pipeline execution.

use crate::context::{Context, ExecutionRequest};
use crate::errors::PipelineError;
use crate::pipeline::{Pipeline, PipelineBuilder, PipelineOptions, RunState};
use crate::stages::Process;
use anyhow::anyhow;
use async_trait::async_trait;
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// The item most tests push through the chain: an id plus an atomic
/// accumulator that stages bump in place.
#[derive(Debug, Default)]
struct Record {
    id: u64,
    total: AtomicU64,
}

impl Record {
    fn new(id: u64) -> Self {
        Self {
            id,
            total: AtomicU64::new(0),
        }
    }

    fn bump(&self, amount: u64) {
        self.total.fetch_add(amount, Ordering::SeqCst);
    }

    fn total(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }
}

#[derive(Debug, PartialEq)]
struct Note(&'static str);

#[derive(Debug)]
struct Tally;

fn fast() -> PipelineOptions {
    PipelineOptions::new().with_poll_interval(Duration::from_millis(1))
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn record_id(request: &Arc<ExecutionRequest>) -> u64 {
    request.item().try_latest::<Record>().map_or(0, |r| r.id)
}

fn bump_by_id(request: &Arc<ExecutionRequest>) {
    if let Some(record) = request.item().try_latest::<Record>() {
        record.bump(record.id);
    }
}

#[tokio::test]
async fn test_single_item_round_trip() {
    init_logging();
    let pipeline = PipelineBuilder::new()
        .with_options(fast())
        .add_inline_step(|req| async move {
            req.item().add(Note("first"));
            Ok(())
        })
        .add_inline_step(|req| async move {
            req.item().add(Note("second"));
            Ok(())
        })
        .build()
        .unwrap();

    let result = pipeline.invoke(Record::new(1)).await.unwrap();

    let item = result.expect("unfiltered item must reach the results");
    let notes = item.get_all::<Note>();
    assert_eq!(notes.len(), 2);
    assert_eq!(*notes[0], Note("first"));
    assert_eq!(*notes[1], Note("second"));
    assert!(!item.has_errors());
    pipeline.dispose().await;
}

#[tokio::test]
async fn test_each_item_appears_exactly_once() {
    let pipeline = PipelineBuilder::new()
        .with_options(fast())
        .add_inline_buffered_step(|_req| async move { Ok(()) })
        .build()
        .unwrap();

    let results = pipeline
        .invoke_many_sync((0..20u64).map(Record::new), Some(4))
        .await
        .unwrap();

    let mut ids: Vec<u64> = results
        .iter()
        .filter_map(|ctx| ctx.try_latest::<Record>().map(|r| r.id))
        .collect();
    ids.sort_unstable();
    assert_eq!(ids, (0..20).collect::<Vec<_>>());
    pipeline.dispose().await;
}

#[tokio::test]
async fn test_filtered_items_stop_at_the_filter() {
    let after_filter = Arc::new(AtomicUsize::new(0));
    let probe = after_filter.clone();

    let pipeline = PipelineBuilder::new()
        .with_options(fast())
        .add_inline_filter(|req| async move { Ok(record_id(&req) % 2 == 0) })
        .add_inline_step(move |_req| {
            let probe = probe.clone();
            async move {
                probe.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .build()
        .unwrap();

    pipeline.start().await.unwrap();
    let mut requests = Vec::new();
    for id in 1..=10 {
        requests.push(pipeline.add_input_value(Record::new(id)).await.unwrap());
    }
    pipeline.finalize().await.unwrap();

    let results = pipeline.results().unwrap().collect().await;
    assert_eq!(results.len(), 5);
    assert_eq!(after_filter.load(Ordering::SeqCst), 5);

    // Every request ends completed: filtered ones by the filter's
    // negative decision, the rest by the terminal sink.
    for request in &requests {
        assert!(request.is_completed());
    }
    // A filtered request never visited the stage behind the filter.
    let odd = &requests[0];
    assert_eq!(odd.visited(), vec!["Step 2. InlineFilter"]);
    pipeline.dispose().await;
}

#[tokio::test]
async fn test_invoke_returns_none_for_filtered_item() {
    let pipeline = PipelineBuilder::new()
        .with_options(fast())
        .add_inline_filter(|_req| async move { Ok(false) })
        .build()
        .unwrap();

    let result = pipeline.invoke(Record::new(1)).await.unwrap();
    assert!(result.is_none());
    pipeline.dispose().await;
}

struct Annotate;

#[async_trait]
impl Process for Annotate {
    async fn process(&self, request: Arc<ExecutionRequest>) -> anyhow::Result<()> {
        request.item().add(Note("annotated"));
        Ok(())
    }
}

struct Explode;

#[async_trait]
impl Process for Explode {
    async fn process(&self, _request: Arc<ExecutionRequest>) -> anyhow::Result<()> {
        Err(anyhow!("X"))
    }
}

struct Publish;

#[async_trait]
impl Process for Publish {
    async fn process(&self, request: Arc<ExecutionRequest>) -> anyhow::Result<()> {
        request.item().add(Note("published"));
        Ok(())
    }
}

#[tokio::test]
async fn test_error_is_recorded_and_later_stages_still_run() {
    let pipeline = PipelineBuilder::new()
        .with_options(fast())
        .add_step(Annotate)
        .add_step(Explode)
        .add_step(Publish)
        .build()
        .unwrap();

    let item = pipeline
        .invoke(Record::new(1))
        .await
        .unwrap()
        .expect("errors must not drop the item");

    // The ledger is keyed by the tail-to-head stage name.
    let errors = item.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors["Step 2. Explode"].len(), 1);
    assert_eq!(errors["Step 2. Explode"][0].to_string(), "X");

    // The stage behind the failing one still executed.
    let notes = item.get_all::<Note>();
    assert_eq!(*notes[0], Note("annotated"));
    assert_eq!(*notes[1], Note("published"));
    pipeline.dispose().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_buffered_concurrency_stays_bounded() {
    let live = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let live_probe = live.clone();
    let peak_probe = peak.clone();

    let pipeline = PipelineBuilder::new()
        .with_options(
            fast()
                .with_max_concurrency(3)
                .with_max_queue_depth(100),
        )
        .add_inline_buffered_step(move |_req| {
            let live = live_probe.clone();
            let peak = peak_probe.clone();
            async move {
                let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                live.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .build()
        .unwrap();

    let results = pipeline
        .invoke_many_sync((0..30u64).map(Record::new), None)
        .await
        .unwrap();

    assert_eq!(results.len(), 30);
    assert!(peak.load(Ordering::SeqCst) <= 3);
    pipeline.dispose().await;
}

#[tokio::test]
async fn test_lifecycle_misuse_fails_fast() {
    let build = || {
        PipelineBuilder::new()
            .with_options(fast())
            .add_inline_step(|_req| async move { Ok(()) })
            .build()
            .unwrap()
    };

    let pipeline = build();
    pipeline.start().await.unwrap();
    assert_eq!(
        pipeline.start().await.unwrap_err(),
        PipelineError::AlreadyRunning
    );

    let fresh = build();
    assert_eq!(
        fresh.finalize().await.unwrap_err(),
        PipelineError::NotRunning
    );
    assert_eq!(
        fresh.add_input_value(Record::new(1)).await.unwrap_err(),
        PipelineError::NotRunning
    );

    pipeline.finalize().await.unwrap();
    assert_eq!(
        pipeline.finalize().await.unwrap_err(),
        PipelineError::AlreadyFinalized
    );
    assert_eq!(
        pipeline.add_input_value(Record::new(1)).await.unwrap_err(),
        PipelineError::AlreadyFinalized
    );

    pipeline.dispose().await;
    fresh.dispose().await;
}

fn branch_counter_pipeline() -> Pipeline {
    let inner = PipelineBuilder::new().add_inline_step(|req| async move {
        bump_by_id(&req);
        Ok(())
    });

    PipelineBuilder::new()
        .with_options(fast())
        .add_inline_step(|req| async move {
            bump_by_id(&req);
            Ok(())
        })
        .add_inline_branch(|req| async move { Ok(record_id(&req) % 2 == 0) }, inner)
        .add_inline_step(|_req| async move { Ok(()) })
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_branch_taken_for_even_id() {
    let pipeline = branch_counter_pipeline();
    let item = pipeline.invoke(Record::new(2)).await.unwrap().unwrap();

    // Outer bump (+2), inner bump (+2), final step adds nothing.
    assert_eq!(item.try_latest::<Record>().unwrap().total(), 4);
    pipeline.dispose().await;
}

#[tokio::test]
async fn test_branch_skipped_for_odd_id() {
    let pipeline = branch_counter_pipeline();
    let item = pipeline.invoke(Record::new(3)).await.unwrap().unwrap();

    assert_eq!(item.try_latest::<Record>().unwrap().total(), 3);
    pipeline.dispose().await;
}

#[tokio::test]
async fn test_fork_takes_matching_items_for_good() {
    let inner = PipelineBuilder::new().add_inline_step(|req| async move {
        req.item().add(Note("forked"));
        Ok(())
    });

    let pipeline = PipelineBuilder::new()
        .with_options(fast())
        .add_inline_step(|req| async move {
            bump_by_id(&req);
            Ok(())
        })
        .add_inline_fork(|req| async move { Ok(record_id(&req) % 2 == 0) }, inner)
        .build()
        .unwrap();

    let results = pipeline
        .invoke_many_sync((1..=4u64).map(Record::new), Some(1))
        .await
        .unwrap();

    // Forked and unforked items land in the combined output exactly once.
    let mut ids: Vec<u64> = results
        .iter()
        .filter_map(|ctx| ctx.try_latest::<Record>().map(|r| r.id))
        .collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 2, 3, 4]);

    for ctx in &results {
        let id = ctx.try_latest::<Record>().unwrap().id;
        let forked = ctx.get_all::<Note>().iter().any(|n| **n == Note("forked"));
        // Matching items carry the sub-chain's mark; the rest are untouched.
        assert_eq!(forked, id % 2 == 0);
    }
    pipeline.dispose().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_global_context_sees_every_item() {
    let global = Arc::new(Context::new());
    let pipeline = PipelineBuilder::new()
        .with_options(fast())
        .with_global_context(global.clone())
        .add_inline_buffered_step(|req| async move {
            req.global().add(Tally);
            Ok(())
        })
        .build()
        .unwrap();

    let results = pipeline
        .invoke_many_sync((0..50u64).map(Record::new), Some(8))
        .await
        .unwrap();

    assert_eq!(results.len(), 50);
    assert_eq!(global.get_all::<Tally>().len(), 50);
    assert!(Arc::ptr_eq(&pipeline.global_context(), &global));
    pipeline.dispose().await;
}

#[tokio::test]
async fn test_source_feeds_the_chain() {
    let pipeline = PipelineBuilder::new()
        .with_options(fast())
        .add_inline_source(|req| async move {
            req.item().add(Note("sourced"));
            Ok(())
        })
        .add_inline_step(|req| async move {
            req.item().add(Note("stepped"));
            Ok(())
        })
        .build()
        .unwrap();

    let results = pipeline
        .invoke_many_sync((0..3u64).map(Record::new), Some(1))
        .await
        .unwrap();

    assert_eq!(results.len(), 3);
    for ctx in &results {
        let notes = ctx.get_all::<Note>();
        assert_eq!(*notes[0], Note("sourced"));
        assert_eq!(*notes[1], Note("stepped"));
    }
    pipeline.dispose().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_invoke_many_streams_lazily() {
    let pipeline = PipelineBuilder::new()
        .with_options(fast())
        .add_inline_buffered_step(|_req| async move { Ok(()) })
        .build()
        .unwrap();

    let mut results = pipeline
        .invoke_many((0..5u64).map(Record::new))
        .await
        .unwrap();

    let mut seen = 0;
    while let Some(_item) = results.next().await {
        seen += 1;
    }
    assert_eq!(seen, 5);
    pipeline.dispose().await;
}

#[tokio::test]
async fn test_services_resolve_per_request() {
    struct Threshold(u64);

    let pipeline = PipelineBuilder::new()
        .with_options(fast())
        .register_service(Threshold(3))
        .add_inline_filter(|req| async move {
            let threshold = req
                .services()
                .get::<Threshold>()
                .ok_or_else(|| anyhow!("threshold not registered"))?;
            Ok(record_id(&req) >= threshold.0)
        })
        .build()
        .unwrap();

    assert!(pipeline.invoke(Record::new(5)).await.unwrap().is_some());
    pipeline.dispose().await;
}

#[tokio::test]
async fn test_wait_returns_after_drain() {
    let pipeline = PipelineBuilder::new()
        .with_options(fast())
        .add_inline_buffered_step(|_req| async move { Ok(()) })
        .build()
        .unwrap();

    pipeline.start().await.unwrap();
    pipeline.add_input_value(Record::new(1)).await.unwrap();
    pipeline.finalize().await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), pipeline.wait())
        .await
        .expect("wait must resolve once drained")
        .unwrap();
    assert_eq!(pipeline.state(), RunState::Stopped);
    pipeline.dispose().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancellation_unwinds_a_running_pipeline() {
    init_logging();
    let pipeline = PipelineBuilder::new()
        .with_options(fast().with_max_concurrency(1))
        .add_inline_buffered_step(|_req| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(())
        })
        .build()
        .unwrap();

    pipeline.start().await.unwrap();
    for id in 0..10 {
        pipeline.add_input_value(Record::new(id)).await.unwrap();
    }
    pipeline.cancellation_token().cancel("test shutdown");

    // The monitor unblocks and the result stream terminates instead of
    // waiting for the queue to drain.
    let results = pipeline.results().unwrap();
    let drained = tokio::time::timeout(Duration::from_secs(5), results.collect())
        .await
        .expect("cancellation must end the stream");
    assert!(drained.len() < 10);
    pipeline.dispose().await;
}

#[tokio::test]
async fn test_results_can_only_be_taken_once() {
    let pipeline = PipelineBuilder::new()
        .with_options(fast())
        .add_inline_step(|_req| async move { Ok(()) })
        .build()
        .unwrap();

    let _results = pipeline.results().unwrap();
    assert_eq!(
        pipeline.results().unwrap_err(),
        PipelineError::ResultsConsumed
    );
    pipeline.dispose().await;
}

#[tokio::test]
async fn test_nested_branch_inside_branch() {
    let innermost = PipelineBuilder::new().add_inline_step(|req| async move {
        bump_by_id(&req);
        Ok(())
    });
    let inner = PipelineBuilder::new()
        .add_inline_step(|req| async move {
            bump_by_id(&req);
            Ok(())
        })
        .add_inline_branch(|_req| async move { Ok(true) }, innermost);

    let pipeline = PipelineBuilder::new()
        .with_options(fast())
        .add_inline_branch(|_req| async move { Ok(true) }, inner)
        .build()
        .unwrap();

    let item = pipeline.invoke(Record::new(5)).await.unwrap().unwrap();
    // Both nested levels bumped the accumulator.
    assert_eq!(item.try_latest::<Record>().unwrap().total(), 10);
    pipeline.dispose().await;
}

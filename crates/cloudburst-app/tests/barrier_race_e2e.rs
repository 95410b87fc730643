use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cloudburst_app::config::PipelineConfig;
use cloudburst_app::services::records::segment_doc_id;
use cloudburst_app::services::store::create_typed;
use cloudburst_app::services::{
    BarrierError, BarrierOutcome, BlobStore, JobDocument, JobStatus, MemoryBlobStore,
    MemoryRepository, PhaseState, PipelineContext, RawArtifact, RetentionFlag, SegmentDocument,
    SleepWaiter, YieldWaiter, advance_to_analyzing, await_barrier, handle_segment, load,
    process_segment, reassemble, segment_job,
};
use tokio::sync::watch;
use tokio::task::JoinSet;

const PHASE: &str = "analysis";

async fn segmented_job(body: &'static [u8], segment_size: u64) -> Arc<PipelineContext> {
    let repo = Arc::new(MemoryRepository::new());
    let blobs = Arc::new(MemoryBlobStore::new());
    blobs
        .put("bucket", "race/race.bin", Bytes::from_static(body))
        .await
        .expect("raw");
    let raw = RawArtifact {
        file_name: "race.bin".into(),
        key: "race/race.bin".into(),
        size_bytes: None,
        retain_input: RetentionFlag::Keep,
        retain_debug: RetentionFlag::Discard,
    };
    create_typed(
        repo.as_ref(),
        JobDocument::split(
            "race",
            "bucket",
            raw,
            PHASE,
            PhaseState::pending(segment_size, RetentionFlag::Discard),
        ),
    )
    .await
    .expect("job");
    let pipeline = PipelineConfig {
        phase: PHASE.to_string(),
        ..PipelineConfig::default()
    };
    let ctx = Arc::new(PipelineContext::new(repo, blobs, pipeline).with_waiter(YieldWaiter));
    segment_job(&ctx, "race").await.expect("segment");
    advance_to_analyzing(&ctx, "race").await.expect("advance");
    ctx
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_detectors_claim_exactly_once() {
    let ctx = segmented_job(b"0123456789abcdef", 4).await;
    for ordinal in 0..4 {
        process_segment(&ctx, &segment_doc_id("race", PHASE, ordinal))
            .await
            .expect("worker");
    }
    let terminal: SegmentDocument = load(ctx.repo.as_ref(), &segment_doc_id("race", PHASE, 3))
        .await
        .expect("terminal segment");
    assert!(terminal.last_seg);

    let mut detectors = JoinSet::new();
    for _ in 0..8 {
        let ctx = Arc::clone(&ctx);
        let segment = terminal.clone();
        detectors.spawn(async move { await_barrier(&ctx, &segment).await });
    }
    let mut claimed = Vec::new();
    let mut already = 0;
    while let Some(joined) = detectors.join_next().await {
        match joined.expect("join").expect("barrier") {
            BarrierOutcome::Claimed(job) => claimed.push(job),
            BarrierOutcome::AlreadyStarted => already += 1,
            BarrierOutcome::NotTerminal => panic!("terminal segment reported as not terminal"),
        }
    }
    assert_eq!(claimed.len(), 1);
    assert_eq!(already, 7);

    let job = claimed.pop().expect("winner");
    assert_eq!(job.status(PHASE), Some(JobStatus::Complete));
    let report = reassemble(&ctx, &job).await.expect("reassemble");
    assert_eq!(
        ctx.blobs.get("bucket", &report.output_key).await.expect("merged"),
        Bytes::from_static(b"0123456789abcdef")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn terminal_segment_first_waits_for_the_rest() {
    let ctx = segmented_job(b"abcdefghij", 4).await;

    let terminal = {
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move { handle_segment(&ctx, &segment_doc_id("race", PHASE, 2)).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let mut others = JoinSet::new();
    for ordinal in 0..2 {
        let ctx = Arc::clone(&ctx);
        others.spawn(async move { handle_segment(&ctx, &segment_doc_id("race", PHASE, ordinal)).await });
    }
    while let Some(joined) = others.join_next().await {
        let run = joined.expect("join").expect("segment");
        assert!(matches!(run.barrier, Some(BarrierOutcome::NotTerminal)));
        assert!(run.reassembly.is_none());
    }

    let run = terminal.await.expect("join").expect("terminal run");
    let report = run.reassembly.expect("terminal invocation merges");
    assert_eq!(report.segments.len(), 3);
    assert_eq!(
        ctx.blobs.get("bucket", &report.output_key).await.expect("merged"),
        Bytes::from_static(b"abcdefghij")
    );
    let job: JobDocument = load(ctx.repo.as_ref(), "race").await.expect("job");
    assert_eq!(job.status(PHASE), Some(JobStatus::Complete));
}

#[tokio::test]
async fn shutdown_cancels_a_waiting_barrier() {
    let ctx = segmented_job(b"abcdefgh", 4).await;
    let terminal = process_segment(&ctx, &segment_doc_id("race", PHASE, 1))
        .await
        .expect("terminal worker");

    let (tx, rx) = watch::channel(false);
    tx.send_replace(true);
    let waiting = PipelineContext::clone(&ctx)
        .with_waiter(SleepWaiter::new(Duration::from_secs(60), rx));
    let err = await_barrier(&waiting, terminal.segment())
        .await
        .expect_err("cancelled");
    assert!(matches!(err, BarrierError::Cancelled { remaining: 1, .. }));

    let job: JobDocument = load(ctx.repo.as_ref(), "race").await.expect("job");
    assert_eq!(job.status(PHASE), Some(JobStatus::Analyzing));
}

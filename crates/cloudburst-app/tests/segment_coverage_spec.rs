use std::sync::Arc;

use bytes::Bytes;
use cloudburst_app::config::PipelineConfig;
use cloudburst_app::services::records::segment_doc_id;
use cloudburst_app::services::store::create_typed;
use cloudburst_app::services::{
    BlobStore, JobDocument, JobStatus, MemoryBlobStore, MemoryRepository, PhaseState,
    PipelineContext, RawArtifact, RetentionFlag, SegmentDocument, Segmentation, YieldWaiter, load,
    plan_segments, run_local, segment_job,
};
use proptest::prelude::*;

proptest! {
    #[test]
    fn plan_covers_every_byte_once(size in 1u64..50_000_000, segment_size in 1_000u64..2_000_000) {
        let ranges = plan_segments(size, segment_size);
        prop_assert_eq!(ranges.len() as u64, size.div_ceil(segment_size));
        prop_assert_eq!(ranges.first().map(|r| r.start), Some(0));
        prop_assert_eq!(ranges.last().map(|r| r.end), Some(size));
        for pair in ranges.windows(2) {
            prop_assert_eq!(pair[0].end, pair[1].start);
        }
        for range in &ranges[..ranges.len() - 1] {
            prop_assert_eq!(range.end - range.start, segment_size);
        }
        let last = ranges.last().expect("at least one range");
        prop_assert!(last.end > last.start);
        prop_assert!(last.end - last.start <= segment_size);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn segmenting_then_merging_reproduces_input(
        data in proptest::collection::vec(any::<u8>(), 1..2048),
        segment_size in 16u64..700,
    ) {
        let rt = tokio::runtime::Runtime::new().expect("runtime");
        let (segments, docs, merged) = rt.block_on(segment_and_merge(data.clone(), segment_size));

        prop_assert_eq!(segments, (data.len() as u64).div_ceil(segment_size));
        let mut expected_start = 0;
        for (ordinal, doc) in docs.iter().enumerate() {
            prop_assert_eq!(doc.ordinal, ordinal as u64);
            prop_assert_eq!(doc.segment_start, expected_start);
            prop_assert_eq!(doc.last_seg, ordinal as u64 + 1 == segments);
            expected_start = doc.segment_end;
        }
        prop_assert_eq!(expected_start, data.len() as u64);
        prop_assert_eq!(merged, data);
    }
}

/// Segment a job, snapshot its segment documents, then run it to completion.
async fn segment_and_merge(
    data: Vec<u8>,
    segment_size: u64,
) -> (u64, Vec<SegmentDocument>, Vec<u8>) {
    let repo = Arc::new(MemoryRepository::new());
    let blobs = Arc::new(MemoryBlobStore::new());
    blobs
        .put("bucket", "prop/prop.bin", Bytes::from(data))
        .await
        .expect("raw");
    let raw = RawArtifact {
        file_name: "prop.bin".into(),
        key: "prop/prop.bin".into(),
        size_bytes: None,
        retain_input: RetentionFlag::Keep,
        retain_debug: RetentionFlag::Discard,
    };
    create_typed(
        repo.as_ref(),
        JobDocument::split(
            "prop",
            "bucket",
            raw,
            "analysis",
            PhaseState::pending(segment_size, RetentionFlag::Discard),
        ),
    )
    .await
    .expect("job");
    let ctx = Arc::new(
        PipelineContext::new(repo.clone(), blobs.clone(), PipelineConfig::default())
            .with_waiter(YieldWaiter),
    );

    let Segmentation::Done(report) = segment_job(&ctx, "prop").await.expect("segment") else {
        panic!("fresh job must segment");
    };
    assert!(report.failures.is_empty());
    let job: JobDocument = load(repo.as_ref(), "prop").await.expect("job");
    assert_eq!(job.status("analysis"), Some(JobStatus::Segmented));
    let segments = job
        .phase("analysis")
        .and_then(|state| state.segment_count)
        .expect("segment count");

    let mut docs = Vec::new();
    for ordinal in 0..segments {
        let doc: SegmentDocument = load(repo.as_ref(), &segment_doc_id("prop", "analysis", ordinal))
            .await
            .expect("segment doc");
        docs.push(doc);
    }

    let run = run_local(ctx, "prop").await.expect("run");
    let report = run.reassembly.expect("merged");
    let merged = blobs.get("bucket", &report.output_key).await.expect("merged blob");
    (segments, docs, merged.to_vec())
}

//! Pipeline services coordinated through the state repository.
//!
//! Everything that touches documents or blobs lives here. Components share no
//! in-process state beyond [`PipelineContext`]; the repository's conditional
//! save is the only synchronization between concurrent invocations.

pub mod barrier;
pub mod blob_store;
pub mod context;
pub mod pipeline;
pub mod preemption;
pub mod reassembler;
pub mod records;
pub mod report;
pub mod retry;
pub mod runner;
pub mod segmenter;
pub mod store;
pub mod transient;
pub mod worker;

pub use barrier::{BarrierError, BarrierOutcome, SleepWaiter, Waiter, YieldWaiter, await_barrier};
#[cfg(feature = "s3")]
pub use blob_store::S3BlobStore;
pub use blob_store::{
    BlobError, BlobStore, DurableWrite, FsBlobStore, MemoryBlobStore, S3Options, UploadOutcome,
};
pub use context::{PipelineContext, build_pipeline_context};
pub use pipeline::{
    LocalRun, PipelineError, SegmentRun, advance_to_analyzing, handle_segment, run_local,
};
pub use preemption::{PreemptionError, PreemptionHandler, ReclaimOutcome};
pub use reassembler::{ReassembleError, ReassemblyReport, reassemble};
pub use records::{
    Document, InstanceProfile, InstanceSpec, JobDocument, JobStatus, PhaseState, RawArtifact,
    RetentionFlag, SegmentDocument, SegmentSummary, WorkUnit,
};
pub use report::{
    CleanupReport, CollectReport, DebugRetention, ReportError, SplitSubmission, StatusLine,
    cleanup, collect, status_lines, submit_split,
};
pub use retry::{ConflictRetry, Rejected, SaveError};
pub use runner::{ActiveJob, RunOutcome, RunReport, Runner, RunnerError};
pub use segmenter::{SegmentError, SegmentReport, Segmentation, plan_segments, segment_job};
pub use store::{
    FsRepository, MemoryRepository, RepoError, SegmentIndex, SegmentView, StateRepository, load,
};
pub use transient::{
    ComputeProvider, DestroyOutcome, HttpComputeProvider, HttpInstanceChannel, InstanceChannel,
    LaunchOutcome, Lifecycle, LifecycleError, ProviderError, TransientSubmission, submit_from_dir,
};
pub use worker::{
    PassThroughAnalyzer, SegmentAnalyzer, WorkerError, WorkerOutcome, process_segment,
};

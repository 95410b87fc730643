//! Cross-cutting application constants.

use std::time::Duration;

/// Segment size (bytes) applied when a job does not request one.
pub const DEFAULT_SEGMENT_SIZE: u64 = 864_000;

/// Save attempts before a conflicting document write is reported as failed.
pub const CONFLICT_RETRY_ATTEMPTS: usize = 10;

/// Wait between polls of the incomplete-segments view.
pub const BARRIER_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// How long a reclaim notice waits for the runner to stop before flushing.
pub const RECLAIM_SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Wait between polls of a provisioning instance.
pub const PROVISION_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Files larger than this are uploaded in parts.
pub const MULTIPART_THRESHOLD_BYTES: u64 = 15 * 1024 * 1024;

/// Part size for multipart uploads.
pub const MULTIPART_CHUNK_BYTES: usize = 5 * 1024 * 1024;

/// Version tag stamped on every document this build writes.
pub const SOFTWARE_VERSION: &str = concat!("cloudburst-", env!("CARGO_PKG_VERSION"));

pub const MISSING_FIELDS_ERROR: &str = "Missing required fields!";
pub const RECLAIMED_ERROR: &str = "instance reclaimed during execution";

/// Extension used for raw segment slices.
pub const RAW_SEGMENT_EXT: &str = "seg";

/// Phase key under which raw segment slices are stored.
pub const RAW_PHASE: &str = "raw";

/// Phase key holding the status of transient-instance jobs.
pub const TRANSIENT_PHASE: &str = "transient";

/// CPU counts a transient instance may request.
pub const CPU_TIERS: [u32; 4] = [4, 8, 16, 32];
pub const DEFAULT_CPUS: u32 = 8;

/// Job durations (hours) a transient instance may request.
pub const DURATION_TIERS: [u32; 4] = [12, 24, 48, 96];
pub const DEFAULT_DURATION_HOURS: u32 = 24;

/// Bucket used when the configuration names none.
pub const DEFAULT_BUCKET: &str = "cloudburst";

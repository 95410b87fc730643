//! Typed job and segment documents persisted in the state repository.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_SEGMENT_SIZE, RAW_PHASE, RAW_SEGMENT_EXT};

/// Lifecycle state of a job phase.
///
/// Status only moves forward. `analyzing` (split jobs) and `processing`
/// (transient jobs) share a rank; `complete` and `reclaimed` are terminal and
/// mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Segmented,
    Analyzing,
    Processing,
    Complete,
    Reclaimed,
}

impl JobStatus {
    pub const fn rank(self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Segmented => 1,
            JobStatus::Analyzing | JobStatus::Processing => 2,
            JobStatus::Complete | JobStatus::Reclaimed => 3,
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Reclaimed)
    }

    /// Whether moving from `self` to `next` respects the monotonic order.
    pub fn can_advance_to(self, next: JobStatus) -> bool {
        self == next || (!self.is_terminal() && next.rank() > self.rank())
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Segmented => "segmented",
            JobStatus::Analyzing => "analyzing",
            JobStatus::Processing => "processing",
            JobStatus::Complete => "complete",
            JobStatus::Reclaimed => "reclaimed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `t`/`f` retention switch stored on job documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RetentionFlag {
    #[serde(rename = "t")]
    Keep,
    #[default]
    #[serde(rename = "f")]
    Discard,
}

impl RetentionFlag {
    pub const fn keep() -> Self {
        RetentionFlag::Keep
    }

    pub const fn from_bool(keep: bool) -> Self {
        if keep {
            RetentionFlag::Keep
        } else {
            RetentionFlag::Discard
        }
    }

    pub const fn is_keep(self) -> bool {
        matches!(self, RetentionFlag::Keep)
    }
}

/// The raw input artifact a split job was submitted with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawArtifact {
    pub file_name: String,
    /// Blob key of the uploaded input inside the job bucket.
    pub key: String,
    #[serde(default)]
    pub size_bytes: Option<u64>,
    /// Keep the raw input after reassembly.
    #[serde(default = "RetentionFlag::keep")]
    pub retain_input: RetentionFlag,
    /// Keep the ordinal 0 raw slice as a debugging sample.
    #[serde(default)]
    pub retain_debug: RetentionFlag,
}

/// Per-type phase descriptor nested in the job document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseState {
    pub status: JobStatus,
    #[serde(default = "default_segment_size")]
    pub segment_size: u64,
    /// Keep the ordinal 0 output blob and segment document after reassembly.
    #[serde(default)]
    pub retain_debug: RetentionFlag,
    #[serde(default)]
    pub segment_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub segments: Vec<SegmentSummary>,
    #[serde(default)]
    pub output_key: Option<String>,
    #[serde(default)]
    pub sw_version: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

fn default_segment_size() -> u64 {
    DEFAULT_SEGMENT_SIZE
}

impl PhaseState {
    pub fn pending(segment_size: u64, retain_debug: RetentionFlag) -> Self {
        Self {
            status: JobStatus::Pending,
            segment_size,
            retain_debug,
            segment_count: None,
            segments: Vec::new(),
            output_key: None,
            sw_version: None,
            started_at: None,
            completed_at: None,
        }
    }
}

/// Instance sizing profile for transient jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceProfile {
    /// Provider default flavor.
    #[default]
    Standard,
    /// Dedicated compute flavor sized to the CPU tier.
    Compute,
}

/// Provisioning request and bookkeeping for a transient job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub cpus: u32,
    #[serde(default)]
    pub profile: InstanceProfile,
    #[serde(default)]
    pub duration_hours: Option<u32>,
    #[serde(default)]
    pub hostname: Option<String>,
    /// Provider identifier of the provisioned instance.
    #[serde(default)]
    pub compute_target: Option<String>,
    /// Callback URI registered for reclaim notifications.
    #[serde(default)]
    pub compute_webhook: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

impl InstanceSpec {
    pub fn new(cpus: u32) -> Self {
        Self {
            cpus,
            profile: InstanceProfile::Standard,
            duration_hours: None,
            hostname: None,
            compute_target: None,
            compute_webhook: None,
            address: None,
        }
    }
}

/// One input executed on a transient instance.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WorkUnit {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub input_key: Option<String>,
    #[serde(default)]
    pub output_key: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<String>,
    #[serde(default)]
    pub compute_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub compute_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl WorkUnit {
    pub fn new(id: impl Into<String>, input_key: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            input_key: Some(input_key.into()),
            ..Self::default()
        }
    }

    pub fn is_valid(&self) -> bool {
        self.id.as_deref().is_some_and(|id| !id.is_empty())
            && self.input_key.as_deref().is_some_and(|key| !key.is_empty())
    }

    /// Started, and neither finished nor failed.
    pub fn is_in_flight(&self) -> bool {
        self.compute_start.is_some() && self.compute_end.is_none() && self.error.is_none()
    }
}

/// Durable record of one submitted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDocument {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub raw: Option<RawArtifact>,
    #[serde(default)]
    pub phases: BTreeMap<String, PhaseState>,
    #[serde(default)]
    pub instance: Option<InstanceSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<WorkUnit>,
    #[serde(default)]
    pub sw_version: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobDocument {
    #[must_use]
    pub fn new(id: impl Into<String>, bucket: impl Into<String>) -> Self {
        let id = id.into();
        debug_assert!(!id.is_empty());
        let now = Utc::now();
        Self {
            id,
            rev: None,
            bucket: Some(bucket.into()),
            raw: None,
            phases: BTreeMap::new(),
            instance: None,
            inputs: Vec::new(),
            sw_version: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Split job submitted with a raw artifact and one pending phase.
    #[must_use]
    pub fn split(
        id: impl Into<String>,
        bucket: impl Into<String>,
        raw: RawArtifact,
        phase: impl Into<String>,
        state: PhaseState,
    ) -> Self {
        let mut doc = Self::new(id, bucket);
        doc.raw = Some(raw);
        doc.phases.insert(phase.into(), state);
        doc
    }

    pub fn phase(&self, phase: &str) -> Option<&PhaseState> {
        self.phases.get(phase)
    }

    pub fn phase_mut(&mut self, phase: &str) -> Option<&mut PhaseState> {
        self.phases.get_mut(phase)
    }

    pub fn status(&self, phase: &str) -> Option<JobStatus> {
        self.phase(phase).map(|state| state.status)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// One unit of parallel work carved out of a job's raw artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentDocument {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    /// Parent job id.
    pub raw_id: String,
    pub raw_bucket: String,
    #[serde(rename = "type")]
    pub phase: String,
    pub ordinal: u64,
    pub segment_start: u64,
    pub segment_end: u64,
    pub segment_size: u64,
    pub input_key: String,
    #[serde(default)]
    pub last_seg: bool,
    #[serde(default)]
    pub sw_version: Option<String>,
    #[serde(default)]
    pub compute_target: Option<String>,
    #[serde(default)]
    pub output_key: Option<String>,
    #[serde(default)]
    pub compute_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub compute_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl SegmentDocument {
    pub fn local_id(&self) -> String {
        segment_local_id(self.ordinal)
    }

    pub fn is_complete(&self) -> bool {
        self.compute_end.is_some()
    }

    pub fn len(&self) -> u64 {
        self.segment_end.saturating_sub(self.segment_start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn summary(&self) -> SegmentSummary {
        SegmentSummary {
            id: self.local_id(),
            ordinal: self.ordinal,
            segment_start: self.segment_start,
            segment_end: self.segment_end,
            segment_size: self.segment_size,
            sw_version: self.sw_version.clone(),
            compute_target: self.compute_target.clone(),
            output_key: self.output_key.clone(),
            compute_start: self.compute_start,
            compute_end: self.compute_end,
            error: self.error.clone(),
        }
    }
}

/// Projection emitted by the complete-segments view and kept on the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentSummary {
    pub id: String,
    pub ordinal: u64,
    pub segment_start: u64,
    pub segment_end: u64,
    pub segment_size: u64,
    #[serde(default)]
    pub sw_version: Option<String>,
    #[serde(default)]
    pub compute_target: Option<String>,
    #[serde(default)]
    pub output_key: Option<String>,
    #[serde(default)]
    pub compute_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub compute_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Anything the repository stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "doc_type", rename_all = "snake_case")]
pub enum Document {
    Job(JobDocument),
    Segment(SegmentDocument),
}

impl Document {
    pub fn id(&self) -> &str {
        match self {
            Document::Job(doc) => &doc.id,
            Document::Segment(doc) => &doc.id,
        }
    }

    pub fn rev(&self) -> Option<&str> {
        match self {
            Document::Job(doc) => doc.rev.as_deref(),
            Document::Segment(doc) => doc.rev.as_deref(),
        }
    }

    pub fn set_rev(&mut self, rev: Option<String>) {
        match self {
            Document::Job(doc) => doc.rev = rev,
            Document::Segment(doc) => doc.rev = rev,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Document::Job(_) => "job",
            Document::Segment(_) => "segment",
        }
    }
}

impl From<JobDocument> for Document {
    fn from(doc: JobDocument) -> Self {
        Document::Job(doc)
    }
}

impl From<SegmentDocument> for Document {
    fn from(doc: SegmentDocument) -> Self {
        Document::Segment(doc)
    }
}

pub fn segment_local_id(ordinal: u64) -> String {
    format!("S{ordinal}")
}

/// `{job_id}.{phase}.S{n}`
pub fn segment_doc_id(job_id: &str, phase: &str, ordinal: u64) -> String {
    format!("{job_id}.{phase}.{}", segment_local_id(ordinal))
}

/// Blob key of a raw segment slice: `{job_id}/raw/S{n}.seg`.
pub fn raw_segment_key(job_id: &str, ordinal: u64) -> String {
    format!(
        "{job_id}/{RAW_PHASE}/{}.{RAW_SEGMENT_EXT}",
        segment_local_id(ordinal)
    )
}

/// Blob key of a segment's analysis output: `{job_id}/{phase}/S{n}.{ext}`.
pub fn segment_output_key(job_id: &str, phase: &str, ordinal: u64, ext: &str) -> String {
    format!("{job_id}/{phase}/{}.{ext}", segment_local_id(ordinal))
}

/// Blob key of the merged artifact: `{job_id}/{phase}/{job_id}.{ext}`.
pub fn merged_output_key(job_id: &str, phase: &str, ext: &str) -> String {
    format!("{job_id}/{phase}/{job_id}.{ext}")
}

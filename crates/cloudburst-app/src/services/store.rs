//! Revisioned document repository with per-job secondary index views.
//!
//! Every write is a compare-and-swap on the document's `_rev` token: `save`
//! only succeeds when the caller holds the latest revision, otherwise it fails
//! with [`RepoError::Conflict`]. Callers combine this with
//! [`crate::services::retry`] to re-fetch and reapply their mutation.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::paths::AppPaths;
use crate::services::records::{Document, JobDocument, SegmentDocument, SegmentSummary};

const REV_HASH_LEN: usize = 16;
const CURRENT_READ_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("document `{0}` not found")]
    NotFound(String),
    #[error("document `{0}` already exists")]
    Duplicate(String),
    #[error("revision conflict saving `{id}`")]
    Conflict { id: String },
    #[error("index `{0}` is not defined")]
    IndexMissing(String),
    #[error("document `{id}` is a {found} document, expected {expected}")]
    WrongKind {
        id: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("invalid document id `{0}`")]
    InvalidId(String),
    #[error("storage io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to decode document at {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode document `{id}`: {source}")]
    Encode {
        id: String,
        #[source]
        source: serde_json::Error,
    },
}

impl RepoError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, RepoError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RepoError::NotFound(_))
    }

    fn io(path: &Path, source: io::Error) -> Self {
        RepoError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Per-job index namespace, named `<type>-<job_id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SegmentIndex {
    pub phase: String,
    pub job_id: String,
}

impl SegmentIndex {
    pub fn new(phase: impl Into<String>, job_id: impl Into<String>) -> Self {
        Self {
            phase: phase.into(),
            job_id: job_id.into(),
        }
    }

    pub fn name(&self) -> String {
        format!("{}-{}", self.phase, self.job_id)
    }

    /// Every segment document of this index has an id starting with this.
    fn segment_id_prefix(&self) -> String {
        format!("{}.{}.", self.job_id, self.phase)
    }

    fn selects(&self, segment: &SegmentDocument) -> bool {
        segment.raw_id == self.job_id && segment.phase == self.phase
    }
}

/// The two views every segment index exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentView {
    /// Segments lacking `compute_end`.
    Incomplete,
    /// Projected summaries of segments with `compute_end`.
    Complete,
}

impl SegmentView {
    pub fn view_name(self, phase: &str) -> String {
        match self {
            SegmentView::Incomplete => format!("{phase}-incomplete"),
            SegmentView::Complete => format!("{phase}-complete"),
        }
    }

    fn emits(self, segment: &SegmentDocument) -> bool {
        match self {
            SegmentView::Incomplete => !segment.is_complete(),
            SegmentView::Complete => segment.is_complete(),
        }
    }
}

/// One row of a view query, keyed (and ordered) by document id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewRow {
    pub id: String,
    pub summary: SegmentSummary,
    pub doc: Option<SegmentDocument>,
}

fn view_rows<'a>(
    index: &SegmentIndex,
    view: SegmentView,
    include_docs: bool,
    docs: impl Iterator<Item = &'a Document>,
) -> Vec<ViewRow> {
    let mut rows: Vec<ViewRow> = docs
        .filter_map(|doc| match doc {
            Document::Segment(segment) if index.selects(segment) && view.emits(segment) => {
                Some(ViewRow {
                    id: segment.id.clone(),
                    summary: segment.summary(),
                    doc: include_docs.then(|| segment.clone()),
                })
            }
            _ => None,
        })
        .collect();
    rows.sort_by(|a, b| a.id.cmp(&b.id));
    rows
}

/// Document store consumed by every pipeline component.
#[async_trait]
pub trait StateRepository: Send + Sync {
    async fn get(&self, id: &str) -> Result<Document, RepoError>;

    async fn exists(&self, id: &str) -> Result<bool, RepoError>;

    /// Insert a new document. Fails with `Duplicate` when the id is taken.
    async fn create(&self, doc: Document) -> Result<Document, RepoError>;

    /// Conditional update; the document's `_rev` must match the stored one.
    async fn save(&self, doc: Document) -> Result<Document, RepoError>;

    /// Returns whether the document existed.
    async fn delete(&self, id: &str) -> Result<bool, RepoError>;

    async fn define_index(&self, index: &SegmentIndex) -> Result<(), RepoError>;

    async fn drop_index(&self, index: &SegmentIndex) -> Result<bool, RepoError>;

    /// Rows ordered by document id; callers needing ordinal order must sort.
    async fn query(
        &self,
        index: &SegmentIndex,
        view: SegmentView,
        include_docs: bool,
    ) -> Result<Vec<ViewRow>, RepoError>;

    async fn list_jobs(&self) -> Result<Vec<JobDocument>, RepoError>;
}

/// Typed view over [`Document`] variants.
pub trait Stored: Clone + Send + Sync + 'static {
    const KIND: &'static str;

    fn doc_id(&self) -> &str;

    fn into_document(self) -> Document;

    fn from_document(doc: Document) -> Result<Self, RepoError>;
}

impl Stored for JobDocument {
    const KIND: &'static str = "job";

    fn doc_id(&self) -> &str {
        &self.id
    }

    fn into_document(self) -> Document {
        Document::Job(self)
    }

    fn from_document(doc: Document) -> Result<Self, RepoError> {
        match doc {
            Document::Job(job) => Ok(job),
            other => Err(RepoError::WrongKind {
                id: other.id().to_string(),
                expected: Self::KIND,
                found: other.kind(),
            }),
        }
    }
}

impl Stored for SegmentDocument {
    const KIND: &'static str = "segment";

    fn doc_id(&self) -> &str {
        &self.id
    }

    fn into_document(self) -> Document {
        Document::Segment(self)
    }

    fn from_document(doc: Document) -> Result<Self, RepoError> {
        match doc {
            Document::Segment(segment) => Ok(segment),
            other => Err(RepoError::WrongKind {
                id: other.id().to_string(),
                expected: Self::KIND,
                found: other.kind(),
            }),
        }
    }
}

pub async fn load<T: Stored>(repo: &dyn StateRepository, id: &str) -> Result<T, RepoError> {
    T::from_document(repo.get(id).await?)
}

pub async fn create_typed<T: Stored>(repo: &dyn StateRepository, doc: T) -> Result<T, RepoError> {
    T::from_document(repo.create(doc.into_document()).await?)
}

pub async fn save_typed<T: Stored>(repo: &dyn StateRepository, doc: T) -> Result<T, RepoError> {
    T::from_document(repo.save(doc.into_document()).await?)
}

fn rev_generation(rev: Option<&str>) -> u64 {
    rev.and_then(|rev| rev.split_once('-'))
        .and_then(|(generation, _)| generation.parse().ok())
        .unwrap_or(0)
}

/// Compute the revision that follows `previous` for the given document body.
fn next_rev(previous: Option<&str>, doc: &Document) -> Result<String, RepoError> {
    let mut unrevisioned = doc.clone();
    unrevisioned.set_rev(None);
    let body = serde_json::to_vec(&unrevisioned).map_err(|source| RepoError::Encode {
        id: doc.id().to_string(),
        source,
    })?;
    let hash = blake3::hash(&body).to_hex();
    Ok(format!(
        "{}-{}",
        rev_generation(previous) + 1,
        &hash.as_str()[..REV_HASH_LEN]
    ))
}

fn validate_id(id: &str) -> Result<(), RepoError> {
    let valid = !id.is_empty()
        && !id.starts_with('.')
        && !id.contains(['/', '\\'])
        && !id.chars().any(char::is_control);
    if valid {
        Ok(())
    } else {
        Err(RepoError::InvalidId(id.to_string()))
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    docs: BTreeMap<String, Document>,
    indexes: BTreeSet<SegmentIndex>,
}

/// In-process repository used by tests and single-process runs.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    state: Mutex<MemoryState>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.docs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn has_index(&self, index: &SegmentIndex) -> bool {
        self.state.lock().await.indexes.contains(index)
    }
}

#[async_trait]
impl StateRepository for MemoryRepository {
    async fn get(&self, id: &str) -> Result<Document, RepoError> {
        let state = self.state.lock().await;
        state
            .docs
            .get(id)
            .cloned()
            .ok_or_else(|| RepoError::NotFound(id.to_string()))
    }

    async fn exists(&self, id: &str) -> Result<bool, RepoError> {
        Ok(self.state.lock().await.docs.contains_key(id))
    }

    async fn create(&self, mut doc: Document) -> Result<Document, RepoError> {
        validate_id(doc.id())?;
        let mut state = self.state.lock().await;
        if state.docs.contains_key(doc.id()) {
            return Err(RepoError::Duplicate(doc.id().to_string()));
        }
        let rev = next_rev(None, &doc)?;
        doc.set_rev(Some(rev));
        state.docs.insert(doc.id().to_string(), doc.clone());
        Ok(doc)
    }

    async fn save(&self, mut doc: Document) -> Result<Document, RepoError> {
        let id = doc.id().to_string();
        let mut state = self.state.lock().await;
        if !state.docs.contains_key(&id) {
            drop(state);
            if doc.rev().is_none() {
                return self.create(doc).await;
            }
            return Err(RepoError::NotFound(id));
        }
        let Some(current) = state.docs.get(&id) else {
            return Err(RepoError::NotFound(id));
        };
        if current.rev() != doc.rev() {
            return Err(RepoError::Conflict { id });
        }
        let rev = next_rev(current.rev(), &doc)?;
        doc.set_rev(Some(rev));
        state.docs.insert(id, doc.clone());
        Ok(doc)
    }

    async fn delete(&self, id: &str) -> Result<bool, RepoError> {
        Ok(self.state.lock().await.docs.remove(id).is_some())
    }

    async fn define_index(&self, index: &SegmentIndex) -> Result<(), RepoError> {
        self.state.lock().await.indexes.insert(index.clone());
        Ok(())
    }

    async fn drop_index(&self, index: &SegmentIndex) -> Result<bool, RepoError> {
        Ok(self.state.lock().await.indexes.remove(index))
    }

    async fn query(
        &self,
        index: &SegmentIndex,
        view: SegmentView,
        include_docs: bool,
    ) -> Result<Vec<ViewRow>, RepoError> {
        let state = self.state.lock().await;
        if !state.indexes.contains(index) {
            return Err(RepoError::IndexMissing(index.name()));
        }
        Ok(view_rows(index, view, include_docs, state.docs.values()))
    }

    async fn list_jobs(&self) -> Result<Vec<JobDocument>, RepoError> {
        let state = self.state.lock().await;
        Ok(state
            .docs
            .values()
            .filter_map(|doc| match doc {
                Document::Job(job) => Some(job.clone()),
                Document::Segment(_) => None,
            })
            .collect())
    }
}

/// Filesystem repository safe for concurrent processes sharing one directory.
///
/// Layout: `docs/{id}/{generation}.json`, one file per revision. A write
/// stages a temp file and hard-links it onto the next generation path; the
/// link fails if another writer claimed that generation first, which is
/// reported as a conflict. Index definitions are marker files under `indexes/`.
#[derive(Debug, Clone)]
pub struct FsRepository {
    docs_dir: PathBuf,
    indexes_dir: PathBuf,
    staging_dir: PathBuf,
}

impl FsRepository {
    pub fn open(paths: &AppPaths) -> Result<Self, RepoError> {
        let map = |err: crate::paths::PathError| RepoError::Io {
            path: paths.data_dir(),
            source: io::Error::other(err.to_string()),
        };
        Ok(Self {
            docs_dir: paths.documents_dir().map_err(map)?,
            indexes_dir: paths.indexes_dir().map_err(map)?,
            staging_dir: paths.staging_dir().map_err(map)?,
        })
    }

    fn doc_dir(&self, id: &str) -> PathBuf {
        self.docs_dir.join(id)
    }

    fn generation_path(&self, id: &str, generation: u64) -> PathBuf {
        self.doc_dir(id).join(format!("{generation:020}.json"))
    }

    fn index_path(&self, index: &SegmentIndex) -> PathBuf {
        self.indexes_dir.join(format!("{}.json", index.name()))
    }

    async fn latest_generation(&self, id: &str) -> Result<Option<(u64, PathBuf)>, RepoError> {
        let dir = self.doc_dir(id);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(RepoError::io(&dir, err)),
        };
        let mut latest: Option<(u64, PathBuf)> = None;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| RepoError::io(&dir, err))?
        {
            let path = entry.path();
            let Some(generation) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<u64>().ok())
            else {
                continue;
            };
            if latest.as_ref().is_none_or(|(best, _)| generation > *best) {
                latest = Some((generation, path));
            }
        }
        Ok(latest)
    }

    async fn read_current(&self, id: &str) -> Result<Option<(u64, Document)>, RepoError> {
        validate_id(id)?;
        for _ in 0..CURRENT_READ_ATTEMPTS {
            let Some((generation, path)) = self.latest_generation(id).await? else {
                return Ok(None);
            };
            match fs::read(&path).await {
                Ok(bytes) => {
                    let doc = serde_json::from_slice(&bytes)
                        .map_err(|source| RepoError::Decode { path, source })?;
                    return Ok(Some((generation, doc)));
                }
                // A newer generation replaced this one between listing and reading.
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(RepoError::io(&path, err)),
            }
        }
        Ok(None)
    }

    /// Stage `doc` and link it into place as `generation`.
    async fn publish(&self, doc: &Document, generation: u64) -> Result<(), RepoError> {
        let bytes = serde_json::to_vec_pretty(doc).map_err(|source| RepoError::Encode {
            id: doc.id().to_string(),
            source,
        })?;
        let staged = tempfile::NamedTempFile::new_in(&self.staging_dir)
            .map_err(|err| RepoError::io(&self.staging_dir, err))?;
        let staged_path = staged.path().to_path_buf();
        let std_file = staged
            .reopen()
            .map_err(|err| RepoError::io(&staged_path, err))?;
        let mut file = fs::File::from_std(std_file);
        file.write_all(&bytes)
            .await
            .map_err(|err| RepoError::io(&staged_path, err))?;
        file.sync_all()
            .await
            .map_err(|err| RepoError::io(&staged_path, err))?;
        drop(file);

        let target = self.generation_path(doc.id(), generation);
        // The temp file is removed when `staged` drops, the link survives.
        match fs::hard_link(&staged_path, &target).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Err(RepoError::Conflict {
                id: doc.id().to_string(),
            }),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(RepoError::NotFound(doc.id().to_string()))
            }
            Err(err) => Err(RepoError::io(&target, err)),
        }
    }

    async fn prune_before(&self, id: &str, generation: u64) {
        let stale = self.generation_path(id, generation.saturating_sub(1));
        if generation > 1
            && let Err(err) = fs::remove_file(&stale).await
            && err.kind() != io::ErrorKind::NotFound
        {
            tracing::debug!(doc_id = id, error = %err, "failed to prune stale revision");
        }
    }

    /// Current revision of every document whose id starts with `prefix`.
    /// Non-matching entries are skipped without being read.
    async fn documents_with_prefix(&self, prefix: &str) -> Result<Vec<Document>, RepoError> {
        let mut entries = fs::read_dir(&self.docs_dir)
            .await
            .map_err(|err| RepoError::io(&self.docs_dir, err))?;
        let mut docs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| RepoError::io(&self.docs_dir, err))?
        {
            let Some(id) = entry
                .file_name()
                .to_str()
                .filter(|name| name.starts_with(prefix))
                .map(str::to_string)
            else {
                continue;
            };
            if let Some((_, doc)) = self.read_current(&id).await? {
                docs.push(doc);
            }
        }
        Ok(docs)
    }
}

#[async_trait]
impl StateRepository for FsRepository {
    async fn get(&self, id: &str) -> Result<Document, RepoError> {
        self.read_current(id)
            .await?
            .map(|(_, doc)| doc)
            .ok_or_else(|| RepoError::NotFound(id.to_string()))
    }

    async fn exists(&self, id: &str) -> Result<bool, RepoError> {
        Ok(self.read_current(id).await?.is_some())
    }

    async fn create(&self, mut doc: Document) -> Result<Document, RepoError> {
        validate_id(doc.id())?;
        let dir = self.doc_dir(doc.id());
        fs::create_dir_all(&dir)
            .await
            .map_err(|err| RepoError::io(&dir, err))?;
        doc.set_rev(Some(next_rev(None, &doc)?));
        match self.publish(&doc, 1).await {
            Ok(()) => Ok(doc),
            Err(RepoError::Conflict { id }) => Err(RepoError::Duplicate(id)),
            Err(err) => Err(err),
        }
    }

    async fn save(&self, mut doc: Document) -> Result<Document, RepoError> {
        let id = doc.id().to_string();
        let Some((generation, current)) = self.read_current(&id).await? else {
            if doc.rev().is_none() {
                return self.create(doc).await;
            }
            return Err(RepoError::NotFound(id));
        };
        if current.rev() != doc.rev() {
            return Err(RepoError::Conflict { id });
        }
        let next_generation = generation + 1;
        doc.set_rev(Some(next_rev(current.rev(), &doc)?));
        self.publish(&doc, next_generation).await?;
        self.prune_before(&id, next_generation).await;
        Ok(doc)
    }

    async fn delete(&self, id: &str) -> Result<bool, RepoError> {
        validate_id(id)?;
        let dir = self.doc_dir(id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(RepoError::io(&dir, err)),
        }
    }

    async fn define_index(&self, index: &SegmentIndex) -> Result<(), RepoError> {
        let path = self.index_path(index);
        let bytes = serde_json::to_vec(index).map_err(|source| RepoError::Encode {
            id: index.name(),
            source,
        })?;
        fs::write(&path, bytes)
            .await
            .map_err(|err| RepoError::io(&path, err))
    }

    async fn drop_index(&self, index: &SegmentIndex) -> Result<bool, RepoError> {
        let path = self.index_path(index);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(RepoError::io(&path, err)),
        }
    }

    async fn query(
        &self,
        index: &SegmentIndex,
        view: SegmentView,
        include_docs: bool,
    ) -> Result<Vec<ViewRow>, RepoError> {
        let marker = self.index_path(index);
        if !fs::try_exists(&marker)
            .await
            .map_err(|err| RepoError::io(&marker, err))?
        {
            return Err(RepoError::IndexMissing(index.name()));
        }
        let docs = self.documents_with_prefix(&index.segment_id_prefix()).await?;
        Ok(view_rows(index, view, include_docs, docs.iter()))
    }

    async fn list_jobs(&self) -> Result<Vec<JobDocument>, RepoError> {
        Ok(self
            .documents_with_prefix("")
            .await?
            .into_iter()
            .filter_map(|doc| match doc {
                Document::Job(job) => Some(job),
                Document::Segment(_) => None,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::records::{SegmentDocument, segment_doc_id};
    use chrono::Utc;
    use tempfile::TempDir;

    fn segment(job: &str, ordinal: u64, done: bool) -> SegmentDocument {
        SegmentDocument {
            id: segment_doc_id(job, "fft", ordinal),
            rev: None,
            raw_id: job.to_string(),
            raw_bucket: "bucket".to_string(),
            phase: "fft".to_string(),
            ordinal,
            segment_start: ordinal * 10,
            segment_end: ordinal * 10 + 10,
            segment_size: 10,
            input_key: format!("{job}/raw/S{ordinal}.seg"),
            last_seg: false,
            sw_version: None,
            compute_target: None,
            output_key: None,
            compute_start: None,
            compute_end: done.then(Utc::now),
            error: None,
        }
    }

    async fn exercise_conditional_save(repo: &dyn StateRepository) {
        let created = create_typed(repo, JobDocument::new("job-a", "bucket"))
            .await
            .expect("create");
        let first_rev = created.rev.clone().expect("rev assigned");
        assert!(first_rev.starts_with("1-"));

        let mut winner = created.clone();
        winner.error = Some("first".into());
        let saved = save_typed(repo, winner).await.expect("first save wins");
        assert!(saved.rev.as_deref().is_some_and(|rev| rev.starts_with("2-")));

        let mut loser = created;
        loser.error = Some("second".into());
        let err = save_typed(repo, loser).await.expect_err("stale rev");
        assert!(err.is_conflict());

        let dup = create_typed(repo, JobDocument::new("job-a", "bucket"))
            .await
            .expect_err("duplicate");
        assert!(matches!(dup, RepoError::Duplicate(_)));

        let current: JobDocument = load(repo, "job-a").await.expect("load");
        assert_eq!(current.error.as_deref(), Some("first"));
        let wrong = load::<SegmentDocument>(repo, "job-a").await.expect_err("kind");
        assert!(matches!(wrong, RepoError::WrongKind { .. }));

        assert!(repo.delete("job-a").await.expect("delete"));
        assert!(!repo.exists("job-a").await.expect("exists"));
        assert!(!repo.delete("job-a").await.expect("idempotent delete"));
    }

    async fn exercise_views(repo: &dyn StateRepository) {
        let index = SegmentIndex::new("fft", "job-b");
        let err = repo
            .query(&index, SegmentView::Incomplete, false)
            .await
            .expect_err("index not defined yet");
        assert!(matches!(err, RepoError::IndexMissing(_)));

        repo.define_index(&index).await.expect("define");
        for (ordinal, done) in [(0, true), (1, false), (2, true), (10, true)] {
            create_typed(repo, segment("job-b", ordinal, done))
                .await
                .expect("create segment");
        }
        create_typed(repo, segment("other", 0, false))
            .await
            .expect("other job");

        let incomplete = repo
            .query(&index, SegmentView::Incomplete, false)
            .await
            .expect("incomplete");
        assert_eq!(incomplete.len(), 1);
        assert_eq!(incomplete[0].id, "job-b.fft.S1");

        let complete = repo
            .query(&index, SegmentView::Complete, true)
            .await
            .expect("complete");
        let ids: Vec<&str> = complete.iter().map(|row| row.id.as_str()).collect();
        // Rows come back in id order, not ordinal order.
        assert_eq!(ids, vec!["job-b.fft.S0", "job-b.fft.S10", "job-b.fft.S2"]);
        assert!(complete.iter().all(|row| row.doc.is_some()));

        assert!(repo.drop_index(&index).await.expect("drop"));
        assert!(!repo.drop_index(&index).await.expect("drop again"));
    }

    #[tokio::test]
    async fn memory_repository_conditional_save() {
        exercise_conditional_save(&MemoryRepository::new()).await;
    }

    #[tokio::test]
    async fn memory_repository_views() {
        exercise_views(&MemoryRepository::new()).await;
    }

    #[tokio::test]
    async fn fs_repository_conditional_save() {
        let temp = TempDir::new().expect("tempdir");
        let paths = AppPaths::new(temp.path()).expect("paths");
        let repo = FsRepository::open(&paths).expect("open");
        exercise_conditional_save(&repo).await;
    }

    #[tokio::test]
    async fn fs_repository_views_and_listing() {
        let temp = TempDir::new().expect("tempdir");
        let paths = AppPaths::new(temp.path()).expect("paths");
        let repo = FsRepository::open(&paths).expect("open");
        exercise_views(&repo).await;

        create_typed(&repo, JobDocument::new("listed", "bucket"))
            .await
            .expect("create job");
        let jobs = repo.list_jobs().await.expect("list");
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, "listed");
    }

    #[tokio::test]
    async fn fs_query_reads_only_the_jobs_segments() {
        let temp = TempDir::new().expect("tempdir");
        let paths = AppPaths::new(temp.path()).expect("paths");
        let repo = FsRepository::open(&paths).expect("open");
        let index = SegmentIndex::new("fft", "job-c");
        repo.define_index(&index).await.expect("define");
        create_typed(&repo, segment("job-c", 0, false))
            .await
            .expect("segment");

        // An undecodable document elsewhere in the store must not be touched.
        let corrupt = paths.data_dir().join("docs").join("elsewhere");
        std::fs::create_dir_all(&corrupt).expect("corrupt dir");
        std::fs::write(corrupt.join(format!("{:020}.json", 1)), b"not json").expect("corrupt");

        let rows = repo
            .query(&index, SegmentView::Incomplete, false)
            .await
            .expect("query skips unrelated documents");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "job-c.fft.S0");
        assert!(matches!(
            repo.list_jobs().await,
            Err(RepoError::Decode { .. })
        ));
    }

    #[tokio::test]
    async fn fs_repository_keeps_only_latest_revision() {
        let temp = TempDir::new().expect("tempdir");
        let paths = AppPaths::new(temp.path()).expect("paths");
        let repo = FsRepository::open(&paths).expect("open");
        let mut job = create_typed(&repo, JobDocument::new("pruned", "bucket"))
            .await
            .expect("create");
        for round in 0..3 {
            job.error = Some(format!("round {round}"));
            job = save_typed(&repo, job).await.expect("save");
        }
        let files = std::fs::read_dir(paths.data_dir().join("docs").join("pruned"))
            .expect("doc dir")
            .count();
        assert_eq!(files, 1);
        assert!(job.rev.as_deref().is_some_and(|rev| rev.starts_with("4-")));
    }

    #[tokio::test]
    async fn fs_repository_rejects_path_like_ids() {
        let temp = TempDir::new().expect("tempdir");
        let paths = AppPaths::new(temp.path()).expect("paths");
        let repo = FsRepository::open(&paths).expect("open");
        let err = create_typed(&repo, JobDocument::new("../escape", "bucket"))
            .await
            .expect_err("invalid id");
        assert!(matches!(err, RepoError::InvalidId(_)));
    }
}

//! Filesystem path helpers (XDG-aware) for documents, blobs, and scratch space.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("unable to determine project directories")]
    MissingProjectDirs,
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid bucket name `{bucket}`")]
    InvalidBucket { bucket: String },
    #[error("invalid object key `{key}`")]
    InvalidKey { key: String },
}

/// Container providing filesystem paths for the application. In production this is
/// rooted at `$XDG_DATA_HOME/cloudburst`; tests may construct custom instances.
#[derive(Debug, Clone)]
pub struct AppPaths {
    base_dir: PathBuf,
}

impl AppPaths {
    /// Construct paths rooted under `$XDG_DATA_HOME/cloudburst`.
    pub fn from_project_dirs() -> Result<Self, PathError> {
        let dirs = ProjectDirs::from("dev", "cloudburst", "cloudburst")
            .ok_or(PathError::MissingProjectDirs)?;
        Self::new(dirs.data_dir())
    }

    /// Construct paths rooted under the provided directory, ensuring it exists.
    pub fn new<P: AsRef<Path>>(base: P) -> Result<Self, PathError> {
        let base = base.as_ref().to_path_buf();
        ensure_dir(&base)?;
        Ok(Self { base_dir: base })
    }

    pub fn data_dir(&self) -> PathBuf {
        self.base_dir.clone()
    }

    /// Revisioned documents (`.../docs`).
    pub fn documents_dir(&self) -> Result<PathBuf, PathError> {
        self.ensure_child(&["docs"])
    }

    /// Index definitions (`.../indexes`).
    pub fn indexes_dir(&self) -> Result<PathBuf, PathError> {
        self.ensure_child(&["indexes"])
    }

    /// Write staging area shared by the document and blob stores (`.../tmp`).
    pub fn staging_dir(&self) -> Result<PathBuf, PathError> {
        self.ensure_child(&["tmp"])
    }

    /// Base directory for blob storage (`.../blobs`).
    pub fn blobs_base_dir(&self) -> Result<PathBuf, PathError> {
        self.ensure_child(&["blobs"])
    }

    /// Directory for a bucket (`.../blobs/{bucket}`).
    pub fn bucket_dir(&self, bucket: &str) -> Result<PathBuf, PathError> {
        validate_bucket(bucket)?;
        self.ensure_child(&["blobs", bucket])
    }

    /// Path for an object key inside a bucket. Parent directories are created.
    pub fn blob_path(&self, bucket: &str, key: &str) -> Result<PathBuf, PathError> {
        validate_key(key)?;
        let mut path = self.bucket_dir(bucket)?;
        for part in key.split('/') {
            path.push(part);
        }
        if let Some(parent) = path.parent() {
            ensure_dir(parent)?;
        }
        Ok(path)
    }

    /// Per-run working directories on an instance (`.../scratch`).
    pub fn scratch_dir(&self) -> Result<PathBuf, PathError> {
        self.ensure_child(&["scratch"])
    }

    fn ensure_child(&self, segments: &[&str]) -> Result<PathBuf, PathError> {
        let mut path = self.base_dir.clone();
        for segment in segments {
            path.push(segment);
        }
        ensure_dir(&path)
    }
}

/// Lowercase letters, digits, dots and dashes; 3 to 63 characters.
pub fn validate_bucket(bucket: &str) -> Result<(), PathError> {
    let valid = (3..=63).contains(&bucket.len())
        && bucket
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
        && bucket.starts_with(|c: char| c.is_ascii_alphanumeric())
        && bucket.ends_with(|c: char| c.is_ascii_alphanumeric());
    if valid {
        Ok(())
    } else {
        Err(PathError::InvalidBucket {
            bucket: bucket.to_string(),
        })
    }
}

pub fn validate_key(key: &str) -> Result<(), PathError> {
    let valid = !key.is_empty()
        && !key.starts_with('/')
        && !key.contains('\\')
        && key
            .split('/')
            .all(|part| !part.is_empty() && part != "." && part != "..");
    if valid {
        Ok(())
    } else {
        Err(PathError::InvalidKey {
            key: key.to_string(),
        })
    }
}

fn ensure_dir(path: &Path) -> Result<PathBuf, PathError> {
    if let Err(err) = fs::create_dir_all(path)
        && err.kind() != io::ErrorKind::AlreadyExists
    {
        return Err(PathError::CreateDir {
            path: path.to_path_buf(),
            source: err,
        });
    }
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn bucket_names() {
        assert!(validate_bucket("results-2024").is_ok());
        assert!(validate_bucket("ab").is_err());
        assert!(validate_bucket("Upper").is_err());
        assert!(validate_bucket("-dash").is_err());
        assert!(validate_bucket("under_score").is_err());
    }

    #[test]
    fn keys_cannot_escape_the_bucket() {
        assert!(validate_key("job/raw/S0.seg").is_ok());
        assert!(validate_key("../etc/passwd").is_err());
        assert!(validate_key("/abs").is_err());
        assert!(validate_key("a//b").is_err());
    }

    #[test]
    fn blob_path_creates_parents() {
        let temp = TempDir::new().expect("tempdir");
        let paths = AppPaths::new(temp.path()).expect("paths");
        let path = paths.blob_path("bucket", "job/raw/S0.seg").expect("path");
        assert!(path.ends_with("blobs/bucket/job/raw/S0.seg"));
        assert!(path.parent().expect("parent").is_dir());
    }
}

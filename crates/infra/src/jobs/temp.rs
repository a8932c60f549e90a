//! Local staging files for job results.
//!
//! Every file lives under `{root}/{job_id}/`, so concurrent jobs never collide.
//! Deletion is sandboxed: a path is resolved to an absolute, normalized form and
//! refused unless it sits strictly inside the root.

use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use backoffice_core::JobId;

#[derive(Debug, Error)]
pub enum TempFileError {
    #[error("path {0} is outside the temp directory")]
    OutsideSandbox(PathBuf),

    #[error("invalid file name: {0:?}")]
    InvalidFileName(String),

    #[error("temp file io error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct TempFileManager {
    root: PathBuf,
    retry_delay: Duration,
}

impl TempFileManager {
    /// `root` is made absolute against the current directory.
    pub fn new(root: impl AsRef<Path>, retry_delay: Duration) -> Result<Self, TempFileError> {
        let root = normalize(&std::path::absolute(root.as_ref())?);
        Ok(Self { root, retry_delay })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn job_dir(&self, job_id: JobId) -> PathBuf {
        self.root.join(job_id.to_string())
    }

    /// Write `bytes` to `{root}/{job_id}/{file_name}` and return the path.
    pub async fn create(&self, job_id: JobId, file_name: &str, bytes: &[u8]) -> Result<PathBuf, TempFileError> {
        let file_name = validate_file_name(file_name)?;
        let dir = self.job_dir(job_id);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(file_name);
        tokio::fs::write(&path, bytes).await?;
        debug!(job_id = %job_id, path = %path.display(), size = bytes.len(), "temp file written");
        Ok(path)
    }

    /// Resolve `path` and check it falls inside the sandbox.
    pub fn resolve(&self, path: &Path) -> Result<PathBuf, TempFileError> {
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::path::absolute(path)?
        };
        let resolved = normalize(&absolute);
        if resolved == self.root || !resolved.starts_with(&self.root) {
            return Err(TempFileError::OutsideSandbox(resolved));
        }
        Ok(resolved)
    }

    /// Delete a staging file. A file that is already gone counts as deleted.
    pub async fn remove(&self, path: &Path) -> Result<(), TempFileError> {
        let resolved = self.resolve(path)?;
        match tokio::fs::remove_file(&resolved).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        if let Some(parent) = resolved.parent().filter(|p| *p != self.root) {
            // Only succeeds once the job directory is empty.
            let _ = tokio::fs::remove_dir(parent).await;
        }
        Ok(())
    }

    /// Delete a staging file; on IO failure retry once after the configured delay
    /// in the background. Never fails the caller.
    pub async fn remove_or_retry(&self, path: &Path) {
        match self.remove(path).await {
            Ok(()) => {}
            Err(TempFileError::Io(err)) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    retry_in_ms = self.retry_delay.as_millis() as u64,
                    "failed to delete temp file; scheduling retry"
                );
                let manager = self.clone();
                let path = path.to_path_buf();
                tokio::spawn(async move {
                    tokio::time::sleep(manager.retry_delay).await;
                    if let Err(err) = manager.remove(&path).await {
                        warn!(path = %path.display(), error = %err, "temp file retry delete failed");
                    }
                });
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "refusing to delete temp file");
            }
        }
    }
}

fn validate_file_name(file_name: &str) -> Result<&str, TempFileError> {
    let mut components = Path::new(file_name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(file_name),
        _ => Err(TempFileError::InvalidFileName(file_name.to_string())),
    }
}

/// Lexical normalization: drops `.` and folds `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(dir: &tempfile::TempDir) -> TempFileManager {
        TempFileManager::new(dir.path().join("temp"), Duration::from_millis(10)).unwrap()
    }

    #[tokio::test]
    async fn files_are_namespaced_per_job() {
        let dir = tempfile::tempdir().unwrap();
        let temp = manager(&dir);
        let job_id = JobId::new();

        let path = temp.create(job_id, "report.csv", b"a,b\n").await.unwrap();
        assert!(path.starts_with(temp.job_dir(job_id)));
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"a,b\n");

        temp.remove(&path).await.unwrap();
        assert!(!path.exists());
        assert!(!temp.job_dir(job_id).exists());
    }

    #[tokio::test]
    async fn traversal_outside_the_sandbox_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let temp = manager(&dir);
        let victim = dir.path().join("keep.txt");
        tokio::fs::write(&victim, b"keep").await.unwrap();

        let sneaky = temp.root().join("..").join("keep.txt");
        assert!(matches!(
            temp.remove(&sneaky).await,
            Err(TempFileError::OutsideSandbox(_))
        ));
        assert!(matches!(
            temp.remove(temp.root()).await,
            Err(TempFileError::OutsideSandbox(_))
        ));
        assert!(victim.exists());
    }

    #[tokio::test]
    async fn file_names_cannot_escape_the_job_directory() {
        let dir = tempfile::tempdir().unwrap();
        let temp = manager(&dir);
        for bad in ["../x.csv", "a/b.csv", "", ".."] {
            assert!(matches!(
                temp.create(JobId::new(), bad, b"").await,
                Err(TempFileError::InvalidFileName(_))
            ));
        }
    }

    #[tokio::test]
    async fn removing_a_missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let temp = manager(&dir);
        let path = temp.job_dir(JobId::new()).join("gone.csv");
        assert!(temp.remove(&path).await.is_ok());
        temp.remove_or_retry(&path).await;
    }
}

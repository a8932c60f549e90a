//! Blob storage for job result files and time-limited signed URLs.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// Unreserved characters and `/` stay as they are in signed URL paths.
const PATH_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResultStoreError {
    #[error("invalid storage path: {0}")]
    InvalidPath(String),

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("signed url has expired")]
    Expired,

    #[error("signature mismatch")]
    InvalidSignature,

    #[error("result storage error: {0}")]
    Backend(String),
}

/// Storage path of a job result: `{user_id}/{job_id}/{file_name}`.
pub fn result_path(user_id: impl std::fmt::Display, job_id: impl std::fmt::Display, file_name: &str) -> String {
    format!("{user_id}/{job_id}/{file_name}")
}

/// Content type guessed from the file extension.
pub fn content_type_for(file_name: &str) -> &'static str {
    let ext = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("csv") => "text/csv",
        Some("json") => "application/json",
        Some("xlsx") => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        Some("pdf") => "application/pdf",
        Some("txt") => "text/plain",
        _ => "application/octet-stream",
    }
}

/// Path-addressed blob storage.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn upload(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), ResultStoreError>;

    async fn create_signed_url(&self, path: &str, ttl: Duration) -> Result<String, ResultStoreError>;

    /// Remove objects; missing objects are ignored.
    async fn remove(&self, paths: &[String]) -> Result<(), ResultStoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// In-memory result store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryResultStore {
    objects: Mutex<HashMap<String, StoredObject>>,
    fail_uploads: AtomicBool,
    fail_signing: AtomicBool,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<_> = self.objects.lock().keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn get(&self, path: &str) -> Option<StoredObject> {
        self.objects.lock().get(path).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }

    /// Make subsequent uploads fail (fault injection).
    pub fn set_fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent URL signing fail (fault injection).
    pub fn set_fail_signing(&self, fail: bool) {
        self.fail_signing.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn upload(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), ResultStoreError> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(ResultStoreError::Backend("upload rejected".to_string()));
        }
        self.objects.lock().insert(
            path.to_string(),
            StoredObject {
                bytes,
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    async fn create_signed_url(&self, path: &str, ttl: Duration) -> Result<String, ResultStoreError> {
        if self.fail_signing.load(Ordering::SeqCst) {
            return Err(ResultStoreError::Backend("signing rejected".to_string()));
        }
        if !self.objects.lock().contains_key(path) {
            return Err(ResultStoreError::NotFound(path.to_string()));
        }
        Ok(format!("memory://{path}?ttl={}", ttl.as_secs()))
    }

    async fn remove(&self, paths: &[String]) -> Result<(), ResultStoreError> {
        let mut objects = self.objects.lock();
        for path in paths {
            objects.remove(path);
        }
        Ok(())
    }
}

/// Filesystem-backed result store issuing HMAC-SHA256 signed URLs.
///
/// URL shape: `{base_url}/{path}?expires={unix}&signature={hex}` where the
/// signature covers `"{path}\n{expires}"`.
pub struct LocalResultStore {
    root: PathBuf,
    base_url: String,
    signing_key: Vec<u8>,
}

impl std::fmt::Debug for LocalResultStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalResultStore")
            .field("root", &self.root)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl LocalResultStore {
    pub fn new(root: impl Into<PathBuf>, base_url: impl Into<String>, signing_key: impl AsRef<[u8]>) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            signing_key: signing_key.as_ref().to_vec(),
        }
    }

    /// Map a storage path onto the filesystem, refusing anything that could
    /// escape the root.
    fn object_path(&self, path: &str) -> Result<PathBuf, ResultStoreError> {
        let relative = Path::new(path);
        if path.is_empty()
            || !relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(ResultStoreError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(relative))
    }

    fn signature(&self, path: &str, expires: i64) -> String {
        let mut mac = match HmacSha256::new_from_slice(&self.signing_key) {
            Ok(mac) => mac,
            Err(_) => return String::new(),
        };
        mac.update(format!("{path}\n{expires}").as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Signed URL valid until `expires_at`.
    pub fn signed_url_until(&self, path: &str, expires_at: DateTime<Utc>) -> String {
        let expires = expires_at.timestamp();
        format!(
            "{}/{}?expires={}&signature={}",
            self.base_url,
            utf8_percent_encode(path, PATH_ENCODE_SET),
            expires,
            self.signature(path, expires)
        )
    }

    /// Check a signed URL's parameters at `now`.
    pub fn verify(&self, path: &str, expires: i64, signature: &str, now: DateTime<Utc>) -> Result<(), ResultStoreError> {
        let expected = self.signature(path, expires);
        if !constant_time_eq(expected.as_bytes(), signature.as_bytes()) {
            return Err(ResultStoreError::InvalidSignature);
        }
        if now.timestamp() > expires {
            return Err(ResultStoreError::Expired);
        }
        Ok(())
    }

    pub async fn read(&self, path: &str) -> Result<Vec<u8>, ResultStoreError> {
        let file = self.object_path(path)?;
        tokio::fs::read(&file).await.map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => ResultStoreError::NotFound(path.to_string()),
            _ => ResultStoreError::Backend(err.to_string()),
        })
    }
}

#[async_trait]
impl ResultStore for LocalResultStore {
    async fn upload(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), ResultStoreError> {
        let file = self.object_path(path)?;
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ResultStoreError::Backend(e.to_string()))?;
        }
        let size = bytes.len();
        tokio::fs::write(&file, bytes)
            .await
            .map_err(|e| ResultStoreError::Backend(e.to_string()))?;
        debug!(path, size, content_type, "result uploaded");
        Ok(())
    }

    async fn create_signed_url(&self, path: &str, ttl: Duration) -> Result<String, ResultStoreError> {
        let file = self.object_path(path)?;
        if !tokio::fs::try_exists(&file).await.unwrap_or(false) {
            return Err(ResultStoreError::NotFound(path.to_string()));
        }
        let ttl = chrono::Duration::from_std(ttl).map_err(|e| ResultStoreError::Backend(e.to_string()))?;
        Ok(self.signed_url_until(path, Utc::now() + ttl))
    }

    async fn remove(&self, paths: &[String]) -> Result<(), ResultStoreError> {
        for path in paths {
            let file = self.object_path(path)?;
            match tokio::fs::remove_file(&file).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(ResultStoreError::Backend(err.to_string())),
            }
        }
        Ok(())
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let mut diff = a.len() ^ b.len();
    for i in 0..a.len().max(b.len()) {
        let left = *a.get(i).unwrap_or(&0);
        let right = *b.get(i).unwrap_or(&0);
        diff |= usize::from(left ^ right);
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &tempfile::TempDir) -> LocalResultStore {
        LocalResultStore::new(dir.path(), "https://files.example.com/", "secret")
    }

    fn query_param<'a>(url: &'a str, name: &str) -> &'a str {
        url.split(['?', '&'])
            .find_map(|pair| pair.strip_prefix(&format!("{name}=")))
            .unwrap()
    }

    #[tokio::test]
    async fn signed_url_verifies_until_it_expires() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let path = "user/job/report 1.csv";
        store.upload(path, b"x".to_vec(), "text/csv").await.unwrap();

        let url = store.create_signed_url(path, Duration::from_secs(60)).await.unwrap();
        assert!(url.starts_with("https://files.example.com/user/job/report%201.csv?expires="));

        let expires: i64 = query_param(&url, "expires").parse().unwrap();
        let signature = query_param(&url, "signature");
        let now = Utc::now();

        assert!(store.verify(path, expires, signature, now).is_ok());
        assert_eq!(
            store.verify(path, expires, signature, now + chrono::Duration::minutes(5)),
            Err(ResultStoreError::Expired)
        );
        assert_eq!(
            store.verify("user/job/other.csv", expires, signature, now),
            Err(ResultStoreError::InvalidSignature)
        );
        assert_eq!(
            store.verify(path, expires + 3600, signature, now),
            Err(ResultStoreError::InvalidSignature)
        );
    }

    #[tokio::test]
    async fn paths_cannot_escape_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        for bad in ["../x", "/etc/passwd", "a/../../b", ""] {
            assert!(matches!(
                store.upload(bad, Vec::new(), "text/plain").await,
                Err(ResultStoreError::InvalidPath(_))
            ));
        }
    }

    #[tokio::test]
    async fn remove_ignores_missing_objects() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.upload("u/j/a.csv", b"a".to_vec(), "text/csv").await.unwrap();

        store
            .remove(&["u/j/a.csv".to_string(), "u/j/missing.csv".to_string()])
            .await
            .unwrap();
        assert_eq!(
            store.read("u/j/a.csv").await,
            Err(ResultStoreError::NotFound("u/j/a.csv".to_string()))
        );
    }

    #[test]
    fn content_types_follow_extension() {
        assert_eq!(content_type_for("a.CSV"), "text/csv");
        assert_eq!(content_type_for("a.bin"), "application/octet-stream");
        assert_eq!(result_path("u", "j", "a.csv"), "u/j/a.csv");
    }
}

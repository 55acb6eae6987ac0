use async_trait::async_trait;
use s3::creds::Credentials;
use s3::{Bucket, Region};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use strum::{AsRefStr, Display};

/// The three destinations an image can be routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum Location {
    Success,
    Failed,
    Pending,
}

/// Write-once image storage split into success / failed / pending.
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Store `data` under `name` and return the resulting key or path.
    async fn put(
        &self,
        location: Location,
        name: &str,
        data: &[u8],
        content_type: &str,
    ) -> Result<String, StorageError>;

    async fn get(&self, location: Location, name: &str) -> Result<Vec<u8>, StorageError>;

    /// Names currently stored at `location`.
    async fn list(&self, location: Location) -> Result<Vec<String>, StorageError>;

    async fn delete(&self, location: Location, name: &str) -> Result<(), StorageError>;
}

/// Replace anything outside `[A-Za-z0-9._-]` so the result is safe as a file
/// name or object key.
pub fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "image".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Three directories on the local filesystem.
pub struct LocalStore {
    success: PathBuf,
    failed: PathBuf,
    pending: PathBuf,
}

impl LocalStore {
    pub fn new(
        success: impl Into<PathBuf>,
        failed: impl Into<PathBuf>,
        pending: impl Into<PathBuf>,
    ) -> Self {
        Self {
            success: success.into(),
            failed: failed.into(),
            pending: pending.into(),
        }
    }

    /// Create all three directories.
    pub async fn ensure_dirs(&self) -> Result<(), StorageError> {
        for dir in [&self.success, &self.failed, &self.pending] {
            tokio::fs::create_dir_all(dir).await?;
        }
        Ok(())
    }

    fn dir(&self, location: Location) -> &Path {
        match location {
            Location::Success => &self.success,
            Location::Failed => &self.failed,
            Location::Pending => &self.pending,
        }
    }

    fn path(&self, location: Location, name: &str) -> PathBuf {
        self.dir(location).join(sanitize_component(name))
    }
}

#[async_trait]
impl ImageStore for LocalStore {
    async fn put(
        &self,
        location: Location,
        name: &str,
        data: &[u8],
        _content_type: &str,
    ) -> Result<String, StorageError> {
        tokio::fs::create_dir_all(self.dir(location)).await?;
        let path = self.path(location, name);

        // Rename from a sibling temp file so readers never see a partial image.
        let mut tmp = path.clone().into_os_string();
        tmp.push(".part");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await?;

        Ok(path.display().to_string())
    }

    async fn get(&self, location: Location, name: &str) -> Result<Vec<u8>, StorageError> {
        Ok(tokio::fs::read(self.path(location, name)).await?)
    }

    async fn list(&self, location: Location) -> Result<Vec<String>, StorageError> {
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(self.dir(location)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.ends_with(".part") {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    async fn delete(&self, location: Location, name: &str) -> Result<(), StorageError> {
        tokio::fs::remove_file(self.path(location, name)).await?;
        Ok(())
    }
}

/// Cloudflare R2 object storage (S3-compatible), one prefix per location.
pub struct R2Store {
    bucket: Box<Bucket>,
}

impl R2Store {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: "auto".to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials =
            Credentials::new(Some(access_key), Some(secret_key), None, None, None)
                .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(Self { bucket })
    }

    fn key(location: Location, name: &str) -> String {
        format!("{}/{}", location.as_ref(), sanitize_component(name))
    }
}

fn check_status(key: &str, code: u16) -> Result<(), StorageError> {
    if (200..300).contains(&code) {
        Ok(())
    } else {
        Err(StorageError::Status {
            key: key.to_string(),
            code,
        })
    }
}

#[async_trait]
impl ImageStore for R2Store {
    async fn put(
        &self,
        location: Location,
        name: &str,
        data: &[u8],
        content_type: &str,
    ) -> Result<String, StorageError> {
        let key = Self::key(location, name);
        let response = self
            .bucket
            .put_object_with_content_type(&key, data, content_type)
            .await?;
        check_status(&key, response.status_code())?;
        Ok(key)
    }

    async fn get(&self, location: Location, name: &str) -> Result<Vec<u8>, StorageError> {
        let key = Self::key(location, name);
        let response = self.bucket.get_object(&key).await?;
        check_status(&key, response.status_code())?;
        Ok(response.to_vec())
    }

    async fn list(&self, location: Location) -> Result<Vec<String>, StorageError> {
        let prefix = format!("{}/", location.as_ref());
        let pages = self.bucket.list(prefix.clone(), None).await?;
        let mut names: Vec<String> = pages
            .into_iter()
            .flat_map(|page| page.contents)
            .filter_map(|object| object.key.strip_prefix(&prefix).map(str::to_string))
            .filter(|name| !name.is_empty())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn delete(&self, location: Location, name: &str) -> Result<(), StorageError> {
        let key = Self::key(location, name);
        let response = self.bucket.delete_object(&key).await?;
        check_status(&key, response.status_code())?;
        Ok(())
    }
}

/// In-process store for tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<(Location, String), Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of objects at `location`.
    pub fn count(&self, location: Location) -> usize {
        self.lock().keys().filter(|(loc, _)| *loc == location).count()
    }

    /// Names stored at `location`, sorted.
    pub fn names(&self, location: Location) -> Vec<String> {
        self.lock()
            .keys()
            .filter(|(loc, _)| *loc == location)
            .map(|(_, name)| name.clone())
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<(Location, String), Vec<u8>>> {
        self.objects.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ImageStore for MemoryStore {
    async fn put(
        &self,
        location: Location,
        name: &str,
        data: &[u8],
        _content_type: &str,
    ) -> Result<String, StorageError> {
        let name = sanitize_component(name);
        self.lock().insert((location, name.clone()), data.to_vec());
        Ok(format!("{}/{}", location.as_ref(), name))
    }

    async fn get(&self, location: Location, name: &str) -> Result<Vec<u8>, StorageError> {
        self.lock()
            .get(&(location, sanitize_component(name)))
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("{}/{}", location.as_ref(), name)))
    }

    async fn list(&self, location: Location) -> Result<Vec<String>, StorageError> {
        Ok(self.names(location))
    }

    async fn delete(&self, location: Location, name: &str) -> Result<(), StorageError> {
        self.lock()
            .remove(&(location, sanitize_component(name)))
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(format!("{}/{}", location.as_ref(), name)))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("S3 returned status {code} for {key}")]
    Status { key: String, code: u16 },

    #[error("Filesystem operation failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Storage configuration error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_component() {
        assert_eq!(sanitize_component("bill 01.png"), "bill_01.png");
        assert_eq!(sanitize_component("../../etc/passwd"), "_.._etc_passwd");
        assert_eq!(sanitize_component("  "), "image");
        assert_eq!(sanitize_component("बिल.jpg"), "___.jpg");
    }

    #[tokio::test]
    async fn test_local_store_roundtrip() {
        let root = tempfile::tempdir().unwrap();
        let store = LocalStore::new(
            root.path().join("success"),
            root.path().join("failed"),
            root.path().join("pending"),
        );
        store.ensure_dirs().await.unwrap();

        let path = store
            .put(Location::Pending, "bill one.png", b"png-bytes", "image/png")
            .await
            .unwrap();
        assert!(path.ends_with("bill_one.png"));

        assert_eq!(store.list(Location::Pending).await.unwrap(), vec!["bill_one.png"]);
        assert!(store.list(Location::Success).await.unwrap().is_empty());
        assert_eq!(
            store.get(Location::Pending, "bill_one.png").await.unwrap(),
            b"png-bytes"
        );

        store.delete(Location::Pending, "bill_one.png").await.unwrap();
        assert!(store.list(Location::Pending).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_local_store_lists_missing_dir_as_empty() {
        let root = tempfile::tempdir().unwrap();
        let store = LocalStore::new(
            root.path().join("s"),
            root.path().join("f"),
            root.path().join("does-not-exist"),
        );
        assert!(store.list(Location::Pending).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_store_overwrites_same_name() {
        let store = MemoryStore::new();
        store.put(Location::Pending, "a.png", b"1", "image/png").await.unwrap();
        store.put(Location::Pending, "a.png", b"2", "image/png").await.unwrap();
        assert_eq!(store.count(Location::Pending), 1);
        assert_eq!(store.get(Location::Pending, "a.png").await.unwrap(), b"2");
    }
}

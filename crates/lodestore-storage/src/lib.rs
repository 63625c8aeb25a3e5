pub mod local_backend;
pub mod retry;
pub mod s3_backend;

use std::sync::Arc;

use url::Url;

use lodestore_types::error::{Result, StoreError};

/// Name and byte size of one object in a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobMeta {
    pub name: String,
    pub size: u64,
}

/// Handle to a single object in a blob store.
///
/// `lock_write_version` snapshots the object's current version token so that a
/// subsequent `write` can detect concurrent modification: `write` returns
/// `Ok(false)` when the version changed since the lock (the caller re-reads
/// and retries), `Ok(true)` on success. A `write` without a preceding lock is
/// unconditional.
pub trait BlobObject: Send {
    /// Whether the object currently exists.
    fn exists(&self) -> Result<bool>;

    /// Read the full object. Absent keys fail with `StoreError::NotFound`.
    fn read(&self) -> Result<Vec<u8>>;

    /// Snapshot the current version for a compare-and-swap `write`.
    /// Returns whether the object existed. Idempotent, safe when absent.
    fn lock_write_version(&mut self) -> Result<bool>;

    /// Write the object. Returns `Ok(false)` if a locked version no longer
    /// matches the backend's current version.
    fn write(&mut self, data: &[u8]) -> Result<bool>;
}

/// Per-worker connection to a blob store. Clients are not shared between
/// threads; each worker constructs its own. Dropping a client releases its
/// connections.
pub trait BlobClient: Send {
    /// Create a handle for the object at `key` (`/`-separated path).
    fn new_object(&self, key: &str) -> Result<Box<dyn BlobObject>>;

    /// List all objects in the store.
    fn list(&self) -> Result<Vec<BlobMeta>>;

    /// Human-readable store location for log messages.
    fn label(&self) -> String;
}

/// Factory for [`BlobClient`]s, shared across worker threads.
pub trait BlobStore: Send + Sync {
    fn new_client(&self) -> Result<Box<dyn BlobClient>>;

    /// Human-readable store location for log messages.
    fn label(&self) -> String;
}

/// Build a blob store from a URI.
///
/// Supported forms:
/// - Bare path (`/data/store`, `./store`, `store`) -> filesystem
/// - `file:///data/store` -> filesystem
/// - `s3://endpoint[:port]/bucket[/prefix]` -> S3
/// - `gs://`, `abfs://`, `abfss://` -> clear "not supported" errors
pub fn store_from_uri(uri: &str) -> Result<Arc<dyn BlobStore>> {
    let trimmed = uri.trim();
    if trimmed.is_empty() {
        return Err(StoreError::InvalidArgument(
            "store URI must not be empty".into(),
        ));
    }

    // Anything without a scheme is a filesystem path.
    if !trimmed.contains("://") {
        return Ok(Arc::new(local_backend::FsBlobStore::new(trimmed)?));
    }

    let parsed = Url::parse(trimmed)
        .map_err(|e| StoreError::InvalidArgument(format!("invalid store URI '{trimmed}': {e}")))?;

    match parsed.scheme() {
        "file" => {
            let path = parsed.path();
            if path.is_empty() {
                return Err(StoreError::InvalidArgument(
                    "file:// URI has empty path".into(),
                ));
            }
            Ok(Arc::new(local_backend::FsBlobStore::new(path)?))
        }
        "s3" => Ok(Arc::new(s3_backend::S3BlobStore::from_url(&parsed)?)),
        "gs" => Err(StoreError::InvalidArgument(
            "google cloud storage (gs://) is not supported by this build".into(),
        )),
        "abfs" => Err(StoreError::InvalidArgument(
            "azure gen1 storage (abfs://) is not implemented".into(),
        )),
        "abfss" => Err(StoreError::InvalidArgument(
            "azure gen2 storage (abfss://) is not implemented".into(),
        )),
        other => Err(StoreError::InvalidArgument(format!(
            "unsupported store URI scheme: '{other}'"
        ))),
    }
}

/// Split a URI into its parent and final segment, on the last `/` or `\`.
pub fn split_uri(uri: &str) -> (&str, &str) {
    match uri.rfind(['/', '\\']) {
        Some(i) => (&uri[..i], &uri[i + 1..]),
        None => ("", uri),
    }
}

/// Read a single object addressed by a full URI.
pub fn read_from_uri(uri: &str) -> Result<Vec<u8>> {
    let (parent, name) = split_uri(uri);
    let store = store_from_uri(parent)?;
    let client = store.new_client()?;
    let object = client.new_object(name)?;
    object.read()
}

/// Write a single object addressed by a full URI.
pub fn write_to_uri(uri: &str, data: &[u8]) -> Result<()> {
    let (parent, name) = split_uri(uri);
    let store = store_from_uri(parent)?;
    let client = store.new_client()?;
    let mut object = client.new_object(name)?;
    object.write(data)?;
    Ok(())
}

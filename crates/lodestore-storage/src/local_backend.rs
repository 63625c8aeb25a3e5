use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use lodestore_types::error::{Result, StoreError};

use crate::{BlobClient, BlobMeta, BlobObject, BlobStore};

/// Blob store rooted at a local directory, using `std::fs` directly.
pub struct FsBlobStore {
    root: PathBuf,
    /// Serializes version-checked writes from clients of this store.
    write_lock: Arc<Mutex<()>>,
}

impl FsBlobStore {
    pub fn new(root: &str) -> Result<Self> {
        let root_path = PathBuf::from(root);
        // Canonicalize if the directory already exists for clearer errors and
        // stable keys with symlinked roots.
        let root = if root_path.exists() {
            fs::canonicalize(&root_path)?
        } else {
            root_path
        };
        Ok(Self {
            root,
            write_lock: Arc::new(Mutex::new(())),
        })
    }
}

impl BlobStore for FsBlobStore {
    fn new_client(&self) -> Result<Box<dyn BlobClient>> {
        Ok(Box::new(FsBlobClient {
            root: self.root.clone(),
            write_lock: Arc::clone(&self.write_lock),
        }))
    }

    fn label(&self) -> String {
        format!("fs://{}", self.root.display())
    }
}

pub struct FsBlobClient {
    root: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

/// Reject keys that could escape the store root.
fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(StoreError::InvalidArgument("unsafe object key: empty".into()));
    }
    if key.starts_with('/') || key.starts_with('\\') {
        return Err(StoreError::InvalidArgument(format!(
            "unsafe object key: absolute path '{key}'"
        )));
    }
    if key.contains('\\') {
        return Err(StoreError::InvalidArgument(format!(
            "unsafe object key: contains backslash '{key}'"
        )));
    }
    for component in Path::new(key).components() {
        if component == Component::ParentDir {
            return Err(StoreError::InvalidArgument(format!(
                "unsafe object key: parent traversal '{key}'"
            )));
        }
    }
    Ok(())
}

impl BlobClient for FsBlobClient {
    fn new_object(&self, key: &str) -> Result<Box<dyn BlobObject>> {
        validate_key(key)?;
        Ok(Box::new(FsBlobObject {
            path: self.root.join(key),
            key: key.to_string(),
            write_lock: Arc::clone(&self.write_lock),
            locked_version: None,
        }))
    }

    fn list(&self) -> Result<Vec<BlobMeta>> {
        let mut blobs = Vec::new();
        if self.root.is_dir() {
            list_recursive(&self.root, &self.root, &mut blobs)?;
        }
        Ok(blobs)
    }

    fn label(&self) -> String {
        format!("fs://{}", self.root.display())
    }
}

/// Recursively list files under `dir` as `/`-separated keys relative to `root`.
fn list_recursive(root: &Path, dir: &Path, blobs: &mut Vec<BlobMeta>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            list_recursive(root, &entry.path(), blobs)?;
        } else if file_type.is_file() {
            let meta = entry.metadata()?;
            if let Ok(rel) = entry.path().strip_prefix(root) {
                let name = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                blobs.push(BlobMeta {
                    name,
                    size: meta.len(),
                });
            }
        }
    }
    Ok(())
}

/// Version token for CAS writes: the file's length and mtime at lock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileVersion {
    len: u64,
    modified: SystemTime,
}

fn stat_version(path: &Path) -> Result<Option<FileVersion>> {
    match fs::metadata(path) {
        Ok(meta) => Ok(Some(FileVersion {
            len: meta.len(),
            modified: meta.modified()?,
        })),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub struct FsBlobObject {
    path: PathBuf,
    key: String,
    write_lock: Arc<Mutex<()>>,
    /// `Some` once `lock_write_version` ran; the inner `None` means the
    /// object did not exist at lock time.
    locked_version: Option<Option<FileVersion>>,
}

/// Distinguishes concurrent temp files for the same target path.
static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

impl FsBlobObject {
    /// Atomic replace: write to a sibling temp file, then rename over `path`.
    fn write_atomic(&self, data: &[u8]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension(format!(
            "tmp{}-{}",
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl BlobObject for FsBlobObject {
    fn exists(&self) -> Result<bool> {
        match fs::metadata(&self.path) {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn read(&self) -> Result<Vec<u8>> {
        match fs::read(&self.path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(format!("object '{}'", self.key)))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn lock_write_version(&mut self) -> Result<bool> {
        let version = stat_version(&self.path)?;
        let existed = version.is_some();
        self.locked_version = Some(version);
        Ok(existed)
    }

    fn write(&mut self, data: &[u8]) -> Result<bool> {
        match self.locked_version {
            None => {
                self.write_atomic(data)?;
                Ok(true)
            }
            Some(locked) => {
                let guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
                if stat_version(&self.path)? != locked {
                    return Ok(false);
                }
                self.write_atomic(data)?;
                // Refresh the snapshot so a repeated write still CASes
                // against what this handle last wrote.
                self.locked_version = Some(stat_version(&self.path)?);
                drop(guard);
                Ok(true)
            }
        }
    }
}

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use lodestore_storage::{BlobClient, BlobMeta, BlobObject, BlobStore};
use lodestore_types::error::{Result, StoreError};

/// In-memory blob store for tests, with per-object version tokens so CAS
/// writes behave like a real backend.
pub struct MemoryBlobStore {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    objects: Mutex<HashMap<String, (Vec<u8>, u64)>>,
    reads: Mutex<HashMap<String, u64>>,
    version_counter: AtomicU64,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                objects: Mutex::new(HashMap::new()),
                reads: Mutex::new(HashMap::new()),
                version_counter: AtomicU64::new(1),
            }),
        }
    }

    /// How many times the object at `key` has been read.
    pub fn reads_of(&self, key: &str) -> u64 {
        self.inner.reads.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    /// Drop an object, simulating out-of-band deletion.
    pub fn remove(&self, key: &str) {
        self.inner.objects.lock().unwrap().remove(key);
    }

    /// Overwrite an object directly, bypassing versioning.
    pub fn inject(&self, key: &str, data: Vec<u8>) {
        let version = self.inner.version_counter.fetch_add(1, Ordering::SeqCst);
        self.inner
            .objects
            .lock()
            .unwrap()
            .insert(key.to_string(), (data, version));
    }
}

impl BlobStore for MemoryBlobStore {
    fn new_client(&self) -> Result<Box<dyn BlobClient>> {
        Ok(Box::new(MemoryBlobClient {
            inner: Arc::clone(&self.inner),
        }))
    }

    fn label(&self) -> String {
        "memory://test".into()
    }
}

struct MemoryBlobClient {
    inner: Arc<MemoryInner>,
}

impl BlobClient for MemoryBlobClient {
    fn new_object(&self, key: &str) -> Result<Box<dyn BlobObject>> {
        Ok(Box::new(MemoryBlobObject {
            inner: Arc::clone(&self.inner),
            key: key.to_string(),
            locked_version: None,
        }))
    }

    fn list(&self) -> Result<Vec<BlobMeta>> {
        let objects = self.inner.objects.lock().unwrap();
        Ok(objects
            .iter()
            .map(|(name, (data, _))| BlobMeta {
                name: name.clone(),
                size: data.len() as u64,
            })
            .collect())
    }

    fn label(&self) -> String {
        "memory://test".into()
    }
}

struct MemoryBlobObject {
    inner: Arc<MemoryInner>,
    key: String,
    /// `Some` once locked; the inner `None` means the object was absent.
    locked_version: Option<Option<u64>>,
}

impl BlobObject for MemoryBlobObject {
    fn exists(&self) -> Result<bool> {
        Ok(self.inner.objects.lock().unwrap().contains_key(&self.key))
    }

    fn read(&self) -> Result<Vec<u8>> {
        *self
            .inner
            .reads
            .lock()
            .unwrap()
            .entry(self.key.clone())
            .or_insert(0) += 1;
        self.inner
            .objects
            .lock()
            .unwrap()
            .get(&self.key)
            .map(|(data, _)| data.clone())
            .ok_or_else(|| StoreError::NotFound(format!("object '{}'", self.key)))
    }

    fn lock_write_version(&mut self) -> Result<bool> {
        let version = self
            .inner
            .objects
            .lock()
            .unwrap()
            .get(&self.key)
            .map(|(_, version)| *version);
        let existed = version.is_some();
        self.locked_version = Some(version);
        Ok(existed)
    }

    fn write(&mut self, data: &[u8]) -> Result<bool> {
        let mut objects = self.inner.objects.lock().unwrap();
        if let Some(locked) = self.locked_version {
            let current = objects.get(&self.key).map(|(_, version)| *version);
            if current != locked {
                return Ok(false);
            }
        }
        let version = self.inner.version_counter.fetch_add(1, Ordering::SeqCst);
        objects.insert(self.key.clone(), (data.to_vec(), version));
        self.locked_version = Some(Some(version));
        Ok(true)
    }
}

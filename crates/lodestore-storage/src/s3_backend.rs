use std::sync::Arc;
use std::time::Duration;

use rusty_s3::actions::{ListObjectsV2, S3Action};
use rusty_s3::{Bucket, Credentials, UrlStyle};
use url::Url;

use lodestore_types::error::{Result, StoreError};

use crate::{BlobClient, BlobMeta, BlobObject, BlobStore};

/// Duration for presigned URL validity.
const PRESIGN_DURATION: Duration = Duration::from_secs(3600);

/// Blob store on S3-compatible object storage, addressed as
/// `s3://endpoint[:port]/bucket[/prefix]`. Credentials come from the
/// standard `AWS_ACCESS_KEY_ID`/`AWS_SECRET_ACCESS_KEY` environment,
/// the region from `AWS_REGION` (default `us-east-1`).
pub struct S3BlobStore {
    shared: Arc<S3Shared>,
}

struct S3Shared {
    bucket: Bucket,
    credentials: Credentials,
    /// Prefix (root path) prepended to all keys. Empty or without slashes.
    root: String,
    label: String,
}

impl S3Shared {
    fn full_key(&self, key: &str) -> String {
        if self.root.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.root, key)
        }
    }
}

impl S3BlobStore {
    pub fn from_url(url: &Url) -> Result<Self> {
        let host = url.host_str().ok_or_else(|| {
            StoreError::InvalidArgument("s3 URI is missing an endpoint host".into())
        })?;
        let port_suffix = url.port().map(|p| format!(":{p}")).unwrap_or_default();
        let endpoint = format!("https://{host}{port_suffix}");

        let path = url.path().trim_start_matches('/');
        let (bucket_name, root) = path.split_once('/').unwrap_or((path, ""));
        if bucket_name.is_empty() {
            return Err(StoreError::InvalidArgument(
                "s3 URI must include a bucket (expected s3://endpoint/bucket[/prefix])".into(),
            ));
        }

        let region = std::env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".to_string());
        let credentials = Credentials::from_env().ok_or_else(|| {
            StoreError::InvalidArgument(
                "S3 requires AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY in the environment".into(),
            )
        })?;

        Self::new(&endpoint, bucket_name, &region, root, credentials)
    }

    pub fn new(
        endpoint: &str,
        bucket_name: &str,
        region: &str,
        root: &str,
        credentials: Credentials,
    ) -> Result<Self> {
        let base_url = endpoint.parse().map_err(|e| {
            StoreError::InvalidArgument(format!("invalid S3 endpoint URL '{endpoint}': {e}"))
        })?;

        // Endpoint is always explicit in the store URI; use path-style addressing.
        let bucket = Bucket::new(
            base_url,
            UrlStyle::Path,
            bucket_name.to_string(),
            region.to_string(),
        )
        .map_err(|e| {
            StoreError::InvalidArgument(format!("failed to create S3 bucket handle: {e}"))
        })?;

        let root = root.trim_matches('/').to_string();
        let endpoint_label = endpoint.trim_start_matches("https://");
        let label = if root.is_empty() {
            format!("s3://{endpoint_label}/{bucket_name}")
        } else {
            format!("s3://{endpoint_label}/{bucket_name}/{root}")
        };

        Ok(Self {
            shared: Arc::new(S3Shared {
                bucket,
                credentials,
                root,
                label,
            }),
        })
    }
}

impl BlobStore for S3BlobStore {
    fn new_client(&self) -> Result<Box<dyn BlobClient>> {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(30))
            .timeout_read(Duration::from_secs(300))
            .timeout_write(Duration::from_secs(300))
            .build();
        Ok(Box::new(S3BlobClient {
            shared: Arc::clone(&self.shared),
            agent,
        }))
    }

    fn label(&self) -> String {
        self.shared.label.clone()
    }
}

pub struct S3BlobClient {
    shared: Arc<S3Shared>,
    agent: ureq::Agent,
}

impl BlobClient for S3BlobClient {
    fn new_object(&self, key: &str) -> Result<Box<dyn BlobObject>> {
        Ok(Box::new(S3BlobObject {
            shared: Arc::clone(&self.shared),
            agent: self.agent.clone(),
            key: key.to_string(),
            locked_version: None,
        }))
    }

    fn list(&self) -> Result<Vec<BlobMeta>> {
        let root_prefix_len = if self.shared.root.is_empty() {
            0
        } else {
            self.shared.root.len() + 1 // +1 for the '/'
        };

        let mut blobs = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut action = self.shared.bucket.list_objects_v2(Some(&self.shared.credentials));
            if !self.shared.root.is_empty() {
                action.query_mut().insert("prefix", &self.shared.root);
            }
            if let Some(ref token) = continuation_token {
                action.query_mut().insert("continuation-token", token);
            }
            let url = action.sign(PRESIGN_DURATION);

            let resp = self
                .agent
                .get(url.as_str())
                .call()
                .map_err(|e| StoreError::Io(format!("S3 LIST {}: {e}", self.shared.label)))?;
            let mut body = Vec::new();
            use std::io::Read;
            resp.into_reader()
                .read_to_end(&mut body)
                .map_err(|e| StoreError::Io(format!("S3 LIST body read: {e}")))?;
            let body = String::from_utf8(body)
                .map_err(|e| StoreError::BadData(format!("S3 LIST: invalid utf8: {e}")))?;
            let parsed = ListObjectsV2::parse_response(&body).map_err(|e| {
                StoreError::BadData(format!("S3 LIST: failed to parse response: {e}"))
            })?;

            for obj in &parsed.contents {
                // Skip directory markers.
                if obj.key.ends_with('/') {
                    continue;
                }
                let name = if root_prefix_len > 0 && obj.key.len() > root_prefix_len {
                    obj.key[root_prefix_len..].to_string()
                } else {
                    obj.key.clone()
                };
                blobs.push(BlobMeta {
                    name,
                    size: obj.size,
                });
            }

            match parsed.next_continuation_token {
                Some(token) => continuation_token = Some(token),
                None => break,
            }
        }

        Ok(blobs)
    }

    fn label(&self) -> String {
        self.shared.label.clone()
    }
}

/// Version token for CAS writes: the object's ETag at lock time, or the
/// observation that it did not exist.
#[derive(Debug, Clone)]
enum S3Version {
    Absent,
    Etag(String),
}

pub struct S3BlobObject {
    shared: Arc<S3Shared>,
    agent: ureq::Agent,
    key: String,
    locked_version: Option<S3Version>,
}

impl S3BlobObject {
    fn head(&self) -> Result<Option<String>> {
        let full_key = self.shared.full_key(&self.key);
        let url = self
            .shared
            .bucket
            .head_object(Some(&self.shared.credentials), &full_key)
            .sign(PRESIGN_DURATION);
        match self.agent.head(url.as_str()).call() {
            Ok(resp) => Ok(Some(resp.header("etag").unwrap_or("").to_string())),
            Err(ureq::Error::Status(404, _)) => Ok(None),
            Err(e) => Err(StoreError::Io(format!("S3 HEAD {}: {e}", self.key))),
        }
    }
}

impl BlobObject for S3BlobObject {
    fn exists(&self) -> Result<bool> {
        Ok(self.head()?.is_some())
    }

    fn read(&self) -> Result<Vec<u8>> {
        let full_key = self.shared.full_key(&self.key);
        let url = self
            .shared
            .bucket
            .get_object(Some(&self.shared.credentials), &full_key)
            .sign(PRESIGN_DURATION);
        match self.agent.get(url.as_str()).call() {
            Ok(resp) => {
                let mut buf = Vec::new();
                use std::io::Read;
                resp.into_reader()
                    .read_to_end(&mut buf)
                    .map_err(|e| StoreError::Io(format!("S3 GET {} body read: {e}", self.key)))?;
                Ok(buf)
            }
            Err(ureq::Error::Status(404, _)) => {
                Err(StoreError::NotFound(format!("object '{}'", self.key)))
            }
            Err(e) => Err(StoreError::Io(format!("S3 GET {}: {e}", self.key))),
        }
    }

    fn lock_write_version(&mut self) -> Result<bool> {
        let version = self.head()?;
        let existed = version.is_some();
        self.locked_version = Some(match version {
            Some(etag) => S3Version::Etag(etag),
            None => S3Version::Absent,
        });
        Ok(existed)
    }

    fn write(&mut self, data: &[u8]) -> Result<bool> {
        let full_key = self.shared.full_key(&self.key);
        let mut action = self
            .shared
            .bucket
            .put_object(Some(&self.shared.credentials), &full_key);

        // Conditional header replays the locked version so the backend
        // rejects the write when the object moved underneath us.
        let condition = match &self.locked_version {
            None => None,
            Some(S3Version::Absent) => Some(("if-none-match", "*".to_string())),
            Some(S3Version::Etag(etag)) => Some(("if-match", etag.clone())),
        };
        if let Some((header, value)) = &condition {
            action.headers_mut().insert(*header, value.as_str());
        }
        let url = action.sign(PRESIGN_DURATION);

        let mut request = self.agent.put(url.as_str());
        if let Some((header, value)) = &condition {
            request = request.set(header, value.as_str());
        }
        match request.send_bytes(data) {
            Ok(_) => Ok(true),
            Err(ureq::Error::Status(412, _)) => Ok(false),
            Err(e) => Err(StoreError::Io(format!("S3 PUT {}: {e}", self.key))),
        }
    }
}

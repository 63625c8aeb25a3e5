use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Error kinds surfaced by the block store.
///
/// Variants carry owned message strings rather than source errors so the type
/// is `Clone`: a coalesced fetch delivers a completion to every waiter, and
/// each waiter owns its copy of the outcome.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("bad data: {0}")]
    BadData(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("out of memory: {0}")]
    Memory(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl StoreError {
    /// Whether this error is the distinct "key absent" outcome.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => StoreError::NotFound(e.to_string()),
            std::io::ErrorKind::PermissionDenied => StoreError::PermissionDenied(e.to_string()),
            _ => StoreError::Io(e.to_string()),
        }
    }
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StoreError::Memory(format!("serialization failed: {e}"))
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StoreError::BadData(format!("deserialization failed: {e}"))
    }
}

use std::time::Duration;

use tracing::warn;

use lodestore_types::error::{Result, StoreError};

use crate::{BlobClient, BlobObject};

/// Delay before each retry attempt: one immediate retry, then 500 ms, then 2 s.
pub const RETRY_DELAYS: [Duration; 3] = [
    Duration::ZERO,
    Duration::from_millis(500),
    Duration::from_secs(2),
];

/// Read an object, retrying transient failures on the fixed ladder.
///
/// The existence check runs first so an absent key short-circuits as
/// `StoreError::NotFound` without consuming any retries. Returns the object
/// bytes and the number of retries consumed (0..=3).
pub fn read_blob_with_retry(client: &dyn BlobClient, key: &str) -> Result<(Vec<u8>, u64)> {
    let object = client.new_object(key)?;
    if !object.exists()? {
        return Err(StoreError::NotFound(format!(
            "object '{key}' in store {}",
            client.label()
        )));
    }

    let mut retry_count = 0u64;
    let mut result = object.read();
    for delay in RETRY_DELAYS {
        let err = match result {
            Ok(data) => return Ok((data, retry_count)),
            Err(e) => e,
        };
        warn!(
            "read '{key}' in store {}: retrying after {delay:?}: {err}",
            client.label()
        );
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        retry_count += 1;
        result = object.read();
    }
    result.map(|data| (data, retry_count))
}

/// Write an object through an existing handle, retrying on the same ladder.
///
/// A `write` returning `Ok(false)` (version drift) counts as a failed attempt
/// like any transient error. Returns the number of retries consumed.
pub fn write_blob_with_retry(
    object: &mut dyn BlobObject,
    key: &str,
    label: &str,
    data: &[u8],
) -> Result<u64> {
    let mut retry_count = 0u64;
    let mut result = object.write(data);
    for delay in RETRY_DELAYS {
        let err = match result {
            Ok(true) => return Ok(retry_count),
            Ok(false) => StoreError::Io(format!("object '{key}' changed under write")),
            Err(e) => e,
        };
        warn!("write '{key}' in store {label}: retrying after {delay:?}: {err}");
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        retry_count += 1;
        result = object.write(data);
    }
    match result {
        Ok(true) => Ok(retry_count),
        Ok(false) => Err(StoreError::Io(format!(
            "object '{key}' in store {label}: write failed after {retry_count} retries"
        ))),
        Err(e) => Err(e),
    }
}

//! Blob storage for uploaded images.

use async_trait::async_trait;
use shared::{ErrorKind, ItemError, StoredImageRef};

pub mod memory;
pub mod s3_service;

pub use memory::MemoryObjectStore;
pub use s3_service::S3Service;

pub const MAX_OBJECT_SIZE: usize = 50 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum StorageWriteError {
    #[error("S3 error: {0}")]
    S3(String),
    #[error("Object not found: {0}")]
    NotFound(String),
    #[error("File too large: {size} bytes exceeds the {limit} byte limit")]
    FileTooLarge { size: usize, limit: usize },
}

impl From<StorageWriteError> for ItemError {
    fn from(err: StorageWriteError) -> Self {
        ItemError::new(ErrorKind::StorageWrite, err.to_string())
    }
}

/// Named blob storage. Writes to an existing name replace the previous
/// object (last writer wins).
#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn bucket_name(&self) -> &str;

    /// Public address of `object_name`; computed locally, never fetched.
    fn public_url(&self, object_name: &str) -> String;

    async fn upload(
        &self,
        object_name: &str,
        data: &[u8],
        mime_type: &str,
    ) -> Result<StoredImageRef, StorageWriteError>;

    /// Grants anonymous read access. Repeating it on a public object is a no-op.
    async fn make_public(&self, object_name: &str) -> Result<(), StorageWriteError>;
}

pub fn validate_object_size(data: &[u8]) -> Result<(), StorageWriteError> {
    if data.len() > MAX_OBJECT_SIZE {
        return Err(StorageWriteError::FileTooLarge {
            size: data.len(),
            limit: MAX_OBJECT_SIZE,
        });
    }
    Ok(())
}

/// `{base}/{object_name}` with each path segment percent-encoded.
pub fn public_object_url(base_url: &str, object_name: &str) -> String {
    let encoded: Vec<String> = object_name
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect();
    format!("{}/{}", base_url.trim_end_matches('/'), encoded.join("/"))
}

pub fn stored_ref(store: &dyn ObjectStore, object_name: &str) -> StoredImageRef {
    StoredImageRef {
        bucket: store.bucket_name().to_string(),
        object_name: object_name.to_string(),
        public_url: store.public_url(object_name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_url_is_deterministic_and_encoded() {
        let base = "https://photos.s3.amazonaws.com/";
        assert_eq!(
            public_object_url(base, "cat.jpg"),
            "https://photos.s3.amazonaws.com/cat.jpg"
        );
        assert_eq!(
            public_object_url(base, "holiday/my cat#1.jpg"),
            "https://photos.s3.amazonaws.com/holiday/my%20cat%231.jpg"
        );
    }

    #[test]
    fn oversized_objects_are_rejected() {
        let data = vec![0u8; MAX_OBJECT_SIZE + 1];
        assert!(matches!(
            validate_object_size(&data),
            Err(StorageWriteError::FileTooLarge { .. })
        ));
        assert!(validate_object_size(&data[..MAX_OBJECT_SIZE]).is_ok());
    }
}

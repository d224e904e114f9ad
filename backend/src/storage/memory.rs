use async_trait::async_trait;
use shared::StoredImageRef;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{ObjectStore, StorageWriteError, public_object_url, stored_ref, validate_object_size};

#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    pub data: Vec<u8>,
    pub mime_type: String,
    pub public: bool,
}

/// Process-local bucket for development runs and tests. Nothing survives a
/// restart.
pub struct MemoryObjectStore {
    bucket_name: String,
    public_base_url: String,
    objects: RwLock<HashMap<String, StoredObject>>,
}

impl MemoryObjectStore {
    pub fn new(bucket_name: impl Into<String>, public_base_url: impl Into<String>) -> Self {
        Self {
            bucket_name: bucket_name.into(),
            public_base_url: public_base_url.into(),
            objects: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, object_name: &str) -> Option<StoredObject> {
        self.objects.read().await.get(object_name).cloned()
    }

    pub async fn object_count(&self) -> usize {
        self.objects.read().await.len()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn bucket_name(&self) -> &str {
        &self.bucket_name
    }

    fn public_url(&self, object_name: &str) -> String {
        public_object_url(&self.public_base_url, object_name)
    }

    async fn upload(
        &self,
        object_name: &str,
        data: &[u8],
        mime_type: &str,
    ) -> Result<StoredImageRef, StorageWriteError> {
        validate_object_size(data)?;

        let replaced = self.objects.write().await.insert(
            object_name.to_string(),
            StoredObject {
                data: data.to_vec(),
                mime_type: mime_type.to_string(),
                public: false,
            },
        );
        if replaced.is_some() {
            log::debug!("Overwrote {}/{}", self.bucket_name, object_name);
        }

        Ok(stored_ref(self, object_name))
    }

    async fn make_public(&self, object_name: &str) -> Result<(), StorageWriteError> {
        match self.objects.write().await.get_mut(object_name) {
            Some(object) => {
                object.public = true;
                Ok(())
            }
            None => Err(StorageWriteError::NotFound(object_name.to_string())),
        }
    }
}

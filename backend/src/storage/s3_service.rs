use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::ObjectCannedAcl;
use shared::StoredImageRef;

use super::{ObjectStore, StorageWriteError, public_object_url, stored_ref, validate_object_size};

#[derive(Clone)]
pub struct S3Service {
    client: Client,
    bucket_name: String,
    public_base_url: String,
}

impl S3Service {
    pub fn new(client: Client, bucket_name: String, public_base_url: String) -> Self {
        Self {
            client,
            bucket_name,
            public_base_url,
        }
    }
}

#[async_trait]
impl ObjectStore for S3Service {
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

        let body = ByteStream::from(data.to_vec());

        self.client
            .put_object()
            .bucket(&self.bucket_name)
            .key(object_name)
            .body(body)
            .content_type(mime_type)
            .send()
            .await
            .map_err(|e| {
                log::error!(
                    "S3 put_object failed for s3://{}/{}: {:?}",
                    self.bucket_name,
                    object_name,
                    e
                );
                StorageWriteError::S3(e.to_string())
            })?;

        Ok(stored_ref(self, object_name))
    }

    async fn make_public(&self, object_name: &str) -> Result<(), StorageWriteError> {
        self.client
            .put_object_acl()
            .bucket(&self.bucket_name)
            .key(object_name)
            .acl(ObjectCannedAcl::PublicRead)
            .send()
            .await
            .map_err(|e| {
                log::error!(
                    "S3 put_object_acl failed for s3://{}/{}: {:?}",
                    self.bucket_name,
                    object_name,
                    e
                );
                StorageWriteError::S3(e.to_string())
            })?;

        Ok(())
    }
}

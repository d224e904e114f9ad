//! Append-only store of classification records.

use async_trait::async_trait;
use futures::stream::BoxStream;
use shared::{ClassificationRecord, ErrorKind, ItemError, StoredRecord};

pub mod dynamodb_repository;
pub mod memory;

pub use dynamodb_repository::DynamoDbRepository;
pub use memory::MemoryResultStore;

#[derive(Debug, thiserror::Error)]
pub enum RecordWriteError {
    #[error("DynamoDB error: {0}")]
    DynamoDb(String),
    #[error("Record store unavailable: {0}")]
    Unavailable(String),
}

impl From<RecordWriteError> for ItemError {
    fn from(err: RecordWriteError) -> Self {
        ItemError::new(ErrorKind::RecordWrite, err.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RecordReadError {
    #[error("DynamoDB error: {0}")]
    DynamoDb(String),
    #[error("Invalid data format: {0}")]
    InvalidData(String),
}

/// Records are written once and never updated or deleted.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Persists `record` under a freshly generated id and returns that id.
    async fn put(&self, record: &ClassificationRecord) -> Result<String, RecordWriteError>;

    /// Every stored record, fetched lazily.
    fn list_all(&self) -> BoxStream<'_, Result<StoredRecord, RecordReadError>>;
}

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use shared::{ClassificationRecord, StoredRecord};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{RecordReadError, RecordWriteError, ResultStore};

/// Process-local record store; records are kept in insertion order.
#[derive(Default)]
pub struct MemoryResultStore {
    records: RwLock<Vec<StoredRecord>>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: &str) -> Option<ClassificationRecord> {
        self.records
            .read()
            .await
            .iter()
            .find(|stored| stored.id == id)
            .map(|stored| stored.record.clone())
    }

    pub async fn record_count(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn put(&self, record: &ClassificationRecord) -> Result<String, RecordWriteError> {
        let id = Uuid::new_v4().to_string();
        self.records.write().await.push(StoredRecord {
            id: id.clone(),
            record: record.clone(),
        });
        Ok(id)
    }

    fn list_all(&self) -> BoxStream<'_, Result<StoredRecord, RecordReadError>> {
        stream::once(async move { self.records.read().await.clone() })
            .flat_map(|records| stream::iter(records.into_iter().map(Ok)))
            .boxed()
    }
}

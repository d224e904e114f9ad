use async_trait::async_trait;
use aws_sdk_dynamodb::Client;
use aws_sdk_dynamodb::types::AttributeValue;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use shared::{ClassificationRecord, Label, StoredRecord};
use std::collections::HashMap;
use uuid::Uuid;

use super::{RecordReadError, RecordWriteError, ResultStore};

type Item = HashMap<String, AttributeValue>;

#[derive(Clone)]
pub struct DynamoDbRepository {
    client: Client,
    results_table: String,
}

impl DynamoDbRepository {
    pub fn new(client: Client, results_table: String) -> Self {
        Self {
            client,
            results_table,
        }
    }

    /// Fetches one scan page starting after `start_key`, returning the page
    /// and the key to continue from (if any).
    async fn scan_page(
        &self,
        start_key: Option<Item>,
    ) -> Result<(Vec<Item>, Option<Item>), RecordReadError> {
        let output = self
            .client
            .scan()
            .table_name(&self.results_table)
            .set_exclusive_start_key(start_key)
            .send()
            .await
            .map_err(|e| {
                log::error!("DynamoDB scan of '{}' failed: {:?}", self.results_table, e);
                RecordReadError::DynamoDb(e.to_string())
            })?;

        let next = output.last_evaluated_key.filter(|key| !key.is_empty());
        Ok((output.items.unwrap_or_default(), next))
    }
}

#[async_trait]
impl ResultStore for DynamoDbRepository {
    async fn put(&self, record: &ClassificationRecord) -> Result<String, RecordWriteError> {
        let id = Uuid::new_v4().to_string();
        let item = record_to_item(&id, record);

        self.client
            .put_item()
            .table_name(&self.results_table)
            .set_item(Some(item))
            .condition_expression("attribute_not_exists(id)")
            .send()
            .await
            .map_err(|e| {
                log::error!(
                    "DynamoDB put_item failed for {} in '{}': {:?}",
                    record.filename,
                    self.results_table,
                    e
                );
                RecordWriteError::DynamoDb(e.to_string())
            })?;

        log::debug!("Stored classification record {} for {}", id, record.filename);
        Ok(id)
    }

    fn list_all(&self) -> BoxStream<'_, Result<StoredRecord, RecordReadError>> {
        // `None` once the last page has been read.
        let start: Option<Option<Item>> = Some(None);

        stream::try_unfold(start, move |cursor| async move {
            let Some(start_key) = cursor else {
                return Ok::<_, RecordReadError>(None);
            };
            let (page, next) = self.scan_page(start_key).await?;
            Ok(Some((page, next.map(Some))))
        })
        .map_ok(|page| stream::iter(page.into_iter().map(item_to_record)))
        .try_flatten()
        .boxed()
    }
}

fn record_to_item(id: &str, record: &ClassificationRecord) -> Item {
    let classifications = record
        .classifications
        .iter()
        .map(|label| {
            let mut entry = HashMap::new();
            entry.insert(
                "description".to_string(),
                AttributeValue::S(label.description.clone()),
            );
            entry.insert(
                "confidence".to_string(),
                AttributeValue::N(label.confidence.to_string()),
            );
            AttributeValue::M(entry)
        })
        .collect();

    let mut item = HashMap::new();
    item.insert("id".to_string(), AttributeValue::S(id.to_string()));
    item.insert(
        "filename".to_string(),
        AttributeValue::S(record.filename.clone()),
    );
    item.insert(
        "classifications".to_string(),
        AttributeValue::L(classifications),
    );
    item.insert(
        "created_at".to_string(),
        AttributeValue::S(record.created_at.clone()),
    );
    item
}

fn string_attr(item: &Item, name: &str) -> Result<String, RecordReadError> {
    item.get(name)
        .and_then(|av| av.as_s().ok())
        .map(|s| s.to_string())
        .ok_or_else(|| RecordReadError::InvalidData(format!("Missing {name} attribute")))
}

fn parse_label(value: &AttributeValue) -> Result<Label, RecordReadError> {
    let entry = value
        .as_m()
        .map_err(|_| RecordReadError::InvalidData("classification is not a map".to_string()))?;
    let description = string_attr(entry, "description")?;
    let confidence = entry
        .get("confidence")
        .and_then(|av| av.as_n().ok())
        .and_then(|n| n.parse::<f32>().ok())
        .ok_or_else(|| {
            RecordReadError::InvalidData(format!("Invalid confidence for label {description}"))
        })?;
    Ok(Label {
        description,
        confidence,
    })
}

fn item_to_record(item: Item) -> Result<StoredRecord, RecordReadError> {
    let id = string_attr(&item, "id")?;
    let filename = string_attr(&item, "filename")?;
    let classifications = match item.get("classifications") {
        Some(value) => value
            .as_l()
            .map_err(|_| RecordReadError::InvalidData("classifications is not a list".to_string()))?
            .iter()
            .map(parse_label)
            .collect::<Result<Vec<_>, _>>()?,
        None => Vec::new(),
    };
    // Older records may predate the timestamp.
    let created_at = string_attr(&item, "created_at").unwrap_or_default();

    Ok(StoredRecord {
        id,
        record: ClassificationRecord {
            filename,
            classifications,
            created_at,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cat_record() -> ClassificationRecord {
        ClassificationRecord {
            filename: "cat.jpg".to_string(),
            classifications: vec![Label::new("Cat", 0.9), Label::new("Whiskers", 0.625)],
            created_at: "2026-10-16T12:00:00+00:00".to_string(),
        }
    }

    #[test]
    fn item_layout_matches_table_schema() {
        let item = record_to_item("rec-1", &cat_record());

        assert_eq!(item["id"].as_s().unwrap(), "rec-1");
        assert_eq!(item["filename"].as_s().unwrap(), "cat.jpg");
        let labels = item["classifications"].as_l().unwrap();
        assert_eq!(labels.len(), 2);
        let first = labels[0].as_m().unwrap();
        assert_eq!(first["description"].as_s().unwrap(), "Cat");
        assert_eq!(first["confidence"].as_n().unwrap(), "0.9");
    }

    #[test]
    fn item_reads_back_as_the_written_record() {
        let stored = item_to_record(record_to_item("rec-1", &cat_record())).unwrap();
        assert_eq!(stored.id, "rec-1");
        assert_eq!(stored.record, cat_record());
    }

    #[test]
    fn missing_filename_is_invalid_data() {
        let mut item = record_to_item("rec-1", &cat_record());
        item.remove("filename");
        assert!(matches!(
            item_to_record(item),
            Err(RecordReadError::InvalidData(msg)) if msg.contains("filename")
        ));
    }

    #[test]
    fn record_without_timestamp_still_reads() {
        let mut item = record_to_item("rec-1", &cat_record());
        item.remove("created_at");
        let stored = item_to_record(item).unwrap();
        assert_eq!(stored.record.created_at, "");
    }
}

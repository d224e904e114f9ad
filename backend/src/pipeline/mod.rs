//! Batch ingestion: every submitted image is classified, stored and recorded.
//!
//! Each item runs Submitted -> Classified -> Stored -> Recorded. A failure at
//! any step ends that item with an outcome naming the step, and the rest of
//! the batch carries on. Nothing is rolled back: an image that was stored but
//! could not be recorded stays in the bucket.

use chrono::Utc;
use futures::channel::oneshot;
use futures::stream::{self, StreamExt};
use shared::{
    BatchResult, ClassificationOutcome, ClassificationRecord, DEFAULT_MIN_CONFIDENCE, ItemError,
    ItemOutcome, ItemResult, StoredImageRef,
};
use std::collections::HashMap;
use std::sync::Arc;

use crate::classifier::Classifier;
use crate::db::ResultStore;
use crate::storage::{ObjectStore, StorageWriteError};

pub mod cancel;

pub use cancel::{CancelOnDrop, CancelSignal, Cancelled};

#[derive(Debug, Clone)]
pub struct ImageSubmission {
    pub filename: String,
    pub mime_type: String,
    pub data: Vec<u8>,
    pub min_confidence: f32,
}

/// Orders the store step of items sharing an object name: an item uploads
/// only after the previous submission with its name has finished (or given
/// up on) its own upload, so the later submission is always the last writer.
struct StoreTurn {
    previous: Option<oneshot::Receiver<()>>,
    done: oneshot::Sender<()>,
}

impl StoreTurn {
    fn assign(batch: Vec<ImageSubmission>) -> Vec<(ImageSubmission, StoreTurn)> {
        let mut last_by_name: HashMap<String, oneshot::Receiver<()>> = HashMap::new();
        batch
            .into_iter()
            .map(|submission| {
                let (done, finished) = oneshot::channel();
                let previous = last_by_name.insert(submission.filename.clone(), finished);
                (submission, StoreTurn { previous, done })
            })
            .collect()
    }

    async fn wait(&mut self) {
        if let Some(previous) = self.previous.take() {
            // A dropped sender means that item stopped before storing.
            let _ = previous.await;
        }
    }

    fn finish(self) {
        let _ = self.done.send(());
    }
}

pub struct IngestionPipeline {
    object_store: Arc<dyn ObjectStore>,
    result_store: Arc<dyn ResultStore>,
    concurrency: usize,
}

/// A lone submission without a filename is how browsers send an empty file
/// picker.
fn is_empty_batch(batch: &[ImageSubmission]) -> bool {
    match batch {
        [] => true,
        [only] => only.filename.is_empty(),
        _ => false,
    }
}

impl IngestionPipeline {
    /// `concurrency` bounds how many items of one batch are in flight at once.
    pub fn new(
        object_store: Arc<dyn ObjectStore>,
        result_store: Arc<dyn ResultStore>,
        concurrency: usize,
    ) -> Self {
        Self {
            object_store,
            result_store,
            concurrency: concurrency.max(1),
        }
    }

    pub fn bucket_name(&self) -> &str {
        self.object_store.bucket_name()
    }

    pub fn result_store(&self) -> &Arc<dyn ResultStore> {
        &self.result_store
    }

    pub async fn ingest(
        &self,
        batch: Vec<ImageSubmission>,
        classifier: &dyn Classifier,
    ) -> BatchResult {
        let min_confidence = batch_threshold(&batch);
        // A signal nobody holds cannot be raised.
        self.ingest_cancellable(batch, classifier, &CancelSignal::new())
            .await
            .unwrap_or_else(|Cancelled| BatchResult::empty(self.bucket_name(), min_confidence))
    }

    /// Like [`ingest`](Self::ingest), but stops once `signal` is raised:
    /// items already past a step finish that step, items not yet started
    /// are skipped, and no partial result is returned.
    pub async fn ingest_cancellable(
        &self,
        batch: Vec<ImageSubmission>,
        classifier: &dyn Classifier,
        signal: &CancelSignal,
    ) -> Result<BatchResult, Cancelled> {
        let min_confidence = batch_threshold(&batch);
        let bucket_name = self.bucket_name().to_string();

        if is_empty_batch(&batch) {
            log::info!("image_classify: no files submitted");
            return Ok(BatchResult::empty(bucket_name, min_confidence));
        }

        let total = batch.len();
        log::info!(
            "image_classify: {} files, min_confidence={}, bucket={}",
            total,
            min_confidence,
            bucket_name
        );

        let results: Vec<Option<ItemResult>> = stream::iter(StoreTurn::assign(batch))
            .map(|(submission, turn)| self.process_item(submission, turn, classifier, signal))
            .buffered(self.concurrency)
            .collect()
            .await;

        if signal.is_cancelled() {
            log::warn!("image_classify: batch of {} cancelled, discarding results", total);
            return Err(Cancelled);
        }

        let results = results.into_iter().collect::<Option<Vec<_>>>().ok_or(Cancelled)?;
        let recorded = results.iter().filter(|r| r.outcome.is_success()).count();
        log::info!("image_classify: {}/{} files recorded", recorded, total);

        Ok(BatchResult {
            bucket_name,
            min_confidence,
            results,
        })
    }

    /// Returns `None` when the batch was cancelled before the item finished.
    async fn process_item(
        &self,
        submission: ImageSubmission,
        mut turn: StoreTurn,
        classifier: &dyn Classifier,
        signal: &CancelSignal,
    ) -> Option<ItemResult> {
        if signal.is_cancelled() {
            return None;
        }

        let ImageSubmission {
            filename,
            mime_type,
            data,
            min_confidence,
        } = submission;

        let classifications = match classifier.classify(&data, min_confidence).await {
            Ok(classifications) => classifications,
            Err(e) => {
                log::warn!("image_classify: filename={} classification failed: {}", filename, e);
                return Some(ItemResult {
                    filename,
                    outcome: ItemOutcome::ClassificationFailed { error: e.into() },
                });
            }
        };

        turn.wait().await;
        if signal.is_cancelled() {
            return None;
        }

        let stored = self.store_image(&filename, &data, &mime_type).await;
        turn.finish();
        let stored = match stored {
            Ok(stored) => stored,
            Err(e) => {
                log::error!("image_classify: filename={} upload failed: {}", filename, e);
                return Some(ItemResult {
                    filename,
                    outcome: ItemOutcome::StorageFailed {
                        classifications,
                        error: e.into(),
                    },
                });
            }
        };

        if signal.is_cancelled() {
            return None;
        }

        let outcome = self.record(&filename, classifications, stored).await;
        Some(ItemResult { filename, outcome })
    }

    async fn store_image(
        &self,
        filename: &str,
        data: &[u8],
        mime_type: &str,
    ) -> Result<StoredImageRef, StorageWriteError> {
        let stored = self.object_store.upload(filename, data, mime_type).await?;
        self.object_store.make_public(filename).await?;
        Ok(stored)
    }

    async fn record(
        &self,
        filename: &str,
        classifications: ClassificationOutcome,
        stored: StoredImageRef,
    ) -> ItemOutcome {
        let record = ClassificationRecord {
            filename: filename.to_string(),
            classifications,
            created_at: Utc::now().to_rfc3339(),
        };

        match self.result_store.put(&record).await {
            Ok(record_id) => {
                log::info!(
                    "image_classify: filename={} blob={} classifications={:?}",
                    filename,
                    stored.object_name,
                    record.classifications
                );
                ItemOutcome::Recorded {
                    record_id,
                    stored,
                    classifications: record.classifications,
                }
            }
            Err(e) => {
                log::error!(
                    "image_classify: filename={} stored at {} but not recorded: {}",
                    filename,
                    stored.public_url,
                    e
                );
                let error: ItemError = e.into();
                ItemOutcome::RecordFailed {
                    stored,
                    classifications: record.classifications,
                    error,
                }
            }
        }
    }
}

fn batch_threshold(batch: &[ImageSubmission]) -> f32 {
    batch
        .first()
        .map(|s| s.min_confidence)
        .unwrap_or(DEFAULT_MIN_CONFIDENCE)
}

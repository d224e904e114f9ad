use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Threshold applied when an upload does not carry its own `min_confidence`.
pub const DEFAULT_MIN_CONFIDENCE: f32 = 0.25;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Label {
    pub description: String,
    pub confidence: f32,
}

impl Label {
    pub fn new(description: impl Into<String>, confidence: f32) -> Self {
        Self {
            description: description.into(),
            confidence,
        }
    }
}

/// Labels admitted for one image, highest confidence first.
pub type ClassificationOutcome = Vec<Label>;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StoredImageRef {
    pub bucket: String,
    pub object_name: String,
    pub public_url: String,
}

/// Persisted document, one per classified-and-stored image.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ClassificationRecord {
    pub filename: String,
    pub classifications: ClassificationOutcome,
    pub created_at: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StoredRecord {
    pub id: String,
    #[serde(flatten)]
    pub record: ClassificationRecord,
}

/// Per-item lifecycle. Failures are tagged with the stage the item was entering.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Stage {
    Submitted,
    Classified,
    Stored,
    Recorded,
}

#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    UnsupportedMedia,
    BackendUnavailable,
    StorageWrite,
    RecordWrite,
}

impl ErrorKind {
    pub fn failed_stage(&self) -> Stage {
        match self {
            ErrorKind::UnsupportedMedia | ErrorKind::BackendUnavailable => Stage::Classified,
            ErrorKind::StorageWrite => Stage::Stored,
            ErrorKind::RecordWrite => Stage::Recorded,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ItemError {
    pub kind: ErrorKind,
    pub stage: Stage,
    pub message: String,
}

impl ItemError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            stage: kind.failed_stage(),
            message: message.into(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemOutcome {
    Recorded {
        record_id: String,
        stored: StoredImageRef,
        classifications: ClassificationOutcome,
    },
    ClassificationFailed {
        error: ItemError,
    },
    StorageFailed {
        classifications: ClassificationOutcome,
        error: ItemError,
    },
    RecordFailed {
        stored: StoredImageRef,
        classifications: ClassificationOutcome,
        error: ItemError,
    },
}

impl ItemOutcome {
    /// Last stage the item completed successfully.
    pub fn reached(&self) -> Stage {
        match self {
            ItemOutcome::Recorded { .. } => Stage::Recorded,
            ItemOutcome::ClassificationFailed { .. } => Stage::Submitted,
            ItemOutcome::StorageFailed { .. } => Stage::Classified,
            ItemOutcome::RecordFailed { .. } => Stage::Stored,
        }
    }

    pub fn error(&self) -> Option<&ItemError> {
        match self {
            ItemOutcome::Recorded { .. } => None,
            ItemOutcome::ClassificationFailed { error }
            | ItemOutcome::StorageFailed { error, .. }
            | ItemOutcome::RecordFailed { error, .. } => Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ItemOutcome::Recorded { .. })
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ItemResult {
    pub filename: String,
    #[serde(flatten)]
    pub outcome: ItemOutcome,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BatchResult {
    pub bucket_name: String,
    pub min_confidence: f32,
    pub results: Vec<ItemResult>,
}

impl BatchResult {
    pub fn empty(bucket_name: impl Into<String>, min_confidence: f32) -> Self {
        Self {
            bucket_name: bucket_name.into(),
            min_confidence,
            results: Vec::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ClassificationResults {
    pub bucket_name: String,
    pub records: Vec<StoredRecord>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct VocabularyResponse {
    pub classes: Vec<String>,
}

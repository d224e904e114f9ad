//! Image classifiers.
//!
//! Both backends implement [`Classifier`] and apply the confidence threshold
//! themselves, so every label a caller receives is admissible.

use async_trait::async_trait;
use image::ImageFormat;
use shared::{ClassificationOutcome, ErrorKind, ItemError, Label};

pub mod local;
pub mod remote;

pub use local::{LocalModel, ModelLoadError};
pub use remote::{RemoteVisionService, VisionSetupError};

#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("Unsupported media: {0}")]
    UnsupportedMedia(String),
    #[error("Classification backend unavailable: {0}")]
    BackendUnavailable(String),
}

impl ClassifyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClassifyError::UnsupportedMedia(_) => ErrorKind::UnsupportedMedia,
            ClassifyError::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
        }
    }
}

impl From<ClassifyError> for ItemError {
    fn from(err: ClassifyError) -> Self {
        ItemError::new(err.kind(), err.to_string())
    }
}

#[async_trait]
pub trait Classifier: Send + Sync {
    /// Labels for `image` whose confidence is at least `min_confidence`.
    async fn classify(
        &self,
        image: &[u8],
        min_confidence: f32,
    ) -> Result<ClassificationOutcome, ClassifyError>;
}

/// Keeps labels at or above the threshold, highest confidence first.
pub fn admit(labels: impl IntoIterator<Item = Label>, min_confidence: f32) -> ClassificationOutcome {
    let mut admitted: Vec<Label> = labels
        .into_iter()
        .filter(|label| label.confidence >= min_confidence)
        .collect();
    admitted.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    admitted
}

/// Identifies the image format from its leading bytes and checks it against
/// the formats a backend accepts. The declared MIME type is not trusted.
pub fn sniff_format(image: &[u8], accepted: &[ImageFormat]) -> Result<ImageFormat, ClassifyError> {
    let format = image::guess_format(image)
        .map_err(|_| ClassifyError::UnsupportedMedia("unrecognised image data".to_string()))?;
    if accepted.contains(&format) {
        Ok(format)
    } else {
        Err(ClassifyError::UnsupportedMedia(format!(
            "{:?} images are not accepted by this classifier",
            format
        )))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admit_filters_and_orders_by_confidence() {
        let labels = vec![
            Label::new("Dog", 0.3),
            Label::new("Cat", 0.9),
            Label::new("Pet", 0.5),
        ];
        let admitted = admit(labels, 0.5);
        assert_eq!(admitted, vec![Label::new("Cat", 0.9), Label::new("Pet", 0.5)]);
        assert!(admitted.iter().all(|l| l.confidence >= 0.5));
    }

    #[test]
    fn admit_drops_nan_scores() {
        let admitted = admit(vec![Label::new("Broken", f32::NAN)], 0.0);
        assert!(admitted.is_empty());
    }

    #[test]
    fn sniff_rejects_unknown_and_unaccepted_formats() {
        let err = sniff_format(b"definitely not an image", &[ImageFormat::Png]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedMedia);

        let png = test_images::solid(ImageFormat::Png, [0, 0, 0]);
        assert_eq!(
            sniff_format(&png, &[ImageFormat::Png]).unwrap(),
            ImageFormat::Png
        );
        assert!(matches!(
            sniff_format(&png, &[ImageFormat::Jpeg]),
            Err(ClassifyError::UnsupportedMedia(_))
        ));
    }

    #[test]
    fn classify_error_maps_to_item_error() {
        let item: ItemError = ClassifyError::BackendUnavailable("quota".into()).into();
        assert_eq!(item.kind, ErrorKind::BackendUnavailable);
        assert_eq!(item.stage, shared::Stage::Classified);
        assert!(item.message.contains("quota"));
    }
}

use std::sync::Arc;

use crate::classifier::Classifier;
use crate::pipeline::IngestionPipeline;

/// Everything built once at startup and shared by every request.
pub struct AppContext {
    pub pipeline: IngestionPipeline,
    pub local_classifier: Arc<dyn Classifier>,
    pub vision_classifier: Arc<dyn Classifier>,
    /// Local model vocabulary, sorted for display.
    pub classes: Vec<String>,
}

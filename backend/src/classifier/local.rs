use async_trait::async_trait;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use ndarray::{Array1, Array2};
use serde::Deserialize;
use shared::{ClassificationOutcome, Label};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{Classifier, ClassifyError, admit, sniff_format};

const ACCEPTED_FORMATS: &[ImageFormat] = &[
    ImageFormat::Jpeg,
    ImageFormat::Png,
    ImageFormat::Gif,
    ImageFormat::Bmp,
    ImageFormat::WebP,
    ImageFormat::Tiff,
];

#[derive(Debug, thiserror::Error)]
pub enum ModelLoadError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid model artifact: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Model shape mismatch: {0}")]
    Shape(String),
    #[error("Label vocabulary is empty")]
    EmptyVocabulary,
    #[error("Unsupported model artifact: {0}")]
    UnsupportedArtifact(String),
    #[cfg(feature = "torch")]
    #[error("TorchScript error: {0}")]
    Torch(#[from] tch::TchError),
}

#[derive(Debug, thiserror::Error)]
enum InferenceError {
    #[error("Preprocessing error: {0}")]
    Preprocessing(String),
    #[error("Model error: {0}")]
    Model(String),
}

/// On-disk classifier. The artifact and vocabulary are loaded once and only
/// read afterwards, so clones share them freely across requests.
#[derive(Clone)]
pub struct LocalModel {
    vocabulary: Arc<[String]>,
    engine: Arc<Engine>,
}

enum Engine {
    Linear(LinearArtifact),
    #[cfg(feature = "torch")]
    TorchScript(TorchScriptArtifact),
}

impl LocalModel {
    /// Loads the label vocabulary and the inference artifact. `.json`
    /// artifacts are linear heads over normalised pixels; `.pt`/`.ts`
    /// TorchScript modules need the `torch` feature.
    pub fn load(
        model_path: &Path,
        labels_path: &Path,
        torch_input_size: u32,
    ) -> Result<Self, ModelLoadError> {
        let vocabulary = load_vocabulary(labels_path)?;
        let extension = model_path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();

        let engine = match extension.as_str() {
            "json" => {
                let raw = read_file(model_path)?;
                let file: LinearArtifactFile = serde_json::from_slice(&raw)?;
                Engine::Linear(LinearArtifact::from_file(file, vocabulary.len())?)
            }
            #[cfg(feature = "torch")]
            "pt" | "ts" => Engine::TorchScript(TorchScriptArtifact::load(model_path, torch_input_size)?),
            _ => {
                #[cfg(not(feature = "torch"))]
                let _ = torch_input_size;
                return Err(ModelLoadError::UnsupportedArtifact(format!(
                    "{} (TorchScript artifacts need the `torch` feature)",
                    model_path.display()
                )));
            }
        };

        log::info!(
            "Loaded local model {} with {} labels",
            model_path.display(),
            vocabulary.len()
        );

        Ok(Self {
            vocabulary: vocabulary.into(),
            engine: Arc::new(engine),
        })
    }

    pub fn vocabulary(&self) -> &[String] {
        &self.vocabulary
    }

    pub fn sorted_vocabulary(&self) -> Vec<String> {
        let mut classes = self.vocabulary.to_vec();
        classes.sort();
        classes
    }

    fn infer(&self, image: &[u8], format: ImageFormat) -> Result<Vec<Label>, ClassifyError> {
        let decoded = image::load_from_memory_with_format(image, format)
            .map_err(|e| ClassifyError::UnsupportedMedia(format!("failed to decode image: {e}")))?;

        let scores = self.engine.scores(&decoded).map_err(|e| match e {
            InferenceError::Preprocessing(msg) => ClassifyError::UnsupportedMedia(msg),
            InferenceError::Model(msg) => ClassifyError::BackendUnavailable(msg),
        })?;

        if scores.len() != self.vocabulary.len() {
            return Err(ClassifyError::BackendUnavailable(format!(
                "model produced {} scores for {} labels",
                scores.len(),
                self.vocabulary.len()
            )));
        }

        Ok(self
            .vocabulary
            .iter()
            .zip(scores)
            .map(|(description, confidence)| Label::new(description.clone(), confidence))
            .collect())
    }
}

#[async_trait]
impl Classifier for LocalModel {
    async fn classify(
        &self,
        image: &[u8],
        min_confidence: f32,
    ) -> Result<ClassificationOutcome, ClassifyError> {
        let format = sniff_format(image, ACCEPTED_FORMATS)?;
        let model = self.clone();
        let image = image.to_vec();

        let labels = tokio::task::spawn_blocking(move || model.infer(&image, format))
            .await
            .map_err(|e| ClassifyError::BackendUnavailable(format!("inference task failed: {e}")))??;

        Ok(admit(labels, min_confidence))
    }
}

impl Engine {
    fn scores(&self, image: &DynamicImage) -> Result<Vec<f32>, InferenceError> {
        match self {
            Engine::Linear(artifact) => artifact.scores(image),
            #[cfg(feature = "torch")]
            Engine::TorchScript(artifact) => artifact.scores(image),
        }
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, ModelLoadError> {
    std::fs::read(path).map_err(|source| ModelLoadError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// One label per line; blank lines are skipped.
fn load_vocabulary(path: &Path) -> Result<Vec<String>, ModelLoadError> {
    let raw = read_file(path)?;
    let vocabulary: Vec<String> = String::from_utf8_lossy(&raw)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();
    if vocabulary.is_empty() {
        return Err(ModelLoadError::EmptyVocabulary);
    }
    Ok(vocabulary)
}

fn default_mean() -> [f32; 3] {
    [0.0; 3]
}

fn default_std() -> [f32; 3] {
    [1.0; 3]
}

#[derive(Debug, Deserialize)]
struct LinearArtifactFile {
    input_size: [u32; 2],
    #[serde(default = "default_mean")]
    mean: [f32; 3],
    #[serde(default = "default_std")]
    std: [f32; 3],
    weights: Vec<Vec<f32>>,
    bias: Vec<f32>,
}

struct LinearArtifact {
    width: u32,
    height: u32,
    mean: [f32; 3],
    std: [f32; 3],
    weights: Array2<f32>,
    bias: Array1<f32>,
}

impl LinearArtifact {
    fn from_file(file: LinearArtifactFile, labels: usize) -> Result<Self, ModelLoadError> {
        let [width, height] = file.input_size;
        if width == 0 || height == 0 {
            return Err(ModelLoadError::Shape("input_size must be non-zero".to_string()));
        }
        if file.std.iter().any(|s| *s == 0.0) {
            return Err(ModelLoadError::Shape("std must be non-zero".to_string()));
        }

        let features = 3 * width as usize * height as usize;
        let rows = file.weights.len();
        if rows != labels {
            return Err(ModelLoadError::Shape(format!(
                "{rows} weight rows for {labels} labels"
            )));
        }
        if file.bias.len() != rows {
            return Err(ModelLoadError::Shape(format!(
                "{} bias terms for {rows} weight rows",
                file.bias.len()
            )));
        }
        if let Some(row) = file.weights.iter().find(|row| row.len() != features) {
            return Err(ModelLoadError::Shape(format!(
                "weight row has {} columns, expected {features}",
                row.len()
            )));
        }

        let flat: Vec<f32> = file.weights.into_iter().flatten().collect();
        let weights = Array2::from_shape_vec((rows, features), flat)
            .map_err(|e| ModelLoadError::Shape(e.to_string()))?;

        Ok(Self {
            width,
            height,
            mean: file.mean,
            std: file.std,
            weights,
            bias: Array1::from_vec(file.bias),
        })
    }

    fn scores(&self, image: &DynamicImage) -> Result<Vec<f32>, InferenceError> {
        let features = pixel_features(image, self.width, self.height, self.mean, self.std);
        let input = Array1::from_vec(features);
        if input.len() != self.weights.ncols() {
            return Err(InferenceError::Preprocessing(format!(
                "expected {} features, got {}",
                self.weights.ncols(),
                input.len()
            )));
        }
        let logits = self.weights.dot(&input) + &self.bias;
        let scores = softmax(logits.as_slice().unwrap_or_default());
        if scores.iter().any(|s| !s.is_finite()) {
            return Err(InferenceError::Model("model produced non-finite scores".to_string()));
        }
        Ok(scores)
    }
}

/// Resized RGB pixels in channel-major order, scaled to [0, 1] then
/// normalised per channel.
fn pixel_features(
    image: &DynamicImage,
    width: u32,
    height: u32,
    mean: [f32; 3],
    std: [f32; 3],
) -> Vec<f32> {
    let rgb = image.resize_exact(width, height, FilterType::Triangle).to_rgb8();
    let plane = (width * height) as usize;
    let mut features = vec![0.0f32; 3 * plane];
    for (index, pixel) in rgb.pixels().enumerate() {
        for channel in 0..3 {
            let value = pixel[channel] as f32 / 255.0;
            features[channel * plane + index] = (value - mean[channel]) / std[channel];
        }
    }
    features
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

#[cfg(feature = "torch")]
struct TorchScriptArtifact {
    module: std::sync::Mutex<tch::CModule>,
    input_size: u32,
}

#[cfg(feature = "torch")]
impl TorchScriptArtifact {
    fn load(path: &Path, input_size: u32) -> Result<Self, ModelLoadError> {
        let device = tch::Device::cuda_if_available();
        let module = tch::CModule::load_on_device(path, device)?;
        Ok(Self {
            module: std::sync::Mutex::new(module),
            input_size,
        })
    }

    fn scores(&self, image: &DynamicImage) -> Result<Vec<f32>, InferenceError> {
        let size = self.input_size;
        let features = pixel_features(
            image,
            size,
            size,
            [0.485, 0.456, 0.406],
            [0.229, 0.224, 0.225],
        );
        let model_error = |e: tch::TchError| InferenceError::Model(e.to_string());
        let tensor = tch::Tensor::from_slice(&features)
            .f_view([1, 3, size as i64, size as i64])
            .map_err(model_error)?;
        // Errors come back as values so a bad input never poisons the lock.
        let output = self
            .module
            .lock()
            .map_err(|_| InferenceError::Model("model lock poisoned".to_string()))?
            .forward_ts(&[tensor])
            .map_err(model_error)?;
        let output = output
            .f_softmax(-1, tch::Kind::Float)
            .and_then(|scores| scores.f_view([-1]))
            .map_err(model_error)?;
        Vec::<f32>::try_from(&output).map_err(model_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::test_images::solid;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    /// 2x2 linear head: "Cat" fires on the red channel, "Dog" is flat.
    fn write_model(dir: &TempDir, labels: &str) -> (PathBuf, PathBuf) {
        let mut cat = vec![0.0f32; 12];
        cat[..4].fill(1.0);
        let artifact = json!({
            "input_size": [2, 2],
            "weights": [cat, vec![0.0f32; 12]],
            "bias": [0.0, 0.0],
        });
        let model_path = dir.path().join("model.json");
        let labels_path = dir.path().join("dict.txt");
        fs::write(&model_path, artifact.to_string()).unwrap();
        fs::write(&labels_path, labels).unwrap();
        (model_path, labels_path)
    }

    fn load(labels: &str) -> (TempDir, LocalModel) {
        let dir = TempDir::new().unwrap();
        let (model_path, labels_path) = write_model(&dir, labels);
        let model = LocalModel::load(&model_path, &labels_path, 224).unwrap();
        (dir, model)
    }

    #[actix_web::test]
    async fn red_image_is_a_cat_above_threshold() {
        let (_dir, model) = load("Cat\nDog\n");
        let image = solid(ImageFormat::Png, [255, 0, 0]);

        let outcome = model.classify(&image, 0.5).await.unwrap();

        assert_eq!(outcome.len(), 1);
        assert_eq!(outcome[0].description, "Cat");
        assert!(outcome[0].confidence > 0.95);
    }

    #[actix_web::test]
    async fn zero_threshold_returns_every_label_highest_first() {
        let (_dir, model) = load("Cat\nDog\n");
        let image = solid(ImageFormat::Png, [255, 0, 0]);

        let outcome = model.classify(&image, 0.0).await.unwrap();

        let names: Vec<_> = outcome.iter().map(|l| l.description.as_str()).collect();
        assert_eq!(names, ["Cat", "Dog"]);
        let total: f32 = outcome.iter().map(|l| l.confidence).sum();
        assert!((total - 1.0).abs() < 1e-5);
    }

    #[actix_web::test]
    async fn non_image_bytes_are_unsupported_media() {
        let (_dir, model) = load("Cat\nDog\n");
        let err = model.classify(b"%PDF-1.7 not an image", 0.25).await.unwrap_err();
        assert!(matches!(err, ClassifyError::UnsupportedMedia(_)));
    }

    #[actix_web::test]
    async fn concurrent_callers_see_identical_results() {
        let (_dir, model) = load("Cat\nDog\n");
        let image = solid(ImageFormat::Jpeg, [250, 10, 10]);

        let calls = (0..8).map(|_| model.classify(&image, 0.0));
        let outcomes = futures::future::join_all(calls).await;

        let first = outcomes[0].as_ref().unwrap();
        for outcome in &outcomes {
            assert_eq!(outcome.as_ref().unwrap(), first);
        }
    }

    #[test]
    fn vocabulary_skips_blank_lines_and_sorts_on_request() {
        let (_dir, model) = load("Dog\n\n  Cat  \n");
        assert_eq!(model.vocabulary(), ["Dog", "Cat"]);
        assert_eq!(model.sorted_vocabulary(), ["Cat", "Dog"]);
    }

    #[test]
    fn label_count_must_match_weight_rows() {
        let dir = TempDir::new().unwrap();
        let (model_path, labels_path) = write_model(&dir, "Cat\nDog\nBird\n");
        let err = LocalModel::load(&model_path, &labels_path, 224).err().unwrap();
        assert!(matches!(err, ModelLoadError::Shape(_)));
    }

    #[test]
    fn empty_vocabulary_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (model_path, labels_path) = write_model(&dir, "\n\n");
        let err = LocalModel::load(&model_path, &labels_path, 224).err().unwrap();
        assert!(matches!(err, ModelLoadError::EmptyVocabulary));
    }

    #[cfg(not(feature = "torch"))]
    #[test]
    fn torchscript_needs_feature() {
        let dir = TempDir::new().unwrap();
        let (_, labels_path) = write_model(&dir, "Cat\nDog\n");
        let err = LocalModel::load(&dir.path().join("model.pt"), &labels_path, 224)
            .err()
            .unwrap();
        assert!(matches!(err, ModelLoadError::UnsupportedArtifact(_)));
    }

    #[test]
    fn softmax_is_a_distribution() {
        let scores = softmax(&[4.0, 0.0]);
        assert!((scores.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!(scores[0] > 0.98);
    }
}

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid config file: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Aws,
    Memory,
}

impl FromStr for StorageBackend {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aws" => Ok(StorageBackend::Aws),
            "memory" => Ok(StorageBackend::Memory),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct VisionConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub max_results: u32,
    pub timeout_secs: u64,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://vision.googleapis.com".to_string(),
            api_key: None,
            max_results: 10,
            timeout_secs: 30,
        }
    }
}

/// Process-wide settings, read once at startup. Values come from the YAML
/// file named by `APP_CONFIG` (if any) and are then overridden by
/// environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub project_id: String,
    pub bucket_name: Option<String>,
    pub public_base_url: Option<String>,
    pub results_table: String,
    pub storage_backend: StorageBackend,
    pub model_path: PathBuf,
    pub labels_path: PathBuf,
    pub torch_input_size: u32,
    pub vision: VisionConfig,
    pub ingest_concurrency: usize,
    pub host: String,
    pub port: u16,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            project_id: "image-classify-dev".to_string(),
            bucket_name: None,
            public_base_url: None,
            results_table: "image_classify_results".to_string(),
            storage_backend: StorageBackend::Aws,
            model_path: PathBuf::from("static/model/model.json"),
            labels_path: PathBuf::from("static/model/dict.txt"),
            torch_input_size: 224,
            vision: VisionConfig::default(),
            ingest_concurrency: 4,
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

fn parse<T: FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue { key, value })
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("APP_CONFIG") {
            Ok(path) => Self::from_yaml_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(v) = lookup("PROJECT_ID") {
            self.project_id = v;
        }
        if let Some(v) = lookup("S3_BUCKET_NAME") {
            self.bucket_name = Some(v);
        }
        if let Some(v) = lookup("PUBLIC_BASE_URL") {
            self.public_base_url = Some(v);
        }
        if let Some(v) = lookup("DYNAMODB_RESULTS_TABLE") {
            self.results_table = v;
        }
        if let Some(v) = lookup("STORAGE_BACKEND") {
            self.storage_backend = parse("STORAGE_BACKEND", v)?;
        }
        if let Some(v) = lookup("MODEL_PATH") {
            self.model_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("LABELS_PATH") {
            self.labels_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("TORCH_INPUT_SIZE") {
            self.torch_input_size = parse("TORCH_INPUT_SIZE", v)?;
        }
        if let Some(v) = lookup("VISION_API_ENDPOINT") {
            self.vision.endpoint = v;
        }
        if let Some(v) = lookup("VISION_API_KEY") {
            self.vision.api_key = Some(v).filter(|key| !key.is_empty());
        }
        if let Some(v) = lookup("VISION_MAX_RESULTS") {
            self.vision.max_results = parse("VISION_MAX_RESULTS", v)?;
        }
        if let Some(v) = lookup("VISION_TIMEOUT_SECS") {
            self.vision.timeout_secs = parse("VISION_TIMEOUT_SECS", v)?;
        }
        if let Some(v) = lookup("INGEST_CONCURRENCY") {
            self.ingest_concurrency = parse("INGEST_CONCURRENCY", v)?;
        }
        if let Some(v) = lookup("APP_HOST") {
            self.host = v;
        }
        if let Some(v) = lookup("PORT") {
            self.port = parse("PORT", v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.project_id.trim().is_empty() {
            return Err(ConfigError::Invalid("project_id must not be empty".to_string()));
        }
        if self.ingest_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "ingest_concurrency must be at least 1".to_string(),
            ));
        }
        if self.torch_input_size == 0 {
            return Err(ConfigError::Invalid(
                "torch_input_size must be at least 1".to_string(),
            ));
        }
        if self.vision.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "vision.timeout_secs must be at least 1".to_string(),
            ));
        }
        Url::parse(&self.vision.endpoint).map_err(|_| ConfigError::InvalidValue {
            key: "VISION_API_ENDPOINT",
            value: self.vision.endpoint.clone(),
        })?;
        Url::parse(&self.public_base_url()).map_err(|_| ConfigError::InvalidValue {
            key: "PUBLIC_BASE_URL",
            value: self.public_base_url(),
        })?;
        Ok(())
    }

    /// Bucket for uploaded images, derived from the project unless set.
    pub fn bucket_name(&self) -> String {
        self.bucket_name
            .clone()
            .unwrap_or_else(|| format!("{}-uploads", self.project_id))
    }

    pub fn public_base_url(&self) -> String {
        self.public_base_url
            .clone()
            .unwrap_or_else(|| format!("https://{}.s3.amazonaws.com", self.bucket_name()))
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn bucket_is_derived_from_project() {
        let config = AppConfig {
            project_id: "acme".to_string(),
            ..AppConfig::default()
        };
        assert_eq!(config.bucket_name(), "acme-uploads");
        assert_eq!(config.public_base_url(), "https://acme-uploads.s3.amazonaws.com");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn yaml_fills_only_given_fields() {
        let config = AppConfig::from_yaml_str(
            "project_id: acme\nstorage_backend: memory\nvision:\n  max_results: 25\n",
        )
        .unwrap();
        assert_eq!(config.project_id, "acme");
        assert_eq!(config.storage_backend, StorageBackend::Memory);
        assert_eq!(config.vision.max_results, 25);
        assert_eq!(config.vision.endpoint, VisionConfig::default().endpoint);
        assert_eq!(config.ingest_concurrency, 4);
    }

    #[test]
    fn environment_overrides_file_values() {
        let mut config = AppConfig::from_yaml_str("project_id: acme\nport: 9000\n").unwrap();
        config
            .apply_overrides(lookup(&[
                ("PORT", "8081"),
                ("S3_BUCKET_NAME", "images.example"),
                ("STORAGE_BACKEND", "Memory"),
                ("VISION_API_KEY", ""),
                ("INGEST_CONCURRENCY", "2"),
            ]))
            .unwrap();
        assert_eq!(config.port, 8081);
        assert_eq!(config.bucket_name(), "images.example");
        assert_eq!(config.storage_backend, StorageBackend::Memory);
        assert_eq!(config.vision.api_key, None);
        assert_eq!(config.ingest_concurrency, 2);
        assert_eq!(config.bind_address(), "127.0.0.1:8081");
    }

    #[test]
    fn malformed_numbers_are_reported_by_key() {
        let mut config = AppConfig::default();
        let err = config
            .apply_overrides(lookup(&[("PORT", "eighty")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "PORT", .. }));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let config = AppConfig {
            ingest_concurrency: 0,
            ..AppConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn zero_torch_input_size_is_rejected() {
        let mut config = AppConfig::default();
        config
            .apply_overrides(lookup(&[("TORCH_INPUT_SIZE", "0")]))
            .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid(msg)) if msg.contains("torch_input_size")
        ));
    }

    #[test]
    fn unparsable_public_base_url_is_rejected() {
        let config = AppConfig {
            public_base_url: Some("not a url".to_string()),
            ..AppConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { key: "PUBLIC_BASE_URL", .. })
        ));
    }
}

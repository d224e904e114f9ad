use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use image::ImageFormat;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use shared::{ClassificationOutcome, Label};
use std::time::Duration;
use url::Url;

use super::{Classifier, ClassifyError, admit, sniff_format};
use crate::config::VisionConfig;

const ACCEPTED_FORMATS: &[ImageFormat] = &[
    ImageFormat::Jpeg,
    ImageFormat::Png,
    ImageFormat::Gif,
    ImageFormat::Bmp,
    ImageFormat::WebP,
    ImageFormat::Tiff,
    ImageFormat::Ico,
];

/// google.rpc.Code INVALID_ARGUMENT, reported per image for undecodable input.
const INVALID_ARGUMENT: i32 = 3;

/// Kept out of the URL so transport errors never echo the key.
const API_KEY_HEADER: &str = "x-goog-api-key";

#[derive(Debug, thiserror::Error)]
pub enum VisionSetupError {
    #[error("Invalid Vision API endpoint: {0}")]
    Endpoint(#[from] url::ParseError),
    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),
}

/// Label detection through a Vision `images:annotate` endpoint. The service
/// knows nothing of the caller's threshold, so labels are filtered here once
/// the response arrives.
#[derive(Clone)]
pub struct RemoteVisionService {
    client: reqwest::Client,
    annotate_url: Url,
    api_key: Option<String>,
    max_results: u32,
}

#[derive(Serialize)]
struct AnnotateRequest {
    requests: Vec<AnnotateImageRequest>,
}

#[derive(Serialize)]
struct AnnotateImageRequest {
    image: ImageContent,
    features: Vec<Feature>,
}

#[derive(Serialize)]
struct ImageContent {
    content: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Feature {
    #[serde(rename = "type")]
    kind: &'static str,
    max_results: u32,
}

#[derive(Deserialize)]
struct AnnotateResponse {
    #[serde(default)]
    responses: Vec<AnnotateImageResponse>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateImageResponse {
    #[serde(default)]
    label_annotations: Vec<EntityAnnotation>,
    error: Option<RpcStatus>,
}

#[derive(Deserialize)]
struct EntityAnnotation {
    description: String,
    #[serde(default)]
    score: f32,
}

#[derive(Deserialize)]
struct RpcStatus {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: String,
}

impl RemoteVisionService {
    pub fn new(config: &VisionConfig) -> Result<Self, VisionSetupError> {
        let mut base = config.endpoint.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let annotate_url = Url::parse(&base)?.join("v1/images:annotate")?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        log::info!("Vision API endpoint is {}", annotate_url);

        Ok(Self {
            client,
            annotate_url,
            api_key: config.api_key.clone(),
            max_results: config.max_results,
        })
    }

    async fn annotate(&self, image: &[u8]) -> Result<Vec<Label>, ClassifyError> {
        let body = AnnotateRequest {
            requests: vec![AnnotateImageRequest {
                image: ImageContent {
                    content: STANDARD.encode(image),
                },
                features: vec![Feature {
                    kind: "LABEL_DETECTION",
                    max_results: self.max_results,
                }],
            }],
        };

        let mut request = self.client.post(self.annotate_url.clone()).json(&body);
        if let Some(key) = &self.api_key {
            request = request.header(API_KEY_HEADER, key);
        }

        let response = request.send().await.map_err(|e| {
            let e = e.without_url();
            log::error!("Vision API request failed: {}", e);
            ClassifyError::BackendUnavailable(e.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            let detail = if status == StatusCode::TOO_MANY_REQUESTS {
                "quota exceeded".to_string()
            } else {
                format!("Vision API returned {status}")
            };
            log::error!("Vision API rejected request: {}", status);
            return Err(ClassifyError::BackendUnavailable(detail));
        }

        let parsed: AnnotateResponse = response
            .json()
            .await
            .map_err(|e| {
                let e = e.without_url();
                ClassifyError::BackendUnavailable(format!("malformed response: {e}"))
            })?;

        let annotated = parsed.responses.into_iter().next().ok_or_else(|| {
            ClassifyError::BackendUnavailable("Vision API returned no responses".to_string())
        })?;

        if let Some(error) = annotated.error {
            return Err(if error.code == INVALID_ARGUMENT {
                ClassifyError::UnsupportedMedia(error.message)
            } else {
                ClassifyError::BackendUnavailable(format!(
                    "Vision API error {}: {}",
                    error.code, error.message
                ))
            });
        }

        Ok(annotated
            .label_annotations
            .into_iter()
            .map(|annotation| Label::new(annotation.description, annotation.score))
            .collect())
    }
}

#[async_trait]
impl Classifier for RemoteVisionService {
    async fn classify(
        &self,
        image: &[u8],
        min_confidence: f32,
    ) -> Result<ClassificationOutcome, ClassifyError> {
        sniff_format(image, ACCEPTED_FORMATS)?;
        let labels = self.annotate(image).await?;
        Ok(admit(labels, min_confidence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::test_images::solid;
    use actix_web::{App, HttpRequest, HttpResponse, HttpServer, web};
    use serde_json::{Value, json};

    /// Serves a canned annotate response; requests without image content or
    /// a LABEL_DETECTION feature get a 400, and a missing key header a 403.
    async fn fake_vision(status: u16, reply: Value) -> String {
        let server = HttpServer::new(move || {
            let reply = reply.clone();
            App::new().route(
                "/v1/images:annotate",
                web::post().to(move |req: HttpRequest, body: web::Json<Value>| {
                    let reply = reply.clone();
                    async move {
                        let keyed = req
                            .headers()
                            .get(API_KEY_HEADER)
                            .is_some_and(|key| key == "test-key");
                        if !keyed || req.query_string().contains("key") {
                            return HttpResponse::Forbidden().finish();
                        }
                        let request = &body["requests"][0];
                        let well_formed = request["features"][0]["type"] == "LABEL_DETECTION"
                            && request["image"]["content"]
                                .as_str()
                                .is_some_and(|c| !c.is_empty());
                        if !well_formed {
                            return HttpResponse::BadRequest().finish();
                        }
                        HttpResponse::build(
                            actix_web::http::StatusCode::from_u16(status).unwrap(),
                        )
                        .json(reply)
                    }
                }),
            )
        })
        .workers(1)
        .disable_signals()
        .bind(("127.0.0.1", 0))
        .unwrap();
        let addr = server.addrs()[0];
        actix_web::rt::spawn(server.run());
        format!("http://{addr}")
    }

    fn service(endpoint: String) -> RemoteVisionService {
        keyed_service(endpoint, "test-key")
    }

    fn keyed_service(endpoint: String, api_key: &str) -> RemoteVisionService {
        RemoteVisionService::new(&VisionConfig {
            endpoint,
            api_key: Some(api_key.to_string()),
            max_results: 10,
            timeout_secs: 5,
        })
        .unwrap()
    }

    #[actix_web::test]
    async fn labels_are_filtered_after_the_response() {
        let endpoint = fake_vision(
            200,
            json!({"responses": [{"labelAnnotations": [
                {"description": "Dog", "score": 0.3},
                {"description": "Cat", "score": 0.9}
            ]}]}),
        )
        .await;

        let outcome = service(endpoint)
            .classify(&solid(ImageFormat::Png, [1, 2, 3]), 0.5)
            .await
            .unwrap();

        assert_eq!(outcome, vec![Label::new("Cat", 0.9)]);
    }

    #[actix_web::test]
    async fn invalid_argument_is_unsupported_media() {
        let endpoint = fake_vision(
            200,
            json!({"responses": [{"error": {"code": 3, "message": "Bad image data."}}]}),
        )
        .await;

        let err = service(endpoint)
            .classify(&solid(ImageFormat::Png, [1, 2, 3]), 0.25)
            .await
            .unwrap_err();

        assert!(matches!(err, ClassifyError::UnsupportedMedia(msg) if msg == "Bad image data."));
    }

    #[actix_web::test]
    async fn quota_exhaustion_is_backend_unavailable() {
        let endpoint = fake_vision(429, json!({"error": {"code": 8}})).await;

        let err = service(endpoint)
            .classify(&solid(ImageFormat::Png, [1, 2, 3]), 0.25)
            .await
            .unwrap_err();

        assert!(matches!(err, ClassifyError::BackendUnavailable(_)));
    }

    #[actix_web::test]
    async fn unreachable_endpoint_is_backend_unavailable() {
        let err = service("http://127.0.0.1:9".to_string())
            .classify(&solid(ImageFormat::Png, [1, 2, 3]), 0.25)
            .await
            .unwrap_err();

        assert!(matches!(err, ClassifyError::BackendUnavailable(_)));
    }

    #[actix_web::test]
    async fn api_key_never_appears_in_transport_errors() {
        let err = keyed_service("http://127.0.0.1:9".to_string(), "SECRET-KEY-123")
            .classify(&solid(ImageFormat::Png, [1, 2, 3]), 0.25)
            .await
            .unwrap_err();

        let ClassifyError::BackendUnavailable(message) = &err else {
            panic!("expected backend unavailable, got {err:?}");
        };
        assert!(!message.contains("SECRET-KEY-123"), "{message}");
        assert!(!err.to_string().contains("SECRET-KEY-123"));
    }

    #[actix_web::test]
    async fn unsupported_bytes_never_reach_the_service() {
        let err = service("http://127.0.0.1:9".to_string())
            .classify(b"plain text", 0.25)
            .await
            .unwrap_err();

        assert!(matches!(err, ClassifyError::UnsupportedMedia(_)));
    }

    #[test]
    fn endpoint_path_is_appended_to_base() {
        let svc = service("https://vision.example.com/proxy".to_string());
        assert_eq!(
            svc.annotate_url.as_str(),
            "https://vision.example.com/proxy/v1/images:annotate"
        );
    }
}

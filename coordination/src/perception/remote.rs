//! HTTP inference backend.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::detection::{DetectError, DetectResult, Detection, Detector};

#[derive(Debug, Deserialize)]
struct DetectResponse {
    #[serde(default)]
    detections: Vec<Detection>,
}

/// Posts each encoded frame to an inference service.
///
/// The service answers with
/// `{"detections":[{"bbox":[x1,y1,x2,y2],"class_label":"cup","confidence":0.9}]}`.
pub struct HttpDetector {
    endpoint: String,
    http: reqwest::Client,
}

impl HttpDetector {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> DetectResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DetectError::Unavailable(e.to_string()))?;
        Ok(Self {
            endpoint: endpoint.into(),
            http,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Detector for HttpDetector {
    fn name(&self) -> &str {
        "http"
    }

    async fn detect(&self, frame: &[u8]) -> DetectResult<Vec<Detection>> {
        let response = self
            .http
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .body(frame.to_vec())
            .send()
            .await
            .map_err(|e| DetectError::Unavailable(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| DetectError::Inference(e.to_string()))?;

        if status == reqwest::StatusCode::UNPROCESSABLE_ENTITY
            || status == reqwest::StatusCode::UNSUPPORTED_MEDIA_TYPE
        {
            return Err(DetectError::Decode(format!("{status}: {body}")));
        }
        if !status.is_success() {
            return Err(DetectError::Inference(format!("{status}: {body}")));
        }

        let detections = parse_response(&body)?;
        debug!(endpoint = %self.endpoint, count = detections.len(), "inference complete");
        Ok(detections)
    }
}

/// Parse an inference service response body.
pub fn parse_response(body: &str) -> DetectResult<Vec<Detection>> {
    serde_json::from_str::<DetectResponse>(body)
        .map(|r| r.detections)
        .map_err(|e| DetectError::Inference(format!("malformed response: {e}")))
}

//! Detection value objects and the detector boundary.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Axis-aligned pixel box, `(x1, y1)` top-left and `(x2, y2)` bottom-right.
///
/// Serialized as `[x1, y1, x2, y2]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "[i32; 4]", into = "[i32; 4]")]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BoundingBox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Width in pixels; inverted boxes have zero width.
    pub fn width(&self) -> i64 {
        (i64::from(self.x2) - i64::from(self.x1)).max(0)
    }

    pub fn height(&self) -> i64 {
        (i64::from(self.y2) - i64::from(self.y1)).max(0)
    }

    pub fn area(&self) -> i64 {
        self.width() * self.height()
    }

    pub fn center_x(&self) -> f32 {
        (self.x1 as f32 + self.x2 as f32) / 2.0
    }
}

impl From<[i32; 4]> for BoundingBox {
    fn from([x1, y1, x2, y2]: [i32; 4]) -> Self {
        Self { x1, y1, x2, y2 }
    }
}

impl From<BoundingBox> for [i32; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

/// One labeled box from one inference pass. No identity across frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub class_label: String,
    /// Score in `[0, 1]`.
    pub confidence: f32,
}

impl Detection {
    pub fn new(bbox: BoundingBox, class_label: impl Into<String>, confidence: f32) -> Self {
        Self {
            bbox,
            class_label: class_label.into(),
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

/// Why a detector produced no result for a frame.
#[derive(Debug, thiserror::Error)]
pub enum DetectError {
    /// No backend configured, or the backend is unreachable.
    #[error("Detector unavailable: {0}")]
    Unavailable(String),

    /// The frame could not be decoded.
    #[error("Failed to decode frame: {0}")]
    Decode(String),

    /// The backend ran but failed or returned garbage.
    #[error("Inference failed: {0}")]
    Inference(String),
}

/// Result type for detector operations
pub type DetectResult<T> = Result<T, DetectError>;

/// Object detector collaborator.
///
/// Implementations doing CPU-heavy work should move it onto
/// `tokio::task::spawn_blocking`; the detection stage already runs
/// detectors off the bus dispatch task.
#[async_trait]
pub trait Detector: Send + Sync {
    fn name(&self) -> &str;

    async fn detect(&self, frame: &[u8]) -> DetectResult<Vec<Detection>>;
}

/// Placeholder used when no backend is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDetector;

#[async_trait]
impl Detector for NullDetector {
    fn name(&self) -> &str {
        "null"
    }

    async fn detect(&self, _frame: &[u8]) -> DetectResult<Vec<Detection>> {
        Err(DetectError::Unavailable("no detector configured".to_string()))
    }
}

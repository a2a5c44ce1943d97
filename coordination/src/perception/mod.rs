//! Perception: detection values, the detector boundary and the stage that
//! turns frames into `detections_found` events.

pub mod detection;
pub mod remote;
pub mod stage;

pub use detection::{BoundingBox, DetectError, DetectResult, Detection, Detector, NullDetector};
pub use remote::{parse_response, HttpDetector};
pub use stage::{DetectionStage, DetectorConfig};

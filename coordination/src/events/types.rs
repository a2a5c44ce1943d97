//! Event types carried by the bus.
//!
//! Every event has a hierarchical string key (its *topic*) used for
//! exact-match routing. The well-known topics of the control loop are typed
//! variants; anything else travels as [`Event::Custom`] with a JSON payload.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::motion::VelocityCommand;
use crate::perception::Detection;

/// Well-known topic keys.
pub mod topics {
    /// One encoded frame read from the ingress transport.
    pub const IMAGE_RECEIVED: &str = "image_received";
    /// Detector output for the most recent frame (possibly empty).
    pub const DETECTIONS_FOUND: &str = "detections_found";
    /// Latch the safety stop.
    pub const SAFETY_STOP: &str = "safety/stop";
    /// Release the safety stop.
    pub const SAFETY_CLEAR: &str = "safety/clear";
    /// Resolved drive command, once per arbitration tick.
    pub const DRIVE_SET_VELOCITY: &str = "drive/set_velocity";
    /// Ask the process to wind down.
    pub const SYSTEM_SHUTDOWN: &str = "system/shutdown";
}

/// An immutable message distributed via the [`EventBus`](super::EventBus).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Raw encoded image bytes plus the peer that sent them.
    ImageReceived { bytes: Vec<u8>, from: String },

    /// Ordered detector results for one frame.
    DetectionsFound { detections: Vec<Detection> },

    /// A hazard was observed or an operator requested a stop.
    SafetyStop { reason: String },

    /// Affirmative release of the safety latch.
    SafetyClear { reason: String },

    /// Command for the actuator.
    SetVelocity(VelocityCommand),

    /// Explicit stop condition for the lifecycle body.
    Shutdown { reason: String },

    /// Any other topic with a free-form mapping payload.
    Custom {
        topic: String,
        payload: Map<String, Value>,
    },
}

impl Event {
    /// Routing key for this event.
    pub fn event_type(&self) -> &str {
        match self {
            Self::ImageReceived { .. } => topics::IMAGE_RECEIVED,
            Self::DetectionsFound { .. } => topics::DETECTIONS_FOUND,
            Self::SafetyStop { .. } => topics::SAFETY_STOP,
            Self::SafetyClear { .. } => topics::SAFETY_CLEAR,
            Self::SetVelocity(_) => topics::DRIVE_SET_VELOCITY,
            Self::Shutdown { .. } => topics::SYSTEM_SHUTDOWN,
            Self::Custom { topic, .. } => topic,
        }
    }

    pub fn safety_stop(reason: impl Into<String>) -> Self {
        Self::SafetyStop {
            reason: reason.into(),
        }
    }

    pub fn safety_clear(reason: impl Into<String>) -> Self {
        Self::SafetyClear {
            reason: reason.into(),
        }
    }

    pub fn shutdown(reason: impl Into<String>) -> Self {
        Self::Shutdown {
            reason: reason.into(),
        }
    }

    /// Build a custom event. Non-object payloads are wrapped under `"value"`.
    pub fn custom(topic: impl Into<String>, payload: Value) -> Self {
        let payload = match payload {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Self::Custom {
            topic: topic.into(),
            payload,
        }
    }

    /// Short description for log lines; never includes frame bytes.
    pub fn summary(&self) -> String {
        match self {
            Self::ImageReceived { bytes, from } => format!("{} bytes from {}", bytes.len(), from),
            Self::DetectionsFound { detections } => format!("{} detections", detections.len()),
            Self::SafetyStop { reason } | Self::SafetyClear { reason } => reason.clone(),
            Self::SetVelocity(cmd) => cmd.to_string(),
            Self::Shutdown { reason } => reason.clone(),
            Self::Custom { payload, .. } => format!("{} fields", payload.len()),
        }
    }
}

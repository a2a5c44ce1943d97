//! Pluggable hazard heuristics.
//!
//! The monitor only needs latch semantics; what counts as a hazard is up
//! to these collaborators. A heuristic that cannot tell should answer
//! [`HazardVerdict::Uncertain`], which latches just like a hazard.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::CameraConfig;
use crate::events::Event;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HazardVerdict {
    Safe,
    Hazard(String),
    Uncertain(String),
}

impl HazardVerdict {
    pub fn is_safe(&self) -> bool {
        matches!(self, Self::Safe)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Safe => None,
            Self::Hazard(r) | Self::Uncertain(r) => Some(r),
        }
    }
}

/// A hazard detector fed by bus events and a periodic poll.
pub trait HazardHeuristic: Send {
    fn name(&self) -> &str;

    /// Called for every `image_received` and `detections_found` event.
    fn observe(&mut self, event: &Event, now: Instant) -> HazardVerdict;

    /// Called on the monitor's poll interval.
    fn poll(&mut self, _now: Instant) -> HazardVerdict {
        HazardVerdict::Safe
    }
}

/// Safety tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Box height / image height at or above which an object is too close.
    /// Values above 1.0 disable the proximity check.
    pub stop_proximity: f32,
    /// Labels considered obstacles; empty means every label.
    pub hazard_labels: Vec<String>,
    /// Frame gap that latches once frames have started; `0` disables.
    pub frame_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            stop_proximity: 0.9,
            hazard_labels: Vec::new(),
            frame_timeout_ms: 2000,
            poll_interval_ms: 100,
        }
    }
}

impl SafetyConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Heuristics enabled by this configuration.
    pub fn heuristics(&self, camera: &CameraConfig) -> Vec<Box<dyn HazardHeuristic>> {
        let mut heuristics: Vec<Box<dyn HazardHeuristic>> = Vec::new();
        if self.stop_proximity <= 1.0 {
            heuristics.push(Box::new(ProximityHazard::new(
                self.stop_proximity,
                camera.height,
                self.hazard_labels.clone(),
            )));
        }
        if self.frame_timeout_ms > 0 {
            heuristics.push(Box::new(FrameWatchdog::new(Duration::from_millis(
                self.frame_timeout_ms,
            ))));
        }
        heuristics
    }
}

/// Proximity-from-vision: a detection filling too much of the frame
/// height is an imminent collision.
#[derive(Debug, Clone)]
pub struct ProximityHazard {
    stop_proximity: f32,
    image_height: u32,
    labels: Vec<String>,
}

impl ProximityHazard {
    pub fn new(stop_proximity: f32, image_height: u32, labels: Vec<String>) -> Self {
        Self {
            stop_proximity,
            image_height,
            labels,
        }
    }
}

impl HazardHeuristic for ProximityHazard {
    fn name(&self) -> &str {
        "proximity"
    }

    fn observe(&mut self, event: &Event, _now: Instant) -> HazardVerdict {
        let Event::DetectionsFound { detections } = event else {
            return HazardVerdict::Safe;
        };
        if self.image_height == 0 {
            return HazardVerdict::Uncertain("image height unknown".to_string());
        }

        detections
            .iter()
            .filter(|d| self.labels.is_empty() || self.labels.contains(&d.class_label))
            .map(|d| (d, d.bbox.height() as f32 / self.image_height as f32))
            .find(|(_, proximity)| *proximity >= self.stop_proximity)
            .map_or(HazardVerdict::Safe, |(d, proximity)| {
                HazardVerdict::Hazard(format!(
                    "'{}' at proximity {:.2}",
                    d.class_label, proximity
                ))
            })
    }
}

/// Fixed-time worst case: once frames are flowing, losing them for longer
/// than `timeout` means the robot is driving blind.
#[derive(Debug, Clone)]
pub struct FrameWatchdog {
    timeout: Duration,
    last_frame: Option<Instant>,
}

impl FrameWatchdog {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_frame: None,
        }
    }
}

impl HazardHeuristic for FrameWatchdog {
    fn name(&self) -> &str {
        "frame_watchdog"
    }

    fn observe(&mut self, event: &Event, now: Instant) -> HazardVerdict {
        if matches!(event, Event::ImageReceived { .. }) {
            self.last_frame = Some(now);
        }
        HazardVerdict::Safe
    }

    fn poll(&mut self, now: Instant) -> HazardVerdict {
        match self.last_frame {
            Some(last) if now.saturating_duration_since(last) > self.timeout => {
                HazardVerdict::Hazard(format!(
                    "no frames for {} ms",
                    now.saturating_duration_since(last).as_millis()
                ))
            }
            _ => HazardVerdict::Safe,
        }
    }
}

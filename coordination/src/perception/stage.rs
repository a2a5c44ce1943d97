//! Detection stage: `image_received` in, `detections_found` out.
//!
//! Frames are handed over newest-wins, so a slow detector drops stale
//! frames instead of queueing them behind the bus.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::detection::{Detection, Detector};
use crate::events::{topics, Event, EventBus, LatestHandler, SubscriptionId};
use crate::lifecycle::Component;

/// Detector backend and result filtering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Inference endpoint; unset means no detector.
    pub endpoint: Option<String>,
    pub confidence_threshold: f32,
    /// Labels kept; empty keeps everything.
    pub classes: Vec<String>,
    pub timeout_ms: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            confidence_threshold: 0.5,
            classes: [
                "handbag",
                "remote",
                "bottle",
                "cup",
                "laptop",
                "mouse",
                "cell phone",
                "wallet",
                "scissors",
                "book",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            timeout_ms: 2000,
        }
    }
}

impl DetectorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Drop detections below the confidence threshold or outside the
    /// class allow-list, preserving order.
    pub fn filter(&self, detections: Vec<Detection>) -> Vec<Detection> {
        detections
            .into_iter()
            .filter(|d| d.confidence >= self.confidence_threshold)
            .filter(|d| self.classes.is_empty() || self.classes.contains(&d.class_label))
            .collect()
    }
}

pub struct DetectionStage {
    bus: EventBus,
    detector: Arc<dyn Detector>,
    config: Arc<DetectorConfig>,
    subscription: Option<SubscriptionId>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl DetectionStage {
    pub fn new(bus: EventBus, detector: Arc<dyn Detector>, config: DetectorConfig) -> Self {
        Self {
            bus,
            detector,
            config: Arc::new(config),
            subscription: None,
            cancel: CancellationToken::new(),
            task: None,
        }
    }
}

#[async_trait]
impl Component for DetectionStage {
    fn name(&self) -> &str {
        "detection_stage"
    }

    async fn enter(&mut self) -> anyhow::Result<()> {
        let (sender, receiver) = watch::channel(None);
        self.subscription = Some(
            self.bus
                .subscribe(topics::IMAGE_RECEIVED, LatestHandler(sender)),
        );

        self.cancel = CancellationToken::new();
        self.task = Some(tokio::spawn(detect_frames(
            receiver,
            Arc::clone(&self.detector),
            Arc::clone(&self.config),
            self.bus.clone(),
            self.cancel.clone(),
        )));
        info!(detector = self.detector.name(), "detection stage started");
        Ok(())
    }

    async fn exit(&mut self) -> anyhow::Result<()> {
        self.cancel.cancel();
        if let Some(id) = self.subscription.take() {
            self.bus.unsubscribe(id);
        }
        if let Some(task) = self.task.take() {
            task.await?;
        }
        info!("detection stage stopped");
        Ok(())
    }
}

async fn detect_frames(
    mut frames: watch::Receiver<Option<Arc<Event>>>,
    detector: Arc<dyn Detector>,
    config: Arc<DetectorConfig>,
    bus: EventBus,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            changed = frames.changed() => {
                if changed.is_err() {
                    break;
                }
                let latest = frames.borrow_and_update().clone();
                let Some(event) = latest else { continue };
                let Event::ImageReceived { bytes, from } = event.as_ref() else {
                    continue;
                };

                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    result = detector.detect(bytes) => result,
                };
                match result {
                    Ok(found) => {
                        let detections = config.filter(found);
                        debug!(peer = %from, detections = detections.len(), "frame analyzed");
                        if let Err(e) = bus.publish(Event::DetectionsFound { detections }) {
                            warn!(error = %e, "failed to publish detections");
                        }
                    }
                    Err(e) => {
                        warn!(detector = detector.name(), peer = %from, error = %e, "detection failed; frame dropped");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChannelHandler;
    use crate::perception::{BoundingBox, DetectError, DetectResult};
    use tokio::sync::mpsc;

    struct Fixed(Vec<Detection>);

    #[async_trait]
    impl Detector for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn detect(&self, _frame: &[u8]) -> DetectResult<Vec<Detection>> {
            Ok(self.0.clone())
        }
    }

    struct Broken;

    #[async_trait]
    impl Detector for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn detect(&self, _frame: &[u8]) -> DetectResult<Vec<Detection>> {
            Err(DetectError::Decode("not a jpeg".to_string()))
        }
    }

    fn det(label: &str, confidence: f32) -> Detection {
        Detection::new(BoundingBox::new(0, 0, 10, 10), label, confidence)
    }

    fn frame() -> Event {
        Event::ImageReceived {
            bytes: vec![0xff, 0xd8, 0xff],
            from: "127.0.0.1:5000".to_string(),
        }
    }

    #[test]
    fn test_filter_threshold_and_classes() {
        let config = DetectorConfig::default();
        let kept = config.filter(vec![
            det("cup", 0.9),
            det("cup", 0.2),
            det("person", 0.95),
            det("book", 0.5),
        ]);
        let labels: Vec<_> = kept.iter().map(|d| d.class_label.as_str()).collect();
        assert_eq!(labels, vec!["cup", "book"]);
    }

    #[test]
    fn test_empty_class_list_keeps_all_labels() {
        let config = DetectorConfig {
            classes: vec![],
            ..Default::default()
        };
        assert_eq!(config.filter(vec![det("person", 0.9)]).len(), 1);
    }

    #[tokio::test]
    async fn test_publishes_filtered_detections() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe(topics::DETECTIONS_FOUND, ChannelHandler(tx));

        let detector = Arc::new(Fixed(vec![det("cup", 0.8), det("cup", 0.1)]));
        let mut stage = DetectionStage::new(bus.clone(), detector, DetectorConfig::default());
        bus.start().unwrap();
        stage.enter().await.unwrap();

        bus.publish(frame()).unwrap();
        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event.as_ref() {
            Event::DetectionsFound { detections } => assert_eq!(detections.len(), 1),
            other => panic!("unexpected event {other:?}"),
        }

        stage.exit().await.unwrap();
        bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_detection_publishes_nothing() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe(topics::DETECTIONS_FOUND, ChannelHandler(tx));

        let mut stage =
            DetectionStage::new(bus.clone(), Arc::new(Broken), DetectorConfig::default());
        bus.start().unwrap();
        stage.enter().await.unwrap();

        bus.publish(frame()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        stage.exit().await.unwrap();
        bus.stop().await.unwrap();
    }
}

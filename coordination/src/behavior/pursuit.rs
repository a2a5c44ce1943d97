//! Vision-driven pursuit producer.
//!
//! On each `detections_found` event the pursuer keeps the detections whose
//! label matches the selected target and tracks the one with the largest
//! box (first wins on ties). From that box:
//!
//! ```text
//! offset    = box_center_x - image_center_x
//! proximity = box_height / image_height
//!
//! |offset| > deadzone  → turn in place toward the box (proximity ignored)
//! otherwise            → forward at the first speed tier with proximity < tier.below
//! no tier matches      → hard stop (zero command, still active)
//! ```
//!
//! Centering before approaching keeps the heading loop from oscillating.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::producer::{ProducerHandle, ProducerOutput, ProducerState, ResetOnDrop};
use super::target::TargetSelector;
use crate::config::CameraConfig;
use crate::events::{topics, Event, EventBus, LatestHandler, SubscriptionId};
use crate::lifecycle::Component;
use crate::motion::VelocityCommand;
use crate::perception::Detection;

/// One forward-speed band.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpeedTier {
    /// Applies while proximity is strictly below this value.
    pub below: f32,
    pub speed: f32,
}

/// Pursuit tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PursuitConfig {
    /// Initial target label; `None` keeps pursuit idle until one is set.
    pub target: Option<String>,
    /// Half-width of the centered band, in pixels.
    pub deadzone_px: f32,
    /// Wheel power for in-place centering turns.
    pub turn_speed: f32,
    /// Ascending by `below`; beyond the last tier the command is zero.
    pub speed_tiers: Vec<SpeedTier>,
    /// Go inactive when no detections arrive for this long.
    pub target_timeout_ms: u64,
}

impl Default for PursuitConfig {
    fn default() -> Self {
        Self {
            target: None,
            deadzone_px: 48.0,
            turn_speed: 0.35,
            speed_tiers: vec![
                SpeedTier {
                    below: 0.25,
                    speed: 0.6,
                },
                SpeedTier {
                    below: 0.45,
                    speed: 0.4,
                },
                SpeedTier {
                    below: 0.65,
                    speed: 0.2,
                },
            ],
            target_timeout_ms: 1000,
        }
    }
}

impl PursuitConfig {
    pub fn target_timeout(&self) -> Duration {
        Duration::from_millis(self.target_timeout_ms)
    }
}

/// Outcome of one policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PursuitDecision {
    /// No detection of the selected label (or no label selected).
    NoTarget,
    /// Target outside the deadzone; centering first.
    Turn {
        offset: f32,
        command: VelocityCommand,
    },
    /// Centered; approaching at a proximity-selected speed.
    Approach {
        proximity: f32,
        command: VelocityCommand,
    },
    /// Centered and closer than every speed tier allows.
    HardStop { proximity: f32 },
}

impl PursuitDecision {
    pub fn command(&self) -> VelocityCommand {
        match self {
            Self::Turn { command, .. } | Self::Approach { command, .. } => *command,
            Self::NoTarget | Self::HardStop { .. } => VelocityCommand::ZERO,
        }
    }

    pub fn has_target(&self) -> bool {
        !matches!(self, Self::NoTarget)
    }

    pub fn state(&self) -> ProducerState {
        if self.has_target() {
            ProducerState::active(self.command())
        } else {
            ProducerState::IDLE
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::NoTarget => "no_target",
            Self::Turn { .. } => "turn",
            Self::Approach { .. } => "approach",
            Self::HardStop { .. } => "hard_stop",
        }
    }
}

/// Pure pursuit policy; no I/O, no clock.
#[derive(Debug, Clone)]
pub struct PursuitPolicy {
    config: PursuitConfig,
    camera: CameraConfig,
}

impl PursuitPolicy {
    pub fn new(config: PursuitConfig, camera: CameraConfig) -> Self {
        Self { config, camera }
    }

    pub fn config(&self) -> &PursuitConfig {
        &self.config
    }

    /// Largest-area detection carrying `label`; the first one wins ties.
    pub fn select_target<'a>(detections: &'a [Detection], label: &str) -> Option<&'a Detection> {
        detections
            .iter()
            .filter(|d| d.class_label == label)
            .fold(None, |best: Option<&Detection>, d| match best {
                Some(b) if b.bbox.area() >= d.bbox.area() => Some(b),
                _ => Some(d),
            })
    }

    pub fn decide(&self, detections: &[Detection], target: Option<&str>) -> PursuitDecision {
        let Some(label) = target else {
            return PursuitDecision::NoTarget;
        };
        let Some(tracked) = Self::select_target(detections, label) else {
            return PursuitDecision::NoTarget;
        };

        let offset = tracked.bbox.center_x() - self.camera.width as f32 / 2.0;
        if offset.abs() > self.config.deadzone_px {
            let command = if offset > 0.0 {
                VelocityCommand::turn_right(self.config.turn_speed)
            } else {
                VelocityCommand::turn_left(self.config.turn_speed)
            };
            return PursuitDecision::Turn { offset, command };
        }

        let proximity = tracked.bbox.height() as f32 / self.camera.height.max(1) as f32;
        match self.speed_for(proximity) {
            Some(speed) => PursuitDecision::Approach {
                proximity,
                command: VelocityCommand::forward(speed),
            },
            None => PursuitDecision::HardStop { proximity },
        }
    }

    /// Forward speed for `proximity`, or `None` past the hard-stop point.
    pub fn speed_for(&self, proximity: f32) -> Option<f32> {
        self.config
            .speed_tiers
            .iter()
            .find(|tier| proximity < tier.below)
            .map(|tier| tier.speed)
    }
}

/// Pursuit producer component.
pub struct Pursuer {
    bus: EventBus,
    policy: Arc<PursuitPolicy>,
    selector: TargetSelector,
    output: Arc<ProducerOutput>,
    subscription: Option<SubscriptionId>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Pursuer {
    pub fn new(
        bus: EventBus,
        config: PursuitConfig,
        camera: CameraConfig,
        selector: TargetSelector,
    ) -> Self {
        Self {
            bus,
            policy: Arc::new(PursuitPolicy::new(config, camera)),
            selector,
            output: Arc::new(ProducerOutput::new("pursuit")),
            subscription: None,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    pub fn handle(&self) -> ProducerHandle {
        self.output.handle()
    }

    pub fn selector(&self) -> &TargetSelector {
        &self.selector
    }
}

#[async_trait]
impl Component for Pursuer {
    fn name(&self) -> &str {
        "pursuit"
    }

    async fn enter(&mut self) -> anyhow::Result<()> {
        let (sender, receiver) = watch::channel(None);
        self.subscription = Some(
            self.bus
                .subscribe(topics::DETECTIONS_FOUND, LatestHandler(sender)),
        );

        self.cancel = CancellationToken::new();
        self.task = Some(tokio::spawn(pursue(
            receiver,
            Arc::clone(&self.policy),
            self.selector.clone(),
            Arc::clone(&self.output),
            self.cancel.clone(),
        )));
        info!(
            label = self.selector.current().as_deref().unwrap_or("<none>"),
            "pursuit started"
        );
        Ok(())
    }

    async fn exit(&mut self) -> anyhow::Result<()> {
        self.cancel.cancel();
        if let Some(id) = self.subscription.take() {
            self.bus.unsubscribe(id);
        }
        let joined = match self.task.take() {
            Some(task) => task.await,
            None => Ok(()),
        };
        self.output.reset();
        info!("pursuit stopped");
        joined?;
        Ok(())
    }
}

async fn pursue(
    mut detections: watch::Receiver<Option<Arc<Event>>>,
    policy: Arc<PursuitPolicy>,
    selector: TargetSelector,
    output: Arc<ProducerOutput>,
    cancel: CancellationToken,
) {
    let _reset = ResetOnDrop(&output);
    let timeout = policy.config().target_timeout();
    let mut last_kind = PursuitDecision::NoTarget.kind();
    let mut last_update = Instant::now();

    loop {
        let active = output.get().active;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            changed = detections.changed() => {
                if changed.is_err() {
                    break;
                }
                let latest = detections.borrow_and_update().clone();
                let Some(event) = latest else { continue };
                let Event::DetectionsFound { detections: found } = event.as_ref() else {
                    continue;
                };

                let target = selector.current();
                let decision = policy.decide(found, target.as_deref());
                if decision.kind() != last_kind {
                    info!(
                        label = target.as_deref().unwrap_or("<none>"),
                        from = last_kind,
                        to = decision.kind(),
                        "pursuit decision changed"
                    );
                    last_kind = decision.kind();
                }
                debug!(?decision, detections = found.len(), "pursuit step");
                output.set(decision.state());
                last_update = Instant::now();
            }
            _ = tokio::time::sleep_until(last_update + timeout), if active => {
                info!(timeout_ms = timeout.as_millis() as u64, "pursuit target stale; going inactive");
                output.reset();
                last_kind = PursuitDecision::NoTarget.kind();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::BehaviorProducer;
    use crate::perception::BoundingBox;

    fn camera() -> CameraConfig {
        CameraConfig {
            width: 640,
            height: 480,
        }
    }

    fn policy() -> PursuitPolicy {
        PursuitPolicy::new(PursuitConfig::default(), camera())
    }

    /// Box of the given size centered at `cx`.
    fn det(label: &str, cx: i32, w: i32, h: i32) -> Detection {
        Detection::new(
            BoundingBox::new(cx - w / 2, 100, cx + w / 2, 100 + h),
            label,
            0.9,
        )
    }

    #[test]
    fn test_selects_largest_box() {
        let detections = vec![det("cup", 320, 10, 10), det("cup", 320, 20, 20)];
        let chosen = PursuitPolicy::select_target(&detections, "cup").unwrap();
        assert_eq!(chosen.bbox.area(), 400);
    }

    #[test]
    fn test_tie_goes_to_first_detection() {
        let first = det("cup", 100, 20, 20);
        let second = det("cup", 500, 20, 20);
        let detections = vec![first.clone(), second];
        let chosen = PursuitPolicy::select_target(&detections, "cup").unwrap();
        assert_eq!(chosen, &first);
    }

    #[test]
    fn test_other_labels_are_ignored() {
        let detections = vec![det("bottle", 320, 200, 200)];
        assert_eq!(
            policy().decide(&detections, Some("cup")),
            PursuitDecision::NoTarget
        );
    }

    #[test]
    fn test_no_selected_target_is_inactive() {
        let detections = vec![det("cup", 320, 20, 20)];
        let decision = policy().decide(&detections, None);
        assert_eq!(decision, PursuitDecision::NoTarget);
        assert_eq!(decision.state(), ProducerState::IDLE);
    }

    #[test]
    fn test_offset_right_turns_right_before_approaching() {
        // Small box (proximity alone would mean fast forward) far to the right.
        let detections = vec![det("cup", 600, 20, 40)];
        let decision = policy().decide(&detections, Some("cup"));

        match decision {
            PursuitDecision::Turn { offset, command } => {
                assert_eq!(offset, 280.0);
                assert_eq!(command, VelocityCommand::new(0.35, -0.35));
            }
            other => panic!("expected a turn, got {other:?}"),
        }
    }

    #[test]
    fn test_offset_left_turns_left() {
        let detections = vec![det("cup", 100, 20, 40)];
        let decision = policy().decide(&detections, Some("cup"));
        assert_eq!(decision.command(), VelocityCommand::new(-0.35, 0.35));
    }

    #[test]
    fn test_centered_speed_tiers() {
        let p = policy();
        // 480 * 0.1 = 48 px tall → proximity 0.1
        let far = p.decide(&[det("cup", 330, 40, 48)], Some("cup"));
        assert_eq!(far.command(), VelocityCommand::forward(0.6));

        // proximity 0.5
        let near = p.decide(&[det("cup", 330, 40, 240)], Some("cup"));
        assert_eq!(near.command(), VelocityCommand::forward(0.2));
    }

    #[test]
    fn test_hard_stop_is_zero_but_active() {
        let decision = policy().decide(&[det("cup", 320, 200, 400)], Some("cup"));
        assert!(matches!(decision, PursuitDecision::HardStop { .. }));
        assert_eq!(
            decision.state(),
            ProducerState::active(VelocityCommand::ZERO)
        );
    }

    #[test]
    fn test_deadzone_boundary_is_centered() {
        // Offset exactly 48 px is inside the deadzone.
        let decision = policy().decide(&[det("cup", 368, 20, 48)], Some("cup"));
        assert!(matches!(decision, PursuitDecision::Approach { .. }));
    }

    async fn wait_until(handle: &ProducerHandle, pred: impl Fn(ProducerState) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !pred(handle.state()) {
            assert!(Instant::now() < deadline, "condition not reached");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_pursuer_tracks_detection_events() {
        let bus = EventBus::new();
        let selector = TargetSelector::new(Some("cup".into()));
        let mut pursuer = Pursuer::new(
            bus.clone(),
            PursuitConfig::default(),
            camera(),
            selector.clone(),
        );
        let handle = pursuer.handle();
        bus.start().unwrap();
        pursuer.enter().await.unwrap();

        bus.publish(Event::DetectionsFound {
            detections: vec![det("cup", 600, 20, 40)],
        })
        .unwrap();
        wait_until(&handle, |s| s.active).await;
        assert_eq!(handle.current_command(), VelocityCommand::turn_right(0.35));

        bus.publish(Event::DetectionsFound { detections: vec![] })
            .unwrap();
        wait_until(&handle, |s| !s.active).await;
        assert!(handle.current_command().is_zero());

        pursuer.exit().await.unwrap();
        bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_pursuer_goes_inactive_when_detections_stop() {
        let bus = EventBus::new();
        let config = PursuitConfig {
            target_timeout_ms: 50,
            ..Default::default()
        };
        let mut pursuer = Pursuer::new(
            bus.clone(),
            config,
            camera(),
            TargetSelector::new(Some("cup".into())),
        );
        let handle = pursuer.handle();
        bus.start().unwrap();
        pursuer.enter().await.unwrap();

        bus.publish(Event::DetectionsFound {
            detections: vec![det("cup", 320, 20, 40)],
        })
        .unwrap();
        wait_until(&handle, |s| s.active).await;
        wait_until(&handle, |s| !s.active).await;

        pursuer.exit().await.unwrap();
        bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_exit_leaves_idle_state() {
        let bus = EventBus::new();
        let mut pursuer = Pursuer::new(
            bus.clone(),
            PursuitConfig::default(),
            camera(),
            TargetSelector::new(Some("cup".into())),
        );
        let handle = pursuer.handle();
        bus.start().unwrap();
        pursuer.enter().await.unwrap();
        bus.publish(Event::DetectionsFound {
            detections: vec![det("cup", 320, 20, 40)],
        })
        .unwrap();
        wait_until(&handle, |s| s.active).await;

        pursuer.exit().await.unwrap();

        assert_eq!(handle.state(), ProducerState::IDLE);
        assert_eq!(bus.subscriber_count(topics::DETECTIONS_FOUND), 0);
        bus.stop().await.unwrap();
    }
}

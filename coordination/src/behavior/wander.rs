//! Wandering producer: scan, relocate, repeat.
//!
//! ```text
//! Scan      rotate through the fixed headings, pausing after each one
//! Relocate  turn a random angle (biased to alternate left/right),
//!           then drive forward for a random duration
//! ```
//!
//! Turns are open-loop: a heading change of `d` degrees is a turn of
//! `d / turn_rate_dps` seconds at `turn_speed`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::producer::{ProducerHandle, ProducerOutput, ProducerState, ResetOnDrop};
use crate::lifecycle::Component;
use crate::motion::VelocityCommand;

/// Wandering tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WanderConfig {
    /// Heading changes visited during a scan; positive is clockwise.
    pub scan_headings_deg: Vec<f32>,
    /// Pause after each scan heading.
    pub scan_dwell_ms: u64,
    /// Wheel power used for in-place turns.
    pub turn_speed: f32,
    /// Rotation rate achieved at `turn_speed`.
    pub turn_rate_dps: f32,
    pub turn_min_deg: f32,
    pub turn_max_deg: f32,
    /// Probability that a relocation turns opposite to the previous one.
    pub alternate_bias: f64,
    pub forward_speed: f32,
    pub drive_min_ms: u64,
    pub drive_max_ms: u64,
    /// Fixed RNG seed for reproducible runs.
    pub seed: Option<u64>,
}

impl Default for WanderConfig {
    fn default() -> Self {
        Self {
            scan_headings_deg: vec![90.0, 90.0, 90.0, 90.0],
            scan_dwell_ms: 400,
            turn_speed: 0.3,
            turn_rate_dps: 90.0,
            turn_min_deg: 30.0,
            turn_max_deg: 150.0,
            alternate_bias: 0.8,
            forward_speed: 0.4,
            drive_min_ms: 1000,
            drive_max_ms: 3000,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WanderPhase {
    Scan,
    Relocate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TurnDirection {
    Left,
    Right,
}

impl TurnDirection {
    pub fn opposite(self) -> Self {
        match self {
            Self::Left => Self::Right,
            Self::Right => Self::Left,
        }
    }
}

/// One timed command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WanderStep {
    pub phase: WanderPhase,
    pub command: VelocityCommand,
    pub duration: Duration,
}

/// Deterministic (given a seed) generator of wander steps.
pub struct WanderPlanner {
    config: WanderConfig,
    rng: StdRng,
    pending: VecDeque<WanderStep>,
    next_phase: WanderPhase,
    last_turn: Option<TurnDirection>,
}

impl WanderPlanner {
    pub fn new(config: WanderConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            rng,
            pending: VecDeque::new(),
            next_phase: WanderPhase::Scan,
            last_turn: None,
        }
    }

    /// Direction of the most recent relocation turn.
    pub fn last_turn(&self) -> Option<TurnDirection> {
        self.last_turn
    }

    pub fn next_step(&mut self) -> WanderStep {
        while self.pending.is_empty() {
            match self.next_phase {
                WanderPhase::Scan => {
                    self.plan_scan();
                    self.next_phase = WanderPhase::Relocate;
                }
                WanderPhase::Relocate => {
                    self.plan_relocate();
                    self.next_phase = WanderPhase::Scan;
                }
            }
        }
        self.pending
            .pop_front()
            .unwrap_or(WanderStep {
                phase: WanderPhase::Scan,
                command: VelocityCommand::ZERO,
                duration: Duration::from_millis(self.config.scan_dwell_ms.max(1)),
            })
    }

    fn plan_scan(&mut self) {
        let dwell = Duration::from_millis(self.config.scan_dwell_ms);
        for heading in self.config.scan_headings_deg.clone() {
            let direction = if heading >= 0.0 {
                TurnDirection::Right
            } else {
                TurnDirection::Left
            };
            if let Some(turn) = self.turn_step(WanderPhase::Scan, direction, heading.abs()) {
                self.pending.push_back(turn);
            }
            self.pending.push_back(WanderStep {
                phase: WanderPhase::Scan,
                command: VelocityCommand::ZERO,
                duration: dwell,
            });
        }
        if self.pending.is_empty() {
            // No headings configured: a single dwell keeps the cycle moving.
            self.pending.push_back(WanderStep {
                phase: WanderPhase::Scan,
                command: VelocityCommand::ZERO,
                duration: dwell.max(Duration::from_millis(1)),
            });
        }
    }

    fn plan_relocate(&mut self) {
        let direction = self.choose_direction();
        let (lo, hi) = ordered(self.config.turn_min_deg, self.config.turn_max_deg);
        let degrees = if lo.is_finite() && hi.is_finite() && hi > lo {
            self.rng.gen_range(lo..=hi)
        } else {
            lo
        };
        if let Some(turn) = self.turn_step(WanderPhase::Relocate, direction, degrees) {
            self.pending.push_back(turn);
        }

        let lo = self.config.drive_min_ms.min(self.config.drive_max_ms);
        let hi = self.config.drive_min_ms.max(self.config.drive_max_ms);
        let drive_ms = self.rng.gen_range(lo..=hi).max(1);
        self.pending.push_back(WanderStep {
            phase: WanderPhase::Relocate,
            command: VelocityCommand::forward(self.config.forward_speed),
            duration: Duration::from_millis(drive_ms),
        });
        debug!(?direction, degrees, drive_ms, "relocation planned");
    }

    /// Pick the next relocation direction, favoring the opposite of the last.
    pub fn choose_direction(&mut self) -> TurnDirection {
        let direction = match self.last_turn {
            None => {
                if self.rng.gen_bool(0.5) {
                    TurnDirection::Left
                } else {
                    TurnDirection::Right
                }
            }
            Some(previous) => {
                let bias = if self.config.alternate_bias.is_nan() {
                    0.5
                } else {
                    self.config.alternate_bias.clamp(0.0, 1.0)
                };
                if self.rng.gen_bool(bias) {
                    previous.opposite()
                } else {
                    previous
                }
            }
        };
        self.last_turn = Some(direction);
        direction
    }

    fn turn_step(
        &self,
        phase: WanderPhase,
        direction: TurnDirection,
        degrees: f32,
    ) -> Option<WanderStep> {
        if degrees <= 0.0 || self.config.turn_rate_dps <= 0.0 {
            return None;
        }
        let command = match direction {
            TurnDirection::Left => VelocityCommand::turn_left(self.config.turn_speed),
            TurnDirection::Right => VelocityCommand::turn_right(self.config.turn_speed),
        };
        // Non-finite or overflowing turn times are skipped.
        let duration = Duration::try_from_secs_f32(degrees / self.config.turn_rate_dps).ok()?;
        Some(WanderStep {
            phase,
            command,
            duration,
        })
    }
}

fn ordered(a: f32, b: f32) -> (f32, f32) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Wandering producer component. Always active while entered.
pub struct Wanderer {
    config: WanderConfig,
    output: Arc<ProducerOutput>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Wanderer {
    pub fn new(config: WanderConfig) -> Self {
        Self {
            config,
            output: Arc::new(ProducerOutput::new("wander")),
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    pub fn handle(&self) -> ProducerHandle {
        self.output.handle()
    }
}

#[async_trait]
impl Component for Wanderer {
    fn name(&self) -> &str {
        "wander"
    }

    async fn enter(&mut self) -> anyhow::Result<()> {
        self.cancel = CancellationToken::new();
        let planner = WanderPlanner::new(self.config.clone());
        self.task = Some(tokio::spawn(wander(
            planner,
            Arc::clone(&self.output),
            self.cancel.clone(),
        )));
        info!("wander started");
        Ok(())
    }

    async fn exit(&mut self) -> anyhow::Result<()> {
        self.cancel.cancel();
        let joined = match self.task.take() {
            Some(task) => task.await,
            None => Ok(()),
        };
        self.output.reset();
        info!("wander stopped");
        joined?;
        Ok(())
    }
}

async fn wander(mut planner: WanderPlanner, output: Arc<ProducerOutput>, cancel: CancellationToken) {
    let _reset = ResetOnDrop(&output);
    let mut phase = None;
    loop {
        let step = planner.next_step();
        if phase != Some(step.phase) {
            debug!(phase = ?step.phase, "wander phase");
            phase = Some(step.phase);
        }
        output.set(ProducerState::active(step.command));
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(step.duration) => {}
        }
    }
}

//! Arbitration loop.
//!
//! Free-runs on a fixed period, independent of frame arrival. Each tick:
//!
//! ```text
//! latch set        → {0, 0}              (safety)
//! pursuit active   → pursuit command     (pursuit)
//! otherwise        → wander command      (wander)
//! ```
//!
//! Strict priority, never blended. The result is published on
//! `drive/set_velocity` every tick, unchanged or not, so the actuator side
//! sees a heartbeat.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, trace, warn};

use crate::behavior::{BehaviorProducer, ProducerState};
use crate::events::{Event, EventBus};
use crate::lifecycle::Component;
use crate::motion::VelocityCommand;
use crate::safety::LatchView;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommanderConfig {
    pub tick_ms: u64,
}

impl Default for CommanderConfig {
    fn default() -> Self {
        Self { tick_ms: 100 }
    }
}

impl CommanderConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }
}

/// Which input won a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandSource {
    Safety,
    Pursuit,
    Wander,
}

impl fmt::Display for CommandSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Safety => write!(f, "safety"),
            Self::Pursuit => write!(f, "pursuit"),
            Self::Wander => write!(f, "wander"),
        }
    }
}

/// Resolved command for one tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Arbitration {
    pub command: VelocityCommand,
    pub source: CommandSource,
}

/// Pick the single live command. Wandering is always eligible.
pub fn arbitrate(latched: bool, pursuit: ProducerState, wander: ProducerState) -> Arbitration {
    if latched {
        Arbitration {
            command: VelocityCommand::ZERO,
            source: CommandSource::Safety,
        }
    } else if pursuit.active {
        Arbitration {
            command: pursuit.command,
            source: CommandSource::Pursuit,
        }
    } else {
        Arbitration {
            command: wander.command,
            source: CommandSource::Wander,
        }
    }
}

pub struct Commander {
    bus: EventBus,
    latch: LatchView,
    pursuit: Arc<dyn BehaviorProducer>,
    wander: Arc<dyn BehaviorProducer>,
    tick: Duration,
    last: watch::Sender<Option<Arbitration>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Commander {
    pub fn new(
        bus: EventBus,
        latch: LatchView,
        pursuit: Arc<dyn BehaviorProducer>,
        wander: Arc<dyn BehaviorProducer>,
        config: CommanderConfig,
    ) -> Self {
        let (last, _) = watch::channel(None);
        Self {
            bus,
            latch,
            pursuit,
            wander,
            tick: config.tick(),
            last,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    /// Most recent tick's outcome, for status reporting.
    pub fn watch(&self) -> watch::Receiver<Option<Arbitration>> {
        self.last.subscribe()
    }

    /// Evaluate one tick without publishing.
    pub fn resolve(&self) -> Arbitration {
        arbitrate(
            self.latch.is_latched(),
            self.pursuit.state(),
            self.wander.state(),
        )
    }
}

#[async_trait]
impl Component for Commander {
    fn name(&self) -> &str {
        "commander"
    }

    async fn enter(&mut self) -> anyhow::Result<()> {
        self.cancel = CancellationToken::new();
        self.task = Some(tokio::spawn(run_ticks(
            self.bus.clone(),
            self.latch.clone(),
            Arc::clone(&self.pursuit),
            Arc::clone(&self.wander),
            self.tick,
            self.last.clone(),
            self.cancel.clone(),
        )));
        info!(tick_ms = self.tick.as_millis() as u64, "commander started");
        Ok(())
    }

    async fn exit(&mut self) -> anyhow::Result<()> {
        self.cancel.cancel();
        let joined = match self.task.take() {
            Some(task) => task.await,
            None => Ok(()),
        };
        // Leave the actuator with a stop as the last word.
        if let Err(e) = self.bus.publish(Event::SetVelocity(VelocityCommand::ZERO)) {
            warn!(error = %e, "failed to publish final zero command");
        }
        self.last.send_replace(None);
        info!("commander stopped");
        joined?;
        Ok(())
    }
}

async fn run_ticks(
    bus: EventBus,
    latch: LatchView,
    pursuit: Arc<dyn BehaviorProducer>,
    wander: Arc<dyn BehaviorProducer>,
    period: Duration,
    last: watch::Sender<Option<Arbitration>>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut source = None;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let resolved = arbitrate(latch.is_latched(), pursuit.state(), wander.state());
                if source != Some(resolved.source) {
                    info!(
                        from = ?source,
                        to = %resolved.source,
                        "command source changed"
                    );
                    source = Some(resolved.source);
                }
                trace!(source = %resolved.source, command = %resolved.command, "tick");

                if let Err(e) = bus.publish(Event::SetVelocity(resolved.command)) {
                    warn!(error = %e, "failed to publish drive command");
                }
                last.send_replace(Some(resolved));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::ProducerOutput;
    use crate::events::{topics, ChannelHandler};
    use crate::safety::SafetyLatch;
    use tokio::sync::mpsc;

    const FORWARD: VelocityCommand = VelocityCommand {
        left: 0.4,
        right: 0.4,
    };
    const TURN: VelocityCommand = VelocityCommand {
        left: 0.35,
        right: -0.35,
    };

    #[test]
    fn test_latched_always_zero() {
        for pursuit_active in [false, true] {
            let pursuit = ProducerState {
                command: TURN,
                active: pursuit_active,
            };
            let result = arbitrate(true, pursuit, ProducerState::active(FORWARD));
            assert_eq!(result.command, VelocityCommand::ZERO);
            assert_eq!(result.source, CommandSource::Safety);
        }
    }

    #[test]
    fn test_active_pursuit_beats_wander() {
        let result = arbitrate(false, ProducerState::active(TURN), ProducerState::active(FORWARD));
        assert_eq!(result.command, TURN);
        assert_eq!(result.source, CommandSource::Pursuit);
    }

    #[test]
    fn test_inactive_pursuit_falls_back_to_wander() {
        let pursuit = ProducerState {
            command: TURN,
            active: false,
        };
        let result = arbitrate(false, pursuit, ProducerState::active(FORWARD));
        assert_eq!(result.command, FORWARD);
        assert_eq!(result.source, CommandSource::Wander);
    }

    #[test]
    fn test_active_pursuit_hard_stop_is_not_overridden() {
        let result = arbitrate(
            false,
            ProducerState::active(VelocityCommand::ZERO),
            ProducerState::active(FORWARD),
        );
        assert_eq!(result.command, VelocityCommand::ZERO);
        assert_eq!(result.source, CommandSource::Pursuit);
    }

    #[tokio::test]
    async fn test_publishes_every_tick_and_final_zero() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe(topics::DRIVE_SET_VELOCITY, ChannelHandler(tx));

        let latch = SafetyLatch::new();
        let pursuit = ProducerOutput::new("pursuit");
        let wander = ProducerOutput::new("wander");
        wander.set(ProducerState::active(FORWARD));

        let mut commander = Commander::new(
            bus.clone(),
            latch.view(),
            Arc::new(pursuit.handle()),
            Arc::new(wander.handle()),
            CommanderConfig { tick_ms: 10 },
        );
        bus.start().unwrap();
        commander.enter().await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        commander.exit().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.stop().await.unwrap();

        let mut commands = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let Event::SetVelocity(command) = event.as_ref() {
                commands.push(*command);
            }
        }
        assert!(commands.len() >= 3, "got {commands:?}");
        assert!(commands[..commands.len() - 1].iter().all(|c| *c == FORWARD));
        assert_eq!(commands.last(), Some(&VelocityCommand::ZERO));
    }

    #[tokio::test]
    async fn test_latch_takes_effect_next_tick() {
        let bus = EventBus::new();
        let latch = SafetyLatch::new();
        let pursuit = ProducerOutput::new("pursuit");
        pursuit.set(ProducerState::active(TURN));
        let wander = ProducerOutput::new("wander");

        let mut commander = Commander::new(
            bus.clone(),
            latch.view(),
            Arc::new(pursuit.handle()),
            Arc::new(wander.handle()),
            CommanderConfig { tick_ms: 10 },
        );
        let mut last = commander.watch();
        bus.start().unwrap();
        commander.enter().await.unwrap();

        last.changed().await.unwrap();
        assert_eq!(commander.resolve().source, CommandSource::Pursuit);

        latch.latch();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let seen = last.borrow().unwrap();
        assert_eq!(seen.command, VelocityCommand::ZERO);
        assert_eq!(seen.source, CommandSource::Safety);

        commander.exit().await.unwrap();
        bus.stop().await.unwrap();
    }
}

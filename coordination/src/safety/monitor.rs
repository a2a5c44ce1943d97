//! Safety monitor component.
//!
//! Owns the latch. Explicit `safety/stop` and `safety/clear` events set and
//! release it directly; hazard heuristics can only set it. When a heuristic
//! trips the latch, the monitor publishes `safety/stop` once for the
//! clear → latched edge.
//!
//! ```text
//! safety/stop  ──────────────────────────────▶ latch()
//! safety/clear ──────────────────────────────▶ clear()
//! image_received ┐                ┌─ observe ─▶ latch() + publish safety/stop
//! detections_found ┴─▶ monitor task ┤
//!                     poll interval ┴─ poll ───▶ latch() + publish safety/stop
//! ```

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::hazard::{HazardHeuristic, HazardVerdict, SafetyConfig};
use super::latch::{LatchView, SafetyLatch, SafetyState};
use crate::events::{topics, ChannelHandler, Event, EventBus, SubscriptionId};
use crate::lifecycle::Component;

pub struct SafetyMonitor {
    bus: EventBus,
    latch: SafetyLatch,
    heuristics: Vec<Box<dyn HazardHeuristic>>,
    poll_interval: Duration,
    subscriptions: Vec<SubscriptionId>,
    cancel: CancellationToken,
    task: Option<JoinHandle<Vec<Box<dyn HazardHeuristic>>>>,
}

impl SafetyMonitor {
    /// Monitor with no heuristics; only explicit stop/clear events move
    /// the latch.
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            latch: SafetyLatch::new(),
            heuristics: Vec::new(),
            poll_interval: SafetyConfig::default().poll_interval(),
            subscriptions: Vec::new(),
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    pub fn with_heuristic(mut self, heuristic: impl HazardHeuristic + 'static) -> Self {
        self.heuristics.push(Box::new(heuristic));
        self
    }

    pub fn with_heuristics(mut self, heuristics: Vec<Box<dyn HazardHeuristic>>) -> Self {
        self.heuristics.extend(heuristics);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn latch_view(&self) -> LatchView {
        self.latch.view()
    }

    pub fn state(&self) -> SafetyState {
        self.latch.state()
    }
}

#[async_trait]
impl Component for SafetyMonitor {
    fn name(&self) -> &str {
        "safety_monitor"
    }

    async fn enter(&mut self) -> anyhow::Result<()> {
        let latch = self.latch.clone();
        self.subscriptions
            .push(self.bus.subscribe_fn(topics::SAFETY_STOP, move |event| {
                if latch.latch() {
                    warn!(reason = %event.summary(), "safety latch set");
                }
                Ok(())
            }));

        let latch = self.latch.clone();
        self.subscriptions
            .push(self.bus.subscribe_fn(topics::SAFETY_CLEAR, move |event| {
                if latch.clear() {
                    info!(reason = %event.summary(), "safety latch cleared");
                }
                Ok(())
            }));

        if !self.heuristics.is_empty() {
            let (sender, receiver) = mpsc::unbounded_channel();
            for topic in [topics::IMAGE_RECEIVED, topics::DETECTIONS_FOUND] {
                self.subscriptions
                    .push(self.bus.subscribe(topic, ChannelHandler(sender.clone())));
            }

            self.cancel = CancellationToken::new();
            self.task = Some(tokio::spawn(watch_hazards(
                receiver,
                std::mem::take(&mut self.heuristics),
                self.poll_interval,
                self.bus.clone(),
                self.latch.clone(),
                self.cancel.clone(),
            )));
        }

        info!(state = %self.latch.state(), "safety monitor started");
        Ok(())
    }

    async fn exit(&mut self) -> anyhow::Result<()> {
        self.cancel.cancel();
        for id in self.subscriptions.drain(..) {
            self.bus.unsubscribe(id);
        }
        if let Some(task) = self.task.take() {
            self.heuristics = task.await?;
        }
        info!(state = %self.latch.state(), "safety monitor stopped");
        Ok(())
    }
}

async fn watch_hazards(
    mut events: mpsc::UnboundedReceiver<Arc<Event>>,
    mut heuristics: Vec<Box<dyn HazardHeuristic>>,
    poll_interval: Duration,
    bus: EventBus,
    latch: SafetyLatch,
    cancel: CancellationToken,
) -> Vec<Box<dyn HazardHeuristic>> {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let _guard = LatchOnAbort {
        bus: bus.clone(),
        latch: latch.clone(),
        cancel: cancel.clone(),
    };

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            received = events.recv() => {
                let Some(event) = received else { break };
                let now = Instant::now();
                for heuristic in heuristics.iter_mut() {
                    let name = heuristic.name().to_string();
                    let verdict = contained(&name, || heuristic.observe(&event, now));
                    apply_verdict(&name, verdict, &bus, &latch);
                }
            }
            _ = ticker.tick() => {
                let now = Instant::now();
                for heuristic in heuristics.iter_mut() {
                    let name = heuristic.name().to_string();
                    let verdict = contained(&name, || heuristic.poll(now));
                    apply_verdict(&name, verdict, &bus, &latch);
                }
            }
        }
    }
    heuristics
}

/// Runs one heuristic evaluation; a panic counts as an uncertain verdict.
fn contained(name: &str, evaluate: impl FnOnce() -> HazardVerdict) -> HazardVerdict {
    match catch_unwind(AssertUnwindSafe(evaluate)) {
        Ok(verdict) => verdict,
        Err(_) => {
            warn!(heuristic = name, "hazard heuristic panicked");
            HazardVerdict::Uncertain("heuristic panicked".to_string())
        }
    }
}

/// Latches if the hazard task ends for any reason other than cancellation.
struct LatchOnAbort {
    bus: EventBus,
    latch: SafetyLatch,
    cancel: CancellationToken,
}

impl Drop for LatchOnAbort {
    fn drop(&mut self) {
        if self.cancel.is_cancelled() {
            return;
        }
        apply_verdict(
            "safety_monitor",
            HazardVerdict::Uncertain("hazard watch ended unexpectedly".to_string()),
            &self.bus,
            &self.latch,
        );
    }
}

fn apply_verdict(name: &str, verdict: HazardVerdict, bus: &EventBus, latch: &SafetyLatch) {
    let Some(reason) = verdict.reason() else {
        return;
    };
    let reason = format!("{name}: {reason}");
    if !latch.latch() {
        debug!(reason = %reason, "hazard while already latched");
        return;
    }

    warn!(
        heuristic = name,
        uncertain = matches!(verdict, HazardVerdict::Uncertain(_)),
        reason = %reason,
        "hazard detected; safety latch set"
    );
    if let Err(e) = bus.publish(Event::safety_stop(reason)) {
        warn!(error = %e, "failed to publish safety stop");
    }
}

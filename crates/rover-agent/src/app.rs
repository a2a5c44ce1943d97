//! Component wiring.

use std::sync::Arc;

use anyhow::Result;
use rover_coordination::behavior::{Pursuer, TargetSelector, Wanderer};
use rover_coordination::perception::{
    DetectionStage, Detector, HttpDetector, NullDetector,
};
use rover_coordination::{
    ActuatorLink, Commander, EventBus, ImageServer, Lifecycle, RoverConfig, SafetyMonitor,
    ShutdownSignal,
};
use tracing::{info, warn};

use crate::operator::OperatorConsole;

/// Build every component, run until a stop condition, then tear down.
///
/// Enter order puts the actuator first and the commander last, so on exit
/// the commander's final zero command goes out while the bus and the
/// actuator link are still up.
pub async fn run(config: RoverConfig, operator: bool) -> Result<()> {
    let bus = EventBus::new();
    let shutdown = ShutdownSignal::new();
    shutdown.listen_on(&bus);
    let os_listener = shutdown.spawn_os_listener();

    let detector: Arc<dyn Detector> = match &config.detector.endpoint {
        Some(endpoint) => Arc::new(HttpDetector::new(endpoint, config.detector.timeout())?),
        None => {
            warn!("no detector endpoint configured; pursuit will stay idle");
            Arc::new(NullDetector)
        }
    };

    let selector = TargetSelector::new(config.pursuit.target.clone());
    let safety = SafetyMonitor::new(bus.clone())
        .with_heuristics(config.safety.heuristics(&config.camera))
        .with_poll_interval(config.safety.poll_interval());
    let latch = safety.latch_view();
    let wanderer = Wanderer::new(config.wander.clone());
    let pursuer = Pursuer::new(
        bus.clone(),
        config.pursuit.clone(),
        config.camera.clone(),
        selector.clone(),
    );
    let commander = Commander::new(
        bus.clone(),
        latch.clone(),
        Arc::new(pursuer.handle()),
        Arc::new(wanderer.handle()),
        config.commander.clone(),
    );
    let arbitration = commander.watch();

    let mut lifecycle = Lifecycle::new()
        .with(ActuatorLink::new(bus.clone(), config.actuator.clone()))
        .with(bus.clone())
        .with(ImageServer::new(bus.clone(), &config.server))
        .with(safety)
        .with(wanderer)
        .with(pursuer)
        .with(DetectionStage::new(bus.clone(), detector, config.detector.clone()))
        .with(commander);

    if operator {
        lifecycle.push(Box::new(OperatorConsole::new(
            bus.clone(),
            selector,
            latch,
            arbitration,
            tokio::io::stdin(),
            tokio::io::stdout(),
        )));
    }

    let result = lifecycle
        .run(async { Ok(shutdown.wait().await) })
        .await;
    os_listener.abort();

    let reason = result?;
    info!(reason = %reason, "rover agent stopped");
    Ok(())
}

//! Rover coordination library
//!
//! This library provides the control core of a vision-guided rover:
//! - An in-process publish/subscribe event bus with a single dispatch task
//! - A lifecycle container that enters components in order and always
//!   exits them in reverse
//! - Behavior producers (wandering, vision pursuit) publishing their latest
//!   drive command
//! - A safety latch that forces a stop until explicitly cleared
//! - The arbitration loop that resolves one drive command per tick
//!
//! # Data Flow
//!
//! ```text
//! ImageServer ──image_received──▶ DetectionStage ──detections_found──▶ Pursuer
//!      │                                 │                                │
//!      └──────────────▶ SafetyMonitor ◀──┘                                │
//!                           │ latch                                       │
//!                           ▼                                             ▼
//!                       Commander ◀──────────── Wanderer ────────── producer state
//!                           │
//!                           └──drive/set_velocity──▶ ActuatorLink
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use rover_coordination::{EventBus, Lifecycle, ShutdownSignal};
//!
//! let bus = EventBus::new();
//! let shutdown = ShutdownSignal::new();
//! shutdown.listen_on(&bus);
//!
//! Lifecycle::new()
//!     .with(bus.clone())
//!     .run(async { shutdown.wait().await })
//!     .await?;
//! ```

pub mod behavior;
pub mod commander;
pub mod config;
pub mod events;
pub mod lifecycle;
pub mod motion;
pub mod perception;
pub mod safety;
pub mod transport;

pub use behavior::{
    BehaviorProducer, ProducerHandle, ProducerState, Pursuer, PursuitConfig, TargetSelector,
    WanderConfig, Wanderer,
};
pub use commander::{arbitrate, Arbitration, CommandSource, Commander, CommanderConfig};
pub use config::{CameraConfig, ConfigError, RoverConfig};
pub use events::{topics, Event, EventBus, EventBusError, EventHandler, SubscriptionId};
pub use lifecycle::{Component, Lifecycle, LifecycleError, LifecycleState, ShutdownSignal};
pub use motion::VelocityCommand;
pub use perception::{Detection, DetectionStage, Detector, DetectorConfig, HttpDetector};
pub use safety::{LatchView, SafetyConfig, SafetyMonitor, SafetyState};
pub use transport::{ActuatorConfig, ActuatorLink, ImageServer};

//! Behavior producers.
//!
//! A producer continuously computes a candidate drive command on its own
//! task and exposes the latest `(command, active)` pair. Arbitration reads
//! producers; it never writes to them.
//!
//! | Producer   | Active when                          | Inputs             |
//! |------------|--------------------------------------|--------------------|
//! | `Pursuer`  | the selected target is in view       | `detections_found` |
//! | `Wanderer` | always (while entered)               | its own timer      |

pub mod producer;
pub mod pursuit;
pub mod target;
pub mod wander;

pub use producer::{BehaviorProducer, ProducerHandle, ProducerOutput, ProducerState};
pub use pursuit::{PursuitConfig, PursuitDecision, PursuitPolicy, Pursuer, SpeedTier};
pub use target::TargetSelector;
pub use wander::{TurnDirection, WanderConfig, WanderPhase, WanderPlanner, WanderStep, Wanderer};

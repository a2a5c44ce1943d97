//! Safety latch, hazard heuristics and the monitor that ties them to the bus.
//!
//! While latched, the commander emits zero velocity regardless of what any
//! behavior wants. Only an explicit `safety/clear` releases the latch.

pub mod hazard;
pub mod latch;
pub mod monitor;

pub use hazard::{FrameWatchdog, HazardHeuristic, HazardVerdict, ProximityHazard, SafetyConfig};
pub use latch::{LatchView, SafetyLatch, SafetyState};
pub use monitor::SafetyMonitor;

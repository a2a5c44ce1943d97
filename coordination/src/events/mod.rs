//! Event-driven coordination between the rover's components.
//!
//! # Architecture
//!
//! 1. **Event Types** (`types.rs`): the typed [`Event`] enum and the
//!    hierarchical topic keys used for exact-match routing.
//!
//! 2. **Event Bus** (`bus.rs`): unbounded FIFO queue drained by a single
//!    dispatch task that calls handlers in subscription order.
//!
//! # Event Flow
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │   Producer   │────▶│  Event Bus   │────▶│  Subscribers │
//! │  (publish)   │     │  (dispatch)  │     │  (handlers)  │
//! └──────────────┘     └──────────────┘     └──────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use rover_coordination::events::{Event, EventBus, topics};
//!
//! let bus = EventBus::new();
//! bus.subscribe_fn(topics::SAFETY_STOP, |event| {
//!     tracing::warn!(reason = %event.summary(), "stop requested");
//!     Ok(())
//! });
//! bus.start()?;
//! bus.publish(Event::safety_stop("bumper"))?;
//! bus.stop().await?;
//! ```

pub mod bus;
pub mod types;

// Re-export core types
pub use bus::{
    ChannelHandler, EventBus, EventBusError, EventBusResult, EventHandler, FnHandler,
    LatestHandler, SharedEventBus, SubscriptionId,
};
pub use types::{topics, Event};

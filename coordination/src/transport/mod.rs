//! Network adapters at the edges of the bus.
//!
//! - [`frame`]: length-prefixed codec shared by ingress and tools.
//! - [`ingress`]: TCP image server publishing `image_received`.
//! - [`actuator`]: line-oriented JSON link consuming `drive/set_velocity`.

pub mod actuator;
pub mod frame;
pub mod ingress;

pub use actuator::{encode_command, ActuatorConfig, ActuatorError, ActuatorLink, ActuatorResult};
pub use frame::{read_frame, write_frame, FrameError, FrameResult, DEFAULT_MAX_FRAME_LEN};
pub use ingress::ImageServer;

//! Normalized differential-drive commands.
//!
//! A [`VelocityCommand`] is wheel power, not physical speed: each side is
//! clamped to `[-1.0, 1.0]` by the constructors and when decoded, so nothing
//! downstream ever sees an out-of-range value.

use serde::{Deserialize, Serialize};

/// Lower bound for a wheel power value.
pub const MIN_POWER: f32 = -1.0;
/// Upper bound for a wheel power value.
pub const MAX_POWER: f32 = 1.0;

/// Normalized left/right wheel power.
///
/// Fields are public for reading and for `const` values. Code that builds a
/// command from untrusted numbers goes through [`VelocityCommand::new`];
/// deserialization always does.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "RawVelocity")]
pub struct VelocityCommand {
    pub left: f32,
    pub right: f32,
}

/// Wire shape of a command before clamping.
#[derive(Deserialize)]
struct RawVelocity {
    left: f32,
    right: f32,
}

impl From<RawVelocity> for VelocityCommand {
    fn from(raw: RawVelocity) -> Self {
        Self::new(raw.left, raw.right)
    }
}

impl VelocityCommand {
    /// Both wheels stopped.
    pub const ZERO: Self = Self {
        left: 0.0,
        right: 0.0,
    };

    /// Build a command, clamping both sides into range. NaN becomes zero.
    pub fn new(left: f32, right: f32) -> Self {
        Self {
            left: clamp_power(left),
            right: clamp_power(right),
        }
    }

    /// Straight line at `speed` (negative reverses).
    pub fn forward(speed: f32) -> Self {
        Self::new(speed, speed)
    }

    /// Rotate in place clockwise (left wheel forward, right wheel back).
    pub fn turn_right(power: f32) -> Self {
        let p = power.abs();
        Self::new(p, -p)
    }

    /// Rotate in place counter-clockwise.
    pub fn turn_left(power: f32) -> Self {
        let p = power.abs();
        Self::new(-p, p)
    }

    pub fn is_zero(&self) -> bool {
        self.left == 0.0 && self.right == 0.0
    }
}

impl std::fmt::Display for VelocityCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:+.3}, {:+.3})", self.left, self.right)
    }
}

fn clamp_power(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(MIN_POWER, MAX_POWER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_clamps_out_of_range() {
        let cmd = VelocityCommand::new(1.7, -3.0);
        assert_eq!(cmd, VelocityCommand::new(1.0, -1.0));
    }

    #[test]
    fn test_nan_becomes_zero() {
        let cmd = VelocityCommand::new(f32::NAN, 0.5);
        assert_eq!(cmd.left, 0.0);
        assert_eq!(cmd.right, 0.5);
    }

    #[test]
    fn test_turns_are_mirrored() {
        let right = VelocityCommand::turn_right(0.3);
        let left = VelocityCommand::turn_left(-0.3);
        assert_eq!(right, VelocityCommand::new(0.3, -0.3));
        assert_eq!(left, VelocityCommand::new(-0.3, 0.3));
    }

    #[test]
    fn test_serializes_as_flat_record() {
        let json = serde_json::to_string(&VelocityCommand::new(0.5, -0.25)).unwrap();
        assert_eq!(json, r#"{"left":0.5,"right":-0.25}"#);
    }

    #[test]
    fn test_decoding_clamps() {
        let cmd: VelocityCommand = serde_json::from_str(r#"{"left":5.0,"right":-9.0}"#).unwrap();
        assert_eq!(cmd, VelocityCommand::new(1.0, -1.0));
    }

    #[test]
    fn test_decoded_event_command_is_clamped() {
        use crate::events::Event;

        let event: Event =
            serde_json::from_str(r#"{"type":"set_velocity","left":2.5,"right":-0.5}"#).unwrap();
        match event {
            Event::SetVelocity(cmd) => assert_eq!(cmd, VelocityCommand::new(1.0, -0.5)),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_zero_default() {
        assert!(VelocityCommand::default().is_zero());
        assert!(!VelocityCommand::forward(0.1).is_zero());
    }
}

//! Process-wide safety latch.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyState {
    Clear,
    Latched,
}

impl fmt::Display for SafetyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Clear => write!(f, "clear"),
            Self::Latched => write!(f, "latched"),
        }
    }
}

/// Owning side of the latch. Only the safety monitor holds one; everyone
/// else gets a read-only [`LatchView`].
#[derive(Debug, Clone, Default)]
pub struct SafetyLatch {
    latched: Arc<AtomicBool>,
}

impl SafetyLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the latch. Returns `true` if this call moved it from clear.
    pub(crate) fn latch(&self) -> bool {
        !self.latched.swap(true, Ordering::AcqRel)
    }

    /// Release the latch. Returns `true` if this call moved it from latched.
    pub(crate) fn clear(&self) -> bool {
        self.latched.swap(false, Ordering::AcqRel)
    }

    pub fn is_latched(&self) -> bool {
        self.latched.load(Ordering::Acquire)
    }

    pub fn state(&self) -> SafetyState {
        if self.is_latched() {
            SafetyState::Latched
        } else {
            SafetyState::Clear
        }
    }

    pub fn view(&self) -> LatchView {
        LatchView {
            latched: Arc::clone(&self.latched),
        }
    }
}

/// Read-only handle onto a [`SafetyLatch`].
#[derive(Debug, Clone)]
pub struct LatchView {
    latched: Arc<AtomicBool>,
}

impl LatchView {
    pub fn is_latched(&self) -> bool {
        self.latched.load(Ordering::Acquire)
    }

    pub fn state(&self) -> SafetyState {
        if self.is_latched() {
            SafetyState::Latched
        } else {
            SafetyState::Clear
        }
    }
}

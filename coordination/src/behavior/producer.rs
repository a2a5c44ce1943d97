//! Shared contract for behavior producers.
//!
//! Each producer runs its own control task and publishes its latest
//! `(command, active)` pair through a `watch` channel. The producer task is
//! the only writer; the commander holds cloned [`ProducerHandle`]s and reads
//! the newest pair once per tick. The pair travels as one value, so a
//! reader never sees a command from one step with the flag from another.

use tokio::sync::watch;

use crate::motion::VelocityCommand;

/// Latest output of a producer.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ProducerState {
    pub command: VelocityCommand,
    pub active: bool,
}

impl ProducerState {
    /// Inactive with the zero command; the state outside `Entered`.
    pub const IDLE: Self = Self {
        command: VelocityCommand::ZERO,
        active: false,
    };

    pub fn active(command: VelocityCommand) -> Self {
        Self {
            command,
            active: true,
        }
    }
}

/// Read side of a behavior producer, as seen by arbitration.
pub trait BehaviorProducer: Send + Sync {
    fn name(&self) -> &str;

    fn current_command(&self) -> VelocityCommand;

    fn is_active(&self) -> bool;

    /// Command and readiness together.
    fn state(&self) -> ProducerState {
        ProducerState {
            command: self.current_command(),
            active: self.is_active(),
        }
    }
}

/// Clonable read handle onto a producer's output.
#[derive(Debug, Clone)]
pub struct ProducerHandle {
    name: String,
    receiver: watch::Receiver<ProducerState>,
}

impl BehaviorProducer for ProducerHandle {
    fn name(&self) -> &str {
        &self.name
    }

    fn current_command(&self) -> VelocityCommand {
        self.receiver.borrow().command
    }

    fn is_active(&self) -> bool {
        self.receiver.borrow().active
    }

    fn state(&self) -> ProducerState {
        *self.receiver.borrow()
    }
}

/// Write side, owned by exactly one producer task at a time.
#[derive(Debug)]
pub struct ProducerOutput {
    name: String,
    sender: watch::Sender<ProducerState>,
}

impl ProducerOutput {
    pub fn new(name: impl Into<String>) -> Self {
        let (sender, _) = watch::channel(ProducerState::IDLE);
        Self {
            name: name.into(),
            sender,
        }
    }

    pub fn handle(&self) -> ProducerHandle {
        ProducerHandle {
            name: self.name.clone(),
            receiver: self.sender.subscribe(),
        }
    }

    pub fn set(&self, state: ProducerState) {
        self.sender.send_replace(state);
    }

    /// Back to inactive/zero.
    pub fn reset(&self) {
        self.set(ProducerState::IDLE);
    }

    pub fn get(&self) -> ProducerState {
        *self.sender.borrow()
    }
}

/// Resets the output when dropped, so a cancelled or panicking producer
/// task always leaves the safe state behind.
pub(crate) struct ResetOnDrop<'a>(pub &'a ProducerOutput);

impl Drop for ResetOnDrop<'_> {
    fn drop(&mut self) {
        self.0.reset();
    }
}

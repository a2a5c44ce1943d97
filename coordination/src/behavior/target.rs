//! Runtime-selectable pursuit target.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

/// Single-field, thread-safe holder for the label pursuit should chase.
///
/// Writers (an operator console, a remote UI) call [`set`](Self::set); the
/// pursuit task reads the current value on every detection event, so a
/// change takes effect on the next `detections_found`.
#[derive(Debug, Clone)]
pub struct TargetSelector {
    sender: Arc<watch::Sender<Option<String>>>,
}

impl TargetSelector {
    pub fn new(initial: Option<String>) -> Self {
        let (sender, _) = watch::channel(normalize(initial));
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Select `label`; an empty or whitespace-only label clears the target.
    pub fn set(&self, label: impl Into<String>) {
        let target = normalize(Some(label.into()));
        info!(label = target.as_deref().unwrap_or("<none>"), "pursuit target set");
        self.sender.send_replace(target);
    }

    pub fn clear(&self) {
        info!("pursuit target cleared");
        self.sender.send_replace(None);
    }

    pub fn current(&self) -> Option<String> {
        self.sender.borrow().clone()
    }

    /// Receiver notified on every change.
    pub fn watch(&self) -> watch::Receiver<Option<String>> {
        self.sender.subscribe()
    }
}

impl Default for TargetSelector {
    fn default() -> Self {
        Self::new(None)
    }
}

fn normalize(label: Option<String>) -> Option<String> {
    label
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
}

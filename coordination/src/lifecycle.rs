//! Lifecycle container: ordered enter, guaranteed reverse-order exit.
//!
//! ```text
//! Lifecycle::run(body)
//!   → enter c1, c2, ... cN          (stop at first failure)
//!   → body                          (until a stop condition)
//!   → exit cN, ... c2, c1           (every exit runs, even if one fails)
//! ```
//!
//! A failed `enter` unwinds the components entered so far and returns the
//! error, so no partially-initialized system is left running. A panic in
//! the body still runs every exit before the panic resumes.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::events::{topics, Event, EventBus, SubscriptionId};

/// Lifecycle of a managed component.
///
/// `Created → Entered → Exiting → Exited`. Outputs of a component that is
/// not `Entered` are undefined; producers report the zero command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Created,
    Entered,
    Exiting,
    Exited,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Entered => write!(f, "entered"),
            Self::Exiting => write!(f, "exiting"),
            Self::Exited => write!(f, "exited"),
        }
    }
}

/// Something with a scoped start/stop.
///
/// `exit` must leave any shared output in its zero/safe state. It is only
/// called after `enter` returned `Ok`; an `enter` that fails must undo its
/// own partial work before returning the error.
#[async_trait]
pub trait Component: Send {
    /// Name for logs and error reports.
    fn name(&self) -> &str;

    async fn enter(&mut self) -> anyhow::Result<()>;

    async fn exit(&mut self) -> anyhow::Result<()>;
}

/// One failed `exit`.
#[derive(Debug)]
pub struct ExitFailure {
    pub component: String,
    pub error: anyhow::Error,
}

/// Error type for lifecycle operations
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("Failed to enter component '{component}': {source:#}")]
    EnterFailed {
        component: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Lifecycle body failed: {0:#}")]
    BodyFailed(#[source] anyhow::Error),

    #[error("{} component(s) failed to exit: {}", .0.len(), describe_exit_failures(.0))]
    ExitFailed(Vec<ExitFailure>),
}

fn describe_exit_failures(failures: &[ExitFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({:#})", f.component, f.error))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type for lifecycle operations
pub type LifecycleResult<T> = Result<T, LifecycleError>;

struct Slot {
    component: Box<dyn Component>,
    state: LifecycleState,
}

/// Ordered set of components managed as one scope.
#[derive(Default)]
pub struct Lifecycle {
    slots: Vec<Slot>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a component; it is entered after everything already added.
    pub fn with(mut self, component: impl Component + 'static) -> Self {
        self.push(Box::new(component));
        self
    }

    pub fn push(&mut self, component: Box<dyn Component>) {
        self.slots.push(Slot {
            component,
            state: LifecycleState::Created,
        });
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Current state of every component, in enter order.
    pub fn states(&self) -> Vec<(String, LifecycleState)> {
        self.slots
            .iter()
            .map(|s| (s.component.name().to_string(), s.state))
            .collect()
    }

    /// Enter every component, run `body`, then exit in reverse order.
    ///
    /// Errors are reported in priority order: enter failure, body failure,
    /// exit failures. Exit failures that accompany an earlier error are
    /// logged rather than returned.
    pub async fn run<F, T>(&mut self, body: F) -> LifecycleResult<T>
    where
        F: Future<Output = anyhow::Result<T>> + Send,
    {
        if let Err(e) = self.enter_all().await {
            let failures = self.exit_entered().await;
            log_suppressed(&failures);
            return Err(e);
        }

        info!(components = self.slots.len(), "all components entered");
        let outcome = AssertUnwindSafe(body).catch_unwind().await;
        let failures = self.exit_entered().await;

        match outcome {
            Err(panic) => {
                log_suppressed(&failures);
                std::panic::resume_unwind(panic)
            }
            Ok(Err(e)) => {
                log_suppressed(&failures);
                Err(LifecycleError::BodyFailed(e))
            }
            Ok(Ok(value)) if failures.is_empty() => Ok(value),
            Ok(Ok(_)) => Err(LifecycleError::ExitFailed(failures)),
        }
    }

    async fn enter_all(&mut self) -> LifecycleResult<()> {
        for slot in &mut self.slots {
            let name = slot.component.name().to_string();
            info!(component = %name, "entering");
            match slot.component.enter().await {
                Ok(()) => slot.state = LifecycleState::Entered,
                Err(source) => {
                    error!(component = %name, error = %source, "enter failed");
                    return Err(LifecycleError::EnterFailed {
                        component: name,
                        source,
                    });
                }
            }
        }
        Ok(())
    }

    async fn exit_entered(&mut self) -> Vec<ExitFailure> {
        let mut failures = Vec::new();
        for slot in self.slots.iter_mut().rev() {
            if slot.state != LifecycleState::Entered {
                continue;
            }
            let name = slot.component.name().to_string();
            slot.state = LifecycleState::Exiting;
            info!(component = %name, "exiting");

            let outcome = AssertUnwindSafe(slot.component.exit()).catch_unwind().await;
            slot.state = LifecycleState::Exited;
            let error = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(_) => anyhow::anyhow!("exit panicked"),
            };
            warn!(component = %name, error = %error, "exit failed");
            failures.push(ExitFailure {
                component: name,
                error,
            });
        }
        failures
    }
}

fn log_suppressed(failures: &[ExitFailure]) {
    for failure in failures {
        warn!(
            component = %failure.component,
            error = %failure.error,
            "exit failure suppressed by earlier error"
        );
    }
}

/// Enter `components` in order, run `body`, exit in reverse order.
pub async fn run<F, T>(components: Vec<Box<dyn Component>>, body: F) -> LifecycleResult<T>
where
    F: Future<Output = anyhow::Result<T>> + Send,
{
    let mut lifecycle = Lifecycle::new();
    for component in components {
        lifecycle.push(component);
    }
    lifecycle.run(body).await
}

// ── Stop condition ───────────────────────────────────────────────────────────

/// Process-wide stop request, settable from signals, events or code.
///
/// The first reason given wins; later triggers are no-ops.
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<String>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.reason.set(reason.clone()).is_ok() {
            info!(reason = %reason, "shutdown requested");
        }
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait for the stop request and return its reason.
    pub async fn wait(&self) -> String {
        self.token.cancelled().await;
        self.reason.get().cloned().unwrap_or_default()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Trigger on `system/shutdown` events published on `bus`.
    pub fn listen_on(&self, bus: &EventBus) -> SubscriptionId {
        let signal = self.clone();
        bus.subscribe_fn(topics::SYSTEM_SHUTDOWN, move |event| {
            if let Event::Shutdown { reason } = event {
                signal.trigger(reason.clone());
            }
            Ok(())
        })
    }

    /// Trigger on Ctrl-C and, on unix, SIGTERM.
    pub fn spawn_os_listener(&self) -> JoinHandle<()> {
        let signal = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = signal.token.cancelled() => {}
                reason = wait_for_os_signal() => signal.trigger(reason),
            }
        })
    }
}

#[cfg(unix)]
async fn wait_for_os_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => tokio::select! {
            _ = tokio::signal::ctrl_c() => "interrupt",
            _ = term.recv() => "terminate",
        },
        Err(e) => {
            warn!(error = %e, "SIGTERM handler unavailable; listening for Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
            "interrupt"
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_os_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "interrupt"
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Probe {
        name: &'static str,
        log: Log,
        fail_enter: bool,
        fail_exit: bool,
    }

    impl Probe {
        fn new(name: &'static str, log: &Log) -> Self {
            Self {
                name,
                log: Arc::clone(log),
                fail_enter: false,
                fail_exit: false,
            }
        }
    }

    #[async_trait]
    impl Component for Probe {
        fn name(&self) -> &str {
            self.name
        }

        async fn enter(&mut self) -> anyhow::Result<()> {
            if self.fail_enter {
                anyhow::bail!("{} refused to start", self.name);
            }
            self.log.lock().unwrap().push(format!("enter {}", self.name));
            Ok(())
        }

        async fn exit(&mut self) -> anyhow::Result<()> {
            self.log.lock().unwrap().push(format!("exit {}", self.name));
            if self.fail_exit {
                anyhow::bail!("{} failed to stop", self.name);
            }
            Ok(())
        }
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn test_enter_in_order_exit_in_reverse() {
        let log = Log::default();
        let mut lifecycle = Lifecycle::new()
            .with(Probe::new("bus", &log))
            .with(Probe::new("server", &log))
            .with(Probe::new("commander", &log));

        let value = lifecycle.run(async { Ok(7) }).await.unwrap();

        assert_eq!(value, 7);
        assert_eq!(
            entries(&log),
            vec![
                "enter bus",
                "enter server",
                "enter commander",
                "exit commander",
                "exit server",
                "exit bus"
            ]
        );
        assert!(lifecycle
            .states()
            .iter()
            .all(|(_, state)| *state == LifecycleState::Exited));
    }

    #[tokio::test]
    async fn test_enter_failure_unwinds_entered_components() {
        let log = Log::default();
        let mut failing = Probe::new("server", &log);
        failing.fail_enter = true;
        let mut lifecycle = Lifecycle::new()
            .with(Probe::new("bus", &log))
            .with(failing)
            .with(Probe::new("commander", &log));

        let err = lifecycle.run(async { Ok(()) }).await.unwrap_err();

        assert!(matches!(err, LifecycleError::EnterFailed { ref component, .. } if component == "server"));
        assert_eq!(entries(&log), vec!["enter bus", "exit bus"]);
        let states = lifecycle.states();
        assert_eq!(states[1].1, LifecycleState::Created);
        assert_eq!(states[2].1, LifecycleState::Created);
    }

    #[tokio::test]
    async fn test_every_exit_runs_when_one_fails() {
        let log = Log::default();
        let mut failing = Probe::new("server", &log);
        failing.fail_exit = true;
        let mut lifecycle = Lifecycle::new()
            .with(Probe::new("bus", &log))
            .with(failing)
            .with(Probe::new("commander", &log));

        let err = lifecycle.run(async { Ok(()) }).await.unwrap_err();

        match err {
            LifecycleError::ExitFailed(failures) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].component, "server");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(
            &entries(&log)[3..],
            &["exit commander", "exit server", "exit bus"]
        );
    }

    #[tokio::test]
    async fn test_body_error_still_exits_everything() {
        let log = Log::default();
        let components: Vec<Box<dyn Component>> = vec![
            Box::new(Probe::new("a", &log)),
            Box::new(Probe::new("b", &log)),
        ];

        let err = run(components, async { anyhow::bail!("lost the camera") })
            .await
            .map(|()| ())
            .unwrap_err();

        assert!(matches!(err, LifecycleError::BodyFailed(_)));
        assert_eq!(entries(&log), vec!["enter a", "enter b", "exit b", "exit a"]);
    }

    #[tokio::test]
    async fn test_body_panic_exits_then_resumes_panic() {
        let log = Log::default();
        let task_log = Arc::clone(&log);

        let handle = tokio::spawn(async move {
            let mut lifecycle = Lifecycle::new()
                .with(Probe::new("a", &task_log))
                .with(Probe::new("b", &task_log));
            lifecycle
                .run(async {
                    if true {
                        panic!("body blew up");
                    }
                    Ok(())
                })
                .await
        });

        let join = handle.await;
        assert!(join.unwrap_err().is_panic());
        assert_eq!(entries(&log), vec!["enter a", "enter b", "exit b", "exit a"]);
    }

    #[tokio::test]
    async fn test_shutdown_signal_first_reason_wins() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_triggered());

        signal.trigger("operator");
        signal.trigger("interrupt");

        assert!(signal.is_triggered());
        assert_eq!(signal.wait().await, "operator");
    }

    #[tokio::test]
    async fn test_shutdown_signal_listens_on_bus() {
        let bus = EventBus::new();
        let signal = ShutdownSignal::new();
        signal.listen_on(&bus);
        bus.start().unwrap();

        bus.publish(Event::shutdown("mission complete")).unwrap();

        let reason = tokio::time::timeout(std::time::Duration::from_secs(2), signal.wait())
            .await
            .unwrap();
        assert_eq!(reason, "mission complete");
        bus.stop().await.unwrap();
    }
}

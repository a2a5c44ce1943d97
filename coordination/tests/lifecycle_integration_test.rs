//! Lifecycle container integration tests with the real bus as one of the
//! managed components.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rover_coordination::lifecycle::ExitFailure;
use rover_coordination::{
    Component, Event, EventBus, Lifecycle, LifecycleError, LifecycleState, ShutdownSignal,
};

type Journal = Arc<Mutex<Vec<String>>>;

struct Recorder {
    name: String,
    journal: Journal,
    fail_enter: bool,
    fail_exit: bool,
}

impl Recorder {
    fn new(name: &str, journal: &Journal) -> Self {
        Self {
            name: name.to_string(),
            journal: Arc::clone(journal),
            fail_enter: false,
            fail_exit: false,
        }
    }
}

#[async_trait]
impl Component for Recorder {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enter(&mut self) -> anyhow::Result<()> {
        if self.fail_enter {
            anyhow::bail!("{} refused to start", self.name);
        }
        self.journal.lock().unwrap().push(format!("enter {}", self.name));
        Ok(())
    }

    async fn exit(&mut self) -> anyhow::Result<()> {
        self.journal.lock().unwrap().push(format!("exit {}", self.name));
        if self.fail_exit {
            anyhow::bail!("{} failed to stop", self.name);
        }
        Ok(())
    }
}

fn entries(journal: &Journal) -> Vec<String> {
    journal.lock().unwrap().clone()
}

#[tokio::test]
async fn exits_in_reverse_enter_order() {
    let journal = Journal::default();
    let mut lifecycle = Lifecycle::new()
        .with(Recorder::new("a", &journal))
        .with(Recorder::new("b", &journal))
        .with(Recorder::new("c", &journal));

    let value = lifecycle.run(async { Ok(42) }).await.unwrap();

    assert_eq!(value, 42);
    assert_eq!(
        entries(&journal),
        vec!["enter a", "enter b", "enter c", "exit c", "exit b", "exit a"]
    );
    assert!(lifecycle
        .states()
        .iter()
        .all(|(_, state)| *state == LifecycleState::Exited));
}

#[tokio::test]
async fn enter_failure_unwinds_only_entered_components() {
    let journal = Journal::default();
    let mut broken = Recorder::new("b", &journal);
    broken.fail_enter = true;

    let mut lifecycle = Lifecycle::new()
        .with(Recorder::new("a", &journal))
        .with(broken)
        .with(Recorder::new("c", &journal));

    let body_ran = Arc::new(Mutex::new(false));
    let flag = Arc::clone(&body_ran);
    let err = lifecycle
        .run(async move {
            *flag.lock().unwrap() = true;
            Ok(())
        })
        .await
        .unwrap_err();

    assert!(matches!(err, LifecycleError::EnterFailed { ref component, .. } if component == "b"));
    assert!(!*body_ran.lock().unwrap());
    // The component whose enter failed is never exited.
    assert_eq!(entries(&journal), vec!["enter a", "exit a"]);
}

#[tokio::test]
async fn body_error_wins_over_exit_errors() {
    let journal = Journal::default();
    let mut sticky = Recorder::new("a", &journal);
    sticky.fail_exit = true;

    let mut lifecycle = Lifecycle::new().with(sticky);
    let err = lifecycle
        .run(async { Err::<(), _>(anyhow::anyhow!("body broke")) })
        .await
        .unwrap_err();

    assert!(matches!(err, LifecycleError::BodyFailed(_)));
    assert_eq!(entries(&journal), vec!["enter a", "exit a"]);
}

#[tokio::test]
async fn exit_failures_are_collected() {
    let journal = Journal::default();
    let mut first = Recorder::new("a", &journal);
    first.fail_exit = true;
    let mut second = Recorder::new("b", &journal);
    second.fail_exit = true;

    let mut lifecycle = Lifecycle::new().with(first).with(second);
    let err = lifecycle.run(async { Ok(()) }).await.unwrap_err();

    match err {
        LifecycleError::ExitFailed(failures) => {
            let names: Vec<_> = failures
                .iter()
                .map(|f: &ExitFailure| f.component.as_str())
                .collect();
            assert_eq!(names, vec!["b", "a"]);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn body_panic_still_exits_everything() {
    let journal = Journal::default();
    let inner = Arc::clone(&journal);

    let handle = tokio::spawn(async move {
        let mut lifecycle = Lifecycle::new()
            .with(Recorder::new("a", &inner))
            .with(Recorder::new("b", &inner));
        lifecycle
            .run(async {
                if inner.lock().unwrap().len() == 2 {
                    panic!("body exploded");
                }
                Ok(())
            })
            .await
    });

    let join = handle.await;
    assert!(join.unwrap_err().is_panic());
    assert_eq!(
        entries(&journal),
        vec!["enter a", "enter b", "exit b", "exit a"]
    );
}

#[tokio::test]
async fn shutdown_event_ends_the_body() {
    let bus = EventBus::new();
    let shutdown = ShutdownSignal::new();
    shutdown.listen_on(&bus);

    let journal = Journal::default();
    let mut lifecycle = Lifecycle::new()
        .with(bus.clone())
        .with(Recorder::new("worker", &journal));

    let publisher = bus.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        publisher.publish(Event::shutdown("test over")).unwrap();
    });

    let reason = tokio::time::timeout(
        Duration::from_secs(2),
        lifecycle.run(async { Ok(shutdown.wait().await) }),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(reason, "test over");
    assert!(!bus.is_running());
    assert_eq!(entries(&journal), vec!["enter worker", "exit worker"]);
}

//! In-process event bus.
//!
//! Publishing enqueues onto an unbounded FIFO and returns immediately. A
//! single dispatch task drains the queue and invokes every handler
//! registered for the event's topic, sequentially and in subscription
//! order. Handler errors and panics are logged and swallowed.
//!
//! ```text
//! publish() ──▶ [ seq | Arc<Event> ] queue ──▶ dispatch task ──▶ handler 1
//!                                                           ├──▶ handler 2
//!                                                           └──▶ ...
//! ```
//!
//! The bus is an explicit object, not a process singleton: every
//! [`EventBus`] owns its own queue and subscriber table, and clones are
//! handles onto the same bus.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::types::Event;
use crate::lifecycle::{Component, LifecycleState};

/// Error type for event bus operations
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Channel closed")]
    ChannelClosed,

    #[error("Event bus is already running")]
    AlreadyRunning,

    #[error("Dispatch task failed: {0}")]
    DispatchFailed(String),
}

/// Result type for event bus operations
pub type EventBusResult<T> = Result<T, EventBusError>;

/// A subscriber callback.
///
/// Handlers run on the bus's dispatch task. Anything slow should hand the
/// event off to its own task instead of awaiting it here.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, event: Arc<Event>) -> anyhow::Result<()>;
}

/// Adapter for plain synchronous closures.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
{
    async fn handle(&self, event: Arc<Event>) -> anyhow::Result<()> {
        (self.0)(&event)
    }
}

/// Forwards every event into an unbounded channel, for consumers that
/// process events on their own task.
pub struct ChannelHandler(pub mpsc::UnboundedSender<Arc<Event>>);

#[async_trait]
impl EventHandler for ChannelHandler {
    async fn handle(&self, event: Arc<Event>) -> anyhow::Result<()> {
        self.0
            .send(event)
            .map_err(|_| anyhow::anyhow!("consumer task is gone"))
    }
}

/// Keeps only the newest event in a `watch` slot (newest-wins hand-off).
pub struct LatestHandler(pub watch::Sender<Option<Arc<Event>>>);

#[async_trait]
impl EventHandler for LatestHandler {
    async fn handle(&self, event: Arc<Event>) -> anyhow::Result<()> {
        self.0.send_replace(Some(event));
        Ok(())
    }
}

/// Identifies one registration, for [`EventBus::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    /// Last sequence number published before this registration.
    since: u64,
    handler: Arc<dyn EventHandler>,
}

struct Envelope {
    seq: u64,
    event: Arc<Event>,
}

#[derive(Default)]
struct Counters {
    published: u64,
    next_subscription: u64,
}

struct Dispatcher {
    cancel: CancellationToken,
    handle: JoinHandle<mpsc::UnboundedReceiver<Envelope>>,
}

struct Shared {
    subscribers: RwLock<HashMap<String, Vec<Subscription>>>,
    counters: Mutex<Counters>,
    sender: mpsc::UnboundedSender<Envelope>,
    /// Queue receiver while no dispatch task owns it.
    parked: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
    dispatcher: Mutex<Option<Dispatcher>>,
    state: Mutex<LifecycleState>,
}

/// Shared reference to EventBus
pub type SharedEventBus = Arc<EventBus>;

/// Typed publish/subscribe bus with a single FIFO dispatch task.
#[derive(Clone)]
pub struct EventBus {
    shared: Arc<Shared>,
}

impl EventBus {
    /// Create a stopped bus. Events published before [`start`](Self::start)
    /// are queued and delivered once dispatch begins.
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                subscribers: RwLock::new(HashMap::new()),
                counters: Mutex::new(Counters::default()),
                sender,
                parked: Mutex::new(Some(receiver)),
                dispatcher: Mutex::new(None),
                state: Mutex::new(LifecycleState::Created),
            }),
        }
    }

    /// Create a shared reference to this event bus
    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    /// Register `handler` for exact-match `event_type`.
    ///
    /// The handler only sees events published after this call returns.
    pub fn subscribe(
        &self,
        event_type: impl Into<String>,
        handler: impl EventHandler,
    ) -> SubscriptionId {
        self.subscribe_arc(event_type, Arc::new(handler))
    }

    /// Register a synchronous closure.
    pub fn subscribe_fn<F>(&self, event_type: impl Into<String>, f: F) -> SubscriptionId
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe(event_type, FnHandler(f))
    }

    pub fn subscribe_arc(
        &self,
        event_type: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionId {
        let event_type = event_type.into();
        // Holding the counters lock orders this registration against
        // concurrent publishes: anything with seq <= since is backlog.
        let mut counters = lock(&self.shared.counters);
        let id = SubscriptionId(counters.next_subscription);
        counters.next_subscription += 1;
        let since = counters.published;

        write(&self.shared.subscribers)
            .entry(event_type.clone())
            .or_default()
            .push(Subscription { id, since, handler });
        drop(counters);

        debug!(event_type = %event_type, subscription = id.0, "handler subscribed");
        id
    }

    /// Remove a registration. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = write(&self.shared.subscribers);
        let mut removed = false;
        for handlers in subscribers.values_mut() {
            let before = handlers.len();
            handlers.retain(|s| s.id != id);
            removed |= handlers.len() != before;
        }
        subscribers.retain(|_, handlers| !handlers.is_empty());
        removed
    }

    /// Enqueue `event` for asynchronous delivery.
    ///
    /// Returns as soon as the event is queued; never waits on subscribers.
    pub fn publish(&self, event: Event) -> EventBusResult<()> {
        let mut counters = lock(&self.shared.counters);
        let seq = counters.published + 1;
        trace!(event_type = %event.event_type(), seq, "event queued");
        self.shared
            .sender
            .send(Envelope {
                seq,
                event: Arc::new(event),
            })
            .map_err(|_| EventBusError::ChannelClosed)?;
        counters.published = seq;
        Ok(())
    }

    /// Number of handlers registered for `event_type`.
    pub fn subscriber_count(&self, event_type: &str) -> usize {
        read(&self.shared.subscribers)
            .get(event_type)
            .map_or(0, Vec::len)
    }

    /// Total number of events accepted by [`publish`](Self::publish).
    pub fn published_count(&self) -> u64 {
        lock(&self.shared.counters).published
    }

    pub fn state(&self) -> LifecycleState {
        *lock(&self.shared.state)
    }

    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Entered
    }

    /// Spawn the dispatch task.
    pub fn start(&self) -> EventBusResult<()> {
        let mut dispatcher = lock(&self.shared.dispatcher);
        if dispatcher.is_some() {
            return Err(EventBusError::AlreadyRunning);
        }
        let mut receiver = lock(&self.shared.parked)
            .take()
            .ok_or(EventBusError::ChannelClosed)?;

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                _ = dispatch_loop(&shared, &mut receiver) => {}
            }
            receiver
        });

        *dispatcher = Some(Dispatcher { cancel, handle });
        *lock(&self.shared.state) = LifecycleState::Entered;
        info!("event bus started");
        Ok(())
    }

    /// Cancel the dispatch task and wait for it to finish.
    ///
    /// Once this returns no handler is running and none will be invoked
    /// until the bus is started again. Undelivered events stay queued.
    pub async fn stop(&self) -> EventBusResult<()> {
        let Some(dispatcher) = lock(&self.shared.dispatcher).take() else {
            return Ok(());
        };
        *lock(&self.shared.state) = LifecycleState::Exiting;
        dispatcher.cancel.cancel();

        let result = match dispatcher.handle.await {
            Ok(receiver) => {
                *lock(&self.shared.parked) = Some(receiver);
                Ok(())
            }
            Err(e) => Err(EventBusError::DispatchFailed(e.to_string())),
        };
        *lock(&self.shared.state) = LifecycleState::Exited;
        info!("event bus stopped");
        result
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Component for EventBus {
    fn name(&self) -> &str {
        "event_bus"
    }

    async fn enter(&mut self) -> anyhow::Result<()> {
        self.start()?;
        Ok(())
    }

    async fn exit(&mut self) -> anyhow::Result<()> {
        self.stop().await?;
        Ok(())
    }
}

async fn dispatch_loop(shared: &Shared, receiver: &mut mpsc::UnboundedReceiver<Envelope>) {
    while let Some(envelope) = receiver.recv().await {
        let event_type = envelope.event.event_type();
        let handlers: Vec<(SubscriptionId, Arc<dyn EventHandler>)> = read(&shared.subscribers)
            .get(event_type)
            .map(|subs| {
                subs.iter()
                    .filter(|s| s.since < envelope.seq)
                    .map(|s| (s.id, Arc::clone(&s.handler)))
                    .collect()
            })
            .unwrap_or_default();

        trace!(event_type, seq = envelope.seq, handlers = handlers.len(), "dispatching");

        for (id, handler) in handlers {
            let outcome = AssertUnwindSafe(handler.handle(Arc::clone(&envelope.event)))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(event_type, subscription = id.0, error = %e, "event handler failed");
                }
                Err(panic) => {
                    warn!(
                        event_type,
                        subscription = id.0,
                        panic = %panic_message(panic.as_ref()),
                        "event handler panicked"
                    );
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(l: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(l: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}

//! Actuator link: forwards `drive/set_velocity` to the motor controller.
//!
//! Wire format is one JSON object per line:
//!
//! ```text
//! {"left":0.4,"right":0.4}\n
//! ```
//!
//! Only the newest command matters, so the link keeps a single pending
//! slot rather than a queue. If no command arrives within the heartbeat
//! timeout the link sends zero on its own. Connection loss is handled by
//! reconnecting lazily on the next send after a fixed backoff.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{topics, Event, EventBus, LatestHandler, SubscriptionId};
use crate::lifecycle::Component;
use crate::motion::VelocityCommand;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActuatorConfig {
    /// Motor controller `host:port`.
    pub address: String,
    pub reconnect_backoff_ms: u64,
    pub heartbeat_timeout_ms: u64,
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:9000".to_string(),
            reconnect_backoff_ms: 1000,
            heartbeat_timeout_ms: 500,
        }
    }
}

impl ActuatorConfig {
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms.max(1))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ActuatorError {
    #[error("Failed to connect to actuator at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Actuator connection timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Actuator unavailable; next attempt in {0:?}")]
    Backoff(Duration),

    #[error("Actuator write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Result type for actuator operations
pub type ActuatorResult<T> = Result<T, ActuatorError>;

/// Encode a command as one protocol line.
pub fn encode_command(command: &VelocityCommand) -> ActuatorResult<Vec<u8>> {
    let command = VelocityCommand::new(command.left, command.right);
    let mut line = serde_json::to_vec(&command)?;
    line.push(b'\n');
    Ok(line)
}

/// Lazily (re)connecting line writer.
struct Connection {
    address: String,
    backoff: Duration,
    writer: Option<BufWriter<TcpStream>>,
    retry_at: Option<Instant>,
}

impl Connection {
    fn new(config: &ActuatorConfig) -> Self {
        Self {
            address: config.address.clone(),
            backoff: config.reconnect_backoff(),
            writer: None,
            retry_at: None,
        }
    }

    async fn connect(&mut self) -> ActuatorResult<&mut BufWriter<TcpStream>> {
        if self.writer.is_none() {
            if let Some(retry_at) = self.retry_at {
                let now = Instant::now();
                if now < retry_at {
                    return Err(ActuatorError::Backoff(retry_at - now));
                }
            }
            let timeout = self.backoff.max(Duration::from_millis(100));
            let stream = match tokio::time::timeout(timeout, TcpStream::connect(&self.address)).await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(source)) => {
                    self.retry_at = Some(Instant::now() + self.backoff);
                    return Err(ActuatorError::Connect {
                        addr: self.address.clone(),
                        source,
                    });
                }
                Err(_) => {
                    self.retry_at = Some(Instant::now() + self.backoff);
                    return Err(ActuatorError::ConnectTimeout(timeout));
                }
            };
            stream.set_nodelay(true)?;
            info!(addr = %self.address, "actuator connected");
            self.retry_at = None;
            self.writer = Some(BufWriter::new(stream));
        }
        self.writer
            .as_mut()
            .ok_or(ActuatorError::Backoff(Duration::ZERO))
    }

    async fn send(&mut self, command: &VelocityCommand) -> ActuatorResult<()> {
        let line = encode_command(command)?;
        let writer = self.connect().await?;
        let written = async {
            writer.write_all(&line).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = written {
            warn!(addr = %self.address, error = %e, "actuator connection lost");
            self.writer = None;
            self.retry_at = Some(Instant::now() + self.backoff);
            return Err(e.into());
        }
        Ok(())
    }

    /// Final stop: ignores the backoff so a recently failed link still gets
    /// one attempt.
    async fn send_final(&mut self, command: &VelocityCommand) -> ActuatorResult<()> {
        self.retry_at = None;
        self.send(command).await?;
        if let Some(mut writer) = self.writer.take() {
            writer.shutdown().await?;
        }
        Ok(())
    }
}

pub struct ActuatorLink {
    bus: EventBus,
    config: ActuatorConfig,
    subscription: Option<SubscriptionId>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ActuatorLink {
    pub fn new(bus: EventBus, config: ActuatorConfig) -> Self {
        Self {
            bus,
            config,
            subscription: None,
            cancel: CancellationToken::new(),
            task: None,
        }
    }
}

#[async_trait]
impl Component for ActuatorLink {
    fn name(&self) -> &str {
        "actuator_link"
    }

    async fn enter(&mut self) -> anyhow::Result<()> {
        let (sender, receiver) = watch::channel(None);
        self.subscription = Some(
            self.bus
                .subscribe(topics::DRIVE_SET_VELOCITY, LatestHandler(sender)),
        );
        self.cancel = CancellationToken::new();
        self.task = Some(tokio::spawn(drive(
            receiver,
            Connection::new(&self.config),
            self.config.heartbeat_timeout(),
            self.cancel.clone(),
        )));
        info!(addr = %self.config.address, "actuator link started");
        Ok(())
    }

    async fn exit(&mut self) -> anyhow::Result<()> {
        self.cancel.cancel();
        if let Some(id) = self.subscription.take() {
            self.bus.unsubscribe(id);
        }
        if let Some(task) = self.task.take() {
            task.await?;
        }
        info!("actuator link stopped");
        Ok(())
    }
}

async fn drive(
    mut commands: watch::Receiver<Option<Arc<Event>>>,
    mut connection: Connection,
    heartbeat: Duration,
    cancel: CancellationToken,
) {
    let mut stale = false;

    loop {
        let command = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            changed = commands.changed() => {
                if changed.is_err() {
                    break;
                }
                let latest = commands.borrow_and_update().clone();
                let Some(event) = latest else { continue };
                let Event::SetVelocity(command) = event.as_ref() else { continue };
                if stale {
                    info!("drive commands resumed");
                    stale = false;
                }
                *command
            }
            _ = tokio::time::sleep(heartbeat) => {
                if !stale {
                    warn!(timeout_ms = heartbeat.as_millis() as u64, "no drive command within heartbeat; stopping motors");
                    stale = true;
                }
                VelocityCommand::ZERO
            }
        };

        match connection.send(&command).await {
            Ok(()) => debug!(%command, "command sent"),
            Err(ActuatorError::Backoff(_)) => {}
            Err(e) => warn!(error = %e, "failed to send drive command"),
        }
    }

    match connection.send_final(&VelocityCommand::ZERO).await {
        Ok(()) => info!("final stop sent to actuator"),
        Err(e) => warn!(error = %e, "failed to send final stop"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    #[test]
    fn test_encode_command_line() {
        let line = encode_command(&VelocityCommand::new(0.5, -0.25)).unwrap();
        assert_eq!(line, b"{\"left\":0.5,\"right\":-0.25}\n");
    }

    #[test]
    fn test_encode_clamps_literal_command() {
        let line = encode_command(&VelocityCommand {
            left: 4.0,
            right: f32::NAN,
        })
        .unwrap();
        assert_eq!(line, b"{\"left\":1.0,\"right\":0.0}\n");
    }

    #[tokio::test]
    async fn test_forwards_commands_and_stops_on_exit() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = ActuatorConfig {
            address: listener.local_addr().unwrap().to_string(),
            reconnect_backoff_ms: 50,
            heartbeat_timeout_ms: 10_000,
        };

        let bus = EventBus::new();
        let mut link = ActuatorLink::new(bus.clone(), config);
        link.enter().await.unwrap();
        bus.start().unwrap();

        bus.publish(Event::SetVelocity(VelocityCommand::forward(0.4)))
            .unwrap();
        let (socket, _) = listener.accept().await.unwrap();
        let mut lines = BufReader::new(socket).lines();

        let first: VelocityCommand =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(first, VelocityCommand::forward(0.4));

        bus.stop().await.unwrap();
        link.exit().await.unwrap();

        let last: VelocityCommand =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert!(last.is_zero());
        assert!(lines.next_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_heartbeat_timeout_sends_zero() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = ActuatorConfig {
            address: listener.local_addr().unwrap().to_string(),
            reconnect_backoff_ms: 50,
            heartbeat_timeout_ms: 30,
        };

        let bus = EventBus::new();
        let mut link = ActuatorLink::new(bus.clone(), config);
        link.enter().await.unwrap();

        let (socket, _) = tokio::time::timeout(Duration::from_secs(1), listener.accept())
            .await
            .unwrap()
            .unwrap();
        let mut lines = BufReader::new(socket).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let command: VelocityCommand = serde_json::from_str(&line).unwrap();
        assert!(command.is_zero());

        link.exit().await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_actuator_does_not_fail_lifecycle() {
        let address = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let bus = EventBus::new();
        let mut link = ActuatorLink::new(
            bus.clone(),
            ActuatorConfig {
                address,
                reconnect_backoff_ms: 20,
                heartbeat_timeout_ms: 10,
            },
        );
        link.enter().await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        link.exit().await.unwrap();
    }
}

//! Operator console.
//!
//! Line-oriented commands on stdin, tokenised shell-style:
//!
//! ```text
//! target <label>      pursue objects labeled <label>
//! clear-target        stop pursuing; wandering resumes
//! stop [reason..]     publish safety/stop
//! resume [reason..]   publish safety/clear
//! status              print latch, target and last arbitration
//! quit                publish system/shutdown
//! ```

use async_trait::async_trait;
use rover_coordination::behavior::TargetSelector;
use rover_coordination::{Arbitration, Component, Event, EventBus, LatchView};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const HELP: &str = "commands: target <label> | clear-target | stop [reason] | resume [reason] | status | quit";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum OperatorError {
    #[error("unbalanced quotes")]
    Unbalanced,

    #[error("`{0}` needs an argument")]
    MissingArgument(&'static str),

    #[error("unknown command `{0}`")]
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorCommand {
    Target(String),
    ClearTarget,
    Stop(String),
    Resume(String),
    Status,
    Help,
    Quit,
}

impl OperatorCommand {
    /// Parse one input line. Blank lines yield `Ok(None)`.
    pub fn parse(line: &str) -> Result<Option<Self>, OperatorError> {
        let words = shlex::split(line).ok_or(OperatorError::Unbalanced)?;
        let Some((head, rest)) = words.split_first() else {
            return Ok(None);
        };
        let reason = |default: &str| {
            if rest.is_empty() {
                default.to_string()
            } else {
                rest.join(" ")
            }
        };

        let command = match head.as_str() {
            "target" => {
                let label = rest.join(" ");
                if label.trim().is_empty() {
                    return Err(OperatorError::MissingArgument("target"));
                }
                Self::Target(label)
            }
            "clear-target" => Self::ClearTarget,
            "stop" => Self::Stop(reason("operator stop")),
            "resume" => Self::Resume(reason("operator resume")),
            "status" => Self::Status,
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            other => return Err(OperatorError::Unknown(other.to_string())),
        };
        Ok(Some(command))
    }
}

struct Console {
    bus: EventBus,
    selector: TargetSelector,
    latch: LatchView,
    arbitration: watch::Receiver<Option<Arbitration>>,
}

impl Console {
    /// Apply a command and return the reply line.
    fn apply(&self, command: OperatorCommand) -> anyhow::Result<String> {
        let reply = match command {
            OperatorCommand::Target(label) => {
                self.selector.set(label.clone());
                info!(label = %label, "operator selected target");
                format!("target set to '{label}'")
            }
            OperatorCommand::ClearTarget => {
                self.selector.clear();
                info!("operator cleared target");
                "target cleared".to_string()
            }
            OperatorCommand::Stop(reason) => {
                self.bus.publish(Event::safety_stop(reason))?;
                "stop requested".to_string()
            }
            OperatorCommand::Resume(reason) => {
                self.bus.publish(Event::safety_clear(reason))?;
                "resume requested".to_string()
            }
            OperatorCommand::Status => {
                let target = self.selector.current();
                let last = match *self.arbitration.borrow() {
                    Some(a) => format!("{} {}", a.source, a.command),
                    None => "none".to_string(),
                };
                format!(
                    "safety={} target={} last={}",
                    self.latch.state(),
                    target.as_deref().unwrap_or("<none>"),
                    last
                )
            }
            OperatorCommand::Help => HELP.to_string(),
            OperatorCommand::Quit => {
                self.bus.publish(Event::shutdown("operator quit"))?;
                "shutting down".to_string()
            }
        };
        Ok(reply)
    }
}

pub struct OperatorConsole<R, W> {
    console: Option<(Console, R, W)>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl<R, W> OperatorConsole<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(
        bus: EventBus,
        selector: TargetSelector,
        latch: LatchView,
        arbitration: watch::Receiver<Option<Arbitration>>,
        input: R,
        output: W,
    ) -> Self {
        let console = Console {
            bus,
            selector,
            latch,
            arbitration,
        };
        Self {
            console: Some((console, input, output)),
            cancel: CancellationToken::new(),
            task: None,
        }
    }
}

#[async_trait]
impl<R, W> Component for OperatorConsole<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    fn name(&self) -> &str {
        "operator_console"
    }

    async fn enter(&mut self) -> anyhow::Result<()> {
        let (console, input, output) = self
            .console
            .take()
            .ok_or_else(|| anyhow::anyhow!("operator console input already consumed"))?;
        self.cancel = CancellationToken::new();
        self.task = Some(tokio::spawn(read_commands(
            console,
            input,
            output,
            self.cancel.clone(),
        )));
        info!("operator console ready");
        Ok(())
    }

    async fn exit(&mut self) -> anyhow::Result<()> {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.await?;
        }
        Ok(())
    }
}

async fn read_commands<R, W>(console: Console, input: R, mut output: W, cancel: CancellationToken)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(input).lines();
    loop {
        let line = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("operator input closed");
                break;
            }
            Err(e) => {
                warn!(error = %e, "failed to read operator input");
                break;
            }
        };

        let reply = match OperatorCommand::parse(&line) {
            Ok(None) => continue,
            Ok(Some(command)) => console
                .apply(command)
                .unwrap_or_else(|e| format!("error: {e}")),
            Err(e) => format!("error: {e}; {HELP}"),
        };
        let written = async {
            output.write_all(reply.as_bytes()).await?;
            output.write_all(b"\n").await?;
            output.flush().await
        }
        .await;
        if let Err(e) = written {
            warn!(error = %e, "failed to write operator reply");
            break;
        }
    }
}

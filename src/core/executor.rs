//! Task Executor - runs one external command at a time and captures it
//!
//! The child is spawned with `kill_on_drop`, and every exit path that gives up
//! on it (timeout, cancellation) kills and reaps it before returning.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Which pipe an output line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Task execution event
#[derive(Debug, Clone)]
pub enum TaskEvent {
    Started { task_id: String, command: String },
    Output { task_id: String, stream: Stream, line: String },
    Completed { task_id: String, exit_code: i32 },
    Failed { task_id: String, error: String },
}

/// What to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    /// Passed to `sh -c`
    Shell(String),
    /// Program and arguments, no shell involved
    Argv(Vec<String>),
}

impl Invocation {
    pub fn display(&self) -> String {
        match self {
            Invocation::Shell(script) => script.clone(),
            Invocation::Argv(argv) => argv.join(" "),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProcessOptions {
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
}

/// Outcome of one finished command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub task: String,
    /// `None` when the process was ended by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub started_at: DateTime<Utc>,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Why a run was given up on
enum Interrupt {
    TimedOut,
    Cancelled,
}

/// Task executor - spawns commands, streams their output as events
#[derive(Clone, Default)]
pub struct Executor {
    event_tx: Option<mpsc::UnboundedSender<TaskEvent>>,
    cancel: CancellationToken,
}

impl Executor {
    /// Create an executor that reports events on the returned channel
    pub fn new(cancel: CancellationToken) -> (Self, mpsc::UnboundedReceiver<TaskEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                event_tx: Some(tx),
                cancel,
            },
            rx,
        )
    }

    /// Executor without an event channel
    pub fn quiet(cancel: CancellationToken) -> Self {
        Self {
            event_tx: None,
            cancel,
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn emit(&self, event: TaskEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    /// Run a command to completion. A non-zero exit is still `Ok`; the
    /// caller decides what failure means.
    pub async fn execute(
        &self,
        task_id: &str,
        invocation: Invocation,
        options: &ProcessOptions,
    ) -> Result<ExecutionResult> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled {
                task: task_id.to_string(),
            });
        }

        let display = invocation.display();
        let mut command = match invocation {
            Invocation::Shell(script) => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(script);
                cmd
            }
            Invocation::Argv(argv) => {
                let Some((program, args)) = argv.split_first() else {
                    return Err(Error::Spawn {
                        task: task_id.to_string(),
                        source: std::io::Error::new(
                            std::io::ErrorKind::InvalidInput,
                            "empty command",
                        ),
                    });
                };
                let mut cmd = Command::new(program);
                cmd.args(args);
                cmd
            }
        };

        if let Some(dir) = &options.working_dir {
            command.current_dir(dir);
        }
        command
            .envs(&options.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        log::info!("Starting task: {} with command: {}", task_id, display);
        let started_at = Utc::now();
        let clock = Instant::now();

        let mut child = command.spawn().map_err(|source| Error::Spawn {
            task: task_id.to_string(),
            source,
        })?;
        self.emit(TaskEvent::Started {
            task_id: task_id.to_string(),
            command: display,
        });

        let mut stdout_reader = self.capture(task_id, Stream::Stdout, child.stdout.take());
        let mut stderr_reader = self.capture(task_id, Stream::Stderr, child.stderr.take());

        let deadline = async {
            match options.timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline);

        let waited = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => Ok(status),
                Err(source) => {
                    reap(task_id, &mut child).await;
                    return Err(Error::Spawn { task: task_id.to_string(), source });
                }
            },
            _ = &mut deadline => Err(Interrupt::TimedOut),
            _ = self.cancel.cancelled() => Err(Interrupt::Cancelled),
        };

        let interrupt = match waited {
            Ok(status) => {
                // a background grandchild can hold the pipes open after the exit
                let drained = tokio::select! {
                    (stdout, stderr) = async {
                        tokio::join!(&mut stdout_reader, &mut stderr_reader)
                    } => Ok((stdout.unwrap_or_default(), stderr.unwrap_or_default())),
                    _ = &mut deadline => Err(Interrupt::TimedOut),
                    _ = self.cancel.cancelled() => Err(Interrupt::Cancelled),
                };
                match drained {
                    Ok((stdout, stderr)) => {
                        let result =
                            self.finished(task_id, status, stdout, stderr, clock, started_at);
                        return Ok(result);
                    }
                    Err(interrupt) => {
                        log::warn!("Task {} exited but its output pipes stayed open", task_id);
                        interrupt
                    }
                }
            }
            Err(interrupt) => {
                reap(task_id, &mut child).await;
                interrupt
            }
        };

        stdout_reader.abort();
        stderr_reader.abort();
        match interrupt {
            Interrupt::TimedOut => {
                let timeout = options.timeout.unwrap_or_default();
                self.emit(TaskEvent::Failed {
                    task_id: task_id.to_string(),
                    error: format!("Timed out after {:?}", timeout),
                });
                Err(Error::TaskTimeout {
                    task: task_id.to_string(),
                    timeout,
                })
            }
            Interrupt::Cancelled => {
                self.emit(TaskEvent::Failed {
                    task_id: task_id.to_string(),
                    error: "Cancelled".to_string(),
                });
                Err(Error::Cancelled {
                    task: task_id.to_string(),
                })
            }
        }
    }

    fn finished(
        &self,
        task_id: &str,
        status: ExitStatus,
        stdout: String,
        stderr: String,
        clock: Instant,
        started_at: DateTime<Utc>,
    ) -> ExecutionResult {
        let exit_code = status.code();
        match exit_code {
            Some(0) => {
                log::info!("Task {} completed (exit: 0)", task_id);
                self.emit(TaskEvent::Completed {
                    task_id: task_id.to_string(),
                    exit_code: 0,
                });
            }
            _ => {
                log::warn!("Task {} failed (exit: {:?})", task_id, exit_code);
                self.emit(TaskEvent::Failed {
                    task_id: task_id.to_string(),
                    error: format!("Process exited with {}", status),
                });
            }
        }

        ExecutionResult {
            task: task_id.to_string(),
            exit_code,
            stdout,
            stderr,
            duration: clock.elapsed(),
            started_at,
        }
    }

    /// Read a pipe line by line, forwarding each line as an event
    fn capture<R>(&self, task_id: &str, stream: Stream, pipe: Option<R>) -> JoinHandle<String>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let task_id = task_id.to_string();
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            let mut captured = String::new();
            let Some(pipe) = pipe else {
                return captured;
            };

            let mut lines = BufReader::new(pipe).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        captured.push_str(&line);
                        captured.push('\n');
                        if let Some(tx) = &event_tx {
                            let _ = tx.send(TaskEvent::Output {
                                task_id: task_id.clone(),
                                stream,
                                line,
                            });
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        log::warn!("Task {} {:?} read error: {}", task_id, stream, e);
                        break;
                    }
                }
            }
            captured
        })
    }
}

/// Kill the child and wait for it so no zombie is left behind
async fn reap(task_id: &str, child: &mut Child) {
    if let Err(e) = child.kill().await {
        log::warn!("Failed to kill task {}: {}", task_id, e);
    }
}

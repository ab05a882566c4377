//! External command execution.
//!
//! Commands are argument vectors, never shell strings: source and destination
//! names flow into arguments verbatim and are never re-parsed by an
//! interpreter, so behaviour is the same on every host platform.
//!
//! stdout and stderr are drained on two independent tasks while the caller
//! waits for the exit status, so a child writing heavily to one stream can
//! never block on a full pipe.

use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::errors::MigrationError;

/// How long drains may keep reading after the child exited. A grandchild that
/// inherited the pipes can hold them open indefinitely.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Program plus arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Build from an argv prefix such as `["java", "-jar", "bfg.jar"]`.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, rest) = argv.split_first()?;
        Some(Self {
            program: program.clone(),
            args: rest.to_vec(),
        })
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: StreamKind,
    pub line: String,
}

/// Receives every line a child writes, in emission order per stream.
pub type LineConsumer = Arc<dyn Fn(OutputLine) + Send + Sync>;

/// Forward child output to this process's own stdout/stderr.
pub fn passthrough_consumer() -> LineConsumer {
    Arc::new(|output: OutputLine| match output.stream {
        StreamKind::Stdout => println!("{}", output.line),
        StreamKind::Stderr => eprintln!("{}", output.line),
    })
}

/// Abstraction over process execution for testability.
/// Real implementation: `ProcessRunner`.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `command` in `dir` and return its exit code (`None` when killed by a signal).
    async fn run(&self, dir: &Path, command: &CommandLine) -> Result<Option<i32>, MigrationError>;

    /// Run `command`, treating any non-zero exit as a failure.
    async fn run_checked(&self, dir: &Path, command: &CommandLine) -> Result<(), MigrationError> {
        match self.run(dir, command).await? {
            Some(0) => Ok(()),
            code => Err(MigrationError::ProcessFailure {
                command: command.to_string(),
                code,
            }),
        }
    }
}

pub struct ProcessRunner {
    consumer: LineConsumer,
    timeout: Option<Duration>,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(passthrough_consumer())
    }
}

impl ProcessRunner {
    pub fn new(consumer: LineConsumer) -> Self {
        Self {
            consumer,
            timeout: None,
        }
    }

    /// Kill children that run longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, dir: &Path, command: &CommandLine) -> Result<Option<i32>, MigrationError> {
        tracing::info!(command = %command, dir = %dir.display(), "exec");

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| MigrationError::SpawnFailed {
                command: command.to_string(),
                source,
            })?;

        let mut drains = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            drains.push(spawn_drain(stdout, StreamKind::Stdout, self.consumer.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            drains.push(spawn_drain(stderr, StreamKind::Stderr, self.consumer.clone()));
        }

        let waited = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(waited) => waited,
                Err(_) => {
                    if let Err(e) = child.kill().await {
                        tracing::warn!(command = %command, error = %e, "failed to kill timed out child");
                    }
                    abandon(drains);
                    return Err(MigrationError::Timeout {
                        command: command.to_string(),
                        secs: limit.as_secs(),
                    });
                }
            },
            None => child.wait().await,
        };
        let status = waited.map_err(|e| {
            MigrationError::Other(anyhow::Error::new(e).context(format!("Failed to wait for `{}`", command)))
        })?;

        finish_drains(drains).await;

        tracing::info!(command = %command, code = ?status.code(), "exit");
        Ok(status.code())
    }
}

fn spawn_drain<R>(reader: R, stream: StreamKind, consumer: LineConsumer) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    while matches!(buf.last(), Some(b'\n' | b'\r')) {
                        buf.pop();
                    }
                    consumer(OutputLine {
                        stream,
                        line: String::from_utf8_lossy(&buf).into_owned(),
                    });
                }
                Err(e) => {
                    tracing::warn!(?stream, error = %e, "output drain stopped");
                    break;
                }
            }
        }
    })
}

async fn finish_drains(drains: Vec<JoinHandle<()>>) {
    for mut drain in drains {
        match tokio::time::timeout(DRAIN_GRACE, &mut drain).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "output drain panicked"),
            Err(_) => {
                tracing::warn!("output still open after child exit, abandoning drain");
                drain.abort();
            }
        }
    }
}

fn abandon(drains: Vec<JoinHandle<()>>) {
    for drain in drains {
        drain.abort();
    }
}

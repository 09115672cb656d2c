// Seam between the provisioner and the operating system: runs the VM helper
// scripts and signals the VM process.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use vmrunner_sdk::{send_signal, ProcessInvoker, ProcessSignal, TraceWriter};

/// One external command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub arguments: Vec<String>,
    pub working_directory: PathBuf,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>, working_directory: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            arguments: Vec::new(),
            working_directory: working_directory.into(),
        }
    }

    pub fn arg(mut self, argument: impl Into<String>) -> Self {
        self.arguments.push(argument.into());
        self
    }

    /// `program arg1 arg2 ...`, for diagnostics.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.display().to_string())
            .chain(self.arguments.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutcome {
    pub exit_code: i32,
    /// Full standard error, newline separated.
    pub stderr: String,
}

#[async_trait]
pub trait ProcessHost: Send + Sync {
    /// Run `command` to completion. Each stdout line is passed to `on_stdout`
    /// as it arrives. A non-zero exit is an `Ok` outcome; `Err` means the
    /// process could not be run at all or was killed by `cancel_token`.
    async fn run(
        &self,
        command: &CommandSpec,
        on_stdout: &mut (dyn for<'a> FnMut(&'a str) + Send),
        cancel_token: CancellationToken,
    ) -> Result<CommandOutcome>;

    fn signal(&self, pid: i32, signal: ProcessSignal) -> Result<()>;
}

/// [`ProcessHost`] backed by [`ProcessInvoker`].
pub struct InvokerProcessHost {
    trace: Arc<dyn TraceWriter>,
}

impl InvokerProcessHost {
    pub fn new(trace: Arc<dyn TraceWriter>) -> Self {
        Self { trace }
    }
}

#[async_trait]
impl ProcessHost for InvokerProcessHost {
    async fn run(
        &self,
        command: &CommandSpec,
        on_stdout: &mut (dyn for<'a> FnMut(&'a str) + Send),
        cancel_token: CancellationToken,
    ) -> Result<CommandOutcome> {
        let mut invoker = ProcessInvoker::new(Arc::clone(&self.trace));
        let mut stdout = invoker
            .take_stdout_receiver()
            .context("stdout receiver already taken")?;
        let mut stderr = invoker
            .take_stderr_receiver()
            .context("stderr receiver already taken")?;

        // The channels close when the task drops the invoker.
        let spec = command.clone();
        let execution = tokio::spawn(async move {
            invoker
                .execute(
                    &spec.working_directory,
                    &spec.program,
                    &spec.arguments,
                    None,
                    false,
                    true,
                    cancel_token,
                )
                .await
        });

        let mut stderr_lines = Vec::new();
        let (mut stdout_open, mut stderr_open) = (true, true);
        while stdout_open || stderr_open {
            tokio::select! {
                line = stdout.recv(), if stdout_open => match line {
                    Some(line) => on_stdout(&line.data),
                    None => stdout_open = false,
                },
                line = stderr.recv(), if stderr_open => match line {
                    Some(line) => stderr_lines.push(line.data),
                    None => stderr_open = false,
                },
            }
        }

        let exit_code = execution
            .await
            .with_context(|| format!("Process task for '{}' failed", command.command_line()))??;

        Ok(CommandOutcome {
            exit_code,
            stderr: stderr_lines.join("\n"),
        })
    }

    fn signal(&self, pid: i32, signal: ProcessSignal) -> Result<()> {
        send_signal(pid, signal)
    }
}

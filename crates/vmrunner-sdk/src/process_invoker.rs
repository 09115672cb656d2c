use crate::trace::TraceWriter;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// The duration to wait after sending SIGINT before escalating to SIGTERM.
const SIGINT_TIMEOUT: Duration = Duration::from_millis(7500);
/// The duration to wait after sending SIGTERM before escalating to SIGKILL.
const SIGTERM_TIMEOUT: Duration = Duration::from_millis(2500);

/// Error type for non-zero process exit codes.
#[derive(Debug, thiserror::Error)]
#[error("Exit code {exit_code} returned from process: file name '{file_name}', arguments '{arguments}'.")]
pub struct ProcessExitCodeError {
    pub exit_code: i32,
    pub file_name: String,
    pub arguments: String,
}

/// A line received from stdout or stderr.
#[derive(Debug, Clone)]
pub struct ProcessDataReceivedEventArgs {
    pub data: String,
}

/// Signals the runner sends to processes it does not own a handle for
/// (e.g. the VM whose pid is only known from its pid file).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    Interrupt,
    Terminate,
    Kill,
}

impl std::fmt::Display for ProcessSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessSignal::Interrupt => write!(f, "SIGINT"),
            ProcessSignal::Terminate => write!(f, "SIGTERM"),
            ProcessSignal::Kill => write!(f, "SIGKILL"),
        }
    }
}

/// Send `signal` to the process identified by `pid`.
#[cfg(unix)]
pub fn send_signal(pid: i32, signal: ProcessSignal) -> Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let sig = match signal {
        ProcessSignal::Interrupt => Signal::SIGINT,
        ProcessSignal::Terminate => Signal::SIGTERM,
        ProcessSignal::Kill => Signal::SIGKILL,
    };
    kill(Pid::from_raw(pid), sig).with_context(|| format!("Failed to send {signal} to process {pid}"))
}

#[cfg(not(unix))]
pub fn send_signal(pid: i32, signal: ProcessSignal) -> Result<()> {
    anyhow::bail!("Sending {signal} to process {pid} is only supported on unix hosts")
}

/// Spawns a child process, streams its stdout/stderr line by line through
/// channels, and tears it down gracefully (SIGINT → SIGTERM → SIGKILL) when
/// the cancellation token fires.
///
/// The channels close once the invoker is dropped, so callers typically move
/// the invoker into a task and drain the receivers until they return `None`.
pub struct ProcessInvoker {
    trace: Arc<dyn TraceWriter>,
    stdout_tx: mpsc::UnboundedSender<ProcessDataReceivedEventArgs>,
    stdout_rx: Option<mpsc::UnboundedReceiver<ProcessDataReceivedEventArgs>>,
    stderr_tx: mpsc::UnboundedSender<ProcessDataReceivedEventArgs>,
    stderr_rx: Option<mpsc::UnboundedReceiver<ProcessDataReceivedEventArgs>>,
}

impl ProcessInvoker {
    pub fn new(trace: Arc<dyn TraceWriter>) -> Self {
        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel();
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();
        Self {
            trace,
            stdout_tx,
            stdout_rx: Some(stdout_rx),
            stderr_tx,
            stderr_rx: Some(stderr_rx),
        }
    }

    /// Take the stdout receiver. Only the first call returns `Some`.
    pub fn take_stdout_receiver(
        &mut self,
    ) -> Option<mpsc::UnboundedReceiver<ProcessDataReceivedEventArgs>> {
        self.stdout_rx.take()
    }

    /// Take the stderr receiver. Only the first call returns `Some`.
    pub fn take_stderr_receiver(
        &mut self,
    ) -> Option<mpsc::UnboundedReceiver<ProcessDataReceivedEventArgs>> {
        self.stderr_rx.take()
    }

    /// Run `file_name` with `arguments` and wait for it to exit.
    ///
    /// Returns the exit code. When `require_exit_code_zero` is set a non-zero
    /// exit becomes a [`ProcessExitCodeError`]. When `kill_process_on_cancel`
    /// is set cancellation skips the graceful signals and kills immediately.
    #[allow(clippy::too_many_arguments)]
    pub async fn execute(
        &self,
        working_directory: &Path,
        file_name: &Path,
        arguments: &[String],
        environment: Option<&HashMap<String, String>>,
        require_exit_code_zero: bool,
        kill_process_on_cancel: bool,
        cancellation_token: CancellationToken,
    ) -> Result<i32> {
        let joined_args = arguments.join(" ");
        self.trace.info("Starting process:");
        self.trace
            .info(&format!("  File name: '{}'", file_name.display()));
        self.trace.info(&format!("  Arguments: '{joined_args}'"));
        self.trace.info(&format!(
            "  Working directory: '{}'",
            working_directory.display()
        ));
        self.trace.info(&format!(
            "  Require exit code zero: '{require_exit_code_zero}'"
        ));

        let mut cmd = Command::new(file_name);
        cmd.args(arguments);

        if working_directory.is_dir() {
            cmd.current_dir(working_directory);
        }

        if let Some(env) = environment {
            cmd.envs(env);
        }

        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.stdin(std::process::Stdio::null());

        let start = std::time::Instant::now();
        let mut child = cmd.spawn().with_context(|| {
            format!(
                "Failed to start process '{}' with arguments '{joined_args}'",
                file_name.display()
            )
        })?;

        let pid = child.id().unwrap_or(0);
        self.trace.info(&format!(
            "Process started with process id {pid}, waiting for process exit."
        ));

        let stdout_task = spawn_line_reader(
            child.stdout.take(),
            self.stdout_tx.clone(),
            self.trace.clone(),
            "STDOUT",
        );
        let stderr_task = spawn_line_reader(
            child.stderr.take(),
            self.stderr_tx.clone(),
            self.trace.clone(),
            "STDERR",
        );

        let exit_code: i32;
        let was_cancelled;

        tokio::select! {
            status = child.wait() => {
                was_cancelled = false;
                exit_code = status
                    .context("Failed to wait for process")?
                    .code()
                    .unwrap_or(-1);
            }
            _ = cancellation_token.cancelled() => {
                was_cancelled = true;
                self.trace.info("Cancellation requested.");
                exit_code = self.cancel_and_kill_process(&mut child, kill_process_on_cancel).await;
            }
        }

        if was_cancelled {
            // Orphaned grandchildren can keep the pipes open indefinitely.
            stdout_task.abort();
            stderr_task.abort();
        } else {
            let _ = stdout_task.await;
            let _ = stderr_task.await;
        }

        let elapsed = start.elapsed();
        self.trace.info(&format!(
            "Finished process {pid} with exit code {exit_code}, and elapsed time {elapsed:.2?}."
        ));

        if was_cancelled {
            anyhow::bail!("Process was cancelled");
        }

        if exit_code != 0 && require_exit_code_zero {
            return Err(ProcessExitCodeError {
                exit_code,
                file_name: file_name.display().to_string(),
                arguments: joined_args,
            }
            .into());
        }

        Ok(exit_code)
    }

    async fn cancel_and_kill_process(
        &self,
        child: &mut tokio::process::Child,
        kill_immediately: bool,
    ) -> i32 {
        if !kill_immediately {
            for (signal, timeout) in [
                (ProcessSignal::Interrupt, SIGINT_TIMEOUT),
                (ProcessSignal::Terminate, SIGTERM_TIMEOUT),
            ] {
                if self.send_signal_and_wait(child, signal, timeout).await {
                    self.trace
                        .info(&format!("Process exited after {signal}."));
                    return exit_code_of(child).await;
                }
            }
        }

        self.trace
            .info("Killing the process since it ignored the cancel and terminate signals.");
        let _ = child.kill().await;
        exit_code_of(child).await
    }

    /// Returns `true` if the child exited within `timeout` after `signal`.
    async fn send_signal_and_wait(
        &self,
        child: &mut tokio::process::Child,
        signal: ProcessSignal,
        timeout: Duration,
    ) -> bool {
        let Some(pid) = child.id() else {
            return true;
        };

        self.trace.info(&format!("Sending {signal} to process {pid}."));
        if let Err(e) = send_signal(pid as i32, signal) {
            self.trace.info(&format!("{e:#}"));
            return false;
        }

        tokio::select! {
            result = child.wait() => result.is_ok(),
            _ = tokio::time::sleep(timeout) => {
                self.trace.info(&format!(
                    "Process did not honor {signal} within {:.1}s.",
                    timeout.as_secs_f64()
                ));
                false
            }
        }
    }
}

fn spawn_line_reader<R>(
    stream: Option<R>,
    tx: mpsc::UnboundedSender<ProcessDataReceivedEventArgs>,
    trace: Arc<dyn TraceWriter>,
    name: &'static str,
) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        if let Some(stream) = stream {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let _ = tx.send(ProcessDataReceivedEventArgs { data: line });
            }
        }
        trace.verbose(&format!("{name} stream read finished."));
    })
}

async fn exit_code_of(child: &mut tokio::process::Child) -> i32 {
    child
        .wait()
        .await
        .map(|s| s.code().unwrap_or(-1))
        .unwrap_or(-1)
}

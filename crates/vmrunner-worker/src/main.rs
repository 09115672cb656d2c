// Entry point for the VM runner worker process.
//
// Reads one job request message, runs it inside a freshly booted VM and exits
// with a return code that encodes the job's `TaskResult`.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use vmrunner_common::{HostContext, ShutdownReason, TaskResult, TaskResultUtil};

use vmrunner_worker::worker::Worker;

/// Command-line arguments for the worker process.
#[derive(Parser, Debug)]
#[command(name = "vmrunner-worker", about = "Runs a CI job inside a dedicated VM")]
struct Args {
    /// Path to the job request message (JSON), or `-` for stdin.
    #[arg(long, default_value = "-")]
    message: String,

    /// Runner root directory. Defaults to the parent of the binary's directory.
    #[arg(long)]
    root: Option<PathBuf>,
}

fn main() {
    let args = Args::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build Tokio runtime");

    let exit_code = runtime.block_on(async move { run(args).await });

    std::process::exit(exit_code);
}

async fn run(args: Args) -> i32 {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("Worker process starting.");
    tracing::info!("  message = {}", args.message);

    let host_context = HostContext::new("Worker");
    if let Some(root) = args.root {
        host_context.set_root_override(root);
    }
    register_shutdown_signals(&host_context);

    let message = match Worker::read_message(&args.message) {
        Ok(message) => message,
        Err(e) => {
            tracing::error!("{:#}", e);
            return TaskResultUtil::translate_to_return_code(TaskResult::Failed);
        }
    };

    let worker = Worker::new(Arc::clone(&host_context));
    match worker.run_async(message).await {
        Ok(result) => {
            let return_code = TaskResultUtil::translate_to_return_code(result);
            tracing::info!(
                "Worker completed with result {} (return code {})",
                result,
                return_code
            );
            return_code
        }
        Err(e) => {
            tracing::error!("Worker failed with error: {:#}", e);
            TaskResultUtil::translate_to_return_code(TaskResult::Failed)
        }
    }
}

/// Ctrl-C cancels the job as a user cancellation, SIGTERM as an OS shutdown.
fn register_shutdown_signals(host_context: &Arc<HostContext>) {
    let context = Arc::clone(host_context);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Ctrl-C received, cancelling the job");
                context.shutdown_runner(ShutdownReason::UserCancelled);
            }
            Err(e) => tracing::warn!("Failed to listen for ctrl-c: {}", e),
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let context = Arc::clone(host_context);
        tokio::spawn(async move {
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    tracing::info!("SIGTERM received, cancelling the job");
                    context.shutdown_runner(ShutdownReason::OperatingSystemShutdown);
                }
                Err(e) => tracing::warn!("Failed to listen for SIGTERM: {}", e),
            }
        });
    }
}

// Process-wide context: directory layout, trace sources, secret masking and
// coordinated runner shutdown.

use crate::constants::{self, WellKnownConfigFile, WellKnownDirectory};
use crate::secret_masker::SecretMasker;
use crate::tracing::{TraceManager, TraceSetting, Tracing};

use parking_lot::Mutex;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use vmrunner_sdk::TraceWriter;

/// Why the runner is shutting down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl-C, or the runner service was stopped.
    UserCancelled,
    /// The host itself is going down.
    OperatingSystemShutdown,
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownReason::UserCancelled => write!(f, "UserCancelled"),
            ShutdownReason::OperatingSystemShutdown => write!(f, "OperatingSystemShutdown"),
        }
    }
}

/// Shared application context for one worker process.
pub struct HostContext {
    host_type: String,
    runner_shutdown_token: CancellationToken,
    runner_shutdown_reason: Mutex<Option<ShutdownReason>>,
    pub secret_masker: Arc<SecretMasker>,
    trace_manager: TraceManager,
    root_override: Mutex<Option<PathBuf>>,
    work_folder_override: Mutex<Option<PathBuf>>,
}

impl HostContext {
    /// `host_type` names the process in diagnostics, e.g. `"Worker"`.
    pub fn new(host_type: impl Into<String>) -> Arc<Self> {
        let secret_masker = Arc::new(SecretMasker::new());

        let print_to_stdout = env::var(constants::variables::agent::PRINT_LOG_TO_STDOUT)
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
            .unwrap_or(false);
        let trace_manager = TraceManager::with_setting(
            secret_masker.clone(),
            TraceSetting {
                print_to_stdout,
                ..TraceSetting::default()
            },
        );

        Arc::new(Self {
            host_type: host_type.into(),
            runner_shutdown_token: CancellationToken::new(),
            runner_shutdown_reason: Mutex::new(None),
            secret_masker,
            trace_manager,
            root_override: Mutex::new(None),
            work_folder_override: Mutex::new(None),
        })
    }

    pub fn host_type(&self) -> &str {
        &self.host_type
    }

    // -----------------------------------------------------------------------
    // Directories
    // -----------------------------------------------------------------------

    pub fn set_root_override(&self, path: PathBuf) {
        *self.root_override.lock() = Some(path);
    }

    /// Relative paths are resolved against the root directory.
    pub fn set_work_folder(&self, work_folder: &str) {
        let path = Path::new(work_folder);
        let full_path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.get_directory(WellKnownDirectory::Root).join(path)
        };
        *self.work_folder_override.lock() = Some(full_path);
    }

    pub fn get_directory(&self, directory: WellKnownDirectory) -> PathBuf {
        match directory {
            WellKnownDirectory::Bin => env::current_exe()
                .ok()
                .and_then(|p| p.parent().map(Path::to_path_buf))
                .unwrap_or_else(|| PathBuf::from(".")),

            WellKnownDirectory::Root => {
                if let Some(root) = self.root_override.lock().clone() {
                    return root;
                }
                let bin = self.get_directory(WellKnownDirectory::Bin);
                bin.parent().map(Path::to_path_buf).unwrap_or(bin)
            }

            WellKnownDirectory::Diag => self
                .get_directory(WellKnownDirectory::Root)
                .join(constants::path::DIAG_DIRECTORY),

            WellKnownDirectory::Temp => self
                .get_directory(WellKnownDirectory::Work)
                .join(constants::path::TEMP_DIRECTORY),

            WellKnownDirectory::Tools => env::var(constants::variables::agent::TOOLS_DIRECTORY)
                .ok()
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| {
                    self.get_directory(WellKnownDirectory::Work)
                        .join(constants::path::TOOL_DIRECTORY)
                }),

            WellKnownDirectory::Virt => env::var(constants::variables::agent::VIRT_DIRECTORY)
                .ok()
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| {
                    let root = self.get_directory(WellKnownDirectory::Root);
                    root.parent()
                        .map(Path::to_path_buf)
                        .unwrap_or(root)
                        .join(constants::path::VIRT_DIRECTORY)
                }),

            WellKnownDirectory::Work => {
                if let Some(work) = self.work_folder_override.lock().clone() {
                    return work;
                }
                self.get_directory(WellKnownDirectory::Root)
                    .join(constants::path::WORK_DIRECTORY)
            }
        }
    }

    pub fn get_config_file(&self, config_file: WellKnownConfigFile) -> PathBuf {
        match config_file {
            WellKnownConfigFile::Runner => self.get_directory(WellKnownDirectory::Root).join(".runner"),
        }
    }

    // -----------------------------------------------------------------------
    // Tracing
    // -----------------------------------------------------------------------

    pub fn get_trace(&self, name: &str) -> Tracing {
        self.trace_manager.get(name)
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Token cancelled once [`HostContext::shutdown_runner`] is called.
    pub fn runner_shutdown_token(&self) -> CancellationToken {
        self.runner_shutdown_token.clone()
    }

    pub fn runner_shutdown_reason(&self) -> Option<ShutdownReason> {
        *self.runner_shutdown_reason.lock()
    }

    /// Record the reason first so observers woken by the token can read it.
    pub fn shutdown_runner(&self, reason: ShutdownReason) {
        self.get_trace("HostContext")
            .info(&format!("Runner will be shutdown for {}", reason));
        *self.runner_shutdown_reason.lock() = Some(reason);
        self.runner_shutdown_token.cancel();
    }
}

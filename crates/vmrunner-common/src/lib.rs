// vmrunner-common: shared services for the VM job runner.
// Depends only on `vmrunner-sdk`.

pub mod config_store;
pub mod constants;
pub mod host_context;
pub mod secret_masker;
pub mod tracing;
pub mod util;

pub use config_store::{ConfigurationStore, PullRequestSecuritySettings, RunnerSettings};
pub use constants::{OsPlatform, WellKnownConfigFile, WellKnownDirectory, CURRENT_PLATFORM};
pub use host_context::{HostContext, ShutdownReason};
pub use secret_masker::SecretMasker;
pub use self::tracing::{TraceEventType, TraceManager, TraceSetting, Tracing};
pub use util::task_result_util::{TaskResult, TaskResultUtil};

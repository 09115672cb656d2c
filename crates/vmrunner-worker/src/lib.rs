// vmrunner-worker: runs one job inside a freshly booted VM.
// Depends on `vmrunner-sdk` and `vmrunner-common`.
//
// Architecture:
//   Worker::run_async → JobRunner::run_async
//     → EnvironmentProvider::provision → SecurityGate::evaluate
//     → JobExtension::initialize_job → StepsRunner::run_async → JobExtension::finalize_job
//     → CompletionReporter::complete
//     → (always) EnvironmentProvider::teardown + job server queue shutdown

pub mod completion;
pub mod environment;
pub mod execution_context;
pub mod github_context;
pub mod job_extension;
pub mod job_runner;
pub mod job_server;
pub mod job_server_queue;
pub mod security_gate;
pub mod steps_runner;
pub mod temp_directory_manager;
pub mod variables;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_support;

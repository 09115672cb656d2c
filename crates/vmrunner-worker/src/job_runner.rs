// JobRunner: the job lifecycle.
//
// Initializing → Provisioning → SecurityGate → Executing → Finalizing, then
// completion reporting. Every path converges on the same completion call, and
// the VM is torn down afterwards no matter how the body ended (including a
// panic in a collaborator).

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use vmrunner_common::{
    ConfigurationStore, HostContext, ShutdownReason, TaskResult, Tracing, WellKnownDirectory,
    CURRENT_PLATFORM,
};
use vmrunner_sdk::{IOUtil, TraceWriter};

use crate::completion::{CompletionError, CompletionReporter};
use crate::environment::{
    EnvironmentHandle, EnvironmentProvider, InvokerProcessHost, ProvisioningError, VmProvisioner,
};
use crate::execution_context::{ExecutionContext, Global, IssueReporter};
use crate::github_context::GitHubContext;
use crate::job_extension::{DefaultJobExtension, JobExtension};
use crate::job_server::{JobServer, VssJobServer};
use crate::job_server_queue::{JobServerQueue, LocalJobServerQueue, ScopedJobServerQueue};
use crate::security_gate::{PolicySource, SecurityGate};
use crate::steps_runner::{ScriptStepsRunner, StepsRunner};
use crate::temp_directory_manager::TempDirectoryManager;
use crate::variables::Variables;
use crate::worker::AgentJobRequestMessage;

const SECURITY_POLICY_DENIED: &str = "Running job on this worker disallowed by security policy";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStage {
    Initializing,
    Provisioning,
    SecurityGate,
    Executing,
    Finalizing,
    Teardown,
    Completed,
}

impl std::fmt::Display for JobStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Collaborators of one job run.
pub struct JobServices {
    pub environment: Arc<dyn EnvironmentProvider>,
    pub job_server: Arc<dyn JobServer>,
    pub job_server_queue: Box<dyn JobServerQueue>,
    pub job_extension: Arc<dyn JobExtension>,
    pub steps_runner: Arc<dyn StepsRunner>,
    pub policy: Arc<dyn PolicySource>,
}

impl JobServices {
    pub fn production(
        host_context: &Arc<HostContext>,
        config_store: Arc<ConfigurationStore>,
    ) -> Result<Self> {
        let process_host = Arc::new(InvokerProcessHost::new(Arc::new(
            host_context.get_trace("ProcessInvoker"),
        )));
        Ok(Self {
            environment: Arc::new(VmProvisioner::new(
                process_host,
                host_context.get_trace("VmProvisioner"),
            )),
            job_server: Arc::new(VssJobServer::new()?),
            job_server_queue: Box::new(LocalJobServerQueue::new(host_context)),
            job_extension: Arc::new(DefaultJobExtension::new()),
            steps_runner: Arc::new(ScriptStepsRunner::new(Arc::clone(host_context))),
            policy: config_store,
        })
    }
}

pub struct JobRunner {
    host_context: Arc<HostContext>,
    services: JobServices,
    instance: u8,
}

impl JobRunner {
    pub fn new(host_context: Arc<HostContext>, services: JobServices, instance: u8) -> Self {
        Self {
            host_context,
            services,
            instance,
        }
    }

    /// Run the job to completion and return its final result.
    ///
    /// A malformed request is rejected with `Err` before anything starts.
    /// Once the lifecycle has started the only error is the completion
    /// event failing every publish attempt.
    pub async fn run_async(
        self,
        message: AgentJobRequestMessage,
        cancel_token: CancellationToken,
    ) -> Result<TaskResult> {
        let JobServices {
            environment,
            job_server,
            job_server_queue,
            job_extension,
            steps_runner,
            policy,
        } = self.services;
        let host_context = self.host_context;
        let trace = host_context.get_trace("JobRunner");
        let job_start_time = Utc::now();

        trace.info(&format!("Job: {}", JobStage::Initializing));
        message.validate()?;
        let image = message.image()?.to_string();
        let workspace = EnvironmentHandle::workspace_for(message.repository_name()?);

        job_server
            .connect(message.system_connection()?)
            .context("Failed to connect to the job server")?;
        let mut queue =
            ScopedJobServerQueue::new(job_server_queue, host_context.get_trace("JobServerQueue"));
        queue.start(&message);

        // The handle only derives paths, so it exists before provisioning and
        // teardown can run after a partial failure.
        let handle = EnvironmentHandle::new(
            self.instance,
            host_context.get_directory(WellKnownDirectory::Virt),
            workspace.clone(),
        );
        let variables = Variables::from_message(&message, &host_context.secret_masker);
        handle.export_variables(&variables);
        let global = Global::from_message(&message, variables, workspace, cancel_token);
        let mut ctx = ExecutionContext::new_root(
            Arc::clone(&host_context),
            global,
            message.job_display_name.clone(),
        );
        let mut temp_directory = TempDirectoryManager::new(Arc::clone(&host_context));

        let lifecycle = Lifecycle {
            reporter: CompletionReporter::new(
                job_server,
                host_context.get_trace("CompletionReporter"),
            ),
            host_context: Arc::clone(&host_context),
            trace: trace.clone(),
            environment: Arc::clone(&environment),
            job_extension,
            steps_runner,
            policy,
            image,
            job_start_time,
        };

        let outcome = AssertUnwindSafe(lifecycle.run(
            &mut ctx,
            &message,
            &handle,
            &mut queue,
            &mut temp_directory,
        ))
        .catch_unwind()
        .await;

        trace.info(&format!("Job: {}", JobStage::Teardown));
        environment.teardown(&handle, &mut ctx).await;
        // A no-op unless the body ended before completion reporting.
        let _ = queue.shutdown(false).await;
        temp_directory.cleanup();

        match outcome {
            Ok(Ok(result)) => {
                trace.info(&format!("Job: {} with result {}", JobStage::Completed, result));
                Ok(result)
            }
            Ok(Err(e)) => {
                trace.error(&format!("{}", e));
                Err(e.into())
            }
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

/// The job body, from provisioning up to and including completion reporting.
struct Lifecycle {
    host_context: Arc<HostContext>,
    trace: Tracing,
    environment: Arc<dyn EnvironmentProvider>,
    job_extension: Arc<dyn JobExtension>,
    steps_runner: Arc<dyn StepsRunner>,
    policy: Arc<dyn PolicySource>,
    reporter: CompletionReporter,
    image: String,
    job_start_time: DateTime<Utc>,
}

impl Lifecycle {
    fn enter(&self, stage: JobStage) {
        self.trace.info(&format!("Job: {}", stage));
    }

    async fn run(
        &self,
        ctx: &mut ExecutionContext,
        message: &AgentJobRequestMessage,
        handle: &EnvironmentHandle,
        queue: &mut ScopedJobServerQueue,
        temp_directory: &mut TempDirectoryManager,
    ) -> Result<TaskResult, CompletionError> {
        let result = self.execute(ctx, message, handle, temp_directory).await;
        self.reporter
            .complete(ctx, message, result, queue, temp_directory)
            .await
    }

    /// Returns the override result for completion, `None` when the job
    /// result is whatever the steps accumulated.
    async fn execute(
        &self,
        ctx: &mut ExecutionContext,
        message: &AgentJobRequestMessage,
        handle: &EnvironmentHandle,
        temp_directory: &mut TempDirectoryManager,
    ) -> Option<TaskResult> {
        // Registered before provisioning so a shutdown also stops the VM boot.
        let _observer = ShutdownObserver::register(&self.host_context, ctx);

        if let Err(e) = temp_directory.initialize(ctx) {
            ctx.error(&format!("{:#}", e));
            return Some(TaskResult::Failed);
        }

        self.enter(JobStage::Provisioning);
        match self.environment.provision(handle, &self.image, ctx).await {
            Ok(()) => {}
            Err(ProvisioningError::Cancelled) => {
                self.trace.info("Provisioning was cancelled.");
                return Some(TaskResult::Canceled);
            }
            Err(e) => {
                self.trace.error(&format!("Provisioning failed: {}", e));
                return Some(TaskResult::Failed);
            }
        }

        self.enter(JobStage::SecurityGate);
        let github = GitHubContext::from_message(message);
        let decision = SecurityGate::evaluate(github.as_ref(), self.policy.as_ref(), &self.trace);
        if !decision.allowed {
            self.trace
                .info(&format!("Security gate denied the job: {}", decision.reason));
            ctx.error(SECURITY_POLICY_DENIED);
            return Some(TaskResult::Failed);
        }
        self.trace
            .info(&format!("Security gate allowed the job: {}", decision.reason));

        self.enter(JobStage::Executing);

        let work = self.host_context.get_directory(WellKnownDirectory::Work);
        if let Err(e) = std::fs::create_dir_all(&work)
            .with_context(|| format!("Failed to create {}", work.display()))
            .and_then(|()| IOUtil::validate_execute_permission(&work))
        {
            ctx.error(&format!("{:#}", e));
            return Some(TaskResult::Failed);
        }

        self.set_runner_context(ctx);

        let steps = match self.job_extension.initialize_job(ctx, message).await {
            Ok(steps) => steps,
            Err(e) if ctx.cancel_token().is_cancelled() => {
                self.trace
                    .error(&format!("Job is cancelled during initialize: {:#}", e));
                return Some(TaskResult::Canceled);
            }
            Err(e) => {
                self.trace.error(&format!("Job initialize failed: {:#}", e));
                return Some(TaskResult::Failed);
            }
        };

        let run = AssertUnwindSafe(self.steps_runner.run_async(ctx, steps))
            .catch_unwind()
            .await;
        match run {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.trace.error(&format!("Steps execution failed: {:#}", e));
                ctx.error(&format!("{:#}", e));
                ctx.merge_result(TaskResult::Failed);
            }
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                self.trace
                    .error(&format!("Step execution terminated unexpectedly: {}", reason));
                ctx.error(&format!("Step execution terminated unexpectedly: {}", reason));
                ctx.merge_result(TaskResult::Failed);
            }
        }

        self.enter(JobStage::Finalizing);
        self.job_extension
            .finalize_job(ctx, message, self.job_start_time);
        None
    }

    fn set_runner_context(&self, ctx: &mut ExecutionContext) {
        if ctx.global().write_debug {
            ctx.set_runner_context("debug", "1");
        }
        ctx.set_runner_context("os", CURRENT_PLATFORM.label_name());

        let tools = self.host_context.get_directory(WellKnownDirectory::Tools);
        if let Err(e) = std::fs::create_dir_all(&tools) {
            self.trace
                .warning(&format!("Failed to create {}: {}", tools.display(), e));
        }
        ctx.set_runner_context("tool_cache", tools.to_string_lossy());
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Turns a runner shutdown into a job issue plus job cancellation.
/// Stops observing when dropped.
struct ShutdownObserver {
    task: JoinHandle<()>,
}

impl ShutdownObserver {
    fn register(host_context: &Arc<HostContext>, ctx: &ExecutionContext) -> Self {
        let host_context = Arc::clone(host_context);
        let shutdown = host_context.runner_shutdown_token();
        let issues = ctx.issue_reporter();
        let job_token = ctx.cancel_token();

        let task = tokio::spawn(async move {
            shutdown.cancelled().await;
            report_shutdown(&issues, host_context.runner_shutdown_reason());
            job_token.cancel();
        });
        Self { task }
    }
}

impl Drop for ShutdownObserver {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn report_shutdown(issues: &IssueReporter, reason: Option<ShutdownReason>) {
    let message = match reason {
        Some(ShutdownReason::OperatingSystemShutdown) => format!(
            "Operating system is shutting down for computer '{}'",
            machine_name()
        ),
        Some(ShutdownReason::UserCancelled) | None => "The runner has received a shutdown signal. \
            This can happen when the runner service is stopped, or a manually started runner is canceled."
            .to_string(),
    };
    issues.error(&message);
}

fn machine_name() -> String {
    hostname::get()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution_context::IssueType;
    use crate::test_support::{
        job_message, test_host, CountingJobExtension, FakeEnvironment, FakeJobServer,
        FakeProcessHost, FakeQueue, FakeStepsRunner, QueueCalls, StepsBehavior,
    };
    use serde_json::json;
    use vmrunner_common::PullRequestSecuritySettings;

    struct Harness {
        host: Arc<HostContext>,
        environment: Arc<FakeEnvironment>,
        job_server: Arc<FakeJobServer>,
        queue: Arc<QueueCalls>,
        extension: Arc<CountingJobExtension>,
        steps: Arc<FakeStepsRunner>,
    }

    struct Setup {
        environment: FakeEnvironment,
        job_server: FakeJobServer,
        fail_queue_shutdown: bool,
        extension: CountingJobExtension,
        steps: StepsBehavior,
        policy: Option<PullRequestSecuritySettings>,
    }

    impl Default for Setup {
        fn default() -> Self {
            Self {
                environment: FakeEnvironment::new(),
                job_server: FakeJobServer::succeeding(),
                fail_queue_shutdown: false,
                extension: CountingJobExtension::new(),
                steps: StepsBehavior::Succeed,
                policy: None,
            }
        }
    }

    impl Setup {
        fn build(self, host: Arc<HostContext>) -> (Harness, JobRunner) {
            let environment = Arc::new(self.environment);
            let job_server = Arc::new(self.job_server);
            let queue = FakeQueue::new(self.fail_queue_shutdown);
            let queue_calls = queue.calls();
            let extension = Arc::new(self.extension);
            let steps = Arc::new(FakeStepsRunner::new(self.steps));
            let policy: Arc<dyn PolicySource> = Arc::new(self.policy);

            let services = JobServices {
                environment: environment.clone(),
                job_server: job_server.clone(),
                job_server_queue: Box::new(queue),
                job_extension: extension.clone(),
                steps_runner: steps.clone(),
                policy,
            };
            let runner = JobRunner::new(Arc::clone(&host), services, 9);
            (
                Harness {
                    host,
                    environment,
                    job_server,
                    queue: queue_calls,
                    extension,
                    steps,
                },
                runner,
            )
        }
    }

    async fn run(setup: Setup, message: AgentJobRequestMessage) -> (Harness, Result<TaskResult>) {
        let (harness, runner) = setup.build(test_host());
        let result = runner.run_async(message, CancellationToken::new()).await;
        (harness, result)
    }

    fn pull_request_from(login: &str) -> AgentJobRequestMessage {
        let mut message = job_message();
        message.context_data.insert(
            "github".to_string(),
            json!({
                "repository": "octo/widgets",
                "event_name": "pull_request",
                "event": {"pull_request": {
                    "author_association": "NONE",
                    "head": {"user": {"login": login}}
                }}
            }),
        );
        message
    }

    fn has_error(issues: &[crate::execution_context::Issue], text: &str) -> bool {
        issues
            .iter()
            .any(|i| i.issue_type == IssueType::Error && i.message.contains(text))
    }

    #[tokio::test]
    async fn successful_job_runs_every_stage_once() {
        let (h, result) = run(Setup::default(), job_message()).await;

        assert_eq!(result.unwrap(), TaskResult::Succeeded);
        assert_eq!(h.environment.provisions(), 1);
        assert_eq!(h.environment.teardowns(), 1);
        assert_eq!(h.steps.runs(), 1);
        assert_eq!(h.steps.steps_seen(), 2);
        assert_eq!(h.extension.finalizations(), 1);
        assert_eq!(h.queue.starts(), 1);
        assert_eq!(h.queue.shutdowns(), 1);
        assert_eq!(h.job_server.connected_endpoint().as_deref(), Some("SystemVssConnection"));

        let events = h.job_server.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].result, TaskResult::Succeeded);
        assert_eq!(events[0].request_id, 42);
    }

    #[tokio::test]
    async fn handle_derived_from_instance_and_repository() {
        let (h, _) = run(Setup::default(), job_message()).await;

        let handle = h.environment.handle().unwrap();
        assert_eq!(handle.instance, 9);
        assert_eq!(handle.vm_ip, "172.17.9.2");
        assert_eq!(handle.workspace, "widgets/widgets");
        assert_eq!(handle.virt_dir, h.host.get_directory(WellKnownDirectory::Virt));
        assert_eq!(h.environment.vm_ip_at_teardown().as_deref(), Some("172.17.9.2"));
    }

    #[tokio::test]
    async fn provisioning_failure_skips_execution() {
        let setup = Setup {
            environment: FakeEnvironment::failing(),
            ..Setup::default()
        };
        let (h, result) = run(setup, job_message()).await;

        assert_eq!(result.unwrap(), TaskResult::Failed);
        assert_eq!(h.steps.runs(), 0);
        assert_eq!(h.extension.initializations(), 0);
        assert_eq!(h.environment.teardowns(), 1);
        assert_eq!(h.job_server.events()[0].result, TaskResult::Failed);
        assert!(has_error(&h.environment.issues_at_teardown(), "non-zero exit code: 1"));
    }

    #[tokio::test]
    async fn security_denial_fails_before_steps() {
        let setup = Setup {
            policy: Some(PullRequestSecuritySettings {
                allow_contributors: false,
                allowed_authors: vec!["octocat".to_string()],
            }),
            ..Setup::default()
        };
        let (h, result) = run(setup, pull_request_from("mallory")).await;

        assert_eq!(result.unwrap(), TaskResult::Failed);
        assert_eq!(h.steps.runs(), 0);
        assert_eq!(h.environment.teardowns(), 1);
        assert!(has_error(&h.environment.issues_at_teardown(), SECURITY_POLICY_DENIED));
    }

    #[tokio::test]
    async fn allow_listed_pull_request_runs() {
        let setup = Setup {
            policy: Some(PullRequestSecuritySettings {
                allow_contributors: false,
                allowed_authors: vec!["octocat".to_string()],
            }),
            ..Setup::default()
        };
        let (h, result) = run(setup, pull_request_from("octocat")).await;

        assert_eq!(result.unwrap(), TaskResult::Succeeded);
        assert_eq!(h.steps.runs(), 1);
    }

    #[tokio::test]
    async fn step_engine_error_becomes_failed() {
        let setup = Setup {
            steps: StepsBehavior::Error,
            ..Setup::default()
        };
        let (h, result) = run(setup, job_message()).await;

        assert_eq!(result.unwrap(), TaskResult::Failed);
        assert_eq!(h.extension.finalizations(), 1);
        assert_eq!(h.environment.teardowns(), 1);
        assert!(has_error(&h.environment.issues_at_teardown(), "step engine crashed"));
    }

    #[tokio::test]
    async fn step_engine_panic_is_contained() {
        let setup = Setup {
            steps: StepsBehavior::Panic,
            ..Setup::default()
        };
        let (h, result) = run(setup, job_message()).await;

        assert_eq!(result.unwrap(), TaskResult::Failed);
        assert_eq!(h.extension.finalizations(), 1);
        assert_eq!(h.environment.teardowns(), 1);
        assert!(has_error(&h.environment.issues_at_teardown(), "step engine bug"));
    }

    #[tokio::test]
    async fn step_results_are_reported() {
        let setup = Setup {
            steps: StepsBehavior::Result(TaskResult::SucceededWithIssues),
            ..Setup::default()
        };
        let (h, result) = run(setup, job_message()).await;
        assert_eq!(result.unwrap(), TaskResult::SucceededWithIssues);
        assert_eq!(h.job_server.events()[0].result, TaskResult::SucceededWithIssues);
    }

    #[tokio::test]
    async fn initialize_failure_fails_without_running_steps() {
        let setup = Setup {
            extension: CountingJobExtension::failing(),
            ..Setup::default()
        };
        let (h, result) = run(setup, job_message()).await;

        assert_eq!(result.unwrap(), TaskResult::Failed);
        assert_eq!(h.steps.runs(), 0);
        assert_eq!(h.environment.teardowns(), 1);
    }

    #[tokio::test]
    async fn cancellation_during_initialize_is_canceled() {
        let setup = Setup {
            extension: CountingJobExtension::cancelling(),
            ..Setup::default()
        };
        let (h, result) = run(setup, job_message()).await;

        assert_eq!(result.unwrap(), TaskResult::Canceled);
        assert_eq!(h.extension.initializations(), 1);
        assert_eq!(h.steps.runs(), 0);
        assert_eq!(h.extension.finalizations(), 0);
        assert_eq!(h.environment.teardowns(), 1);
        assert_eq!(h.job_server.events()[0].result, TaskResult::Canceled);
        assert!(h.environment.issues_at_teardown().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn runner_shutdown_during_vm_boot_cancels_and_tears_down() {
        let host = test_host();
        let process_host = Arc::new(FakeProcessHost::new());
        process_host.hang_until_cancelled(vmrunner_common::constants::vm::BOOT_SCRIPT);
        let job_server = Arc::new(FakeJobServer::succeeding());
        let steps = Arc::new(FakeStepsRunner::new(StepsBehavior::Succeed));
        let services = JobServices {
            environment: Arc::new(VmProvisioner::new(
                process_host.clone(),
                host.get_trace("VmProvisioner"),
            )),
            job_server: job_server.clone(),
            job_server_queue: Box::new(FakeQueue::new(false)),
            job_extension: Arc::new(CountingJobExtension::new()),
            steps_runner: steps.clone(),
            policy: Arc::new(None::<PullRequestSecuritySettings>),
        };

        let shutdown_host = Arc::clone(&host);
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
            shutdown_host.shutdown_runner(ShutdownReason::OperatingSystemShutdown);
        });

        let result = JobRunner::new(Arc::clone(&host), services, 4)
            .run_async(job_message(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result, TaskResult::Canceled);
        assert_eq!(steps.runs(), 0);
        assert_eq!(job_server.events()[0].result, TaskResult::Canceled);

        let commands = process_host.commands();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].arguments[0], "run_image.sh");
        assert_eq!(
            commands[1].arguments,
            vec!["-e", "sshfs.sh", "4", "widgets/widgets"]
        );
    }

    #[tokio::test]
    async fn queue_shutdown_failure_fails_successful_job() {
        let setup = Setup {
            fail_queue_shutdown: true,
            ..Setup::default()
        };
        let (h, result) = run(setup, job_message()).await;

        assert_eq!(result.unwrap(), TaskResult::Failed);
        assert_eq!(h.queue.shutdowns(), 1);
        assert_eq!(h.job_server.events()[0].result, TaskResult::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn publish_exhaustion_escapes_after_teardown() {
        let setup = Setup {
            job_server: FakeJobServer::failing(),
            ..Setup::default()
        };
        let (h, result) = run(setup, job_message()).await;

        let err = result.unwrap_err();
        assert!(err.downcast_ref::<CompletionError>().is_some());
        assert_eq!(h.job_server.calls(), 5);
        assert_eq!(h.environment.teardowns(), 1);
        assert_eq!(h.queue.shutdowns(), 1);
    }

    #[tokio::test]
    async fn runner_shutdown_cancels_job_and_records_reason() {
        let host = test_host();
        let setup = Setup {
            steps: StepsBehavior::Shutdown(Arc::clone(&host), ShutdownReason::UserCancelled),
            ..Setup::default()
        };
        let (h, runner) = setup.build(host);
        let result = runner
            .run_async(job_message(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result, TaskResult::Canceled);
        assert!(has_error(
            &h.environment.issues_at_teardown(),
            "The runner has received a shutdown signal."
        ));
        assert_eq!(h.environment.teardowns(), 1);
    }

    #[tokio::test]
    async fn invalid_request_rejected_before_lifecycle() {
        let mut message = job_message();
        message.steps = None;
        let (h, result) = run(Setup::default(), message).await;

        assert!(result.is_err());
        assert_eq!(h.environment.provisions(), 0);
        assert_eq!(h.environment.teardowns(), 0);
        assert_eq!(h.queue.starts(), 0);
    }

    #[test]
    fn os_shutdown_message_names_machine() {
        let (_host, ctx) = crate::test_support::test_context();
        report_shutdown(&ctx.issue_reporter(), Some(ShutdownReason::OperatingSystemShutdown));
        let issues = ctx.issues();
        assert!(issues[0]
            .message
            .starts_with("Operating system is shutting down for computer '"));
    }
}

// Fixtures and test doubles shared by the unit tests.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use vmrunner_common::{constants, HostContext, ShutdownReason, TaskResult};
use vmrunner_sdk::ProcessSignal;

use crate::environment::{
    CommandOutcome, CommandSpec, EnvironmentHandle, EnvironmentProvider, ProcessHost,
    ProvisioningError,
};
use crate::execution_context::{ExecutionContext, Global, Issue};
use crate::job_extension::{DefaultJobExtension, JobExtension};
use crate::job_server::{JobCompletedEvent, JobServer, PlanRejection, PublishError};
use crate::job_server_queue::JobServerQueue;
use crate::steps_runner::StepsRunner;
use crate::variables::Variables;
use crate::worker::{AgentJobRequestMessage, JobStep, ServiceEndpoint, TaskOrchestrationPlanReference};

pub(crate) fn job_message() -> AgentJobRequestMessage {
    serde_json::from_value(serde_json::json!({
        "jobId": "job-1",
        "jobDisplayName": "build",
        "requestId": 42,
        "plan": {
            "scopeIdentifier": "scope-1",
            "planType": "actions",
            "planId": "plan-1",
            "version": 20,
            "features": 1
        },
        "variables": {
            "system.runner.name": {"value": "vm-runner"},
            "deploy_password": {"value": "hunter2", "isSecret": true}
        },
        "steps": [
            {"id": "build", "displayName": "Build", "script": "echo build"},
            {"id": "test", "displayName": "Test", "script": "echo test"}
        ],
        "resources": {"endpoints": [{
            "name": "SystemVssConnection",
            "url": "https://pipelines.example.com/tenant/",
            "authorization": {"scheme": "OAuth", "parameters": {"AccessToken": "access-token-value"}}
        }]},
        "contextData": {"github": {"repository": "octo/widgets", "event_name": "push"}},
        "jobContainer": "ubuntu:22.04"
    }))
    .expect("job message fixture")
}

/// A fresh runner root under the system temp directory.
pub(crate) fn test_host() -> Arc<HostContext> {
    let root = std::env::temp_dir()
        .join(format!("vmrunner-{}", Uuid::new_v4().simple()))
        .join("runner");
    std::fs::create_dir_all(&root).expect("create test root");
    let host = HostContext::new("Worker");
    host.set_root_override(root);
    host
}

/// Job context over [`job_message`] with step debug enabled.
pub(crate) fn test_context() -> (Arc<HostContext>, ExecutionContext) {
    let host = test_host();
    let message = job_message();
    let variables = Variables::from_message(&message, &host.secret_masker);
    let mut global = Global::from_message(
        &message,
        variables,
        EnvironmentHandle::workspace_for("widgets"),
        CancellationToken::new(),
    );
    global.write_debug = true;
    let ctx = ExecutionContext::new_root(Arc::clone(&host), global, message.job_display_name);
    (host, ctx)
}

// ---------------------------------------------------------------------------
// ProcessHost
// ---------------------------------------------------------------------------

struct ScriptedCommand {
    script: String,
    stdout: Vec<String>,
    exit_code: i32,
    stderr: String,
}

/// Answers commands by script name; unknown commands exit 0 silently.
#[derive(Default)]
pub(crate) struct FakeProcessHost {
    scripted: Mutex<Vec<ScriptedCommand>>,
    hanging: Mutex<Vec<String>>,
    commands: Mutex<Vec<CommandSpec>>,
    signals: Mutex<Vec<(i32, ProcessSignal)>>,
    remove_on_terminate: Mutex<Option<PathBuf>>,
}

impl FakeProcessHost {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn script_boot(&self, stdout: &[&str], exit_code: i32) {
        self.scripted.lock().push(ScriptedCommand {
            script: constants::vm::BOOT_SCRIPT.to_string(),
            stdout: stdout.iter().map(|l| l.to_string()).collect(),
            exit_code,
            stderr: String::new(),
        });
    }

    pub(crate) fn script_exit(&self, script: &str, exit_code: i32, stderr: &str) {
        self.scripted.lock().push(ScriptedCommand {
            script: script.to_string(),
            stdout: Vec::new(),
            exit_code,
            stderr: stderr.to_string(),
        });
    }

    /// `script` runs until its cancellation token fires.
    pub(crate) fn hang_until_cancelled(&self, script: &str) {
        self.hanging.lock().push(script.to_string());
    }

    /// Simulate the VM exiting (and removing its pid file) on SIGTERM.
    pub(crate) fn remove_on_terminate(&self, pid_file: PathBuf) {
        *self.remove_on_terminate.lock() = Some(pid_file);
    }

    pub(crate) fn commands(&self) -> Vec<CommandSpec> {
        self.commands.lock().clone()
    }

    pub(crate) fn signals(&self) -> Vec<(i32, ProcessSignal)> {
        self.signals.lock().clone()
    }
}

#[async_trait]
impl ProcessHost for FakeProcessHost {
    async fn run(
        &self,
        command: &CommandSpec,
        on_stdout: &mut (dyn for<'a> FnMut(&'a str) + Send),
        cancel_token: CancellationToken,
    ) -> Result<CommandOutcome> {
        self.commands.lock().push(command.clone());
        let hangs = self
            .hanging
            .lock()
            .iter()
            .any(|script| command.arguments.iter().any(|a| a == script));
        if hangs {
            cancel_token.cancelled().await;
        }
        if cancel_token.is_cancelled() {
            anyhow::bail!("Process was cancelled");
        }
        let (stdout, outcome) = {
            let scripted = self.scripted.lock();
            match scripted
                .iter()
                .find(|s| command.arguments.iter().any(|a| *a == s.script))
            {
                Some(s) => (
                    s.stdout.clone(),
                    CommandOutcome {
                        exit_code: s.exit_code,
                        stderr: s.stderr.clone(),
                    },
                ),
                None => (Vec::new(), CommandOutcome::default()),
            }
        };
        for line in &stdout {
            on_stdout(line);
        }
        Ok(outcome)
    }

    fn signal(&self, pid: i32, signal: ProcessSignal) -> Result<()> {
        self.signals.lock().push((pid, signal));
        if signal == ProcessSignal::Terminate {
            if let Some(pid_file) = self.remove_on_terminate.lock().as_ref() {
                let _ = std::fs::remove_file(pid_file);
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JobServerQueue
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct QueueCalls {
    starts: AtomicUsize,
    shutdowns: AtomicUsize,
}

impl QueueCalls {
    pub(crate) fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub(crate) fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

pub(crate) struct FakeQueue {
    fail_shutdown: bool,
    calls: Arc<QueueCalls>,
}

impl FakeQueue {
    pub(crate) fn new(fail_shutdown: bool) -> Self {
        Self {
            fail_shutdown,
            calls: Arc::new(QueueCalls::default()),
        }
    }

    pub(crate) fn calls(&self) -> Arc<QueueCalls> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl JobServerQueue for FakeQueue {
    fn start(&mut self, _message: &AgentJobRequestMessage) {
        self.calls.starts.fetch_add(1, Ordering::SeqCst);
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.calls.shutdowns.fetch_add(1, Ordering::SeqCst);
        if self.fail_shutdown {
            anyhow::bail!("timeline upload failed");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JobServer
// ---------------------------------------------------------------------------

enum PublishMode {
    Succeed,
    FailTimes(usize),
    Reject(PlanRejection),
}

pub(crate) struct FakeJobServer {
    mode: PublishMode,
    calls: AtomicUsize,
    events: Mutex<Vec<JobCompletedEvent>>,
    connected: Mutex<Option<String>>,
}

impl FakeJobServer {
    fn with_mode(mode: PublishMode) -> Self {
        Self {
            mode,
            calls: AtomicUsize::new(0),
            events: Mutex::new(Vec::new()),
            connected: Mutex::new(None),
        }
    }

    pub(crate) fn succeeding() -> Self {
        Self::with_mode(PublishMode::Succeed)
    }

    pub(crate) fn failing() -> Self {
        Self::with_mode(PublishMode::FailTimes(usize::MAX))
    }

    pub(crate) fn failing_times(times: usize) -> Self {
        Self::with_mode(PublishMode::FailTimes(times))
    }

    pub(crate) fn rejecting(rejection: PlanRejection) -> Self {
        Self::with_mode(PublishMode::Reject(rejection))
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Events that were accepted.
    pub(crate) fn events(&self) -> Vec<JobCompletedEvent> {
        self.events.lock().clone()
    }

    pub(crate) fn connected_endpoint(&self) -> Option<String> {
        self.connected.lock().clone()
    }
}

#[async_trait]
impl JobServer for FakeJobServer {
    fn connect(&self, endpoint: &ServiceEndpoint) -> Result<()> {
        *self.connected.lock() = Some(endpoint.name.clone());
        Ok(())
    }

    async fn raise_plan_event(
        &self,
        _plan: &TaskOrchestrationPlanReference,
        event: &JobCompletedEvent,
    ) -> Result<(), PublishError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        match self.mode {
            PublishMode::Reject(rejection) => Err(PublishError::Terminal(rejection)),
            PublishMode::FailTimes(times) if call <= times => Err(PublishError::Retryable(
                anyhow::anyhow!("HTTP 503 Service Unavailable (attempt {})", call),
            )),
            _ => {
                self.events.lock().push(event.clone());
                Ok(())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// EnvironmentProvider
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct FakeEnvironment {
    fail_provision: bool,
    provisions: AtomicUsize,
    teardowns: AtomicUsize,
    handle: Mutex<Option<EnvironmentHandle>>,
    /// Job issues and `system.qemuIp` as seen by teardown.
    issues_at_teardown: Mutex<Vec<Issue>>,
    vm_ip_at_teardown: Mutex<Option<String>>,
}

impl FakeEnvironment {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn failing() -> Self {
        Self {
            fail_provision: true,
            ..Self::default()
        }
    }

    pub(crate) fn provisions(&self) -> usize {
        self.provisions.load(Ordering::SeqCst)
    }

    pub(crate) fn teardowns(&self) -> usize {
        self.teardowns.load(Ordering::SeqCst)
    }

    pub(crate) fn handle(&self) -> Option<EnvironmentHandle> {
        self.handle.lock().clone()
    }

    pub(crate) fn issues_at_teardown(&self) -> Vec<Issue> {
        self.issues_at_teardown.lock().clone()
    }

    pub(crate) fn vm_ip_at_teardown(&self) -> Option<String> {
        self.vm_ip_at_teardown.lock().clone()
    }
}

#[async_trait]
impl EnvironmentProvider for FakeEnvironment {
    async fn provision(
        &self,
        handle: &EnvironmentHandle,
        _image: &str,
        ctx: &mut ExecutionContext,
    ) -> Result<(), ProvisioningError> {
        self.provisions.fetch_add(1, Ordering::SeqCst);
        *self.handle.lock() = Some(handle.clone());
        if self.fail_provision {
            let error = ProvisioningError::VmStartFailed {
                exit_code: 1,
                stderr: "qemu: image not found".to_string(),
            };
            ctx.error(&error.to_string());
            return Err(error);
        }
        Ok(())
    }

    async fn teardown(&self, _handle: &EnvironmentHandle, ctx: &mut ExecutionContext) {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        *self.issues_at_teardown.lock() = ctx.issues();
        *self.vm_ip_at_teardown.lock() = ctx.variables().get("system.qemuIp");
    }
}

// ---------------------------------------------------------------------------
// StepsRunner / JobExtension
// ---------------------------------------------------------------------------

pub(crate) enum StepsBehavior {
    Succeed,
    Result(TaskResult),
    Error,
    Panic,
    /// Request a runner shutdown and wait for the job to observe it.
    Shutdown(Arc<HostContext>, ShutdownReason),
}

pub(crate) struct FakeStepsRunner {
    behavior: StepsBehavior,
    runs: AtomicUsize,
    steps_seen: AtomicUsize,
}

impl FakeStepsRunner {
    pub(crate) fn new(behavior: StepsBehavior) -> Self {
        Self {
            behavior,
            runs: AtomicUsize::new(0),
            steps_seen: AtomicUsize::new(0),
        }
    }

    pub(crate) fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub(crate) fn steps_seen(&self) -> usize {
        self.steps_seen.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StepsRunner for FakeStepsRunner {
    async fn run_async(&self, ctx: &mut ExecutionContext, steps: Vec<JobStep>) -> Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.steps_seen.store(steps.len(), Ordering::SeqCst);
        match &self.behavior {
            StepsBehavior::Succeed => Ok(()),
            StepsBehavior::Result(result) => {
                ctx.merge_result(*result);
                Ok(())
            }
            StepsBehavior::Error => anyhow::bail!("step engine crashed"),
            StepsBehavior::Panic => panic!("step engine bug"),
            StepsBehavior::Shutdown(host, reason) => {
                let token = ctx.cancel_token();
                host.shutdown_runner(*reason);
                token.cancelled().await;
                ctx.merge_result(TaskResult::Canceled);
                Ok(())
            }
        }
    }
}

/// [`DefaultJobExtension`] with call counters and an optional init failure.
#[derive(Default)]
pub(crate) struct CountingJobExtension {
    inner: DefaultJobExtension,
    fail_initialize: bool,
    cancel_on_initialize: bool,
    initializations: AtomicUsize,
    finalizations: AtomicUsize,
}

impl CountingJobExtension {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn failing() -> Self {
        Self {
            fail_initialize: true,
            ..Self::default()
        }
    }

    /// Initialization observes a job cancellation and fails because of it.
    pub(crate) fn cancelling() -> Self {
        Self {
            cancel_on_initialize: true,
            ..Self::default()
        }
    }

    pub(crate) fn initializations(&self) -> usize {
        self.initializations.load(Ordering::SeqCst)
    }

    pub(crate) fn finalizations(&self) -> usize {
        self.finalizations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobExtension for CountingJobExtension {
    async fn initialize_job(
        &self,
        ctx: &mut ExecutionContext,
        message: &AgentJobRequestMessage,
    ) -> Result<Vec<JobStep>> {
        self.initializations.fetch_add(1, Ordering::SeqCst);
        if self.cancel_on_initialize {
            ctx.cancel_token().cancel();
        }
        if self.fail_initialize {
            anyhow::bail!("failed to resolve actions");
        }
        self.inner.initialize_job(ctx, message).await
    }

    fn finalize_job(
        &self,
        ctx: &mut ExecutionContext,
        message: &AgentJobRequestMessage,
        job_start_time: DateTime<Utc>,
    ) {
        self.finalizations.fetch_add(1, Ordering::SeqCst);
        self.inner.finalize_job(ctx, message, job_start_time);
    }
}

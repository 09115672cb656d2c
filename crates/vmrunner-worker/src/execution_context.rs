// ExecutionContext: the mutable state of a running job and its child records
// ("Set up VM", one per step). Owns the live log and the job-level issues.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use vmrunner_common::{constants, HostContext, SecretMasker, TaskResult, TaskResultUtil};

use crate::variables::Variables;
use crate::worker::{
    ActionsEnvironmentReference, AgentJobRequestMessage, PlanFeatures, ServiceEndpoint,
    VariableValueMessage,
};

// ---------------------------------------------------------------------------
// Issues and timeline records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueType {
    Error,
    Warning,
}

/// A job-level annotation shown to the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    pub issue_type: IssueType,
    pub message: String,
}

/// A completed child context.
#[derive(Debug, Clone)]
pub struct TimelineRecord {
    pub id: Uuid,
    pub name: String,
    pub result: TaskResult,
    pub log_lines: Vec<String>,
}

// ---------------------------------------------------------------------------
// Global (shared by the job context and its children)
// ---------------------------------------------------------------------------

pub struct Global {
    pub variables: Variables,
    pub endpoints: Vec<ServiceEndpoint>,
    /// Extra process environment for steps (e.g. `RUNNER_TEMP`).
    pub environment_variables: HashMap<String, String>,
    pub job_display_name: String,
    pub job_id: String,
    /// Relative workspace path, `<repo>/<repo>`.
    pub workspace_directory: String,
    pub features: PlanFeatures,
    pub cancel_token: CancellationToken,
    pub write_debug: bool,
    /// `runner.*` values exposed to steps.
    pub runner_context: BTreeMap<String, String>,
    pub issues: Vec<Issue>,
    pub records: Vec<TimelineRecord>,
    /// step id → output name → value.
    pub step_outputs: HashMap<String, HashMap<String, String>>,
    pub job_outputs: HashMap<String, VariableValueMessage>,
    pub actions_environment: Option<ActionsEnvironmentReference>,
}

impl Global {
    pub fn from_message(
        message: &AgentJobRequestMessage,
        variables: Variables,
        workspace_directory: String,
        cancel_token: CancellationToken,
    ) -> Self {
        let write_debug = variables.get_bool(constants::variables::STEP_DEBUG);
        Self {
            variables,
            endpoints: message.endpoints().to_vec(),
            environment_variables: HashMap::new(),
            job_display_name: message.job_display_name.clone(),
            job_id: message.job_id.clone(),
            workspace_directory,
            features: message.plan.features,
            cancel_token,
            write_debug,
            runner_context: BTreeMap::new(),
            issues: Vec::new(),
            records: Vec::new(),
            step_outputs: HashMap::new(),
            job_outputs: HashMap::new(),
            actions_environment: message.actions_environment.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

pub struct ExecutionContext {
    host_context: Arc<HostContext>,
    global: Arc<RwLock<Global>>,
    record_id: Uuid,
    display_name: String,
    is_job: bool,
    result: Option<TaskResult>,
    log_lines: Vec<String>,
    is_completed: bool,
    secret_masker: Arc<SecretMasker>,
}

impl ExecutionContext {
    pub fn new_root(host_context: Arc<HostContext>, global: Global, display_name: String) -> Self {
        let secret_masker = Arc::clone(&host_context.secret_masker);
        Self {
            host_context,
            global: Arc::new(RwLock::new(global)),
            record_id: Uuid::new_v4(),
            display_name,
            is_job: true,
            result: None,
            log_lines: Vec::new(),
            is_completed: false,
            secret_masker,
        }
    }

    /// Child record sharing this job's global state. Its log is kept apart
    /// and published to `Global::records` on completion.
    pub fn create_child(&self, display_name: impl Into<String>) -> Self {
        Self {
            host_context: Arc::clone(&self.host_context),
            global: Arc::clone(&self.global),
            record_id: Uuid::new_v4(),
            display_name: display_name.into(),
            is_job: false,
            result: None,
            log_lines: Vec::new(),
            is_completed: false,
            secret_masker: Arc::clone(&self.secret_masker),
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn record_id(&self) -> Uuid {
        self.record_id
    }

    pub fn host_context(&self) -> &Arc<HostContext> {
        &self.host_context
    }

    pub fn global(&self) -> parking_lot::RwLockReadGuard<'_, Global> {
        self.global.read()
    }

    pub fn global_mut(&self) -> parking_lot::RwLockWriteGuard<'_, Global> {
        self.global.write()
    }

    pub fn variables(&self) -> Variables {
        self.global.read().variables.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.global.read().cancel_token.clone()
    }

    pub fn result(&self) -> Option<TaskResult> {
        self.result
    }

    /// Merge `incoming` into the current result, keeping the more severe.
    pub fn merge_result(&mut self, incoming: TaskResult) -> TaskResult {
        let merged = TaskResultUtil::merge_task_results(self.result, incoming);
        self.result = Some(merged);
        merged
    }

    pub fn is_completed(&self) -> bool {
        self.is_completed
    }

    pub fn log_lines(&self) -> &[String] {
        &self.log_lines
    }

    pub fn issues(&self) -> Vec<Issue> {
        self.global.read().issues.clone()
    }

    pub fn set_runner_context(&self, key: &str, value: impl Into<String>) {
        self.global
            .write()
            .runner_context
            .insert(key.to_string(), value.into());
    }

    pub fn add_issue(&self, issue_type: IssueType, message: &str) {
        self.issue_reporter().add(issue_type, message);
    }

    /// Handle for recording job issues from another task.
    pub fn issue_reporter(&self) -> IssueReporter {
        IssueReporter {
            global: Arc::clone(&self.global),
            secret_masker: Arc::clone(&self.secret_masker),
        }
    }

    // -----------------------------------------------------------------------
    // Logging
    // -----------------------------------------------------------------------

    /// Raw process output line.
    pub fn output(&mut self, line: &str) {
        let masked = self.secret_masker.mask_secrets(line);
        tracing::info!(target: "step", "[{}] {}", self.display_name, masked);
        self.log_lines.push(masked);
    }

    pub fn info(&mut self, message: &str) {
        self.output(message);
    }

    /// Only recorded when step debug is enabled.
    pub fn debug(&mut self, message: &str) {
        if self.global.read().write_debug {
            let masked = self.secret_masker.mask_secrets(message);
            tracing::debug!(target: "step", "[{}] {}", self.display_name, masked);
            self.log_lines.push(format!("##[debug]{}", masked));
        }
    }

    pub fn warning(&mut self, message: &str) {
        let masked = self.secret_masker.mask_secrets(message);
        tracing::warn!(target: "step", "[{}] {}", self.display_name, masked);
        self.log_lines.push(format!("##[warning]{}", masked));
        self.add_issue(IssueType::Warning, message);
    }

    pub fn error(&mut self, message: &str) {
        let masked = self.secret_masker.mask_secrets(message);
        tracing::error!(target: "step", "[{}] {}", self.display_name, masked);
        self.log_lines.push(format!("##[error]{}", masked));
        self.add_issue(IssueType::Error, message);
    }

    pub fn section(&mut self, message: &str) {
        let masked = self.secret_masker.mask_secrets(message);
        tracing::info!(target: "step", "[{}] >> {}", self.display_name, masked);
        self.log_lines.push(format!("##[group]{}", masked));
    }

    // -----------------------------------------------------------------------
    // Completion
    // -----------------------------------------------------------------------

    /// Merge `result` into the accumulated one and close the context.
    /// Returns the final result, `Succeeded` when nothing was recorded.
    /// A second call is ignored and returns the first final result.
    pub fn complete(&mut self, result: Option<TaskResult>) -> TaskResult {
        if self.is_completed {
            tracing::warn!(
                "Attempted to complete already-completed context: {}",
                self.display_name
            );
            return self.result.unwrap_or(TaskResult::Succeeded);
        }

        if let Some(result) = result {
            self.merge_result(result);
        }
        let final_result = self.result.unwrap_or(TaskResult::Succeeded);
        self.result = Some(final_result);
        self.is_completed = true;

        if final_result.is_success() || final_result == TaskResult::Skipped {
            tracing::info!(target: "step", "Finishing: {} (Result: {})", self.display_name, final_result);
        } else {
            tracing::error!(target: "step", "Finishing: {} (Result: {})", self.display_name, final_result);
        }

        if !self.is_job {
            self.global.write().records.push(TimelineRecord {
                id: self.record_id,
                name: self.display_name.clone(),
                result: final_result,
                log_lines: self.log_lines.clone(),
            });
        }

        final_result
    }
}

/// Records job issues without borrowing the [`ExecutionContext`].
#[derive(Clone)]
pub struct IssueReporter {
    global: Arc<RwLock<Global>>,
    secret_masker: Arc<SecretMasker>,
}

impl IssueReporter {
    pub fn add(&self, issue_type: IssueType, message: &str) {
        let message = self.secret_masker.mask_secrets(message);
        self.global.write().issues.push(Issue {
            issue_type,
            message,
        });
    }

    pub fn error(&self, message: &str) {
        tracing::error!(target: "step", "{}", self.secret_masker.mask_secrets(message));
        self.add(IssueType::Error, message);
    }
}

// Worker: reads the job request message, registers its secrets, wires the
// production services and hands the job to the JobRunner.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use vmrunner_common::constants;
use vmrunner_common::{ConfigurationStore, HostContext, TaskResult};
use vmrunner_sdk::TraceWriter;

use crate::job_runner::{JobRunner, JobServices};

// ---------------------------------------------------------------------------
// Job request message
// ---------------------------------------------------------------------------

/// Job request as delivered by the orchestration service.
///
/// `resources`, `variables` and `steps` are optional on the wire so that a
/// malformed message is rejected by [`AgentJobRequestMessage::validate`]
/// instead of silently defaulting to empty collections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentJobRequestMessage {
    #[serde(default)]
    pub job_id: String,

    #[serde(default)]
    pub job_display_name: String,

    #[serde(default)]
    pub request_id: u64,

    #[serde(default)]
    pub plan: TaskOrchestrationPlanReference,

    #[serde(default)]
    pub variables: Option<HashMap<String, VariableValueMessage>>,

    #[serde(default)]
    pub steps: Option<Vec<JobStep>>,

    #[serde(default)]
    pub resources: Option<JobResources>,

    /// Context data (github, inputs, ...). `github` carries the trigger event.
    #[serde(default)]
    pub context_data: HashMap<String, serde_json::Value>,

    /// Image the VM is booted from.
    #[serde(default)]
    pub job_container: Option<JobContainerReference>,

    /// Job output name → `steps.<id>.outputs.<name>` reference.
    #[serde(default)]
    pub job_outputs: HashMap<String, String>,

    #[serde(default)]
    pub actions_environment: Option<ActionsEnvironmentReference>,
}

/// Why a job request was rejected before its lifecycle started.
#[derive(Debug, thiserror::Error)]
pub enum JobRequestError {
    #[error("Job message is missing required field '{0}'")]
    MissingField(&'static str),

    #[error("Job message has no '{0}' endpoint")]
    MissingEndpoint(String),

    #[error("Job message has {count} '{name}' endpoints, expected exactly one")]
    AmbiguousEndpoint { name: String, count: usize },

    #[error("github context does not name a repository")]
    MissingRepository,

    #[error("Job message does not name a VM image")]
    MissingImage,

    #[error("{variable}='{value}' is not a valid runner instance number (0-255)")]
    InvalidInstanceNumber { variable: &'static str, value: String },
}

impl AgentJobRequestMessage {
    /// Check the fields the lifecycle cannot run without.
    pub fn validate(&self) -> Result<(), JobRequestError> {
        if self.resources.is_none() {
            return Err(JobRequestError::MissingField("resources"));
        }
        if self.variables.is_none() {
            return Err(JobRequestError::MissingField("variables"));
        }
        if self.steps.is_none() {
            return Err(JobRequestError::MissingField("steps"));
        }
        self.system_connection()?;
        self.repository_name()?;
        self.image()?;
        Ok(())
    }

    pub fn endpoints(&self) -> &[ServiceEndpoint] {
        self.resources
            .as_ref()
            .map(|r| r.endpoints.as_slice())
            .unwrap_or_default()
    }

    /// The single `SystemVssConnection` endpoint (name compared case-insensitively).
    pub fn system_connection(&self) -> Result<&ServiceEndpoint, JobRequestError> {
        let name = constants::endpoints::SYSTEM_VSS_CONNECTION;
        let matches: Vec<&ServiceEndpoint> = self
            .endpoints()
            .iter()
            .filter(|e| e.name.eq_ignore_ascii_case(name))
            .collect();
        match matches.as_slice() {
            [endpoint] => Ok(endpoint),
            [] => Err(JobRequestError::MissingEndpoint(name.to_string())),
            many => Err(JobRequestError::AmbiguousEndpoint {
                name: name.to_string(),
                count: many.len(),
            }),
        }
    }

    /// Last segment of `github.repository`, e.g. `runner` for `octo/runner`.
    pub fn repository_name(&self) -> Result<&str, JobRequestError> {
        let full_name = self
            .context_data
            .get("github")
            .and_then(|g| g.get("repository"))
            .and_then(|r| r.as_str())
            .filter(|r| !r.trim().is_empty())
            .ok_or(JobRequestError::MissingRepository)?;
        let name = full_name.rsplit('/').next().unwrap_or(full_name);
        if name.is_empty() {
            return Err(JobRequestError::MissingRepository);
        }
        Ok(name)
    }

    pub fn image(&self) -> Result<&str, JobRequestError> {
        self.job_container
            .as_ref()
            .map(JobContainerReference::image)
            .filter(|i| !i.trim().is_empty())
            .ok_or(JobRequestError::MissingImage)
    }

    pub fn steps(&self) -> &[JobStep] {
        self.steps.as_deref().unwrap_or_default()
    }
}

/// Variable value from the job message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableValueMessage {
    pub value: String,
    #[serde(default)]
    pub is_secret: bool,
    #[serde(default)]
    pub is_read_only: bool,
}

/// A single step definition from the job message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStep {
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub display_name: String,

    /// Only the literal `always()` is understood; anything else means `success()`.
    #[serde(default)]
    pub condition: String,

    #[serde(default)]
    pub timeout_in_minutes: u32,

    #[serde(default)]
    pub environment: HashMap<String, String>,

    #[serde(default)]
    pub continue_on_error: bool,

    #[serde(default)]
    pub script: Option<String>,

    /// Relative to the workspace unless absolute.
    #[serde(default)]
    pub working_directory: Option<String>,
}

/// Job resources – service endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResources {
    #[serde(default)]
    pub endpoints: Vec<ServiceEndpoint>,
}

/// A service endpoint for server communication.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEndpoint {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub authorization: Option<EndpointAuthorization>,
    #[serde(default)]
    pub data: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointAuthorization {
    #[serde(default)]
    pub scheme: String,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

/// `jobContainer` is either a bare image reference or an object with `image`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobContainerReference {
    Image(String),
    Container {
        #[serde(default)]
        image: String,
    },
}

impl JobContainerReference {
    pub fn image(&self) -> &str {
        match self {
            JobContainerReference::Image(image) => image,
            JobContainerReference::Container { image } => image,
        }
    }
}

/// Identifies the remote plan that owns this job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOrchestrationPlanReference {
    #[serde(default)]
    pub scope_identifier: String,
    #[serde(default)]
    pub plan_type: String,
    #[serde(default)]
    pub plan_id: String,
    #[serde(default)]
    pub version: i32,
    #[serde(default)]
    pub features: PlanFeatures,
}

/// Capability bit flags advertised by the plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanFeatures(pub u32);

impl PlanFeatures {
    pub const NONE: PlanFeatures = PlanFeatures(0);
    /// The worker, not the listener, raises the job completed event.
    pub const JOB_COMPLETED_PLAN_EVENT: PlanFeatures = PlanFeatures(1);

    pub fn contains(self, flag: PlanFeatures) -> bool {
        self.0 & flag.0 == flag.0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionsEnvironmentReference {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// The worker service – top level orchestration.
pub struct Worker {
    host_context: Arc<HostContext>,
}

impl Worker {
    pub fn new(host_context: Arc<HostContext>) -> Self {
        Self { host_context }
    }

    /// Read a job message from a file, or from stdin when `source` is `-`.
    pub fn read_message(source: &str) -> Result<AgentJobRequestMessage> {
        let json = if source == "-" {
            let mut buffer = String::new();
            std::io::stdin()
                .read_to_string(&mut buffer)
                .context("Failed to read job message from stdin")?;
            buffer
        } else {
            std::fs::read_to_string(source)
                .with_context(|| format!("Failed to read job message from {}", source))?
        };

        serde_json::from_str(&json).context("Failed to deserialize AgentJobRequestMessage")
    }

    /// Runs the job and returns its final result. Only request validation and
    /// completion-event exhaustion surface as errors.
    pub async fn run_async(&self, message: AgentJobRequestMessage) -> Result<TaskResult> {
        let trace = self.host_context.get_trace("Worker");
        trace.info(&format!(
            "Job: {} ({})",
            message.job_display_name, message.job_id
        ));

        self.initialize_secrets(&message);

        let instance = instance_number_from_env()?;
        trace.info(&format!("Runner instance: {}", instance));

        let config_store = Arc::new(ConfigurationStore::new(&self.host_context));
        if config_store.is_configured() {
            match config_store.get_settings() {
                Ok(settings) if !settings.work_folder.is_empty() => {
                    self.host_context.set_work_folder(&settings.work_folder);
                }
                Ok(_) => {}
                Err(e) => trace.warning(&format!("Unable to load runner settings: {:#}", e)),
            }
        }

        let services = JobServices::production(&self.host_context, config_store)?;
        let job_runner = JobRunner::new(Arc::clone(&self.host_context), services, instance);

        let result = job_runner
            .run_async(message, CancellationToken::new())
            .await?;

        trace.info(&format!("Worker completed with result: {}", result));
        Ok(result)
    }

    /// Register secret variables and endpoint credentials with the masker.
    fn initialize_secrets(&self, message: &AgentJobRequestMessage) {
        let masker = &self.host_context.secret_masker;

        for var in message.variables.iter().flat_map(|v| v.values()) {
            if var.is_secret {
                masker.add_value(&var.value);
            }
        }

        for endpoint in message.endpoints() {
            if let Some(ref auth) = endpoint.authorization {
                for value in auth.parameters.values() {
                    masker.add_value(value);
                }
            }
        }
    }
}

/// `RUNNER_INSTANCE_NUMBER`, required to pick the VM slot.
pub fn instance_number_from_env() -> Result<u8, JobRequestError> {
    let variable = constants::variables::agent::INSTANCE_NUMBER;
    let value = std::env::var(variable).unwrap_or_default();
    parse_instance_number(variable, &value)
}

fn parse_instance_number(variable: &'static str, value: &str) -> Result<u8, JobRequestError> {
    value
        .trim()
        .parse::<u8>()
        .map_err(|_| JobRequestError::InvalidInstanceNumber {
            variable,
            value: value.to_string(),
        })
}

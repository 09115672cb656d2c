// JobServer: connection to the orchestration service that owns the plan.
//
// Only one call matters to the worker: raising the JobCompleted plan event.
// POST {url}/{scopeIdentifier}/_apis/distributedtask/hubs/{planType}/plans/{planId}/events
// with Bearer auth using the SystemVssConnection access token.

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use url::Url;
use vmrunner_common::{constants, TaskResult};

use crate::worker::{
    ActionsEnvironmentReference, ServiceEndpoint, TaskOrchestrationPlanReference,
    VariableValueMessage,
};

const API_VERSION: &str = "api-version=2.0-preview.1";
const REQUEST_TIMEOUT_SECS: u64 = 100;

/// Plan states in which the server will never accept the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanRejection {
    PlanNotFound,
    PlanSecurityViolation,
    PlanTerminated,
}

impl PlanRejection {
    /// Map the server's exception type key onto a rejection.
    pub fn from_type_key(type_key: &str) -> Option<Self> {
        match type_key {
            "TaskOrchestrationPlanNotFoundException" => Some(PlanRejection::PlanNotFound),
            "TaskOrchestrationPlanSecurityException" => Some(PlanRejection::PlanSecurityViolation),
            "TaskOrchestrationPlanTerminatedException" => Some(PlanRejection::PlanTerminated),
            _ => None,
        }
    }
}

impl std::fmt::Display for PlanRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanRejection::PlanNotFound => write!(f, "plan not found"),
            PlanRejection::PlanSecurityViolation => write!(f, "plan security violation"),
            PlanRejection::PlanTerminated => write!(f, "plan already terminated"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// Retrying cannot help.
    #[error("Completion event rejected: {0}")]
    Terminal(PlanRejection),

    #[error(transparent)]
    Retryable(#[from] anyhow::Error),
}

/// Body of the `JobCompleted` plan event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCompletedEvent {
    pub name: &'static str,
    pub job_id: String,
    pub request_id: u64,
    pub result: TaskResult,
    pub outputs: HashMap<String, VariableValueMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actions_environment: Option<ActionsEnvironmentReference>,
}

impl JobCompletedEvent {
    pub fn new(
        job_id: impl Into<String>,
        request_id: u64,
        result: TaskResult,
        outputs: HashMap<String, VariableValueMessage>,
        actions_environment: Option<ActionsEnvironmentReference>,
    ) -> Self {
        Self {
            name: "JobCompleted",
            job_id: job_id.into(),
            request_id,
            result,
            outputs,
            actions_environment,
        }
    }
}

#[async_trait]
pub trait JobServer: Send + Sync {
    /// Prepare the connection from the system endpoint. Must be called
    /// before [`JobServer::raise_plan_event`].
    fn connect(&self, endpoint: &ServiceEndpoint) -> Result<()>;

    async fn raise_plan_event(
        &self,
        plan: &TaskOrchestrationPlanReference,
        event: &JobCompletedEvent,
    ) -> Result<(), PublishError>;
}

#[derive(Debug, Clone)]
struct Connection {
    base_url: Url,
    access_token: String,
}

/// [`JobServer`] over the distributed task REST API.
pub struct VssJobServer {
    client: reqwest::Client,
    connection: Mutex<Option<Connection>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WrappedException {
    #[serde(default)]
    type_key: String,
    #[serde(default)]
    message: String,
}

impl VssJobServer {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!("VmRunner/{}", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            connection: Mutex::new(None),
        })
    }

    fn events_url(base_url: &Url, plan: &TaskOrchestrationPlanReference) -> String {
        format!(
            "{}/{}/_apis/distributedtask/hubs/{}/plans/{}/events?{}",
            base_url.as_str().trim_end_matches('/'),
            plan.scope_identifier,
            plan.plan_type,
            plan.plan_id,
            API_VERSION
        )
    }
}

/// Decide whether a failed response is worth retrying.
pub(crate) fn classify_failure(status: reqwest::StatusCode, body: &str) -> PublishError {
    if let Ok(exception) = serde_json::from_str::<WrappedException>(body) {
        if let Some(rejection) = PlanRejection::from_type_key(&exception.type_key) {
            return PublishError::Terminal(rejection);
        }
        if !exception.message.is_empty() {
            return PublishError::Retryable(anyhow::anyhow!(
                "HTTP {}: {} ({})",
                status,
                exception.message,
                exception.type_key
            ));
        }
    }
    PublishError::Retryable(anyhow::anyhow!("HTTP {}: {}", status, body))
}

#[async_trait]
impl JobServer for VssJobServer {
    fn connect(&self, endpoint: &ServiceEndpoint) -> Result<()> {
        let base_url = Url::parse(&endpoint.url)
            .with_context(|| format!("Invalid URL '{}' on endpoint {}", endpoint.url, endpoint.name))?;
        let access_token = endpoint
            .authorization
            .as_ref()
            .and_then(|a| a.parameters.get(constants::endpoints::ACCESS_TOKEN_PARAMETER))
            .with_context(|| format!("No AccessToken in {} authorization", endpoint.name))?
            .clone();

        *self.connection.lock() = Some(Connection {
            base_url,
            access_token,
        });
        Ok(())
    }

    async fn raise_plan_event(
        &self,
        plan: &TaskOrchestrationPlanReference,
        event: &JobCompletedEvent,
    ) -> Result<(), PublishError> {
        let connection = self
            .connection
            .lock()
            .clone()
            .context("Job server is not connected")?;
        let url = Self::events_url(&connection.base_url, plan);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&connection.access_token)
            .json(event)
            .send()
            .await
            .context("Failed to send JobCompleted event")?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_failure(status, &body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::job_message;
    use reqwest::StatusCode;

    #[test]
    fn terminal_type_keys_recognised() {
        for (key, expected) in [
            ("TaskOrchestrationPlanNotFoundException", PlanRejection::PlanNotFound),
            ("TaskOrchestrationPlanSecurityException", PlanRejection::PlanSecurityViolation),
            ("TaskOrchestrationPlanTerminatedException", PlanRejection::PlanTerminated),
        ] {
            let body = format!(r#"{{"typeKey":"{}","message":"nope"}}"#, key);
            match classify_failure(StatusCode::BAD_REQUEST, &body) {
                PublishError::Terminal(rejection) => assert_eq!(rejection, expected),
                other => panic!("expected terminal for {}, got {:?}", key, other),
            }
        }
    }

    #[test]
    fn other_failures_are_retryable() {
        let body = r#"{"typeKey":"TimelineNotFoundException","message":"gone"}"#;
        assert!(matches!(
            classify_failure(StatusCode::NOT_FOUND, body),
            PublishError::Retryable(_)
        ));
        assert!(matches!(
            classify_failure(StatusCode::BAD_GATEWAY, "<html>"),
            PublishError::Retryable(_)
        ));
    }

    #[test]
    fn event_serializes_camel_case() {
        let event = JobCompletedEvent::new("job-1", 42, TaskResult::Failed, HashMap::new(), None);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["name"], "JobCompleted");
        assert_eq!(json["jobId"], "job-1");
        assert_eq!(json["requestId"], 42);
        assert!(json.get("actionsEnvironment").is_none());
    }

    #[test]
    fn events_url_includes_plan_coordinates() {
        let message = job_message();
        let base = Url::parse("https://pipelines.example.com/tenant/").unwrap();
        let url = VssJobServer::events_url(&base, &message.plan);
        assert_eq!(
            url,
            format!(
                "https://pipelines.example.com/tenant/{}/_apis/distributedtask/hubs/{}/plans/{}/events?{}",
                message.plan.scope_identifier, message.plan.plan_type, message.plan.plan_id, API_VERSION
            )
        );
    }

    #[test]
    fn connect_requires_access_token() {
        let server = VssJobServer::new().unwrap();
        let mut endpoint = job_message().system_connection().unwrap().clone();
        assert!(server.connect(&endpoint).is_ok());

        endpoint.authorization = None;
        assert!(server.connect(&endpoint).is_err());
    }

    #[tokio::test]
    async fn raise_without_connect_is_retryable() {
        let server = VssJobServer::new().unwrap();
        let message = job_message();
        let event = JobCompletedEvent::new("job", 1, TaskResult::Succeeded, HashMap::new(), None);
        let err = server.raise_plan_event(&message.plan, &event).await.unwrap_err();
        assert!(matches!(err, PublishError::Retryable(_)));
    }
}

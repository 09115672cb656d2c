// Pre-execution gate for externally triggered (pull request) jobs.

use anyhow::Result;
use vmrunner_common::{ConfigurationStore, PullRequestSecuritySettings};
use vmrunner_sdk::TraceWriter;

use crate::github_context::GitHubContext;

const OWNER: &str = "OWNER";
const COLLABORATOR: &str = "COLLABORATOR";

/// Outcome of the gate, with a reason fit for the job log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityDecision {
    pub allowed: bool,
    pub reason: String,
}

impl SecurityDecision {
    fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }
}

/// Where the pull request policy comes from. Only consulted for pull requests.
pub trait PolicySource: Send + Sync {
    /// `Ok(None)` when no policy is configured.
    fn pull_request_policy(&self) -> Result<Option<PullRequestSecuritySettings>>;
}

impl PolicySource for ConfigurationStore {
    fn pull_request_policy(&self) -> Result<Option<PullRequestSecuritySettings>> {
        Ok(self.get_settings()?.pull_request_security)
    }
}

impl PolicySource for Option<PullRequestSecuritySettings> {
    fn pull_request_policy(&self) -> Result<Option<PullRequestSecuritySettings>> {
        Ok(self.clone())
    }
}

pub struct SecurityGate;

impl SecurityGate {
    /// Decide whether the job may run. Any failure to read the trigger
    /// context or the policy denies the job.
    pub fn evaluate(
        github: Option<&GitHubContext>,
        policy: &dyn PolicySource,
        trace: &dyn TraceWriter,
    ) -> SecurityDecision {
        let Some(github) = github else {
            trace.error("No github context in job message, not allowing this job to run");
            return SecurityDecision::deny("job message has no github context");
        };

        if !github.is_pull_request() {
            return SecurityDecision::allow("not triggered by a pull request");
        }

        match Self::evaluate_pull_request(github, policy, trace) {
            Ok(decision) => decision,
            Err(e) => {
                trace.error("Caught exception while evaluating pull request security");
                trace.error("As a safety precaution we are not allowing this job to run");
                trace.error(&format!("{:#}", e));
                SecurityDecision::deny(format!("unable to evaluate pull request: {:#}", e))
            }
        }
    }

    fn evaluate_pull_request(
        github: &GitHubContext,
        policy: &dyn PolicySource,
        trace: &dyn TraceWriter,
    ) -> Result<SecurityDecision> {
        let Some(policy) = policy.pull_request_policy()? else {
            trace.info("No pull request security defined in settings, allowing this build");
            return Ok(SecurityDecision::allow("no pull request policy configured"));
        };

        let association = github.author_association()?;
        if association == Some(OWNER) {
            trace.info("PR is from the repo owner, always allowed");
            return Ok(SecurityDecision::allow("author is the repository owner"));
        }
        if policy.allow_contributors && association == Some(COLLABORATOR) {
            trace.info("PR is from a repo collaborator, allowing");
            return Ok(SecurityDecision::allow("author is a repository collaborator"));
        }

        let Some(login) = github.head_user_login()? else {
            trace.info("Unable to get PR author, not allowing PR to run");
            return Ok(SecurityDecision::deny("pull request author is unknown"));
        };
        trace.info(&format!("GitHub PR author is {}", login));

        if policy.is_allowed_author(login) {
            trace.info("Author in PR allowed list");
            Ok(SecurityDecision::allow(format!("author '{}' is allowed", login)))
        } else {
            trace.info(&format!(
                "Not running job as author ({}) is not in {{{}}}",
                login,
                policy.allowed_authors.join(", ")
            ));
            Ok(SecurityDecision::deny(format!(
                "author '{}' is not in the allowed list",
                login
            )))
        }
    }
}

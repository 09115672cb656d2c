// JobExtension: job-level hooks around step execution.
// `initialize_job` produces the step list; `finalize_job` always runs after
// the steps and resolves the job's output variables.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::execution_context::ExecutionContext;
use crate::worker::{AgentJobRequestMessage, JobStep, VariableValueMessage};

#[async_trait]
pub trait JobExtension: Send + Sync {
    async fn initialize_job(
        &self,
        ctx: &mut ExecutionContext,
        message: &AgentJobRequestMessage,
    ) -> Result<Vec<JobStep>>;

    fn finalize_job(
        &self,
        ctx: &mut ExecutionContext,
        message: &AgentJobRequestMessage,
        job_start_time: DateTime<Utc>,
    );
}

/// Steps come straight from the job message.
#[derive(Debug, Default)]
pub struct DefaultJobExtension;

impl DefaultJobExtension {
    pub fn new() -> Self {
        Self
    }
}

/// `steps.<id>.outputs.<name>`, optionally wrapped in `${{ }}`.
fn parse_output_reference(reference: &str) -> Option<(&str, &str)> {
    let reference = reference.trim();
    let reference = reference
        .strip_prefix("${{")
        .and_then(|r| r.strip_suffix("}}"))
        .unwrap_or(reference)
        .trim();

    let rest = reference.strip_prefix("steps.")?;
    let (step_id, name) = rest.split_once(".outputs.")?;
    if step_id.is_empty() || name.is_empty() {
        return None;
    }
    Some((step_id, name))
}

#[async_trait]
impl JobExtension for DefaultJobExtension {
    async fn initialize_job(
        &self,
        ctx: &mut ExecutionContext,
        message: &AgentJobRequestMessage,
    ) -> Result<Vec<JobStep>> {
        ctx.section("Set up job");
        if ctx.cancel_token().is_cancelled() {
            anyhow::bail!("The job was cancelled before it was initialized");
        }

        let steps = message.steps().to_vec();
        for step in &steps {
            if step.script.is_none() {
                ctx.debug(&format!("Step '{}' has no script", step.display_name));
            }
        }
        ctx.info(&format!("Job initialized with {} steps.", steps.len()));
        Ok(steps)
    }

    fn finalize_job(
        &self,
        ctx: &mut ExecutionContext,
        message: &AgentJobRequestMessage,
        job_start_time: DateTime<Utc>,
    ) {
        ctx.section("Complete job");

        let mut resolved = Vec::new();
        {
            let global = ctx.global();
            for (name, reference) in &message.job_outputs {
                let Some((step_id, output)) = parse_output_reference(reference) else {
                    resolved.push((name.clone(), None));
                    continue;
                };
                let value = global
                    .step_outputs
                    .get(step_id)
                    .and_then(|outputs| outputs.get(output))
                    .cloned();
                resolved.push((name.clone(), value));
            }
        }

        for (name, value) in resolved {
            match value {
                Some(value) => {
                    ctx.global_mut().job_outputs.insert(
                        name,
                        VariableValueMessage {
                            value,
                            is_secret: false,
                            is_read_only: false,
                        },
                    );
                }
                None => ctx.debug(&format!("Job output '{}' did not resolve to a value", name)),
            }
        }

        let elapsed = Utc::now() - job_start_time;
        ctx.info(&format!(
            "Job finished in {}s",
            elapsed.num_milliseconds().max(0) as f64 / 1000.0
        ));
    }
}

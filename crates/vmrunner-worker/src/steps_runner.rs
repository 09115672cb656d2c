// StepsRunner: the step-execution engine seam.
//
// The orchestrator hands the initialized step list to a StepsRunner and only
// looks at the job result afterwards. ScriptStepsRunner is the built-in
// engine: every step is a bash script run in the job workspace.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use vmrunner_common::{constants, HostContext, TaskResult, Tracing, WellKnownDirectory};
use vmrunner_sdk::{IOUtil, ProcessInvoker, TraceWriter, WhichUtil};

use crate::execution_context::ExecutionContext;
use crate::worker::JobStep;

const DEFAULT_STEP_TIMEOUT_MINUTES: u64 = 360;
const OUTPUT_FILE_VARIABLE: &str = "GITHUB_OUTPUT";

#[async_trait]
pub trait StepsRunner: Send + Sync {
    /// Run `steps` in order, merging each step's result into `ctx`.
    async fn run_async(&self, ctx: &mut ExecutionContext, steps: Vec<JobStep>) -> Result<()>;
}

pub struct ScriptStepsRunner {
    host_context: Arc<HostContext>,
    trace: Tracing,
}

impl ScriptStepsRunner {
    pub fn new(host_context: Arc<HostContext>) -> Self {
        Self {
            trace: host_context.get_trace("StepsRunner"),
            host_context,
        }
    }

    /// Empty condition means `success()`. Only `always()` runs after a failure.
    fn should_run(ctx: &ExecutionContext, step: &JobStep) -> bool {
        if step.condition.trim() == "always()" {
            return true;
        }
        matches!(
            ctx.result(),
            None | Some(TaskResult::Succeeded) | Some(TaskResult::SucceededWithIssues)
        )
    }

    fn working_directory(&self, ctx: &ExecutionContext, step: &JobStep) -> PathBuf {
        let workspace = self
            .host_context
            .get_directory(WellKnownDirectory::Work)
            .join(&ctx.global().workspace_directory);
        match step.working_directory.as_deref() {
            Some(dir) if !dir.is_empty() => workspace.join(dir),
            _ => workspace,
        }
    }

    fn environment(&self, ctx: &ExecutionContext, step: &JobStep) -> HashMap<String, String> {
        let mut environment = ctx.variables().copy_into_env_block();
        environment.extend(ctx.global().environment_variables.clone());
        environment.extend(step.environment.clone());
        environment
    }

    async fn run_step(
        &self,
        ctx: &mut ExecutionContext,
        step: &JobStep,
        cancel_token: CancellationToken,
    ) -> Result<i32> {
        let script = step.script.as_deref().unwrap_or_default();
        if script.trim().is_empty() {
            ctx.debug("Script body is empty, skipping.");
            return Ok(0);
        }

        let temp = self.host_context.get_directory(WellKnownDirectory::Temp);
        std::fs::create_dir_all(&temp)
            .with_context(|| format!("Failed to create {}", temp.display()))?;
        let id = Uuid::new_v4().simple().to_string();
        let script_file = temp.join(format!("{}.sh", id));
        let output_file = temp.join(format!("{}_output", id));
        std::fs::write(&script_file, script)
            .with_context(|| format!("Failed to write script file {}", script_file.display()))?;
        std::fs::write(&output_file, "")
            .with_context(|| format!("Failed to create {}", output_file.display()))?;

        let mut environment = self.environment(ctx, step);
        environment.insert(
            OUTPUT_FILE_VARIABLE.to_string(),
            output_file.to_string_lossy().into_owned(),
        );

        let shell = WhichUtil::which(constants::vm::SHELL, false)
            .ok()
            .flatten()
            .unwrap_or_else(|| PathBuf::from(constants::vm::SHELL));
        let arguments: Vec<String> = ["--noprofile", "--norc", "-e", "-o", "pipefail"]
            .iter()
            .map(|s| s.to_string())
            .chain(std::iter::once(script_file.to_string_lossy().into_owned()))
            .collect();
        let working_directory = self.working_directory(ctx, step);
        ctx.debug(&format!(
            "{} {} (in {})",
            shell.display(),
            arguments.join(" "),
            working_directory.display()
        ));

        let result = self
            .execute(ctx, working_directory, shell, arguments, environment, cancel_token)
            .await;

        if !step.id.is_empty() {
            let outputs = read_outputs(&output_file);
            if !outputs.is_empty() {
                ctx.global_mut()
                    .step_outputs
                    .entry(step.id.clone())
                    .or_default()
                    .extend(outputs);
            }
        }
        for file in [&script_file, &output_file] {
            if let Err(e) = IOUtil::delete_file(file) {
                self.trace.warning(&format!("{:#}", e));
            }
        }

        result
    }

    async fn execute(
        &self,
        ctx: &mut ExecutionContext,
        working_directory: PathBuf,
        shell: PathBuf,
        arguments: Vec<String>,
        environment: HashMap<String, String>,
        cancel_token: CancellationToken,
    ) -> Result<i32> {
        let mut invoker = ProcessInvoker::new(Arc::new(self.trace.clone()));
        let mut stdout = invoker
            .take_stdout_receiver()
            .context("stdout receiver already taken")?;
        let mut stderr = invoker
            .take_stderr_receiver()
            .context("stderr receiver already taken")?;

        let execution = tokio::spawn(async move {
            invoker
                .execute(
                    &working_directory,
                    &shell,
                    &arguments,
                    Some(&environment),
                    false,
                    false,
                    cancel_token,
                )
                .await
        });

        let (mut stdout_open, mut stderr_open) = (true, true);
        while stdout_open || stderr_open {
            tokio::select! {
                line = stdout.recv(), if stdout_open => match line {
                    Some(line) => ctx.output(&line.data),
                    None => stdout_open = false,
                },
                line = stderr.recv(), if stderr_open => match line {
                    Some(line) => ctx.output(&line.data),
                    None => stderr_open = false,
                },
            }
        }

        execution.await.context("Step process task failed")?
    }
}

/// `name=value` lines written by the step to its output file.
fn read_outputs(path: &Path) -> HashMap<String, String> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return HashMap::new();
    };
    content
        .lines()
        .filter_map(|line| line.split_once('='))
        .filter(|(name, _)| !name.trim().is_empty())
        .map(|(name, value)| (name.trim().to_string(), value.to_string()))
        .collect()
}

#[async_trait]
impl StepsRunner for ScriptStepsRunner {
    async fn run_async(&self, ctx: &mut ExecutionContext, steps: Vec<JobStep>) -> Result<()> {
        for step in steps {
            let job_token = ctx.cancel_token();
            if job_token.is_cancelled() {
                ctx.info(&format!(
                    "Skipping step '{}' due to job cancellation.",
                    step.display_name
                ));
                ctx.merge_result(TaskResult::Canceled);
                continue;
            }
            if !Self::should_run(ctx, &step) {
                ctx.info(&format!(
                    "Skipping step '{}' (condition evaluated to false).",
                    step.display_name
                ));
                continue;
            }

            let mut step_ctx = ctx.create_child(step.display_name.clone());
            step_ctx.section(&format!("Run {}", step.display_name));

            let minutes = match step.timeout_in_minutes {
                0 => DEFAULT_STEP_TIMEOUT_MINUTES,
                n => u64::from(n),
            };
            let step_token = job_token.child_token();
            let mut timed_out = false;
            let result = {
                let run = self.run_step(&mut step_ctx, &step, step_token.clone());
                tokio::pin!(run);
                tokio::select! {
                    result = &mut run => result,
                    _ = tokio::time::sleep(Duration::from_secs(minutes * 60)) => {
                        timed_out = true;
                        step_token.cancel();
                        run.await
                    }
                }
            };

            let outcome = match result {
                Ok(0) => TaskResult::Succeeded,
                Ok(exit_code) => {
                    step_ctx.error(&format!("Process completed with exit code {}.", exit_code));
                    TaskResult::Failed
                }
                Err(_) if timed_out => {
                    step_ctx.error(&format!(
                        "The step '{}' has exceeded the maximum execution time of {} minutes.",
                        step.display_name, minutes
                    ));
                    TaskResult::Failed
                }
                Err(_) if job_token.is_cancelled() => {
                    step_ctx.info("The step was cancelled.");
                    TaskResult::Canceled
                }
                Err(e) => {
                    step_ctx.error(&format!("{:#}", e));
                    TaskResult::Failed
                }
            };

            let conclusion = if outcome == TaskResult::Failed && step.continue_on_error {
                step_ctx.info("Step failed but continue-on-error is enabled.");
                TaskResult::Succeeded
            } else {
                outcome
            };
            step_ctx.complete(Some(outcome));
            ctx.merge_result(conclusion);
            self.trace.info(&format!(
                "Step '{}' finished: outcome={}, conclusion={}",
                step.display_name, outcome, conclusion
            ));
        }
        Ok(())
    }
}

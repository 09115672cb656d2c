// Completion reporting: close the job context, drain the job server queue,
// release temp storage and publish the JobCompleted event to the plan.

use std::sync::Arc;
use std::time::Duration;
use vmrunner_common::{constants, TaskResult, TaskResultUtil, Tracing};
use vmrunner_sdk::TraceWriter;

use crate::execution_context::ExecutionContext;
use crate::job_server::{JobCompletedEvent, JobServer, PublishError};
use crate::job_server_queue::ScopedJobServerQueue;
use crate::temp_directory_manager::TempDirectoryManager;
use crate::worker::{AgentJobRequestMessage, PlanFeatures, TaskOrchestrationPlanReference};

#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    /// Every publish attempt failed with a retryable error.
    #[error(
        "Failed to report completion of job {job_id} (request {request_id}) after {} attempts: {}",
        attempts.len(),
        attempts.join("; ")
    )]
    RetriesExhausted {
        job_id: String,
        request_id: u64,
        attempts: Vec<String>,
    },
}

pub struct CompletionReporter {
    job_server: Arc<dyn JobServer>,
    trace: Tracing,
    max_attempts: u32,
    retry_delay: Duration,
}

impl CompletionReporter {
    pub fn new(job_server: Arc<dyn JobServer>, trace: Tracing) -> Self {
        Self {
            job_server,
            trace,
            max_attempts: constants::completion::MAX_ATTEMPTS,
            retry_delay: Duration::from_secs(constants::completion::RETRY_DELAY_SECS),
        }
    }

    /// Finish the job with `result_override` merged into what the job
    /// accumulated, and report it to the plan when the plan supports it.
    pub async fn complete(
        &self,
        ctx: &mut ExecutionContext,
        message: &AgentJobRequestMessage,
        result_override: Option<TaskResult>,
        queue: &mut ScopedJobServerQueue,
        temp_directory: &mut TempDirectoryManager,
    ) -> Result<TaskResult, CompletionError> {
        let mut result = ctx.complete(result_override);
        self.trace.info(&format!("Job result after all job steps finish: {}", result));

        self.trace.info("Shutting down the job server queue.");
        if let Err(e) = queue.shutdown(true).await {
            self.trace.error(&format!(
                "Caught exception from the job server queue shutdown: {:#}",
                e
            ));
            result = TaskResultUtil::merge_task_results(Some(result), TaskResult::Failed);
            self.trace.info(&format!(
                "Update job result with current job server queue shutdown failure: {}",
                result
            ));
        }

        // The queue may still have been uploading files out of temp.
        temp_directory.cleanup();

        if !message
            .plan
            .features
            .contains(PlanFeatures::JOB_COMPLETED_PLAN_EVENT)
        {
            self.trace.info(&format!(
                "Skip raise job completed event call from worker because plan version is {}",
                message.plan.version
            ));
            return Ok(result);
        }

        self.trace.info("Raising job completed event.");
        let outputs = ctx.global().job_outputs.clone();
        let actions_environment = ctx.global().actions_environment.clone();
        let event = JobCompletedEvent::new(
            message.job_id.clone(),
            message.request_id,
            result,
            outputs,
            actions_environment,
        );
        self.report(&message.plan, &event).await
    }

    /// Publish `event`, resending the same event on retryable failures.
    pub async fn report(
        &self,
        plan: &TaskOrchestrationPlanReference,
        event: &JobCompletedEvent,
    ) -> Result<TaskResult, CompletionError> {
        let mut attempts = Vec::new();
        for attempt in 1..=self.max_attempts {
            self.trace
                .info(&format!("Raising job completed event (attempt {}).", attempt));
            match self.job_server.raise_plan_event(plan, event).await {
                Ok(()) => return Ok(event.result),
                Err(PublishError::Terminal(rejection)) => {
                    self.trace.error(&format!(
                        "TaskOrchestrationPlan ({}) for job {} is no longer accepting events: {}",
                        plan.plan_id, event.job_id, rejection
                    ));
                    return Ok(TaskResult::Failed);
                }
                Err(PublishError::Retryable(e)) => {
                    self.trace.error(&format!(
                        "Catch exception while attempting to send JobCompletedEvent for job {}, will retry: {:#}",
                        event.job_id, e
                    ));
                    attempts.push(format!("{:#}", e));
                }
            }

            if attempt < self.max_attempts {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        self.trace.error(&format!(
            "Raise job completed event failed {} times.",
            attempts.len()
        ));
        Err(CompletionError::RetriesExhausted {
            job_id: event.job_id.clone(),
            request_id: event.request_id,
            attempts,
        })
    }
}

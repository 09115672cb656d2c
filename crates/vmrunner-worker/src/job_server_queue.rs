// JobServerQueue: background upload of the job's timeline and logs.
//
// The queue is started once the job is accepted and must be shut down exactly
// once, on both the success and the failure path. ScopedJobServerQueue
// enforces that no matter how many times shutdown is requested.

use anyhow::Result;
use async_trait::async_trait;
use vmrunner_common::{HostContext, Tracing};
use vmrunner_sdk::TraceWriter;

use crate::worker::AgentJobRequestMessage;

#[async_trait]
pub trait JobServerQueue: Send {
    fn start(&mut self, message: &AgentJobRequestMessage);

    /// Flush whatever is pending and stop.
    async fn shutdown(&mut self) -> Result<()>;
}

/// Queue used when the runner has no timeline upload configured. Only
/// traces what it would do.
pub struct LocalJobServerQueue {
    trace: Tracing,
    job_id: Option<String>,
}

impl LocalJobServerQueue {
    pub fn new(host_context: &HostContext) -> Self {
        Self {
            trace: host_context.get_trace("JobServerQueue"),
            job_id: None,
        }
    }
}

#[async_trait]
impl JobServerQueue for LocalJobServerQueue {
    fn start(&mut self, message: &AgentJobRequestMessage) {
        self.trace
            .info(&format!("Job server queue started for job {}", message.job_id));
        self.job_id = Some(message.job_id.clone());
    }

    async fn shutdown(&mut self) -> Result<()> {
        if let Some(job_id) = self.job_id.take() {
            self.trace
                .info(&format!("Job server queue stopped for job {}", job_id));
        }
        Ok(())
    }
}

enum QueueState {
    NotStarted(Box<dyn JobServerQueue>),
    Running(Box<dyn JobServerQueue>),
    ShutDown,
}

/// Owns a [`JobServerQueue`] for the length of one job.
pub struct ScopedJobServerQueue {
    state: QueueState,
    trace: Tracing,
}

impl ScopedJobServerQueue {
    pub fn new(queue: Box<dyn JobServerQueue>, trace: Tracing) -> Self {
        Self {
            state: QueueState::NotStarted(queue),
            trace,
        }
    }

    pub fn start(&mut self, message: &AgentJobRequestMessage) {
        self.state = match std::mem::replace(&mut self.state, QueueState::ShutDown) {
            QueueState::NotStarted(mut queue) => {
                queue.start(message);
                QueueState::Running(queue)
            }
            other => other,
        };
    }

    pub fn is_shut_down(&self) -> bool {
        matches!(self.state, QueueState::ShutDown)
    }

    /// Shut the queue down if it has not been already. The queue counts as
    /// shut down afterwards even when this fails. With `throw_on_failure`
    /// unset a failure is only traced.
    pub async fn shutdown(&mut self, throw_on_failure: bool) -> Result<()> {
        let mut queue = match std::mem::replace(&mut self.state, QueueState::ShutDown) {
            QueueState::Running(queue) => queue,
            QueueState::NotStarted(_) | QueueState::ShutDown => return Ok(()),
        };

        match queue.shutdown().await {
            Ok(()) => Ok(()),
            Err(e) if throw_on_failure => Err(e),
            Err(e) => {
                self.trace
                    .error(&format!("Error shutting down job server queue: {:#}", e));
                Ok(())
            }
        }
    }
}

// Job/step result values, their process return codes, and result merging.

use serde::{Deserialize, Serialize};

/// Offset added to TaskResult values to produce process return codes.
const RETURN_CODE_OFFSET: i32 = 100;

/// Outcome of a step or a whole job.
///
/// The discriminants are part of the wire format (return codes, plan events)
/// and the ordering drives [`TaskResultUtil::merge_task_results`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[repr(i32)]
pub enum TaskResult {
    Succeeded = 0,
    SucceededWithIssues = 1,
    Failed = 2,
    Canceled = 3,
    Skipped = 4,
    Abandoned = 5,
}

impl TaskResult {
    /// Succeeded or SucceededWithIssues.
    pub fn is_success(self) -> bool {
        matches!(self, TaskResult::Succeeded | TaskResult::SucceededWithIssues)
    }
}

impl std::fmt::Display for TaskResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskResult::Succeeded => "Succeeded",
            TaskResult::SucceededWithIssues => "SucceededWithIssues",
            TaskResult::Failed => "Failed",
            TaskResult::Canceled => "Canceled",
            TaskResult::Skipped => "Skipped",
            TaskResult::Abandoned => "Abandoned",
        };
        f.write_str(name)
    }
}

pub struct TaskResultUtil;

impl TaskResultUtil {
    pub fn translate_to_return_code(result: TaskResult) -> i32 {
        RETURN_CODE_OFFSET + (result as i32)
    }

    /// Merge an incoming result into the current one, keeping the more severe.
    ///
    /// - no current result: the incoming one wins
    /// - current is Canceled, Skipped or Abandoned: it is terminal and kept
    /// - otherwise the incoming result wins when it is at least as severe
    ///
    /// A merge never moves `Failed` back to a success value.
    pub fn merge_task_results(
        current_result: Option<TaskResult>,
        coming_result: TaskResult,
    ) -> TaskResult {
        match current_result {
            None => coming_result,
            Some(current) if current > TaskResult::Failed => current,
            Some(current) if coming_result >= current => coming_result,
            Some(current) => current,
        }
    }
}

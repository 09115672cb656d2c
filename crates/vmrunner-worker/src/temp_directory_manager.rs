// Per-job scratch directory (`<work>/_temp`), exposed to steps as RUNNER_TEMP.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use vmrunner_common::{constants, HostContext, Tracing, WellKnownDirectory};
use vmrunner_sdk::{IOUtil, TraceWriter};

use crate::execution_context::ExecutionContext;

pub struct TempDirectoryManager {
    trace: Tracing,
    host_context: Arc<HostContext>,
    temp_directory: Option<PathBuf>,
}

impl TempDirectoryManager {
    pub fn new(host_context: Arc<HostContext>) -> Self {
        Self {
            trace: host_context.get_trace("TempDirectoryManager"),
            host_context,
            temp_directory: None,
        }
    }

    pub fn temp_directory(&self) -> Option<&Path> {
        self.temp_directory.as_deref()
    }

    /// Start the job with an empty temp directory.
    pub fn initialize(&mut self, ctx: &mut ExecutionContext) -> Result<()> {
        let temp = self.host_context.get_directory(WellKnownDirectory::Temp);
        ctx.debug(&format!("Cleaning runner temp folder: {}", temp.display()));

        if let Err(e) = IOUtil::delete_directory_contents(&temp) {
            ctx.warning(&format!("Failed to clean runner temp folder: {:#}", e));
        }
        std::fs::create_dir_all(&temp)
            .with_context(|| format!("Failed to create {}", temp.display()))?;

        ctx.global_mut().environment_variables.insert(
            constants::variables::agent::TEMP_DIRECTORY.to_string(),
            temp.to_string_lossy().into_owned(),
        );
        self.temp_directory = Some(temp);
        Ok(())
    }

    /// Empty the temp directory. Runs at most once per `initialize`.
    pub fn cleanup(&mut self) {
        let Some(temp) = self.temp_directory.take() else {
            return;
        };
        self.trace
            .info(&format!("Cleaning runner temp folder: {}", temp.display()));
        if let Err(e) = IOUtil::delete_directory_contents(&temp) {
            self.trace
                .warning(&format!("Failed to clean runner temp folder: {:#}", e));
        }
    }
}

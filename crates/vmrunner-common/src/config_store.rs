// Loads the runner settings file (`.runner`).

use crate::constants::WellKnownConfigFile;
use crate::host_context::HostContext;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

// ---------------------------------------------------------------------------
// RunnerSettings
// ---------------------------------------------------------------------------

/// Policy applied to jobs triggered by pull requests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PullRequestSecuritySettings {
    /// Let repository collaborators run jobs without being on the allow-list.
    #[serde(default, rename = "AllowContributors")]
    pub allow_contributors: bool,

    /// Exact (case-sensitive) logins allowed to run jobs.
    #[serde(default, rename = "AllowedAuthors")]
    pub allowed_authors: Vec<String>,
}

impl PullRequestSecuritySettings {
    pub fn is_allowed_author(&self, login: &str) -> bool {
        self.allowed_authors.iter().any(|a| a == login)
    }
}

/// Persisted runner configuration. Only the keys the worker reads are
/// modeled; everything else in the file is ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunnerSettings {
    /// The work directory name / path (relative to root).
    #[serde(default, rename = "WorkFolder")]
    pub work_folder: String,

    /// `None` disables the pull-request gate entirely.
    #[serde(
        default,
        rename = "PullRequestSecurity",
        alias = "PullRequestSecuritySettings"
    )]
    pub pull_request_security: Option<PullRequestSecuritySettings>,
}

// ---------------------------------------------------------------------------
// ConfigurationStore
// ---------------------------------------------------------------------------

pub struct ConfigurationStore {
    config_file_path: PathBuf,
    settings: Mutex<Option<RunnerSettings>>,
}

impl ConfigurationStore {
    pub fn new(context: &HostContext) -> Self {
        Self {
            config_file_path: context.get_config_file(WellKnownConfigFile::Runner),
            settings: Mutex::new(None),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.config_file_path.exists()
    }

    /// Load and return runner settings. Cached after first load.
    pub fn get_settings(&self) -> Result<RunnerSettings> {
        let mut guard = self.settings.lock();
        if let Some(ref settings) = *guard {
            return Ok(settings.clone());
        }

        let json = fs::read_to_string(&self.config_file_path)
            .with_context(|| format!("Failed to read settings from {:?}", self.config_file_path))?;

        let settings: RunnerSettings = serde_json::from_str(json.trim_start_matches('\u{feff}'))
            .with_context(|| "Failed to deserialize runner settings")?;

        *guard = Some(settings.clone());
        Ok(settings)
    }
}

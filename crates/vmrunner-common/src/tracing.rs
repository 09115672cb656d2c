// Per-component diagnostic trace sources with secret masking.

use crate::secret_masker::SecretMasker;
use chrono::Utc;
use std::sync::Arc;
use vmrunner_sdk::TraceWriter;

/// Trace severity, ordered from most to least verbose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TraceEventType {
    Verbose,
    Information,
    Warning,
    Error,
}

impl std::fmt::Display for TraceEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TraceEventType::Verbose => write!(f, "VERB"),
            TraceEventType::Information => write!(f, "INFO"),
            TraceEventType::Warning => write!(f, "WARN"),
            TraceEventType::Error => write!(f, "ERR "),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TraceSetting {
    /// Minimum severity to emit.
    pub level: TraceEventType,
    /// Mirror every line to stdout (useful when the worker runs interactively).
    pub print_to_stdout: bool,
}

impl Default for TraceSetting {
    fn default() -> Self {
        Self {
            level: TraceEventType::Verbose,
            print_to_stdout: false,
        }
    }
}

/// A named trace source. Cheap to clone; all sources share one masker.
#[derive(Clone)]
pub struct Tracing {
    name: String,
    secret_masker: Arc<SecretMasker>,
    setting: TraceSetting,
}

impl Tracing {
    pub fn new(
        name: impl Into<String>,
        secret_masker: Arc<SecretMasker>,
        setting: TraceSetting,
    ) -> Self {
        Self {
            name: name.into(),
            secret_masker,
            setting,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn trace(&self, event_type: TraceEventType, message: &str) {
        if event_type < self.setting.level {
            return;
        }

        let masked = self.secret_masker.mask_secrets(message);
        let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");
        let formatted = format!("[{}][{}] {}: {}", timestamp, self.name, event_type, masked);

        match event_type {
            TraceEventType::Error => tracing::error!("{}", formatted),
            TraceEventType::Warning => tracing::warn!("{}", formatted),
            TraceEventType::Information => tracing::info!("{}", formatted),
            TraceEventType::Verbose => tracing::debug!("{}", formatted),
        }

        if self.setting.print_to_stdout {
            println!("{}", formatted);
        }
    }

    pub fn entering(&self, name: &str) {
        self.verbose(&format!("Entering {}", name));
    }

    /// Log an error and each of its causes on separate lines.
    pub fn error_chain(&self, err: &(dyn std::error::Error + 'static)) {
        self.error(&err.to_string());
        let mut source = err.source();
        while let Some(cause) = source {
            self.error(&format!("  caused by: {}", cause));
            source = cause.source();
        }
    }
}

impl TraceWriter for Tracing {
    fn info(&self, message: &str) {
        self.trace(TraceEventType::Information, message);
    }

    fn verbose(&self, message: &str) {
        self.trace(TraceEventType::Verbose, message);
    }

    fn warning(&self, message: &str) {
        self.trace(TraceEventType::Warning, message);
    }

    fn error(&self, message: &str) {
        self.trace(TraceEventType::Error, message);
    }
}

/// Hands out named [`Tracing`] sources sharing one masker and setting.
pub struct TraceManager {
    secret_masker: Arc<SecretMasker>,
    default_setting: TraceSetting,
}

impl TraceManager {
    pub fn with_setting(secret_masker: Arc<SecretMasker>, setting: TraceSetting) -> Self {
        Self {
            secret_masker,
            default_setting: setting,
        }
    }

    pub fn get(&self, name: &str) -> Tracing {
        Tracing::new(name, self.secret_masker.clone(), self.default_setting.clone())
    }
}

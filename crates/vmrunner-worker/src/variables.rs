// Job variable store with secret tracking and environment block export.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use vmrunner_common::SecretMasker;

use crate::worker::AgentJobRequestMessage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableValue {
    pub value: String,
    pub is_secret: bool,
    pub is_read_only: bool,
}

/// Thread-safe variable store for one job.
///
/// Names are case-insensitive. Secret values are registered with the
/// `SecretMasker` as they are stored.
#[derive(Clone)]
pub struct Variables {
    store: Arc<RwLock<HashMap<String, VariableValue>>>,
    secret_masker: Option<Arc<SecretMasker>>,
}

impl std::fmt::Debug for Variables {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Variables")
            .field("count", &self.store.read().len())
            .finish()
    }
}

impl Variables {
    pub fn new() -> Self {
        Self {
            store: Arc::new(RwLock::new(HashMap::new())),
            secret_masker: None,
        }
    }

    pub fn with_masker(masker: Arc<SecretMasker>) -> Self {
        Self {
            store: Arc::new(RwLock::new(HashMap::new())),
            secret_masker: Some(masker),
        }
    }

    pub fn from_message(message: &AgentJobRequestMessage, masker: &Arc<SecretMasker>) -> Self {
        let vars = Self::with_masker(Arc::clone(masker));
        for (name, var) in message.variables.iter().flatten() {
            vars.insert(
                name,
                VariableValue {
                    value: var.value.clone(),
                    is_secret: var.is_secret,
                    is_read_only: var.is_read_only,
                },
            );
        }
        vars
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.store
            .read()
            .get(&name.to_lowercase())
            .map(|v| v.value.clone())
    }

    /// `true`/`1` (any case) are true; everything else, including unset, is false.
    pub fn get_bool(&self, name: &str) -> bool {
        self.get(name)
            .map(|v| v.eq_ignore_ascii_case("true") || v.trim() == "1")
            .unwrap_or(false)
    }

    /// Returns `false` if the variable is read-only and was not overwritten.
    pub fn set(&self, name: &str, value: impl Into<String>, is_secret: bool) -> bool {
        let key = name.to_lowercase();
        if let Some(existing) = self.store.read().get(&key) {
            if existing.is_read_only {
                return false;
            }
        }

        self.insert(
            name,
            VariableValue {
                value: value.into(),
                is_secret,
                is_read_only: false,
            },
        );
        true
    }

    /// Store a runner-derived value. Overwrites whatever the job message
    /// sent, read-only or not, and leaves the result read-only.
    pub fn set_system(&self, name: &str, value: impl Into<String>) {
        self.insert(
            name,
            VariableValue {
                value: value.into(),
                is_secret: false,
                is_read_only: true,
            },
        );
    }

    fn insert(&self, name: &str, value: VariableValue) {
        if value.is_secret {
            if let Some(ref masker) = self.secret_masker {
                masker.add_value(&value.value);
            }
        }
        self.store.write().insert(name.to_lowercase(), value);
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.store.read().contains_key(&name.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.store.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.read().is_empty()
    }

    /// Non-secret variables as process environment: `system.qemuIp` → `SYSTEM_QEMUIP`.
    pub fn copy_into_env_block(&self) -> HashMap<String, String> {
        self.store
            .read()
            .iter()
            .filter(|(_, var)| !var.is_secret)
            .map(|(name, var)| (name.replace('.', "_").to_uppercase(), var.value.clone()))
            .collect()
    }
}

impl Default for Variables {
    fn default() -> Self {
        Self::new()
    }
}

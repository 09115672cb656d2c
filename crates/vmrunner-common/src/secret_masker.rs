// Replaces registered secret values in job and diagnostic output.

use parking_lot::RwLock;

const MASK: &str = "***";

/// Thread-safe set of secret values that are replaced with `***` in any
/// string passed through [`SecretMasker::mask_secrets`].
#[derive(Debug, Default)]
pub struct SecretMasker {
    /// Sorted longest first so a secret containing another is masked whole.
    secrets: RwLock<Vec<String>>,
}

impl SecretMasker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a secret. Blank values are ignored.
    pub fn add_value(&self, secret: &str) {
        let trimmed = secret.trim();
        if trimmed.is_empty() {
            return;
        }

        let mut secrets = self.secrets.write();
        if secrets.iter().any(|s| s == trimmed) {
            return;
        }
        secrets.push(trimmed.to_string());
        secrets.sort_by(|a, b| b.len().cmp(&a.len()));
    }

    pub fn mask_secrets(&self, input: &str) -> String {
        let secrets = self.secrets.read();
        let shortest = secrets.last().map(|s| s.len()).unwrap_or(0);
        if secrets.is_empty() || input.len() < shortest {
            return input.to_string();
        }

        secrets.iter().fold(input.to_string(), |acc, secret| {
            if acc.contains(secret.as_str()) {
                acc.replace(secret.as_str(), MASK)
            } else {
                acc
            }
        })
    }

    pub fn secret_count(&self) -> usize {
        self.secrets.read().len()
    }
}

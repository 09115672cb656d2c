use std::path::{Path, PathBuf};

/// Locates executables on `PATH`.
pub struct WhichUtil;

impl WhichUtil {
    /// Locate the first occurrence of `command` on the system `PATH`.
    ///
    /// Absolute paths are returned as-is when they point at an executable file.
    /// Returns `Ok(None)` when nothing is found and `require` is false.
    pub fn which(command: &str, require: bool) -> anyhow::Result<Option<PathBuf>> {
        if command.is_empty() {
            if require {
                anyhow::bail!("command must not be empty");
            }
            return Ok(None);
        }

        let command_path = Path::new(command);
        if command_path.is_absolute() && command_path.is_file() && Self::is_executable(command_path)
        {
            return Ok(Some(command_path.to_path_buf()));
        }

        let path_var = std::env::var_os("PATH").unwrap_or_default();
        for dir in std::env::split_paths(&path_var) {
            if !dir.is_dir() {
                continue;
            }
            let candidate = dir.join(command);
            if candidate.is_file() && Self::is_executable(&candidate) {
                return Ok(Some(candidate));
            }
        }

        if require {
            anyhow::bail!(
                "{command}: command not found. Make sure '{command}' is installed and its location included in the 'PATH' environment variable."
            );
        }
        Ok(None)
    }

    /// Like [`WhichUtil::which`] with `require = true`, unwrapped.
    pub fn require(command: &str) -> anyhow::Result<PathBuf> {
        Self::which(command, true)?
            .ok_or_else(|| anyhow::anyhow!("{command}: command not found"))
    }

    #[cfg(unix)]
    fn is_executable(path: &Path) -> bool {
        use std::os::unix::fs::PermissionsExt;
        std::fs::metadata(path)
            .map(|meta| meta.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }

    #[cfg(not(unix))]
    fn is_executable(path: &Path) -> bool {
        path.is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(unix)]
    fn which_finds_bash_or_sh() {
        let found = WhichUtil::which("sh", false).unwrap();
        assert!(found.is_some());
        assert!(found.unwrap().is_absolute());
    }

    #[test]
    fn which_returns_none_for_missing() {
        let result = WhichUtil::which("nonexistent_command_xyz_123", false).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn require_errors_when_missing() {
        let err = WhichUtil::require("nonexistent_command_xyz_123").unwrap_err();
        assert!(err.to_string().contains("command not found"));
    }

    #[test]
    fn empty_command_is_rejected_when_required() {
        assert!(WhichUtil::which("", true).is_err());
        assert!(WhichUtil::which("", false).unwrap().is_none());
    }
}

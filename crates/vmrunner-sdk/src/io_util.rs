use anyhow::{Context, Result};
use std::fs;
use std::io::BufRead;
use std::path::Path;

/// Filesystem helpers shared by the worker.
pub struct IOUtil;

impl IOUtil {
    /// Delete a single file, clearing the read-only bit first if needed.
    /// A missing file is not an error.
    pub fn delete_file(path: &Path) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(meta) = fs::metadata(path) {
                let mut perms = meta.permissions();
                let mode = perms.mode();
                if mode & 0o200 == 0 {
                    perms.set_mode(mode | 0o200);
                    let _ = fs::set_permissions(path, perms);
                }
            }
        }

        fs::remove_file(path)
            .with_context(|| format!("Failed to delete file '{}'", path.display()))
    }

    /// Remove everything inside `path` while keeping the directory itself.
    pub fn delete_directory_contents(path: &Path) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }

        for entry in fs::read_dir(path)
            .with_context(|| format!("Failed to list directory '{}'", path.display()))?
        {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let entry_path = entry.path();
            if file_type.is_dir() {
                fs::remove_dir_all(&entry_path).with_context(|| {
                    format!("Failed to delete directory '{}'", entry_path.display())
                })?;
            } else {
                Self::delete_file(&entry_path)?;
            }
        }
        Ok(())
    }

    /// Read the first line of a text file, without its line terminator.
    pub fn read_first_line(path: &Path) -> Result<String> {
        let file = fs::File::open(path)
            .with_context(|| format!("Failed to open '{}'", path.display()))?;
        let mut line = String::new();
        std::io::BufReader::new(file)
            .read_line(&mut line)
            .with_context(|| format!("Failed to read '{}'", path.display()))?;
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Verify that `directory` and each of its ancestors can be traversed.
    pub fn validate_execute_permission(directory: &Path) -> Result<()> {
        let mut current = Some(directory);
        while let Some(dir) = current {
            fs::read_dir(dir).with_context(|| {
                format!(
                    "Permission to read the directory contents is required for '{}' and each directory up the hierarchy.",
                    directory.display()
                )
            })?;
            current = dir.parent().filter(|p| !p.as_os_str().is_empty());
        }
        Ok(())
    }
}

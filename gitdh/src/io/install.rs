//! Writing installer files (hooks, cron entries) to disk.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::info;

/// Options shared by `install postreceive` and `install cron`.
#[derive(Debug, Clone)]
pub struct InstallOptions {
    /// Print the files instead of writing them.
    pub print_only: bool,
    /// Overwrite existing files.
    pub force: bool,
    /// Suppress status lines.
    pub quiet: bool,
    /// Permission bits applied after writing.
    pub mode: u32,
}

/// A file to install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedFile {
    pub path: PathBuf,
    pub contents: String,
}

/// Fail unless every planned file can be written with `options`.
///
/// Runs before anything is written so a bad target leaves no partial install.
pub fn check_plan(files: &[PlannedFile], options: &InstallOptions) -> Result<()> {
    if options.print_only {
        return Ok(());
    }
    for file in files {
        let parent = file
            .path
            .parent()
            .ok_or_else(|| anyhow!("'{}' has no parent directory", file.path.display()))?;
        if !parent.is_dir() {
            return Err(anyhow!(
                "can't write to '{}': {} is not a directory",
                file.path.display(),
                parent.display()
            ));
        }
        if file.path.exists() && !options.force {
            return Err(anyhow!(
                "'{}' exists already, use --force to overwrite",
                file.path.display()
            ));
        }
    }
    Ok(())
}

/// Write (or print) every planned file, returning the product output lines.
pub fn apply_plan(files: &[PlannedFile], options: &InstallOptions) -> Result<Vec<String>> {
    let mut lines = Vec::new();
    for file in files {
        if options.print_only {
            lines.push(format!("# File '{}'", file.path.display()));
            lines.extend(file.contents.lines().map(str::to_string));
            continue;
        }
        write_file(&file.path, &file.contents, options.mode)?;
        info!(path = %file.path.display(), mode = %format!("{:o}", options.mode), "installed");
        if !options.quiet {
            lines.push(format!("file={} action=written", file.path.display()));
        }
    }
    Ok(lines)
}

fn write_file(path: &Path, contents: &str, mode: u32) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("set mode {mode:o} on {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(print_only: bool, force: bool) -> InstallOptions {
        InstallOptions {
            print_only,
            force,
            quiet: false,
            mode: 0o755,
        }
    }

    fn plan(path: PathBuf) -> Vec<PlannedFile> {
        vec![PlannedFile {
            path,
            contents: "#!/bin/sh\nexit 0\n".to_string(),
        }]
    }

    #[test]
    fn writes_with_mode() {
        let temp = tempfile::tempdir().expect("tempdir");
        let files = plan(temp.path().join("hook"));
        check_plan(&files, &options(false, false)).expect("check");
        let lines = apply_plan(&files, &options(false, false)).expect("apply");

        assert_eq!(
            lines,
            vec![format!("file={} action=written", files[0].path.display())]
        );
        let meta = fs::metadata(&files[0].path).expect("metadata");
        assert_eq!(meta.permissions().mode() & 0o7777, 0o755);
    }

    #[test]
    fn existing_file_requires_force() {
        let temp = tempfile::tempdir().expect("tempdir");
        let files = plan(temp.path().join("hook"));
        fs::write(&files[0].path, "old").expect("write");

        let err = check_plan(&files, &options(false, false)).unwrap_err();
        assert!(err.to_string().contains("--force"));
        check_plan(&files, &options(false, true)).expect("forced");
    }

    #[test]
    fn missing_directory_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let files = plan(temp.path().join("missing").join("hook"));
        assert!(check_plan(&files, &options(false, false)).is_err());
    }

    #[test]
    fn print_only_leaves_disk_untouched() {
        let temp = tempfile::tempdir().expect("tempdir");
        let files = plan(temp.path().join("hook"));
        check_plan(&files, &options(true, false)).expect("check");
        let lines = apply_plan(&files, &options(true, false)).expect("apply");

        assert_eq!(lines[0], format!("# File '{}'", files[0].path.display()));
        assert_eq!(lines[1], "#!/bin/sh");
        assert!(!files[0].path.exists());
    }
}

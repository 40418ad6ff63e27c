//! Executable path resolution.
//!
//! A bare program name (no path separator) is looked up on `PATH` first.
//! Anything else, or a name `PATH` does not know, is treated as a filesystem
//! path relative to the working directory the subject will run in.

use std::ffi::OsStr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use super::ExecutableError;

/// Resolve `path` to an absolute, executable regular file.
pub(crate) async fn resolve_executable(
    path: &Path,
    working_dir: Option<&Path>,
) -> Result<PathBuf, ExecutableError> {
    let resolved = match lookup_on_path(path).await {
        Some(found) => found,
        None => absolutize(path, working_dir).ok_or_else(|| not_found(path))?,
    };

    let metadata = tokio::fs::metadata(&resolved)
        .await
        .map_err(|_| not_found(path))?;

    if metadata.is_dir() || metadata.permissions().mode() & 0o111 == 0 {
        return Err(ExecutableError::NotExecutable {
            path: path.display().to_string(),
            resolved: resolved.display().to_string(),
        });
    }

    Ok(resolved)
}

fn not_found(path: &Path) -> ExecutableError {
    let name = path
        .file_name()
        .unwrap_or_else(|| path.as_os_str())
        .to_string_lossy()
        .into_owned();
    ExecutableError::NotFound { name }
}

/// Search `PATH` for a bare program name.
async fn lookup_on_path(path: &Path) -> Option<PathBuf> {
    if path.as_os_str().is_empty() || path.components().count() != 1 || is_explicit(path) {
        return None;
    }

    let search = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&search) {
        if dir.as_os_str().is_empty() {
            continue;
        }
        let candidate = dir.join(path);
        if is_executable_file(&candidate).await {
            return Some(candidate);
        }
    }

    None
}

/// `./name` has a single normal component but must not go through `PATH`.
fn is_explicit(path: &Path) -> bool {
    path.as_os_str()
        .to_string_lossy()
        .contains(std::path::MAIN_SEPARATOR)
}

async fn is_executable_file(candidate: &Path) -> bool {
    match tokio::fs::metadata(candidate).await {
        Ok(metadata) => metadata.is_file() && metadata.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

fn absolutize(path: &Path, working_dir: Option<&Path>) -> Option<PathBuf> {
    if path.is_absolute() {
        return Some(path.to_path_buf());
    }

    let cwd = std::env::current_dir().ok()?;
    let base = match working_dir {
        Some(dir) if dir.is_absolute() => dir.to_path_buf(),
        Some(dir) => cwd.join(dir),
        None => cwd,
    };

    Some(base.join(strip_current_dir(path)))
}

fn strip_current_dir(path: &Path) -> &Path {
    path.strip_prefix(OsStr::new(".")).unwrap_or(path)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn write_file(dir: &Path, name: &str, mode: u32) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, "#!/bin/sh\necho hi\n").expect("write file");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).expect("chmod");
        path
    }

    #[tokio::test]
    async fn bare_name_is_found_on_path() {
        let resolved = resolve_executable(Path::new("sh"), None)
            .await
            .expect("sh should be on PATH");
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("sh"));
    }

    #[tokio::test]
    async fn missing_file_reports_base_name() {
        let err = resolve_executable(Path::new("/definitely/not/here/blah"), None)
            .await
            .expect_err("should not resolve");
        assert_matches!(err, ExecutableError::NotFound { ref name } if name == "blah");
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn file_without_execute_bit_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_file(dir.path(), "not_executable.sh", 0o644);

        let err = resolve_executable(&path, None)
            .await
            .expect_err("should be rejected");
        assert_matches!(err, ExecutableError::NotExecutable { .. });
        assert!(err.to_string().contains("not an executable file"));
        assert!(err.to_string().contains("not_executable.sh"));
    }

    #[tokio::test]
    async fn directory_is_rejected_even_with_execute_bits() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("haskell");
        std::fs::create_dir(&nested).expect("mkdir");

        let err = resolve_executable(&nested, None)
            .await
            .expect_err("directories are not executables");
        assert_matches!(err, ExecutableError::NotExecutable { .. });
        assert!(err.to_string().contains("haskell"));
    }

    #[tokio::test]
    async fn relative_path_resolves_against_working_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = write_file(dir.path(), "your_program.sh", 0o755);

        let resolved = resolve_executable(Path::new("./your_program.sh"), Some(dir.path()))
            .await
            .expect("resolves inside working dir");
        assert_eq!(resolved, script);
    }
}

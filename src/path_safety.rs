use std::path::{Path, PathBuf};

use crate::error::{DeployerError, Result};

/// Resolves a descriptor-referenced file (compose file, static bundle)
/// against its stack directory. Client configs are user-authored, so
/// absolute paths are rejected outright and `..` hops out of the stack
/// directory fail with [`DeployerError::PathEscape`].
pub fn resolve_in_stack_dir(stack_dir: &Path, candidate: &Path) -> Result<PathBuf> {
    if candidate.is_absolute() {
        return Err(DeployerError::PathEscape {
            root: stack_dir.to_path_buf(),
            path: candidate.to_path_buf(),
        });
    }

    let root = stack_dir.canonicalize().map_err(|err| {
        DeployerError::Config(format!(
            "stack directory {} is not accessible: {err}",
            stack_dir.display()
        ))
    })?;
    let joined = root.join(candidate);
    let resolved = joined.canonicalize().map_err(|err| {
        DeployerError::Config(format!(
            "referenced file {} is not accessible: {err}",
            joined.display()
        ))
    })?;

    if !resolved.starts_with(&root) {
        return Err(DeployerError::PathEscape {
            root,
            path: resolved,
        });
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn accepts_files_inside_the_stack_directory() {
        let dir = tempdir().expect("temp dir");
        fs::write(dir.path().join("docker-compose.yaml"), "services: {}\n").expect("write");
        let resolved = resolve_in_stack_dir(dir.path(), Path::new("docker-compose.yaml"))
            .expect("path accepted");
        assert!(resolved.ends_with("docker-compose.yaml"));
    }

    #[test]
    fn rejects_dotdot_escapes() {
        let outer = tempdir().expect("temp dir");
        let stack_dir = outer.path().join("web");
        fs::create_dir_all(&stack_dir).expect("stack dir");
        fs::write(outer.path().join("outside.yaml"), "services: {}\n").expect("write");

        let err = resolve_in_stack_dir(&stack_dir, Path::new("../outside.yaml"))
            .expect_err("escape rejected");
        assert!(matches!(err, DeployerError::PathEscape { .. }));
        assert!(format!("{err}").contains("escapes the stack directory"));
    }

    #[test]
    fn rejects_absolute_paths() {
        let dir = tempdir().expect("temp dir");
        let err = resolve_in_stack_dir(dir.path(), Path::new("/etc/passwd"))
            .expect_err("absolute rejected");
        assert!(matches!(err, DeployerError::PathEscape { .. }));
    }

    #[test]
    fn missing_files_report_the_joined_path() {
        let dir = tempdir().expect("temp dir");
        let err = resolve_in_stack_dir(dir.path(), Path::new("nope.yaml"))
            .expect_err("missing file");
        assert!(format!("{err}").contains("nope.yaml"));
    }
}

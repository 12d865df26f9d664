//! Thin git subprocess wrapper used by the orchestrator's control thread.
//!
//! Every other git interaction (worktree add/remove, reset, clean,
//! cherry-pick) is owned by [`crate::worktree`] and [`crate::merge_coordinator`];
//! this module is left with exactly the one operation neither of those
//! owns: reading the trunk's current HEAD at startup.

use std::io;
use std::path::Path;
use std::process::Command;

/// Errors from git operations.
#[derive(Debug, thiserror::Error)]
pub enum GitOpsError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("git command failed: {0}")]
    Git(String),
}

/// Returns the HEAD commit SHA of the repository at `path`.
pub fn get_head_sha(path: impl AsRef<Path>) -> Result<String, GitOpsError> {
    let path = path.as_ref();
    let output = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(path)
        .output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitOpsError::Git(stderr.to_string()));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::TempDir;

    fn init_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let run = |args: &[&str]| {
            Command::new("git").args(args).current_dir(root).output().unwrap();
        };
        run(&["init", "--initial-branch=main"]);
        run(&["config", "user.email", "test@example.com"]);
        run(&["config", "user.name", "test"]);
        std::fs::write(root.join("README.md"), "x\n").unwrap();
        run(&["add", "-A"]);
        run(&["commit", "-m", "init"]);
        dir
    }

    #[test]
    fn get_head_sha_returns_a_commit_hash() {
        let repo = init_repo();
        let sha = get_head_sha(repo.path()).unwrap();
        assert_eq!(sha.len(), 40);
        assert!(sha.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn get_head_sha_fails_outside_a_repo() {
        let dir = TempDir::new().unwrap();
        assert!(get_head_sha(dir.path()).is_err());
    }
}

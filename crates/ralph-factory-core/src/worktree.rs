//! Git worktree management for the Factory's workers.
//!
//! Each worker owns one linked working directory rooted at
//! `<worktree_dir>/worker-<id>`, tied to a long-lived branch
//! `ralph-factory/worker-<id>`. Worktrees are the isolation primitive: a
//! worker's worktree is exclusively owned by that worker for its lifetime.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, warn};

/// Configuration for worktree placement.
#[derive(Debug, Clone)]
pub struct WorktreeConfig {
    /// Directory where worker worktrees are created (default: `.ralph/worktrees`).
    pub worktree_dir: PathBuf,
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            worktree_dir: PathBuf::from(".ralph/worktrees"),
        }
    }
}

impl WorktreeConfig {
    /// Creates a config with a custom worktree directory.
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            worktree_dir: dir.into(),
        }
    }

    /// Absolute path to the worktree root, relative to the main repo if not absolute.
    pub fn worktree_root(&self, repo_root: &Path) -> PathBuf {
        if self.worktree_dir.is_absolute() {
            self.worktree_dir.clone()
        } else {
            repo_root.join(&self.worktree_dir)
        }
    }
}

/// A worker's worktree: an isolated working directory on its own branch.
#[derive(Debug, Clone)]
pub struct Worktree {
    /// Absolute path to the worktree directory.
    pub path: PathBuf,
    /// The long-lived branch checked out in this worktree.
    pub branch: String,
    /// HEAD commit, if resolvable.
    pub head: Option<String>,
}

/// Errors from worktree operations.
#[derive(Debug, thiserror::Error)]
pub enum WorktreeError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("git command failed: {0}")]
    Git(String),

    #[error("not a git repository: {0}")]
    NotARepo(String),

    #[error("worktree not found: {0}")]
    NotFound(String),

    /// Git refused to create the worktree or the filesystem was unwritable.
    #[error("worktree setup failed: {0}")]
    WorktreeSetup(String),
}

fn branch_name(worker_id: &str) -> String {
    format!("ralph-factory/worker-{worker_id}")
}

fn run_git(repo_root: &Path, args: &[&str]) -> Result<std::process::Output, WorktreeError> {
    Command::new("git")
        .args(args)
        .current_dir(repo_root)
        .output()
        .map_err(WorktreeError::from)
}

/// Returns true if `path` is a valid linked worktree of `repo_root`, according to git.
fn is_valid_linked_worktree(repo_root: &Path, path: &Path) -> bool {
    let Ok(worktrees) = list_worktrees(repo_root) else {
        return false;
    };
    let Ok(canonical) = path.canonicalize() else {
        return false;
    };
    worktrees
        .iter()
        .any(|w| w.path.canonicalize().map(|p| p == canonical).unwrap_or(false))
}

/// Initialises a worker's worktree, idempotently.
///
/// - If `<worktree_dir>/worker-<id>` exists and git considers it a valid
///   linked worktree, reuse it.
/// - Otherwise, remove any stale directory, then create the worktree at the
///   current trunk HEAD, creating the branch if it does not exist.
pub fn init_worktree(
    repo_root: impl AsRef<Path>,
    worker_id: &str,
    config: &WorktreeConfig,
) -> Result<Worktree, WorktreeError> {
    let repo_root = repo_root.as_ref();

    if !repo_root.join(".git").exists() {
        return Err(WorktreeError::NotARepo(
            repo_root.to_string_lossy().to_string(),
        ));
    }

    let worktree_root = config.worktree_root(repo_root);
    let path = worktree_root.join(format!("worker-{worker_id}"));
    let branch = branch_name(worker_id);

    if path.exists() && is_valid_linked_worktree(repo_root, &path) {
        debug!(worker_id, path = %path.display(), "reusing existing worktree");
        let head = get_head_commit(&path).ok();
        return Ok(Worktree { path, branch, head });
    }

    if path.exists() {
        warn!(worker_id, path = %path.display(), "stale worktree directory, removing");
        let _ = run_git(
            repo_root,
            &["worktree", "remove", "--force", &path.to_string_lossy()],
        );
        if path.exists() {
            fs::remove_dir_all(&path).map_err(WorktreeError::from)?;
        }
        let _ = run_git(repo_root, &["worktree", "prune"]);
    }

    fs::create_dir_all(&worktree_root).map_err(WorktreeError::from)?;

    let branch_exists = run_git(
        repo_root,
        &["rev-parse", "--verify", "--quiet", &branch],
    )
    .map(|o| o.status.success())
    .unwrap_or(false);

    let output = if branch_exists {
        run_git(
            repo_root,
            &["worktree", "add", &path.to_string_lossy(), &branch],
        )?
    } else {
        run_git(
            repo_root,
            &["worktree", "add", "-b", &branch, &path.to_string_lossy()],
        )?
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        return Err(WorktreeError::WorktreeSetup(stderr));
    }

    let head = get_head_commit(&path).ok();
    debug!(worker_id, path = %path.display(), branch = %branch, "created worktree");

    Ok(Worktree { path, branch, head })
}

/// Resets a worktree to the main repo's current trunk HEAD, discarding residue.
///
/// Runs inside the worktree: `git reset --hard <trunk-head>` followed by
/// `git clean -fd`. The trunk HEAD is read locally from `main_repo` — never
/// fetched from a remote (see the resolved Open Question in SPEC_FULL.md §9).
pub fn reset_to_head(worktree: &Worktree, main_repo: impl AsRef<Path>) -> Result<(), WorktreeError> {
    let main_repo = main_repo.as_ref();

    let head_output = run_git(main_repo, &["rev-parse", "HEAD"])?;
    if !head_output.status.success() {
        let stderr = String::from_utf8_lossy(&head_output.stderr).to_string();
        return Err(WorktreeError::Git(stderr));
    }
    let trunk_head = String::from_utf8_lossy(&head_output.stdout).trim().to_string();

    let reset = run_git(&worktree.path, &["reset", "--hard", &trunk_head])?;
    if !reset.status.success() {
        let stderr = String::from_utf8_lossy(&reset.stderr).to_string();
        return Err(WorktreeError::Git(stderr));
    }

    let clean = run_git(&worktree.path, &["clean", "-fd"])?;
    if !clean.status.success() {
        let stderr = String::from_utf8_lossy(&clean.stderr).to_string();
        return Err(WorktreeError::Git(stderr));
    }

    debug!(worker = %worktree.branch, trunk_head = %trunk_head, "reset worktree to trunk head");
    Ok(())
}

/// Stages all changes and commits inside a worktree.
///
/// Returns the resulting commit hash, or the sentinel `"no-commit"` if
/// nothing was staged (the caller treats this as a failure).
pub fn commit_in_worktree(worktree: &Worktree, message: &str) -> Result<String, WorktreeError> {
    let add = run_git(&worktree.path, &["add", "-A"])?;
    if !add.status.success() {
        let stderr = String::from_utf8_lossy(&add.stderr).to_string();
        return Err(WorktreeError::Git(stderr));
    }

    let status = run_git(&worktree.path, &["status", "--porcelain"])?;
    let staged = String::from_utf8_lossy(&status.stdout);
    if staged.trim().is_empty() {
        return Ok("no-commit".to_string());
    }

    let commit = run_git(&worktree.path, &["commit", "-m", message])?;
    if !commit.status.success() {
        let stderr = String::from_utf8_lossy(&commit.stderr).to_string();
        return Err(WorktreeError::Git(stderr));
    }

    let sha = run_git(&worktree.path, &["rev-parse", "HEAD"])?;
    Ok(String::from_utf8_lossy(&sha.stdout).trim().to_string())
}

/// Removes a worker's worktree (force) and its branch, best-effort.
pub fn remove_worktree(
    repo_root: impl AsRef<Path>,
    worktree: &Worktree,
) -> Result<(), WorktreeError> {
    let repo_root = repo_root.as_ref();

    if !worktree.path.exists() {
        return Err(WorktreeError::NotFound(
            worktree.path.to_string_lossy().to_string(),
        ));
    }

    let output = run_git(
        repo_root,
        &["worktree", "remove", "--force", &worktree.path.to_string_lossy()],
    )?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        return Err(WorktreeError::Git(stderr));
    }

    if worktree.branch.starts_with("ralph-factory/") {
        let del = run_git(repo_root, &["branch", "-D", &worktree.branch]);
        if let Ok(out) = del
            && !out.status.success()
        {
            debug!(branch = %worktree.branch, "branch already gone");
        }
    }

    let _ = run_git(repo_root, &["worktree", "prune"]);
    debug!(path = %worktree.path.display(), "removed worktree");
    Ok(())
}

/// Lists all git worktrees of `repo_root`, including the main one.
pub fn list_worktrees(repo_root: impl AsRef<Path>) -> Result<Vec<Worktree>, WorktreeError> {
    let repo_root = repo_root.as_ref();
    let output = run_git(repo_root, &["worktree", "list", "--porcelain"])?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        return Err(WorktreeError::Git(stderr));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(parse_worktree_list(&stdout))
}

fn parse_worktree_list(output: &str) -> Vec<Worktree> {
    let mut worktrees = Vec::new();
    let mut path: Option<PathBuf> = None;
    let mut head: Option<String> = None;
    let mut branch: Option<String> = None;
    let mut is_bare = false;

    for line in output.lines() {
        if line.starts_with("worktree ") {
            if let Some(p) = path.take()
                && !is_bare
            {
                worktrees.push(Worktree {
                    path: p,
                    branch: branch.take().unwrap_or_else(|| "(detached)".to_string()),
                    head: head.take(),
                });
            }
            path = Some(PathBuf::from(line.strip_prefix("worktree ").unwrap()));
            head = None;
            branch = None;
            is_bare = false;
        } else if let Some(h) = line.strip_prefix("HEAD ") {
            head = Some(h.to_string());
        } else if let Some(b) = line.strip_prefix("branch ") {
            branch = Some(b.strip_prefix("refs/heads/").unwrap_or(b).to_string());
        } else if line == "bare" {
            is_bare = true;
        }
    }

    if let Some(p) = path
        && !is_bare
    {
        worktrees.push(Worktree {
            path: p,
            branch: branch.unwrap_or_else(|| "(detached)".to_string()),
            head,
        });
    }

    worktrees
}

fn get_head_commit(path: &Path) -> Result<String, WorktreeError> {
    let output = run_git(path, &["rev-parse", "HEAD"])?;
    if !output.status.success() {
        return Err(WorktreeError::Git(
            String::from_utf8_lossy(&output.stderr).to_string(),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;
    use tempfile::TempDir;

    fn init_git_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        let run = |args: &[&str]| {
            StdCommand::new("git")
                .args(args)
                .current_dir(dir.path())
                .output()
                .unwrap()
        };
        run(&["init", "--initial-branch=main"]);
        run(&["config", "user.email", "test@example.com"]);
        run(&["config", "user.name", "Test"]);
        fs::write(dir.path().join("README.md"), "hello\n").unwrap();
        run(&["add", "-A"]);
        run(&["commit", "-m", "initial"]);
        dir
    }

    #[test]
    fn init_worktree_creates_branch_and_path() {
        let repo = init_git_repo();
        let config = WorktreeConfig::default();
        let wt = init_worktree(repo.path(), "1", &config).unwrap();

        assert_eq!(wt.branch, "ralph-factory/worker-1");
        assert!(wt.path.exists());
        assert!(wt.path.ends_with("worker-1"));
    }

    #[test]
    fn init_worktree_is_idempotent() {
        let repo = init_git_repo();
        let config = WorktreeConfig::default();
        let first = init_worktree(repo.path(), "1", &config).unwrap();
        let second = init_worktree(repo.path(), "1", &config).unwrap();
        assert_eq!(first.path, second.path);
        assert_eq!(first.branch, second.branch);
    }

    #[test]
    fn init_worktree_recreates_stale_directory() {
        let repo = init_git_repo();
        let config = WorktreeConfig::default();
        let wt = init_worktree(repo.path(), "1", &config).unwrap();

        // Simulate staleness: remove via filesystem, bypassing `git worktree remove`.
        fs::remove_dir_all(&wt.path).unwrap();
        fs::create_dir_all(&wt.path).unwrap();

        let recreated = init_worktree(repo.path(), "1", &config).unwrap();
        assert!(recreated.path.exists());
        assert!(recreated.path.join(".git").exists());
    }

    #[test]
    fn reset_to_head_discards_residue() {
        let repo = init_git_repo();
        let config = WorktreeConfig::default();
        let wt = init_worktree(repo.path(), "1", &config).unwrap();

        fs::write(wt.path.join("scratch.txt"), "residue").unwrap();
        StdCommand::new("git")
            .args(["add", "-A"])
            .current_dir(&wt.path)
            .output()
            .unwrap();

        reset_to_head(&wt, repo.path()).unwrap();

        assert!(!wt.path.join("scratch.txt").exists());
    }

    #[test]
    fn commit_in_worktree_returns_no_commit_when_clean() {
        let repo = init_git_repo();
        let config = WorktreeConfig::default();
        let wt = init_worktree(repo.path(), "1", &config).unwrap();

        let result = commit_in_worktree(&wt, "Ralph: nothing").unwrap();
        assert_eq!(result, "no-commit");
    }

    #[test]
    fn commit_in_worktree_returns_sha_when_changes_exist() {
        let repo = init_git_repo();
        let config = WorktreeConfig::default();
        let wt = init_worktree(repo.path(), "1", &config).unwrap();

        fs::write(wt.path.join("foo.txt"), "content").unwrap();
        let sha = commit_in_worktree(&wt, "Ralph: add foo").unwrap();
        assert_ne!(sha, "no-commit");
        assert_eq!(sha.len(), 40);
    }

    #[test]
    fn remove_worktree_deletes_directory_and_branch() {
        let repo = init_git_repo();
        let config = WorktreeConfig::default();
        let wt = init_worktree(repo.path(), "1", &config).unwrap();

        remove_worktree(repo.path(), &wt).unwrap();
        assert!(!wt.path.exists());

        let worktrees = list_worktrees(repo.path()).unwrap();
        assert!(worktrees.iter().all(|w| w.path != wt.path));
    }

    #[test]
    fn init_worktree_rejects_non_repo() {
        let dir = TempDir::new().unwrap();
        let config = WorktreeConfig::default();
        let err = init_worktree(dir.path(), "1", &config).unwrap_err();
        assert!(matches!(err, WorktreeError::NotARepo(_)));
    }
}

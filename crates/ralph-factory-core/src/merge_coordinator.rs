//! Mutex-serialised cherry-pick of worker commits onto trunk (§4.G).

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

/// Append-only audit entry for one cherry-pick attempt.
#[derive(Debug, Clone)]
pub struct MergeRecord {
    pub task_id: String,
    pub success: bool,
    pub commit_hash: Option<String>,
    pub conflict: bool,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of [`MergeCoordinator::cherry_pick`].
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub success: bool,
    pub commit_hash: Option<String>,
    pub conflict: bool,
    pub error: Option<String>,
}

/// Serialises all cherry-picks onto trunk behind an internal mutex; two
/// parallel cherry-picks of the same file would otherwise risk losing one.
pub struct MergeCoordinator {
    main_repo: PathBuf,
    history: Mutex<Vec<MergeRecord>>,
}

impl MergeCoordinator {
    pub fn new(main_repo: impl Into<PathBuf>) -> Self {
        Self {
            main_repo: main_repo.into(),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Acquires the mutex, attempts `git cherry-pick -x <commit_hash>` on
    /// trunk, and appends exactly one [`MergeRecord`] before releasing.
    pub fn cherry_pick(&self, commit_hash: &str, task_id: &str) -> MergeOutcome {
        let _guard = self.history.lock().unwrap();
        // Held for the duration of the cherry-pick so concurrent callers
        // never interleave attempts against trunk.
        let outcome = self.run_cherry_pick(commit_hash);

        let record = MergeRecord {
            task_id: task_id.to_string(),
            success: outcome.success,
            commit_hash: outcome.commit_hash.clone(),
            conflict: outcome.conflict,
            error: outcome.error.clone(),
            timestamp: Utc::now(),
        };
        drop(_guard);
        self.history.lock().unwrap().push(record);
        outcome
    }

    fn run_cherry_pick(&self, commit_hash: &str) -> MergeOutcome {
        let result = Command::new("git")
            .args(["cherry-pick", "-x", commit_hash])
            .current_dir(&self.main_repo)
            .output();

        let output = match result {
            Ok(output) => output,
            Err(e) => {
                return MergeOutcome {
                    success: false,
                    commit_hash: None,
                    conflict: false,
                    error: Some(format!("failed to run git cherry-pick: {e}")),
                };
            }
        };

        if output.status.success() {
            let head = self.head_commit();
            return MergeOutcome {
                success: true,
                commit_hash: head,
                conflict: false,
                error: None,
            };
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if self.has_conflict(&stderr) {
            self.abort_cherry_pick();
            return MergeOutcome {
                success: false,
                commit_hash: None,
                conflict: true,
                error: None,
            };
        }

        self.abort_cherry_pick();
        MergeOutcome {
            success: false,
            commit_hash: None,
            conflict: false,
            error: Some(stderr.trim().to_string()),
        }
    }

    fn has_conflict(&self, stderr: &str) -> bool {
        if stderr.to_lowercase().contains("conflict") {
            return true;
        }
        Command::new("git")
            .args(["status", "--porcelain"])
            .current_dir(&self.main_repo)
            .output()
            .map(|o| {
                String::from_utf8_lossy(&o.stdout)
                    .lines()
                    .any(|line| line.starts_with("UU") || line.starts_with("AA"))
            })
            .unwrap_or(false)
    }

    fn abort_cherry_pick(&self) {
        let _ = Command::new("git")
            .args(["cherry-pick", "--abort"])
            .current_dir(&self.main_repo)
            .output();
    }

    fn head_commit(&self) -> Option<String> {
        Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(&self.main_repo)
            .output()
            .ok()
            .filter(|o| o.status.success())
            .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
    }

    /// The full append-only history, for the final run summary.
    pub fn history(&self) -> Vec<MergeRecord> {
        self.history.lock().unwrap().clone()
    }

    pub fn main_repo(&self) -> &Path {
        &self.main_repo
    }
}

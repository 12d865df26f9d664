//! Per-worker task lifecycle (§4.E).

use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::prd::PrdFile;
use crate::provider::{InvokeOptions, ProviderAdapter, ProviderSlot};
use crate::worktree::{self, Worktree, WorktreeConfig, WorktreeError};

/// The four fixed completion-marker strings; presence of any one is the
/// contract (applied here, not at the adapter boundary).
const COMPLETION_MARKERS: [&str; 4] = [
    "<complete>DONE</complete>",
    "<promise>COMPLETE</promise>",
    "task completed successfully",
    "\"subtype\":\"success\"",
];

pub fn contains_completion_marker(output: &str) -> bool {
    COMPLETION_MARKERS.iter().any(|marker| output.contains(marker))
}

/// A task dispatched to a worker, scored and routed by the Complexity
/// Router. Owned exclusively by whichever collection it lives in.
#[derive(Debug, Clone)]
pub struct FactoryTask {
    pub item_id: String,
    pub name: String,
    pub description: String,
    pub prd_file_path: PathBuf,
    pub prd_category: Option<String>,
    pub complexity_score: u32,
    pub tier: crate::provider::Tier,
    pub retry_count: u32,
    pub assigned_slot: Option<ProviderSlot>,
    pub assigned_worker_id: Option<String>,
}

/// Outcome of one `Worker::execute` call.
#[derive(Debug, Clone)]
pub struct WorkerResult {
    pub task_id: String,
    pub worker_id: String,
    pub success: bool,
    pub commit_hash: Option<String>,
    pub duration: Duration,
    pub validation_passed: Option<bool>,
    pub rate_limited: bool,
    pub error: Option<String>,
}

/// Lifecycle status of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Idle,
    Running,
    Validating,
    Merging,
}

/// Token limits per Claude model, and the generic default for everyone
/// else (§4.E).
#[derive(Debug, Clone, Copy)]
pub struct TokenLimits {
    pub opus: u32,
    pub sonnet: u32,
    pub haiku: u32,
}

impl TokenLimits {
    pub fn for_slot(&self, slot: &ProviderSlot) -> u32 {
        if slot.provider == crate::provider::Provider::Claude {
            match slot.model.as_str() {
                "opus" => return self.opus,
                "haiku" => return self.haiku,
                _ => {}
            }
        }
        self.sonnet
    }
}

impl Default for TokenLimits {
    fn default() -> Self {
        Self {
            opus: 32_000,
            sonnet: 16_000,
            haiku: 8_000,
        }
    }
}

/// Collaborator run against a completed task's worktree before it is
/// committed. `None`/an always-pass implementation models validation being
/// globally or per-task skipped.
pub trait ValidationGate: Send + Sync {
    fn validate(&self, worktree_path: &std::path::Path, category: Option<&str>) -> ValidationOutcome;
}

#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub passed: bool,
    pub failed_gates: Vec<String>,
}

/// Always-pass validation gate, used when validation is skipped.
pub struct NoValidation;

impl ValidationGate for NoValidation {
    fn validate(&self, _worktree_path: &std::path::Path, _category: Option<&str>) -> ValidationOutcome {
        ValidationOutcome {
            passed: true,
            failed_gates: vec![],
        }
    }
}

/// One worker: a long-lived branch and worktree, exclusively owned for its
/// lifetime.
pub struct Worker {
    pub id: String,
    pub worktree: Worktree,
    pub status: WorkerStatus,
    pub completed_task_ids: Vec<String>,
}

impl Worker {
    pub fn init(
        id: impl Into<String>,
        main_repo: impl AsRef<std::path::Path>,
        config: &WorktreeConfig,
    ) -> Result<Self, WorktreeError> {
        let id = id.into();
        let worktree = worktree::init_worktree(main_repo, &id, config)?;
        Ok(Self {
            id,
            worktree,
            status: WorkerStatus::Idle,
            completed_task_ids: vec![],
        })
    }

    /// Builds the prompt text (§4.E step 3 / §6): task description and id,
    /// an explicit request to emit the completion marker, and on retry a
    /// summary of prior failures.
    pub fn build_prompt(task: &FactoryTask, prior_failure: Option<&str>) -> String {
        let mut prompt = format!(
            "Task {} ({}): {}\n\nWhen the task is complete, include the exact text \
             `<complete>DONE</complete>` in your final message.",
            task.item_id, task.name, task.description
        );
        if let Some(failure) = prior_failure {
            prompt.push_str(&format!(
                "\n\nThis task was attempted before and failed: {failure}. \
                 Take that into account and address it this time."
            ));
        }
        prompt
    }

    /// Runs the full eight-step execute sequence.
    #[allow(clippy::too_many_arguments)]
    pub fn execute(
        &mut self,
        task: &FactoryTask,
        slot: &ProviderSlot,
        adapter: &dyn ProviderAdapter,
        validation: &dyn ValidationGate,
        main_repo: impl AsRef<std::path::Path>,
        dry_run: bool,
        skip_validation: bool,
        timeout: Duration,
    ) -> WorkerResult {
        let start = Instant::now();
        self.status = WorkerStatus::Running;

        if let Err(e) = worktree::reset_to_head(&self.worktree, &main_repo) {
            self.status = WorkerStatus::Idle;
            return self.failure(task, start, format!("worktree reset failed: {e}"));
        }

        let prior_state = PrdFile::load(&task.prd_file_path);
        let prior_failure = prior_state.ok().and_then(|prd| {
            prd.items
                .iter()
                .find(|item| item.id == task.item_id)
                .and_then(|item| {
                    item.validation_result
                        .as_ref()
                        .map(|v| v.to_string())
                        .or_else(|| item.judge_result.as_ref().map(|v| v.to_string()))
                })
        });

        let prompt = Self::build_prompt(task, prior_failure.as_deref());
        let token_limit = TokenLimits::default().for_slot(slot);

        let options = InvokeOptions {
            project_root: &self.worktree.path,
            dry_run,
            model: Some(slot.model.as_str()),
            timeout,
            token_limit: Some(token_limit),
        };
        let invocation = adapter.invoke(slot.provider, &prompt, &options);

        if !invocation.success {
            self.status = WorkerStatus::Idle;
            let combined = format!("{}\n{}", invocation.output, invocation.error.clone().unwrap_or_default());
            if crate::rate_limiter::is_rate_limited(&combined) {
                return WorkerResult {
                    task_id: task.item_id.clone(),
                    worker_id: self.id.clone(),
                    success: false,
                    commit_hash: None,
                    duration: start.elapsed(),
                    validation_passed: None,
                    rate_limited: true,
                    error: invocation.error,
                };
            }
            return self.failure(
                task,
                start,
                invocation.error.unwrap_or_else(|| "provider failed".to_string()),
            );
        }

        if !contains_completion_marker(&invocation.output) {
            self.status = WorkerStatus::Idle;
            return self.failure(task, start, "provider did not signal completion".to_string());
        }

        self.status = WorkerStatus::Validating;
        let validation_outcome = if skip_validation {
            None
        } else {
            Some(validation.validate(&self.worktree.path, task.prd_category.as_deref()))
        };

        if let Some(outcome) = &validation_outcome {
            if !outcome.passed {
                self.status = WorkerStatus::Idle;
                let mut result = self.failure(
                    task,
                    start,
                    format!("validation failed: {}", outcome.failed_gates.join(", ")),
                );
                result.validation_passed = Some(false);
                return result;
            }
        }

        self.status = WorkerStatus::Merging;
        let message = format!(
            "Ralph: {} ({}-{})",
            task.name,
            task.prd_category.as_deref().unwrap_or("uncategorised"),
            task.item_id
        );
        let commit = worktree::commit_in_worktree(&self.worktree, &message);
        self.status = WorkerStatus::Idle;

        match commit {
            Ok(hash) if hash != "no-commit" => {
                self.completed_task_ids.push(task.item_id.clone());
                WorkerResult {
                    task_id: task.item_id.clone(),
                    worker_id: self.id.clone(),
                    success: true,
                    commit_hash: Some(hash),
                    duration: start.elapsed(),
                    validation_passed: validation_outcome.map(|o| o.passed),
                    rate_limited: false,
                    error: None,
                }
            }
            Ok(_no_commit) => {
                self.failure(task, start, "provider claimed completion but produced nothing".to_string())
            }
            Err(e) => self.failure(task, start, format!("commit failed: {e}")),
        }
    }

    fn failure(&self, task: &FactoryTask, start: Instant, error: String) -> WorkerResult {
        WorkerResult {
            task_id: task.item_id.clone(),
            worker_id: self.id.clone(),
            success: false,
            commit_hash: None,
            duration: start.elapsed(),
            validation_passed: None,
            rate_limited: false,
            error: Some(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{InvokeResult, Provider, Tier};
    use std::process::Command;
    use std::sync::Mutex;
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

    struct MockAdapter {
        response: Mutex<InvokeResult>,
    }

    impl ProviderAdapter for MockAdapter {
        fn invoke(&self, _provider: Provider, _prompt: &str, _options: &InvokeOptions<'_>) -> InvokeResult {
            self.response.lock().unwrap().clone()
        }
    }

    fn sample_task() -> FactoryTask {
        FactoryTask {
            item_id: "T-001".to_string(),
            name: "Add file foo.txt".to_string(),
            description: "create foo.txt".to_string(),
            prd_file_path: PathBuf::from("nonexistent.json"),
            prd_category: None,
            complexity_score: 50,
            tier: Tier::Medium,
            retry_count: 0,
            assigned_slot: None,
            assigned_worker_id: None,
        }
    }

    #[test]
    fn execute_succeeds_and_commits_on_completion_marker() {
        let repo = init_repo();
        let mut worker = Worker::init(
            "w1",
            repo.path(),
            &WorktreeConfig {
                worktree_dir: repo.path().join(".ralph/worktrees"),
            },
        )
        .unwrap();

        std::fs::write(worker.worktree.path.join("foo.txt"), "hi\n").unwrap();

        let adapter = MockAdapter {
            response: Mutex::new(InvokeResult {
                success: true,
                output: "<complete>DONE</complete>".to_string(),
                summary: None,
                error: None,
            }),
        };

        let task = sample_task();
        let slot = ProviderSlot::new(Provider::Claude, "sonnet", Tier::Medium);
        let result = worker.execute(
            &task,
            &slot,
            &adapter,
            &NoValidation,
            repo.path(),
            false,
            true,
            Duration::from_secs(5),
        );

        assert!(result.success);
        assert!(result.commit_hash.is_some());
        assert_eq!(worker.status, WorkerStatus::Idle);
    }

    #[test]
    fn execute_fails_when_completion_marker_missing() {
        let repo = init_repo();
        let mut worker = Worker::init(
            "w1",
            repo.path(),
            &WorktreeConfig {
                worktree_dir: repo.path().join(".ralph/worktrees"),
            },
        )
        .unwrap();

        let adapter = MockAdapter {
            response: Mutex::new(InvokeResult {
                success: true,
                output: "still working on it".to_string(),
                summary: None,
                error: None,
            }),
        };

        let task = sample_task();
        let slot = ProviderSlot::new(Provider::Claude, "sonnet", Tier::Medium);
        let result = worker.execute(
            &task,
            &slot,
            &adapter,
            &NoValidation,
            repo.path(),
            false,
            true,
            Duration::from_secs(5),
        );

        assert!(!result.success);
        assert!(!result.rate_limited);
        assert_eq!(worker.status, WorkerStatus::Idle);
    }

    #[test]
    fn execute_classifies_rate_limit_signal() {
        let repo = init_repo();
        let mut worker = Worker::init(
            "w1",
            repo.path(),
            &WorktreeConfig {
                worktree_dir: repo.path().join(".ralph/worktrees"),
            },
        )
        .unwrap();

        let adapter = MockAdapter {
            response: Mutex::new(InvokeResult {
                success: false,
                output: String::new(),
                summary: None,
                error: Some("rate_limit_error".to_string()),
            }),
        };

        let task = sample_task();
        let slot = ProviderSlot::new(Provider::Claude, "sonnet", Tier::Medium);
        let result = worker.execute(
            &task,
            &slot,
            &adapter,
            &NoValidation,
            repo.path(),
            false,
            true,
            Duration::from_secs(5),
        );

        assert!(!result.success);
        assert!(result.rate_limited);
    }

    #[test]
    fn dry_run_short_circuits_through_mock_and_still_commits_nothing_new() {
        let repo = init_repo();
        let mut worker = Worker::init(
            "w1",
            repo.path(),
            &WorktreeConfig {
                worktree_dir: repo.path().join(".ralph/worktrees"),
            },
        )
        .unwrap();

        let adapter = MockAdapter {
            response: Mutex::new(InvokeResult {
                success: true,
                output: "<complete>DONE</complete>\n(dry run: no work was performed)".to_string(),
                summary: Some("dry run".to_string()),
                error: None,
            }),
        };

        let task = sample_task();
        let slot = ProviderSlot::new(Provider::Claude, "sonnet", Tier::Medium);
        let result = worker.execute(
            &task,
            &slot,
            &adapter,
            &NoValidation,
            repo.path(),
            true,
            true,
            Duration::from_secs(5),
        );

        // Nothing was staged, so commit_in_worktree returns "no-commit",
        // which the worker treats as a failure per §3.
        assert!(!result.success);
    }

    #[test]
    fn token_limits_pick_claude_model_specific_limit() {
        let limits = TokenLimits::default();
        let opus = ProviderSlot::new(Provider::Claude, "opus", Tier::High);
        let haiku = ProviderSlot::new(Provider::Claude, "haiku", Tier::Low);
        let gemini = ProviderSlot::new(Provider::Gemini, "pro", Tier::High);

        assert_eq!(limits.for_slot(&opus), limits.opus);
        assert_eq!(limits.for_slot(&haiku), limits.haiku);
        assert_eq!(limits.for_slot(&gemini), limits.sonnet);
    }
}

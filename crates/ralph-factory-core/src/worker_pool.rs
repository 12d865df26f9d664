//! Bounded worker pool: fixed roster, idle/active accounting, assign/await/
//! shutdown (§4.F).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::provider::{ProviderAdapter, ProviderSlot};
use crate::worker::{FactoryTask, ValidationGate, Worker, WorkerResult, WorkerStatus};
use crate::worktree::WorktreeConfig;

/// Fixed roster of workers, built once at init. Workers that fail to
/// initialise (bad worktree setup) are dropped; the pool refuses to run on
/// an empty final roster.
pub struct WorkerPool {
    workers: Vec<Arc<Mutex<Worker>>>,
    main_repo: std::path::PathBuf,
    max_total_workers: usize,
    completion_tx: mpsc::UnboundedSender<WorkerResult>,
    completion_rx: Mutex<mpsc::UnboundedReceiver<WorkerResult>>,
    active: Mutex<usize>,
}

impl WorkerPool {
    /// Initialises a worker per `worker_ids`, dropping any whose worktree
    /// setup fails. Returns an error if the resulting roster is empty.
    pub fn init(
        worker_ids: &[String],
        main_repo: impl AsRef<std::path::Path>,
        config: &WorktreeConfig,
        max_total_workers: usize,
    ) -> Result<Self, crate::error::FactoryError> {
        let mut workers = Vec::new();
        for id in worker_ids {
            match Worker::init(id.clone(), main_repo.as_ref(), config) {
                Ok(worker) => workers.push(Arc::new(Mutex::new(worker))),
                Err(e) => {
                    tracing::warn!(worker_id = %id, error = %e, "dropping worker that failed to initialise");
                }
            }
        }

        if workers.is_empty() {
            return Err(crate::error::FactoryError::EmptyRoster);
        }

        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        Ok(Self {
            workers,
            main_repo: main_repo.as_ref().to_path_buf(),
            max_total_workers,
            completion_tx,
            completion_rx: Mutex::new(completion_rx),
            active: Mutex::new(0),
        })
    }

    pub fn get_idle_worker(&self) -> Option<Arc<Mutex<Worker>>> {
        self.workers
            .iter()
            .find(|w| w.lock().unwrap().status == WorkerStatus::Idle)
            .cloned()
    }

    pub fn get_active_count(&self) -> usize {
        *self.active.lock().unwrap()
    }

    /// Non-blocking: spawns concurrent execution of `worker.execute(...)`.
    /// Refuses assignment if it would exceed `max_total_workers`.
    #[allow(clippy::too_many_arguments)]
    pub fn assign_task(
        &self,
        worker: Arc<Mutex<Worker>>,
        task: FactoryTask,
        slot: ProviderSlot,
        adapter: Arc<dyn ProviderAdapter>,
        validation: Arc<dyn ValidationGate>,
        main_repo: std::path::PathBuf,
        dry_run: bool,
        skip_validation: bool,
        timeout: Duration,
    ) -> bool {
        {
            let mut active = self.active.lock().unwrap();
            if *active >= self.max_total_workers {
                return false;
            }
            *active += 1;
        }

        let tx = self.completion_tx.clone();
        tokio::task::spawn_blocking(move || {
            let mut worker = worker.lock().unwrap();
            let result = worker.execute(
                &task,
                &slot,
                adapter.as_ref(),
                validation.as_ref(),
                &main_repo,
                dry_run,
                skip_validation,
                timeout,
            );
            let _ = tx.send(result);
        });

        true
    }

    /// Suspends until at least one assigned worker finishes; drains all
    /// currently-ready results, matching the at-least-one contract.
    pub async fn await_any_completion(&self) -> Vec<WorkerResult> {
        let mut rx = self.completion_rx.lock().unwrap();
        let Some(first) = rx.recv().await else {
            return Vec::new();
        };
        let mut results = vec![first];
        while let Ok(next) = rx.try_recv() {
            results.push(next);
        }
        *self.active.lock().unwrap() -= results.len();
        results
    }

    pub fn has_active_workers(&self) -> bool {
        self.get_active_count() > 0
    }

    pub fn roster_size(&self) -> usize {
        self.workers.len()
    }

    /// Waits for in-flight executions to drain (by polling active count)
    /// and, if requested, tears down every worker's worktree.
    pub async fn shutdown(&self, cleanup_worktrees: bool) {
        while self.has_active_workers() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if cleanup_worktrees {
            for worker in &self.workers {
                let worker = worker.lock().unwrap();
                if let Err(e) = crate::worktree::remove_worktree(&self.main_repo, &worker.worktree) {
                    tracing::warn!(worker_id = %worker.id, error = %e, "failed to remove worktree on shutdown");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{InvokeOptions, InvokeResult, Provider, Tier};
    use crate::worker::NoValidation;
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

    struct MockAdapter;
    impl ProviderAdapter for MockAdapter {
        fn invoke(&self, _provider: Provider, _prompt: &str, _options: &InvokeOptions<'_>) -> InvokeResult {
            InvokeResult {
                success: true,
                output: "<complete>DONE</complete>".to_string(),
                summary: None,
                error: None,
            }
        }
    }

    fn sample_task() -> FactoryTask {
        FactoryTask {
            item_id: "T-001".to_string(),
            name: "demo".to_string(),
            description: "demo task".to_string(),
            prd_file_path: std::path::PathBuf::from("nonexistent.json"),
            prd_category: None,
            complexity_score: 50,
            tier: Tier::Medium,
            retry_count: 0,
            assigned_slot: None,
            assigned_worker_id: None,
        }
    }

    #[test]
    fn init_rejects_empty_roster() {
        let repo = init_repo();
        let config = WorktreeConfig {
            worktree_dir: repo.path().join(".ralph/worktrees"),
        };
        let result = WorkerPool::init(&[], repo.path(), &config, 4);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn assign_and_await_completion_round_trip() {
        let repo = init_repo();
        let config = WorktreeConfig {
            worktree_dir: repo.path().join(".ralph/worktrees"),
        };
        let pool = WorkerPool::init(&["w1".to_string()], repo.path(), &config, 1).unwrap();

        let worker = pool.get_idle_worker().unwrap();
        {
            let w = worker.lock().unwrap();
            std::fs::write(w.worktree.path.join("foo.txt"), "hi\n").unwrap();
        }

        let task = sample_task();
        let slot = ProviderSlot::new(Provider::Claude, "sonnet", Tier::Medium);
        let assigned = pool.assign_task(
            worker,
            task,
            slot,
            Arc::new(MockAdapter),
            Arc::new(NoValidation),
            repo.path().to_path_buf(),
            false,
            true,
            Duration::from_secs(5),
        );
        assert!(assigned);
        assert_eq!(pool.get_active_count(), 1);

        let results = pool.await_any_completion().await;
        assert_eq!(results.len(), 1);
        assert!(results[0].success);
        assert_eq!(pool.get_active_count(), 0);
    }

    #[tokio::test]
    async fn assignment_refused_past_max_total_workers() {
        let repo = init_repo();
        let config = WorktreeConfig {
            worktree_dir: repo.path().join(".ralph/worktrees"),
        };
        let pool = WorkerPool::init(
            &["w1".to_string(), "w2".to_string()],
            repo.path(),
            &config,
            1,
        )
        .unwrap();

        let w1 = pool.get_idle_worker().unwrap();
        let assigned1 = pool.assign_task(
            w1,
            sample_task(),
            ProviderSlot::new(Provider::Claude, "sonnet", Tier::Medium),
            Arc::new(MockAdapter),
            Arc::new(NoValidation),
            repo.path().to_path_buf(),
            false,
            true,
            Duration::from_secs(5),
        );
        assert!(assigned1);

        let w2 = pool.get_idle_worker();
        if let Some(w2) = w2 {
            let assigned2 = pool.assign_task(
                w2,
                sample_task(),
                ProviderSlot::new(Provider::Claude, "sonnet", Tier::Medium),
                Arc::new(MockAdapter),
                Arc::new(NoValidation),
                repo.path().to_path_buf(),
                false,
                true,
                Duration::from_secs(5),
            );
            assert!(!assigned2);
        }
        pool.await_any_completion().await;
    }
}

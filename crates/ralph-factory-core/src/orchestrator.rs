//! Owns the task queue, in-progress map, retry table, and the main loop
//! that drives every other collaborator to convergence (§4.I).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::complexity_router::{build_tier, find_available_slot};
use crate::merge_coordinator::MergeCoordinator;
use crate::planner::Planner;
use crate::prd::PrdFile;
use crate::provider::{Provider, ProviderAdapter};
use crate::rate_limiter::RateLimiter;
use crate::worker::{FactoryTask, ValidationGate};
use crate::worker_pool::WorkerPool;
use crate::worktree::WorktreeConfig;

/// Knobs that come from `FactoryConfig` plus CLI overrides, already merged
/// by the time the orchestrator is constructed.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_total_workers: usize,
    pub retry_limit: u32,
    pub escalate_on_retry: bool,
    pub cleanup: bool,
    pub planner_refill_threshold: usize,
    pub planner_interval: Duration,
    pub planner_provider: Provider,
    pub planner_model: String,
    pub dry_run: bool,
    pub skip_validation: bool,
    pub invoke_timeout: Duration,
}

/// End-of-run report (§7, §8).
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub tasks_completed: usize,
    pub merges_succeeded: usize,
    pub conflicts: usize,
    pub workers_used: usize,
    pub slots_in_backoff: Vec<String>,
    pub converged: bool,
}

/// Owns every collaborator and the control-plane state the main loop reads
/// and mutates. Everything here is touched only from the control thread;
/// worker executions run concurrently but report back through the pool's
/// completion channel (§5).
pub struct Orchestrator {
    prd_files: Vec<PrdFile>,
    task_queue: Vec<FactoryTask>,
    in_progress: HashMap<String, FactoryTask>,
    completed_task_ids: Vec<String>,
    failed_task_retries: HashMap<String, u32>,
    shutdown: Arc<AtomicBool>,
    start_time: Instant,

    config: OrchestratorConfig,
    rate_limiter: RateLimiter,
    merge_coordinator: MergeCoordinator,
    planner: Planner,
    pool: WorkerPool,
    adapter: Arc<dyn ProviderAdapter>,
    validation: Arc<dyn ValidationGate>,
    main_repo: PathBuf,

    merges_succeeded: usize,
    conflicts: usize,
}

impl Orchestrator {
    /// Initialisation sequence (§4.I steps 1-7), minus signal registration
    /// (the caller owns that — see [`Orchestrator::shutdown_flag`]).
    #[allow(clippy::too_many_arguments)]
    pub fn init(
        prd_paths: &[PathBuf],
        main_repo: impl Into<PathBuf>,
        worker_ids: &[String],
        worktree_config: &WorktreeConfig,
        slot_capacities: &[(Provider, &str, u32)],
        spec_content: Option<String>,
        adapter: Arc<dyn ProviderAdapter>,
        validation: Arc<dyn ValidationGate>,
        config: OrchestratorConfig,
    ) -> Result<Self, crate::error::FactoryError> {
        let main_repo = main_repo.into();

        let mut prd_files = Vec::new();
        for path in prd_paths {
            prd_files.push(PrdFile::load(path)?);
        }

        let rate_limiter = RateLimiter::new();
        for (provider, model, capacity) in slot_capacities {
            rate_limiter.configure(provider.as_str(), model, *capacity);
        }

        let trunk_head = crate::git_ops::get_head_sha(&main_repo)?;
        info!(trunk_head = %trunk_head, "starting factory run against trunk");

        let merge_coordinator = MergeCoordinator::new(&main_repo);
        let planner_is_configured = spec_content.is_some();
        let mut planner = Planner::new(config.planner_interval, spec_content);

        let pool = WorkerPool::init(
            worker_ids,
            &main_repo,
            worktree_config,
            config.max_total_workers,
        )?;

        let mut orchestrator = Self {
            prd_files,
            task_queue: Vec::new(),
            in_progress: HashMap::new(),
            completed_task_ids: Vec::new(),
            failed_task_retries: HashMap::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
            start_time: Instant::now(),
            config,
            rate_limiter,
            merge_coordinator,
            planner,
            pool,
            adapter,
            validation,
            main_repo,
            merges_succeeded: 0,
            conflicts: 0,
        };

        if planner_is_configured {
            orchestrator.evaluate_planner_now();
        }

        orchestrator.refresh_task_queue();
        Ok(orchestrator)
    }

    /// Handle the caller can clone and flip from a signal handler
    /// (SIGINT/SIGTERM) to request a clean shutdown.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    fn evaluate_planner_now(&mut self) {
        let pending_summary: Vec<String> = self
            .completed_task_ids
            .iter()
            .rev()
            .take(10)
            .cloned()
            .collect();
        // A single synthetic PrdFile view spanning every loaded file; the
        // planner only reads descriptions and statuses, never mutates.
        let combined = self.combined_prd_view();
        let evaluation = self.planner.evaluate(
            self.adapter.as_ref(),
            self.config.planner_provider,
            &self.config.planner_model,
            &self.main_repo,
            &combined,
            &pending_summary,
        );
        self.apply_planner_evaluation(evaluation);
    }

    fn combined_prd_view(&self) -> PrdFile {
        let mut items = Vec::new();
        for prd in &self.prd_files {
            items.extend(prd.items.iter().cloned());
        }
        PrdFile {
            path: PathBuf::from("combined"),
            project: self.prd_files.first().and_then(|p| p.project.clone()),
            description: self.prd_files.first().and_then(|p| p.description.clone()),
            metadata: serde_json::Map::new(),
            items,
            extra: serde_json::Map::new(),
        }
    }

    fn apply_planner_evaluation(&mut self, evaluation: crate::planner::PlannerEvaluation) {
        if evaluation.spec_satisfied {
            info!("planner reports the reference specification is satisfied");
        }
        if !evaluation.new_tasks.is_empty() {
            info!(count = evaluation.new_tasks.len(), "planner injected new tasks");
            if let Some(target) = self.prd_files.first_mut() {
                for item in evaluation.new_tasks {
                    target.push_new_item(item);
                }
                if let Err(e) = target.save() {
                    warn!(error = %e, "failed to persist planner-injected tasks");
                }
            }
            self.refresh_task_queue();
        }
    }

    /// The main loop (§4.I). Runs until convergence or shutdown.
    pub async fn run(&mut self) -> RunSummary {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            if self.converged() {
                break;
            }

            let assigned = self.try_assign_tasks();

            if self.pool.has_active_workers() {
                let results = self.pool.await_any_completion().await;
                for result in results {
                    self.handle_result(result);
                }
                continue;
            }

            if assigned == 0 {
                if self.task_queue.is_empty() && self.in_progress.is_empty() {
                    if self.planner.is_configured() && !self.planner.has_evaluated() {
                        tokio::time::sleep(Duration::from_secs(3)).await;
                        self.refresh_task_queue();
                        continue;
                    }
                    break;
                }
                if self.rate_limiter.available_slots().is_empty() && !self.task_queue.is_empty() {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                } else if !self.task_queue.is_empty() && self.in_progress.is_empty() {
                    warn!("stuck: no slot matches any remaining task");
                    break;
                } else {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }

        self.shutdown_sequence().await
    }

    /// `tryAssignTasks()`: dispatches as many queued tasks as idle workers
    /// and available slots allow, in queue order.
    fn try_assign_tasks(&mut self) -> usize {
        let mut assigned = 0;
        let mut remaining = Vec::new();
        let queue = std::mem::take(&mut self.task_queue);

        for task in queue {
            let Some(worker) = self.pool.get_idle_worker() else {
                remaining.push(task);
                continue;
            };
            if self.pool.get_active_count() >= self.config.max_total_workers {
                remaining.push(task);
                continue;
            }
            let Some(slot) = find_available_slot(task.tier, &self.rate_limiter) else {
                remaining.push(task);
                continue;
            };
            if !self.rate_limiter.try_acquire(slot.provider.as_str(), &slot.model) {
                remaining.push(task);
                continue;
            }

            let mut task = task;
            task.assigned_slot = Some(slot.clone());
            task.assigned_worker_id = Some(worker.lock().unwrap().id.clone());

            if let Some(prd) = self.find_prd_mut(&task.prd_file_path) {
                if let Some(item) = prd.find_mut(&task.item_id) {
                    item.status = crate::prd::Status::InProgress;
                }
                let _ = prd.save();
            }

            self.in_progress.insert(task.item_id.clone(), task.clone());

            let assigned_ok = self.pool.assign_task(
                worker,
                task.clone(),
                slot,
                self.adapter.clone(),
                self.validation.clone(),
                self.main_repo.clone(),
                self.config.dry_run,
                self.config.skip_validation,
                self.config.invoke_timeout,
            );

            if assigned_ok {
                assigned += 1;
            } else {
                self.in_progress.remove(&task.item_id);
                remaining.push(task);
            }
        }

        self.task_queue = remaining;
        assigned
    }

    /// `handleResult(result)` (§4.I).
    fn handle_result(&mut self, result: crate::worker::WorkerResult) {
        let Some(task) = self.in_progress.remove(&result.task_id) else {
            return;
        };
        let Some(slot) = task.assigned_slot.clone() else {
            return;
        };

        self.rate_limiter.release(slot.provider.as_str(), &slot.model);

        if result.rate_limited {
            self.rate_limiter.report_rate_limit(slot.provider.as_str(), &slot.model);
            self.requeue(task, false);
            return;
        }

        // Past this point the provider call itself worked, whatever the
        // task's outcome — the limiter always sees a success.
        self.rate_limiter.report_success(slot.provider.as_str(), &slot.model);

        if let (true, Some(commit_hash)) = (result.success, result.commit_hash.clone()) {
            let outcome = self.merge_coordinator.cherry_pick(&commit_hash, &task.item_id);

            if outcome.success {
                self.merges_succeeded += 1;
                self.mark_complete(&task);
                self.completed_task_ids.push(task.item_id.clone());
                let pending = self.task_queue.len();
                let combined = self.combined_prd_view();
                let recent_completions = self.completed_task_ids.clone();
                let maybe_evaluation = self.planner.maybe_refill(
                    pending,
                    self.config.planner_refill_threshold,
                    self.adapter.as_ref(),
                    self.config.planner_provider,
                    &self.config.planner_model,
                    &self.main_repo,
                    &combined,
                    &recent_completions,
                );
                if let Some(evaluation) = maybe_evaluation {
                    self.apply_planner_evaluation(evaluation);
                }
                self.refresh_task_queue();
            } else {
                if outcome.conflict {
                    self.conflicts += 1;
                    warn!(task_id = %task.item_id, "cherry-pick conflict, re-queueing");
                } else {
                    error!(task_id = %task.item_id, error = ?outcome.error, "cherry-pick failed");
                }
                self.requeue(task, true);
            }
            return;
        }

        warn!(task_id = %task.item_id, error = ?result.error, "task attempt failed");
        self.requeue(task, true);
    }

    fn mark_complete(&mut self, task: &FactoryTask) {
        if let Some(prd) = self.find_prd_mut(&task.prd_file_path) {
            if let Some(item) = prd.find_mut(&task.item_id) {
                item.status = crate::prd::Status::Completed;
                item.completed_at = Some(chrono::Utc::now().to_rfc3339());
            }
            let _ = prd.save();
        }
    }

    /// Re-queue rules: bump retry on real failures; drop past the limit;
    /// leave as-is (no bump) for rate-limit re-queues.
    fn requeue(&mut self, mut task: FactoryTask, bump_retry: bool) {
        if bump_retry {
            let retries = self.failed_task_retries.entry(task.item_id.clone()).or_insert(0);
            *retries += 1;
            if *retries > self.config.retry_limit {
                warn!(task_id = %task.item_id, "task exceeded retry limit, dropping");
                if let Some(prd) = self.find_prd_mut(&task.prd_file_path) {
                    if let Some(item) = prd.find_mut(&task.item_id) {
                        item.status = crate::prd::Status::Pending;
                    }
                    let _ = prd.save();
                }
                return;
            }
            task.retry_count = *retries;
            if self.config.escalate_on_retry {
                task.tier = task.tier.escalate();
            }
        }

        if let Some(prd) = self.find_prd_mut(&task.prd_file_path) {
            if let Some(item) = prd.find_mut(&task.item_id) {
                item.status = crate::prd::Status::Pending;
            }
            let _ = prd.save();
        }

        task.assigned_slot = None;
        task.assigned_worker_id = None;
        self.task_queue.push(task);
        self.sort_queue();
    }

    /// Refresh queue: ready items minus queued/in-progress/completed/
    /// past-retry-limit, rebuilt and sorted priority-asc, complexity-desc.
    fn refresh_task_queue(&mut self) {
        let mut exclude: std::collections::HashSet<String> = self
            .task_queue
            .iter()
            .map(|t| t.item_id.clone())
            .collect();
        exclude.extend(self.in_progress.keys().cloned());
        exclude.extend(self.completed_task_ids.iter().cloned());
        for (id, retries) in &self.failed_task_retries {
            if *retries > self.config.retry_limit {
                exclude.insert(id.clone());
            }
        }

        let mut new_tasks = Vec::new();
        for prd in &self.prd_files {
            for item in prd.ready_items(&exclude) {
                let retry_count = self.failed_task_retries.get(&item.id).copied().unwrap_or(0);
                let (score, tier) = build_tier(item, self.config.escalate_on_retry, retry_count);
                new_tasks.push(FactoryTask {
                    item_id: item.id.clone(),
                    name: item.name.clone().unwrap_or_else(|| item.id.clone()),
                    description: item.description.clone(),
                    prd_file_path: prd.path.clone(),
                    prd_category: item.category.clone(),
                    complexity_score: score,
                    tier,
                    retry_count,
                    assigned_slot: None,
                    assigned_worker_id: None,
                });
            }
        }

        self.task_queue = new_tasks;
        self.sort_queue();
    }

    fn sort_queue(&mut self) {
        let priorities = self.priority_lookup();
        self.task_queue.sort_by(|a, b| {
            let prd_a = priorities.get(&a.item_id).copied().unwrap_or(crate::prd::Priority::Medium);
            let prd_b = priorities.get(&b.item_id).copied().unwrap_or(crate::prd::Priority::Medium);
            prd_a
                .cmp(&prd_b)
                .then_with(|| b.complexity_score.cmp(&a.complexity_score))
        });
    }

    fn priority_lookup(&self) -> HashMap<String, crate::prd::Priority> {
        let mut lookup = HashMap::new();
        for prd in &self.prd_files {
            for item in &prd.items {
                lookup.insert(item.id.clone(), item.priority);
            }
        }
        lookup
    }

    fn find_prd_mut(&mut self, path: &std::path::Path) -> Option<&mut PrdFile> {
        self.prd_files.iter_mut().find(|p| p.path == path)
    }

    /// Convergence check (§4.I).
    fn converged(&self) -> bool {
        if self.planner.spec_satisfied() && self.in_progress.is_empty() {
            return true;
        }
        self.task_queue.is_empty()
            && self.in_progress.is_empty()
            && (!self.planner.is_configured() || self.planner.has_evaluated())
    }

    async fn shutdown_sequence(&mut self) -> RunSummary {
        self.pool.shutdown(self.config.cleanup).await;

        // Orphaned in_progress items are reset to pending only here, on the
        // Factory's own clean shutdown of the run that set them in_progress
        // — never at startup (SPEC_FULL.md §9).
        for prd in &mut self.prd_files {
            prd.reset_in_progress_to_pending();
            let _ = prd.save();
        }
        self.in_progress.clear();

        info!(
            elapsed_secs = self.start_time.elapsed().as_secs(),
            completed = self.completed_task_ids.len(),
            "factory run finished"
        );

        RunSummary {
            tasks_completed: self.completed_task_ids.len(),
            merges_succeeded: self.merges_succeeded,
            conflicts: self.conflicts,
            workers_used: self.pool.roster_size(),
            slots_in_backoff: self
                .rate_limiter
                .available_slots()
                .into_iter()
                .map(|(p, m)| format!("{p}:{m}"))
                .collect(),
            converged: self.converged(),
        }
    }
}

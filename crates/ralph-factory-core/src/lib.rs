//! # ralph-factory-core
//!
//! Core orchestration for the Factory: a convergent, multi-provider
//! coding-agent orchestrator. This crate owns the backlog model, the
//! complexity router, the rate limiter, worktree-isolated workers, the
//! merge coordinator, the demand-driven planner, and the orchestrator that
//! wires them together and drives a run to convergence.
//!
//! It depends on no concrete provider CLI: provider invocation is behind
//! the [`provider::ProviderAdapter`] trait, implemented by
//! `ralph-factory-adapters`.

mod complexity_router;
pub mod config;
pub mod error;
mod git_ops;
pub mod merge_coordinator;
pub mod orchestrator;
pub mod planner;
pub mod prd;
pub mod provider;
pub mod rate_limiter;
pub mod worker;
pub mod worker_pool;
pub mod worktree;

pub use complexity_router::{build_tier, find_available_slot, score_complexity, score_to_tier};
pub use config::{ConfigError, FactoryConfig, SlotCapacity};
pub use error::FactoryError;
pub use merge_coordinator::{MergeCoordinator, MergeOutcome, MergeRecord};
pub use orchestrator::{Orchestrator, OrchestratorConfig, RunSummary};
pub use planner::{Planner, PlannerEvaluation, html_to_text};
pub use prd::{PrdError, PrdFile, PrdItem, Priority, Status};
pub use provider::{InvokeOptions, InvokeResult, Provider, ProviderAdapter, ProviderSlot, Tier};
pub use rate_limiter::{RateLimiter, is_rate_limited};
pub use worker::{
    FactoryTask, NoValidation, TokenLimits, ValidationGate, ValidationOutcome, Worker,
    WorkerResult, WorkerStatus, contains_completion_marker,
};
pub use worker_pool::WorkerPool;
pub use worktree::{
    Worktree, WorktreeConfig, WorktreeError, commit_in_worktree, init_worktree, list_worktrees,
    remove_worktree, reset_to_head,
};

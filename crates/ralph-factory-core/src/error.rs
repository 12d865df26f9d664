//! Aggregate error type returned across the crate's public boundary.

use crate::config::ConfigError;
use crate::git_ops::GitOpsError;
use crate::prd::PrdError;
use crate::worktree::WorktreeError;

/// Top-level error for Factory core operations that cross more than one
/// module boundary (the orchestrator's main loop, the CLI).
///
/// Individual modules keep their own narrower `thiserror` enum
/// (`WorktreeError`, `GitOpsError`, `PrdError`, `ConfigError`) and only
/// convert into `FactoryError` at the point where the orchestrator needs
/// to report a fatal condition. The merge coordinator is the one
/// exception: it never propagates an error type at all, since a cherry-
/// pick conflict is an expected, recoverable outcome rather than a
/// failure — `cherry_pick` returns a `MergeOutcome` with an `Option<String>`
/// error field instead (§4.G).
#[derive(Debug, thiserror::Error)]
pub enum FactoryError {
    #[error("worktree error: {0}")]
    Worktree(#[from] WorktreeError),

    #[error("git error: {0}")]
    Git(#[from] GitOpsError),

    #[error("backlog error: {0}")]
    Prd(#[from] PrdError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("worker pool has an empty roster")]
    EmptyRoster,
}

//! `FactoryConfig`: the explicit, known-keys configuration record (§6, §9).

use serde::{Deserialize, Serialize};

/// Errors from loading a [`FactoryConfig`] off disk.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

fn default_max_workers() -> usize {
    4
}
fn default_retry_limit() -> u32 {
    3
}
fn default_planner_interval_secs() -> u64 {
    120
}
fn default_true() -> bool {
    true
}
fn default_worktree_dir() -> String {
    ".ralph/worktrees".to_string()
}

/// Per-`provider:model` configured concurrency cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotCapacity {
    pub provider: String,
    pub model: String,
    pub capacity: u32,
}

/// Known-keys configuration for a Factory run. CLI flags override file
/// values field-by-field (CLI > file > built-in default), matching the
/// surrounding codebase's config-merge precedent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactoryConfig {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,

    #[serde(default)]
    pub slots: Vec<SlotCapacity>,

    #[serde(default = "default_planner_interval_secs")]
    pub planner_interval_secs: u64,

    #[serde(default)]
    pub planner_provider: Option<String>,

    #[serde(default)]
    pub planner_model: Option<String>,

    #[serde(default = "default_true")]
    pub auto_route: bool,

    #[serde(default = "default_true")]
    pub escalate_on_retry: bool,

    #[serde(default = "default_true")]
    pub cleanup: bool,

    #[serde(default)]
    pub spec_urls: Vec<String>,

    #[serde(default = "default_worktree_dir")]
    pub worktree_dir: String,

    #[serde(default)]
    pub dry_run: bool,

    #[serde(default)]
    pub skip_validation: bool,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            retry_limit: default_retry_limit(),
            slots: Vec::new(),
            planner_interval_secs: default_planner_interval_secs(),
            planner_provider: None,
            planner_model: None,
            auto_route: true,
            escalate_on_retry: true,
            cleanup: true,
            spec_urls: Vec::new(),
            worktree_dir: default_worktree_dir(),
            dry_run: false,
            skip_validation: false,
        }
    }
}

impl FactoryConfig {
    /// Loads from a YAML file, falling back to defaults for any key the
    /// file omits.
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&raw)?)
    }

    pub fn slot_capacity(&self, provider: &str, model: &str) -> u32 {
        self.slots
            .iter()
            .find(|s| s.provider == provider && s.model == model)
            .map_or(0, |s| s.capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_recommendations() {
        let config = FactoryConfig::default();
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.retry_limit, 3);
        assert!(config.auto_route);
        assert!(config.escalate_on_retry);
        assert!(config.cleanup);
        assert_eq!(config.worktree_dir, ".ralph/worktrees");
    }

    #[test]
    fn partial_yaml_fills_remaining_defaults() {
        let config: FactoryConfig = serde_yaml::from_str("max_workers: 8\n").unwrap();
        assert_eq!(config.max_workers, 8);
        assert_eq!(config.retry_limit, 3);
    }

    #[test]
    fn slot_capacity_defaults_to_zero_when_unconfigured() {
        let config = FactoryConfig::default();
        assert_eq!(config.slot_capacity("claude", "opus"), 0);
    }
}

//! Shared provider and tier primitives used across the router, rate limiter,
//! worker and adapter boundary.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// One of the four external coding-agent CLIs the factory can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Provider {
    Claude,
    Gemini,
    Codex,
    Cursor,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Provider::Claude => "claude",
            Provider::Gemini => "gemini",
            Provider::Codex => "codex",
            Provider::Cursor => "cursor",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a provider name does not match one of the closed set.
#[derive(Debug, Clone)]
pub struct UnknownProviderError(pub String);

impl fmt::Display for UnknownProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown provider: {}", self.0)
    }
}

impl std::error::Error for UnknownProviderError {}

impl FromStr for Provider {
    type Err = UnknownProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claude" => Ok(Provider::Claude),
            "gemini" => Ok(Provider::Gemini),
            "codex" => Ok(Provider::Codex),
            "cursor" => Ok(Provider::Cursor),
            other => Err(UnknownProviderError(other.to_string())),
        }
    }
}

/// Complexity tier assigned to a task by the Complexity Router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Tier {
    Low,
    Medium,
    High,
}

impl Tier {
    /// `low -> medium -> high -> high`, per the escalation rule.
    pub fn escalate(self) -> Tier {
        match self {
            Tier::Low => Tier::Medium,
            Tier::Medium => Tier::High,
            Tier::High => Tier::High,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Low => "low",
            Tier::Medium => "medium",
            Tier::High => "high",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `(provider, model, tier)` — the concurrency key is `(provider, model)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSlot {
    pub provider: Provider,
    pub model: String,
    pub tier: Tier,
}

impl ProviderSlot {
    pub fn new(provider: Provider, model: impl Into<String>, tier: Tier) -> Self {
        Self {
            provider,
            model: model.into(),
            tier,
        }
    }

    /// The `provider:model` key the rate limiter and routing table use.
    pub fn key(&self) -> String {
        format!("{}:{}", self.provider, self.model)
    }
}

/// Options accepted by a [`ProviderAdapter`] invocation (§4.D).
#[derive(Debug, Clone)]
pub struct InvokeOptions<'a> {
    pub project_root: &'a Path,
    pub dry_run: bool,
    pub model: Option<&'a str>,
    pub timeout: Duration,
    /// Per-slot token budget from `TokenLimits::for_slot` (§4.E), in tokens.
    /// The adapter has no per-provider flag for this; it is enforced by
    /// truncating the prompt before it is handed to the CLI.
    pub token_limit: Option<u32>,
}

/// Result of a single provider invocation.
#[derive(Debug, Clone)]
pub struct InvokeResult {
    pub success: bool,
    pub output: String,
    pub summary: Option<String>,
    pub error: Option<String>,
}

/// The Provider Adapter contract: invoke the chosen CLI with a prompt and
/// capture its output. Implemented by `ralph-factory-adapters`'s
/// subprocess-backed `CliBackend`; the worker and orchestrator depend only
/// on this trait, never on a concrete CLI-spawning type, so tests can
/// substitute a mock provider.
pub trait ProviderAdapter: Send + Sync {
    fn invoke(&self, provider: Provider, prompt: &str, options: &InvokeOptions<'_>) -> InvokeResult;
}

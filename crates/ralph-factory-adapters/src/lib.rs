//! Provider adapters: one CLI backend per supported coding-agent provider,
//! and the subprocess invocation that drives it (§4.D).

pub mod cli_backend;

pub use cli_backend::{CliBackend, OutputFormat, PromptMode, SubprocessAdapter, invoke};
pub use ralph_factory_core::provider::{InvokeOptions, InvokeResult, ProviderAdapter};

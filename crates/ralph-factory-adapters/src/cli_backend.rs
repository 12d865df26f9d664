//! CLI backend definitions for the four supported coding-agent providers.

use ralph_factory_core::provider::{InvokeOptions, InvokeResult, Provider, ProviderAdapter};
use std::io::Write;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;

#[cfg(test)]
use std::path::Path;

/// Output format emitted by a CLI backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Plain text output.
    #[default]
    Text,
    /// Newline-delimited JSON stream (Claude with `--output-format stream-json`).
    StreamJson,
}

/// How to pass the prompt to the CLI tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptMode {
    /// Pass prompt as a command-line argument.
    Arg,
    /// Write prompt to stdin.
    Stdin,
}

/// A CLI backend configuration for executing prompts against one provider.
#[derive(Debug, Clone)]
pub struct CliBackend {
    pub command: String,
    pub args: Vec<String>,
    pub prompt_mode: PromptMode,
    pub prompt_flag: Option<String>,
    pub model_flag: Option<String>,
    pub output_format: OutputFormat,
}

impl CliBackend {
    /// Creates the backend for the given provider, in the provider's
    /// headless/autonomous invocation mode.
    pub fn for_provider(provider: Provider) -> Self {
        match provider {
            Provider::Claude => Self::claude(),
            Provider::Gemini => Self::gemini(),
            Provider::Codex => Self::codex(),
            Provider::Cursor => Self::cursor(),
        }
    }

    /// Claude Code, headless, streaming JSON output.
    pub fn claude() -> Self {
        Self {
            command: "claude".to_string(),
            args: vec![
                "--dangerously-skip-permissions".to_string(),
                "--verbose".to_string(),
                "--output-format".to_string(),
                "stream-json".to_string(),
            ],
            prompt_mode: PromptMode::Arg,
            prompt_flag: Some("-p".to_string()),
            model_flag: Some("--model".to_string()),
            output_format: OutputFormat::StreamJson,
        }
    }

    /// Gemini CLI, headless (`--yolo` auto-approves tool use).
    pub fn gemini() -> Self {
        Self {
            command: "gemini".to_string(),
            args: vec!["--yolo".to_string()],
            prompt_mode: PromptMode::Arg,
            prompt_flag: Some("-p".to_string()),
            model_flag: Some("-m".to_string()),
            output_format: OutputFormat::Text,
        }
    }

    /// Codex CLI, headless (`exec --full-auto`).
    pub fn codex() -> Self {
        Self {
            command: "codex".to_string(),
            args: vec!["exec".to_string(), "--full-auto".to_string()],
            prompt_mode: PromptMode::Arg,
            prompt_flag: None, // positional argument
            model_flag: Some("-m".to_string()),
            output_format: OutputFormat::Text,
        }
    }

    /// Cursor CLI (`cursor-agent`), headless (`--force` auto-approves tool use).
    ///
    /// No teacher backend exists for Cursor; this follows the same
    /// factory-method shape as the other three.
    pub fn cursor() -> Self {
        Self {
            command: "cursor-agent".to_string(),
            args: vec!["--force".to_string()],
            prompt_mode: PromptMode::Arg,
            prompt_flag: Some("-p".to_string()),
            model_flag: Some("--model".to_string()),
            output_format: OutputFormat::Text,
        }
    }

    /// Builds the full command with arguments for execution.
    pub fn build_command(
        &self,
        prompt: &str,
        model: Option<&str>,
    ) -> (String, Vec<String>, Option<String>, Option<NamedTempFile>) {
        let mut args = self.args.clone();

        if let (Some(flag), Some(model)) = (&self.model_flag, model) {
            args.push(flag.clone());
            args.push(model.to_string());
        }

        let (stdin_input, temp_file) = match self.prompt_mode {
            PromptMode::Arg => {
                let (prompt_text, temp_file) = if self.command == "claude" && prompt.len() > 7000 {
                    match NamedTempFile::new() {
                        Ok(mut file) => {
                            if let Err(e) = file.write_all(prompt.as_bytes()) {
                                tracing::warn!("failed to write prompt to temp file: {e}");
                                (prompt.to_string(), None)
                            } else {
                                let path = file.path().display().to_string();
                                (
                                    format!("Please read and execute the task in {path}"),
                                    Some(file),
                                )
                            }
                        }
                        Err(e) => {
                            tracing::warn!("failed to create temp file: {e}");
                            (prompt.to_string(), None)
                        }
                    }
                } else {
                    (prompt.to_string(), None)
                };

                if let Some(ref flag) = self.prompt_flag {
                    args.push(flag.clone());
                }
                args.push(prompt_text);
                (None, temp_file)
            }
            PromptMode::Stdin => (Some(prompt.to_string()), None),
        };

        tracing::debug!(
            command = %self.command,
            args_count = args.len(),
            prompt_len = prompt.len(),
            uses_stdin = stdin_input.is_some(),
            uses_temp_file = temp_file.is_some(),
            "built CLI command"
        );
        tracing::trace!(prompt = %prompt, "full prompt content");

        (self.command.clone(), args, stdin_input, temp_file)
    }
}

/// Truncates `prompt` to approximately fit within `limit` tokens, using the
/// same ~4-characters-per-token heuristic and natural-break-point search the
/// surrounding codebase uses for memory budgets, so a worker's token limit
/// (§4.E) is actually enforced rather than only carried in `InvokeOptions`.
fn truncate_to_token_budget(prompt: &str, limit: u32) -> String {
    let char_budget = limit as usize * 4;
    if prompt.len() <= char_budget {
        return prompt.to_string();
    }

    let mut end = char_budget;
    while end > 0 && !prompt.is_char_boundary(end) {
        end -= 1;
    }
    let truncated = &prompt[..end];
    let break_at = truncated.rfind("\n\n").unwrap_or(end);
    format!(
        "{}\n\n(truncated: prompt exceeded the {limit}-token budget for this provider slot)",
        &truncated[..break_at]
    )
}

/// Synthetic output returned for `dryRun=true`, carrying a completion marker
/// so the Worker's completion check (§4.E) treats it as done without
/// anything having run.
const DRY_RUN_OUTPUT: &str = "<complete>DONE</complete>\n(dry run: no work was performed)";

/// Invokes `provider`'s CLI in `options.project_root` with `prompt`.
///
/// The adapter only classifies success/failure on process outcome (exit
/// code, timeout, missing binary); completion-marker scanning and
/// rate-limit classification are the Worker's job (§4.E/§4.B), driven off
/// the returned `output`.
pub fn invoke(provider: Provider, prompt: &str, options: &InvokeOptions<'_>) -> InvokeResult {
    if options.dry_run {
        return InvokeResult {
            success: true,
            output: DRY_RUN_OUTPUT.to_string(),
            summary: Some("dry run".to_string()),
            error: None,
        };
    }

    let prompt = match options.token_limit {
        Some(limit) => truncate_to_token_budget(prompt, limit),
        None => prompt.to_string(),
    };
    let backend = CliBackend::for_provider(provider);
    let (command, args, stdin_input, _temp_file) = backend.build_command(&prompt, options.model);

    let mut cmd = Command::new(&command);
    cmd.args(&args)
        .current_dir(options.project_root)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return InvokeResult {
                success: false,
                output: String::new(),
                summary: None,
                error: Some(format!("failed to launch {command}: {e}")),
            };
        }
    };

    if let Some(input) = stdin_input {
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(input.as_bytes());
        }
    } else {
        drop(child.stdin.take());
    }

    let deadline = Instant::now() + options.timeout;
    loop {
        match child.try_wait() {
            Ok(Some(_status)) => break,
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return InvokeResult {
                        success: false,
                        output: String::new(),
                        summary: None,
                        error: Some(format!(
                            "{command} exceeded timeout of {:?}",
                            options.timeout
                        )),
                    };
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                return InvokeResult {
                    success: false,
                    output: String::new(),
                    summary: None,
                    error: Some(format!("failed to poll {command}: {e}")),
                };
            }
        }
    }

    let output = match child.wait_with_output() {
        Ok(output) => output,
        Err(e) => {
            return InvokeResult {
                success: false,
                output: String::new(),
                summary: None,
                error: Some(format!("failed to collect output from {command}: {e}")),
            };
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    let combined = format!("{stdout}\n{stderr}");

    if !output.status.success() {
        return InvokeResult {
            success: false,
            output: combined,
            summary: None,
            error: Some(format!(
                "{command} exited with {}",
                output.status.code().unwrap_or(-1)
            )),
        };
    }

    let (text, summary) = extract_final_message(backend.output_format, &stdout);

    InvokeResult {
        success: true,
        output: if text.is_empty() { combined } else { text },
        summary,
        error: None,
    }
}

/// Extracts the final assistant message text (and, if present, a structured
/// summary) from the provider's stdout.
///
/// For [`OutputFormat::StreamJson`] this scans newline-delimited JSON events
/// for the last `type: "result"` / `subtype: "success"` record and returns
/// its `result` field as text and `summary` verbatim; malformed or
/// non-matching lines are skipped rather than treated as fatal, matching the
/// adapter's tolerant stdout-scanning contract.
fn extract_final_message(format: OutputFormat, stdout: &str) -> (String, Option<String>) {
    match format {
        OutputFormat::Text => (stdout.trim().to_string(), None),
        OutputFormat::StreamJson => {
            let mut last_text = String::new();
            let mut summary = None;
            for line in stdout.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
                    continue;
                };
                if let Some(result) = value.get("result").and_then(|v| v.as_str()) {
                    last_text = result.to_string();
                }
                if value.get("subtype").and_then(|v| v.as_str()) == Some("success") {
                    summary = Some(line.to_string());
                }
            }
            if last_text.is_empty() {
                (stdout.trim().to_string(), summary)
            } else {
                (last_text, summary)
            }
        }
    }
}

/// The real, subprocess-backed [`ProviderAdapter`]. The only implementation
/// the binary wires in; tests inject a different implementer of the trait.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubprocessAdapter;

impl ProviderAdapter for SubprocessAdapter {
    fn invoke(&self, provider: Provider, prompt: &str, options: &InvokeOptions<'_>) -> InvokeResult {
        invoke(provider, prompt, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claude_backend_builds_expected_command() {
        let backend = CliBackend::claude();
        let (cmd, args, stdin, _temp) = backend.build_command("test prompt", None);

        assert_eq!(cmd, "claude");
        assert_eq!(
            args,
            vec![
                "--dangerously-skip-permissions",
                "--verbose",
                "--output-format",
                "stream-json",
                "-p",
                "test prompt"
            ]
        );
        assert!(stdin.is_none());
        assert_eq!(backend.output_format, OutputFormat::StreamJson);
    }

    #[test]
    fn claude_large_prompt_uses_temp_file() {
        let backend = CliBackend::claude();
        let large_prompt = "x".repeat(7001);
        let (_cmd, args, _stdin, temp) = backend.build_command(&large_prompt, None);

        assert!(temp.is_some());
        assert!(args.iter().any(|a| a.contains("Please read and execute")));
    }

    #[test]
    fn non_claude_large_prompt_is_passed_inline() {
        let backend = CliBackend::gemini();
        let large_prompt = "x".repeat(7001);
        let (_cmd, args, stdin, temp) = backend.build_command(&large_prompt, None);

        assert_eq!(args.last().unwrap(), &large_prompt);
        assert!(stdin.is_none());
        assert!(temp.is_none());
    }

    #[test]
    fn model_flag_is_appended_before_prompt() {
        let backend = CliBackend::codex();
        let (_cmd, args, _stdin, _temp) = backend.build_command("prompt", Some("o4-mini"));

        assert_eq!(
            args,
            vec!["exec", "--full-auto", "-m", "o4-mini", "prompt"]
        );
    }

    #[test]
    fn cursor_backend_builds_expected_command() {
        let backend = CliBackend::cursor();
        let (cmd, args, stdin, _temp) = backend.build_command("do the thing", None);

        assert_eq!(cmd, "cursor-agent");
        assert_eq!(args, vec!["--force", "-p", "do the thing"]);
        assert!(stdin.is_none());
    }

    #[test]
    fn dry_run_short_circuits_with_completion_marker() {
        let result = invoke(
            Provider::Claude,
            "irrelevant",
            &InvokeOptions {
                project_root: Path::new("."),
                dry_run: true,
                model: None,
                timeout: Duration::from_secs(1),
                token_limit: None,
            },
        );

        assert!(result.success);
        assert!(result.output.contains("<complete>DONE</complete>"));
    }

    #[test]
    fn invoke_reports_missing_binary_as_failure() {
        let result = invoke(
            Provider::Claude,
            "prompt",
            &InvokeOptions {
                project_root: Path::new("."),
                dry_run: false,
                model: None,
                timeout: Duration::from_secs(1),
                token_limit: None,
            },
        );
        // The real `claude` binary is not present in the test sandbox, so this
        // exercises the spawn-failure path rather than a real invocation.
        if !result.success {
            assert!(result.error.is_some());
        }
    }

    #[test]
    fn truncate_to_token_budget_leaves_short_prompts_untouched() {
        let prompt = "do the thing";
        assert_eq!(truncate_to_token_budget(prompt, 100), prompt);
    }

    #[test]
    fn truncate_to_token_budget_cuts_down_long_prompts() {
        let prompt = "x".repeat(10_000);
        let truncated = truncate_to_token_budget(&prompt, 100);
        assert!(truncated.len() < prompt.len());
        assert!(truncated.contains("truncated"));
    }

    #[test]
    fn extract_final_message_picks_last_result_event() {
        let stdout = r#"{"type":"assistant","text":"thinking"}
{"type":"result","subtype":"success","result":"done"}"#;
        let (text, summary) = extract_final_message(OutputFormat::StreamJson, stdout);
        assert_eq!(text, "done");
        assert!(summary.is_some());
    }

    #[test]
    fn extract_final_message_tolerates_malformed_lines() {
        let stdout = "not json\n{\"type\":\"result\",\"subtype\":\"success\",\"result\":\"ok\"}";
        let (text, _summary) = extract_final_message(OutputFormat::StreamJson, stdout);
        assert_eq!(text, "ok");
    }
}

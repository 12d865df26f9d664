//! Demand-driven planner: asks a dedicated provider slot for new tasks or a
//! "spec satisfied" verdict (§4.H).

use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::prd::{PrdFile, PrdItem, Priority, Status};
use crate::provider::{InvokeOptions, Provider, ProviderAdapter};

/// Raw shape the planner's provider is asked to emit.
#[derive(Debug, Deserialize)]
struct PlannerResponse {
    #[serde(rename = "specSatisfied", default)]
    spec_satisfied: bool,
    #[serde(default)]
    #[allow(dead_code)]
    reasoning: String,
    #[serde(rename = "newTasks", default)]
    new_tasks: Vec<PlannerTaskDraft>,
}

#[derive(Debug, Deserialize)]
struct PlannerTaskDraft {
    #[serde(default)]
    id: String,
    #[serde(default)]
    description: String,
    #[serde(default = "default_priority")]
    priority: Priority,
    #[serde(default)]
    acceptance_criteria: Vec<String>,
    #[serde(default)]
    estimated_hours: Option<f64>,
    #[serde(default)]
    complexity: Option<String>,
}

fn default_priority() -> Priority {
    Priority::Medium
}

/// Result of one planner evaluation. Never surfaces an error to the
/// orchestrator — parse and provider failures fold into an empty result.
#[derive(Debug, Default, Clone)]
pub struct PlannerEvaluation {
    pub spec_satisfied: bool,
    pub new_tasks: Vec<PrdItem>,
}

/// Tracks evaluation timing and the "spec satisfied" / "evaluated at least
/// once" flags the orchestrator's convergence check reads.
pub struct Planner {
    interval: Duration,
    last_evaluated: Option<Instant>,
    evaluated_at_least_once: bool,
    spec_satisfied: bool,
    spec_content: Option<String>,
}

impl Planner {
    pub fn new(interval: Duration, spec_content: Option<String>) -> Self {
        Self {
            interval,
            last_evaluated: None,
            evaluated_at_least_once: false,
            spec_satisfied: false,
            spec_content,
        }
    }

    pub fn has_evaluated(&self) -> bool {
        self.evaluated_at_least_once
    }

    pub fn spec_satisfied(&self) -> bool {
        self.spec_satisfied
    }

    pub fn is_configured(&self) -> bool {
        self.spec_content.is_some()
    }

    /// `true` if enough wall time has elapsed since the last evaluation (or
    /// none has happened yet).
    fn interval_elapsed(&self) -> bool {
        self.last_evaluated.is_none_or(|t| t.elapsed() >= self.interval)
    }

    /// Called after each completion. Evaluates only if `pending_count <
    /// threshold` AND the interval has elapsed (or this is the startup
    /// evaluation).
    pub fn maybe_refill(
        &mut self,
        pending_count: usize,
        threshold: usize,
        adapter: &dyn ProviderAdapter,
        provider: Provider,
        model: &str,
        project_root: &std::path::Path,
        prd: &PrdFile,
        recent_completions: &[String],
    ) -> Option<PlannerEvaluation> {
        if pending_count >= threshold || !self.interval_elapsed() {
            return None;
        }
        Some(self.evaluate(adapter, provider, model, project_root, prd, recent_completions))
    }

    /// Unconditional evaluation, used once at startup when spec content is
    /// configured.
    pub fn evaluate(
        &mut self,
        adapter: &dyn ProviderAdapter,
        provider: Provider,
        model: &str,
        project_root: &std::path::Path,
        prd: &PrdFile,
        recent_completions: &[String],
    ) -> PlannerEvaluation {
        self.last_evaluated = Some(Instant::now());
        self.evaluated_at_least_once = true;

        let context = self.build_context(prd, recent_completions);
        let options = InvokeOptions {
            project_root,
            dry_run: false,
            model: Some(model),
            timeout: Duration::from_secs(120),
        };
        let invocation = adapter.invoke(provider, &context, &options);

        if !invocation.success {
            return PlannerEvaluation::default();
        }

        let Some(response) = parse_planner_response(&invocation.output) else {
            return PlannerEvaluation::default();
        };

        if response.spec_satisfied {
            self.spec_satisfied = true;
        }

        let sanitised = sanitise_new_tasks(response.new_tasks, prd);

        PlannerEvaluation {
            spec_satisfied: response.spec_satisfied,
            new_tasks: sanitised,
        }
    }

    fn build_context(&self, prd: &PrdFile, recent_completions: &[String]) -> String {
        let mut context = String::new();
        context.push_str("Project backlog status:\n");
        for item in &prd.items {
            context.push_str(&format!(
                "- {} [{}] {}\n",
                item.id,
                if item.is_complete() { "done" } else { "pending" },
                item.description
            ));
        }
        if !recent_completions.is_empty() {
            context.push_str("\nRecently completed:\n");
            for id in recent_completions {
                context.push_str(&format!("- {id}\n"));
            }
        }
        if let Some(spec) = &self.spec_content {
            context.push_str("\nReference specification:\n");
            context.push_str(spec);
        }
        context.push_str(
            "\n\nRespond with JSON: {\"specSatisfied\": bool, \"reasoning\": string, \
             \"newTasks\": [{\"id\": string, \"description\": string, \"priority\": string}]}",
        );
        context
    }
}

/// Parses the planner's response: either a top-level JSON object, or JSON
/// extracted from a fenced code block. Tolerates both; anything else yields
/// `None`.
fn parse_planner_response(output: &str) -> Option<PlannerResponse> {
    if let Ok(response) = serde_json::from_str::<PlannerResponse>(output.trim()) {
        return Some(response);
    }

    let fenced = extract_fenced_json(output)?;
    serde_json::from_str::<PlannerResponse>(&fenced).ok()
}

fn extract_fenced_json(output: &str) -> Option<String> {
    let start_marker = output.find("```")?;
    let after_marker = &output[start_marker + 3..];
    let after_marker = after_marker.strip_prefix("json").unwrap_or(after_marker);
    let end = after_marker.find("```")?;
    Some(after_marker[..end].trim().to_string())
}

fn sanitise_new_tasks(drafts: Vec<PlannerTaskDraft>, prd: &PrdFile) -> Vec<PrdItem> {
    drafts
        .into_iter()
        .filter(|draft| !draft.id.is_empty() && !draft.description.is_empty())
        .filter(|draft| !prd.items.iter().any(|item| item.id == draft.id))
        .map(|draft| PrdItem {
            id: draft.id,
            name: None,
            description: draft.description,
            priority: draft.priority,
            category: None,
            status: Status::Pending,
            passes: None,
            depends_on: vec![],
            acceptance_criteria: draft.acceptance_criteria,
            estimated_hours: draft.estimated_hours,
            provider_override: None,
            validation_override: None,
            complexity_hint: draft.complexity,
            judges: vec![],
            validation_result: None,
            judge_result: None,
            completed_at: None,
            extra: serde_json::Map::new(),
        })
        .collect()
}

/// Converts fetched HTML into readable text: strips `<script>`/`<style>`/
/// `<nav>`/`<footer>`, converts block tags to newlines, strips remaining
/// tags, decodes a handful of basic entities, normalises whitespace, and
/// truncates to `max_chars`.
pub fn html_to_text(html: &str, max_chars: usize) -> String {
    let stripped = strip_elements(html, &["script", "style", "nav", "footer"]);

    let mut text = String::with_capacity(stripped.len());
    let mut in_tag = false;
    let mut tag_name = String::new();
    for ch in stripped.chars() {
        match ch {
            '<' => {
                in_tag = true;
                tag_name.clear();
            }
            '>' => {
                in_tag = false;
                let is_block = matches!(
                    tag_name.trim_start_matches('/'),
                    "p" | "div" | "br" | "li" | "h1" | "h2" | "h3" | "h4" | "h5" | "h6" | "tr"
                );
                if is_block {
                    text.push('\n');
                }
            }
            _ if in_tag => tag_name.push(ch),
            _ => text.push(ch),
        }
    }

    let text = text
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ");

    let normalised: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    normalised.chars().take(max_chars).collect()
}

fn strip_elements(html: &str, tags: &[&str]) -> String {
    let mut result = html.to_string();
    for tag in tags {
        loop {
            let open = format!("<{tag}");
            let Some(start) = result.to_lowercase().find(&open) else {
                break;
            };
            let close_tag = format!("</{tag}>");
            let Some(close_rel) = result.to_lowercase()[start..].find(&close_tag) else {
                break;
            };
            let end = start + close_rel + close_tag.len();
            result.replace_range(start..end, "");
        }
    }
    result
}

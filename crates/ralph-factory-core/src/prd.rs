//! Backlog (PRD) data model and file read/write contract (§3, §6).

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Priority of a backlog item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

/// Status of a backlog item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    InProgress,
    Completed,
}

/// A single backlog item. The core treats it as opaque except for these
/// fields. Unrecognised JSON fields round-trip via `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrdItem {
    pub id: String,
    pub name: Option<String>,
    pub description: String,
    pub priority: Priority,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passes: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub acceptance_criteria: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_hours: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_override: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_override: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity_hint: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub judges: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judge_result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    /// Unrecognised fields, preserved verbatim across load/save.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PrdItem {
    /// An item is *complete* iff `status = completed` OR `passes = true`.
    pub fn is_complete(&self) -> bool {
        self.status == Status::Completed || self.passes == Some(true)
    }

    /// An item is *pending* iff `passes = false`, or (`passes` unset AND
    /// `status` ∈ {pending, in_progress}).
    pub fn is_pending(&self) -> bool {
        match self.passes {
            Some(false) => true,
            Some(true) => false,
            None => matches!(self.status, Status::Pending | Status::InProgress),
        }
    }

    /// An item is *ready* iff it is pending, not complete, and every
    /// dependency resolves to a complete item in `backlog`.
    pub fn is_ready(&self, backlog: &[PrdItem]) -> bool {
        if !self.is_pending() || self.is_complete() {
            return false;
        }
        self.depends_on.iter().all(|dep| {
            backlog
                .iter()
                .find(|item| &item.id == dep)
                .is_some_and(PrdItem::is_complete)
        })
    }
}

/// Error returned by backlog load/save operations.
#[derive(Debug, thiserror::Error)]
pub enum PrdError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed backlog file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// A single PRD file: its path plus the parsed document.
#[derive(Debug, Clone)]
pub struct PrdFile {
    pub path: PathBuf,
    pub project: Option<String>,
    pub description: Option<String>,
    pub metadata: Map<String, Value>,
    pub items: Vec<PrdItem>,
    /// Any other top-level fields, preserved verbatim.
    pub extra: Map<String, Value>,
}

impl PrdFile {
    /// Loads a PRD file. Accepts either `{ "items": [...] , ... }` or a bare
    /// top-level array.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, PrdError> {
        let path = path.into();
        let raw = std::fs::read_to_string(&path).map_err(|e| PrdError::Io {
            path: path.clone(),
            source: e,
        })?;
        let value: Value = serde_json::from_str(&raw).map_err(|e| PrdError::Parse {
            path: path.clone(),
            source: e,
        })?;

        match value {
            Value::Array(items) => {
                let items = serde_json::from_value(Value::Array(items)).map_err(|e| {
                    PrdError::Parse {
                        path: path.clone(),
                        source: e,
                    }
                })?;
                Ok(Self {
                    path,
                    project: None,
                    description: None,
                    metadata: Map::new(),
                    items,
                    extra: Map::new(),
                })
            }
            Value::Object(mut obj) => {
                let items_value = obj.remove("items").unwrap_or(Value::Array(vec![]));
                let items = serde_json::from_value(items_value).map_err(|e| PrdError::Parse {
                    path: path.clone(),
                    source: e,
                })?;
                let project = obj
                    .remove("project")
                    .and_then(|v| v.as_str().map(str::to_string));
                let description = obj
                    .remove("description")
                    .and_then(|v| v.as_str().map(str::to_string));
                let metadata = match obj.remove("metadata") {
                    Some(Value::Object(m)) => m,
                    _ => Map::new(),
                };
                Ok(Self {
                    path,
                    project,
                    description,
                    metadata,
                    items,
                    extra: obj,
                })
            }
            _ => Err(PrdError::Parse {
                path,
                source: serde::de::Error::custom("backlog file is neither an object nor an array"),
            }),
        }
    }

    /// Saves the document back to `self.path`, preserving unrecognised
    /// top-level fields and stamping `metadata.updated_at`. Items are never
    /// reordered; only their in-place fields are mutated by callers.
    pub fn save(&mut self) -> Result<(), PrdError> {
        self.metadata.insert(
            "updated_at".to_string(),
            Value::String(Utc::now().to_rfc3339()),
        );

        let mut obj = self.extra.clone();
        if let Some(project) = &self.project {
            obj.insert("project".to_string(), Value::String(project.clone()));
        }
        if let Some(description) = &self.description {
            obj.insert(
                "description".to_string(),
                Value::String(description.clone()),
            );
        }
        obj.insert(
            "metadata".to_string(),
            Value::Object(self.metadata.clone()),
        );
        obj.insert(
            "items".to_string(),
            serde_json::to_value(&self.items).map_err(|e| PrdError::Parse {
                path: self.path.clone(),
                source: e,
            })?,
        );

        let rendered = serde_json::to_string_pretty(&Value::Object(obj)).map_err(|e| {
            PrdError::Parse {
                path: self.path.clone(),
                source: e,
            }
        })?;
        std::fs::write(&self.path, rendered).map_err(|e| PrdError::Io {
            path: self.path.clone(),
            source: e,
        })
    }

    /// On startup, crash-recovered `in_progress` items not currently held by
    /// a live worker are reset to `pending` (§3).
    pub fn reset_in_progress_to_pending(&mut self) {
        for item in &mut self.items {
            if item.status == Status::InProgress {
                item.status = Status::Pending;
            }
        }
    }

    /// Ready items (pending, not complete, dependencies satisfied),
    /// optionally filtered by category/priority, excluding ids already
    /// accounted for elsewhere (queued, in progress, completed, or past the
    /// retry limit).
    pub fn ready_items<'a>(&'a self, exclude: &HashSet<String>) -> Vec<&'a PrdItem> {
        self.items
            .iter()
            .filter(|item| !exclude.contains(&item.id) && item.is_ready(&self.items))
            .collect()
    }

    pub fn find_mut(&mut self, id: &str) -> Option<&mut PrdItem> {
        self.items.iter_mut().find(|item| item.id == id)
    }

    /// Appends a sanitised planner-generated item with `status = pending`.
    pub fn push_new_item(&mut self, item: PrdItem) {
        self.items.push(item);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_item(id: &str, status: Status) -> PrdItem {
        PrdItem {
            id: id.to_string(),
            name: None,
            description: "do a thing".to_string(),
            priority: Priority::Medium,
            category: None,
            status,
            passes: None,
            depends_on: vec![],
            acceptance_criteria: vec![],
            estimated_hours: None,
            provider_override: None,
            validation_override: None,
            complexity_hint: None,
            judges: vec![],
            validation_result: None,
            judge_result: None,
            completed_at: None,
            extra: Map::new(),
        }
    }

    #[test]
    fn completeness_and_readiness_invariants() {
        let mut dependency = sample_item("A", Status::Completed);
        dependency.passes = Some(true);
        let dependent = sample_item("B", Status::Pending);
        let mut dependent = dependent;
        dependent.depends_on = vec!["A".to_string()];

        let backlog = vec![dependency, dependent.clone()];
        assert!(dependent.is_ready(&backlog));
    }

    #[test]
    fn not_ready_when_dependency_incomplete() {
        let dependency = sample_item("A", Status::Pending);
        let mut dependent = sample_item("B", Status::Pending);
        dependent.depends_on = vec!["A".to_string()];

        let backlog = vec![dependency, dependent.clone()];
        assert!(!dependent.is_ready(&backlog));
    }

    #[test]
    fn passes_false_overrides_completed_status() {
        let mut item = sample_item("A", Status::Completed);
        item.passes = Some(false);
        assert!(!item.is_complete());
        assert!(item.is_pending());
    }

    #[test]
    fn round_trip_preserves_unrecognised_fields_and_marks_one_item() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("prd.json");
        std::fs::write(
            &path,
            r#"{
                "project": "demo",
                "custom_field": "kept",
                "items": [
                    {"id": "T-001", "description": "add foo", "priority": "high", "status": "pending"},
                    {"id": "T-002", "description": "add bar", "priority": "low", "status": "pending"}
                ]
            }"#,
        )
        .unwrap();

        let mut prd = PrdFile::load(&path).unwrap();
        assert_eq!(prd.extra.get("custom_field").unwrap(), "kept");
        prd.find_mut("T-001").unwrap().status = Status::Completed;
        prd.save().unwrap();

        let reloaded = PrdFile::load(&path).unwrap();
        assert_eq!(reloaded.extra.get("custom_field").unwrap(), "kept");
        assert!(reloaded.metadata.contains_key("updated_at"));
        let t001 = reloaded.items.iter().find(|i| i.id == "T-001").unwrap();
        assert!(t001.is_complete());
        let t002 = reloaded.items.iter().find(|i| i.id == "T-002").unwrap();
        assert_eq!(t002.status, Status::Pending);
    }

    #[test]
    fn in_progress_resets_to_pending_on_load() {
        let mut item = sample_item("A", Status::InProgress);
        item.status = Status::InProgress;
        let mut prd = PrdFile {
            path: PathBuf::from("unused.json"),
            project: None,
            description: None,
            metadata: Map::new(),
            items: vec![item],
            extra: Map::new(),
        };
        prd.reset_in_progress_to_pending();
        assert_eq!(prd.items[0].status, Status::Pending);
    }
}

//! Batch report across the recipes of one `run` invocation.

use super::types::{RunReport, RunStatus, Value};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A recipe that could not be resolved or whose run failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureEntry {
    pub recipe: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

/// Summary rows gathered from every run that produced a given summary key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SummaryTable {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_text: Option<String>,
    pub data_rows: Vec<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchReport {
    pub failures: Vec<FailureEntry>,
    pub skipped: Vec<String>,
    pub completed: Vec<String>,
    pub summary_results: IndexMap<String, SummaryTable>,
}

impl BatchReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a recipe that never reached the executor.
    pub fn record_error(&mut self, recipe: &str, message: &str) {
        self.failures.push(FailureEntry {
            recipe: recipe.to_string(),
            message: message.to_string(),
            processor: None,
            step_index: None,
            trace: None,
        });
    }

    pub fn record_run(&mut self, run: &RunReport) {
        match run.status {
            RunStatus::Completed => self.completed.push(run.identifier.clone()),
            RunStatus::Skipped => self.skipped.push(run.identifier.clone()),
            RunStatus::Failed | RunStatus::Pending | RunStatus::Running => {
                let (message, processor, step_index, trace) = match run.failure {
                    Some(ref f) => (
                        f.message.clone(),
                        f.processor.clone(),
                        f.step_index,
                        f.trace.clone(),
                    ),
                    None => (format!("run ended {}", run.status), None, None, None),
                };
                self.failures.push(FailureEntry {
                    recipe: run.identifier.clone(),
                    message,
                    processor,
                    step_index,
                    trace,
                });
            }
        }

        for (key, result) in &run.summary_results {
            let table = self.summary_results.entry(key.clone()).or_default();
            match result.as_map() {
                Some(map) => {
                    if table.summary_text.is_none() {
                        table.summary_text =
                            map.get("summary_text").and_then(Value::scalar_string);
                    }
                    if let Some(data) = map.get("data") {
                        table.data_rows.push(data.clone());
                    }
                }
                None => table.data_rows.push(result.clone()),
            }
        }
    }

    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    /// Write the report as pretty JSON via a temporary file and rename.
    pub fn write(&self, path: &Path) -> Result<(), String> {
        let json =
            serde_json::to_string_pretty(self).map_err(|e| format!("serialize error: {}", e))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| format!("cannot write {}: {}", tmp.display(), e))?;
        std::fs::rename(&tmp, path)
            .map_err(|e| format!("cannot rename {} → {}: {}", tmp.display(), path.display(), e))
    }
}

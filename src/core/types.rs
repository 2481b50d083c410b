//! Shared types: environment values, recipes, chains, run reports, events.
//!
//! Recipe documents are YAML; the run report and event log are JSON. All
//! persisted types derive Serialize/Deserialize.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

// ============================================================================
// Environment values
// ============================================================================

/// A single environment value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Map(IndexMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    /// Truthiness used for flags such as `stop_processing_recipe`.
    ///
    /// Strings coming from `-k key=value` are text, so `""`, `"0"`, `"false"`
    /// and `"no"` count as false.
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Integer(n) => *n != 0,
            Self::Float(f) => *f != 0.0,
            Self::String(s) => {
                let lower = s.trim().to_ascii_lowercase();
                !matches!(lower.as_str(), "" | "0" | "false" | "no")
            }
            Self::List(l) => !l.is_empty(),
            Self::Map(m) => !m.is_empty(),
        }
    }

    /// Render a scalar as plain text. Lists and maps have no plain form.
    pub fn scalar_string(&self) -> Option<String> {
        match self {
            Self::Bool(b) => Some(b.to_string()),
            Self::Integer(n) => Some(n.to_string()),
            Self::Float(f) => Some(f.to_string()),
            Self::String(s) => Some(s.clone()),
            Self::List(_) | Self::Map(_) => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "boolean",
            Self::Integer(_) => "integer",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::List(_) => "list",
            Self::Map(_) => "mapping",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scalar_string() {
            Some(s) => write!(f, "{}", s),
            None => match serde_json::to_string(self) {
                Ok(json) => write!(f, "{}", json),
                Err(_) => write!(f, "<{}>", self.type_name()),
            },
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Integer(n)
    }
}

impl From<Vec<Value>> for Value {
    fn from(l: Vec<Value>) -> Self {
        Self::List(l)
    }
}

impl From<IndexMap<String, Value>> for Value {
    fn from(m: IndexMap<String, Value>) -> Self {
        Self::Map(m)
    }
}

/// The mutable key/value state threaded through a pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Environment(IndexMap<String, Value>);

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Insert or overwrite; an overwritten key keeps its original position.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.shift_remove(key)
    }

    /// Overlay every entry of `other`, other wins.
    pub fn merge(&mut self, other: &IndexMap<String, Value>) {
        for (k, v) in other {
            self.0.insert(k.clone(), v.clone());
        }
    }

    pub fn is_truthy(&self, key: &str) -> bool {
        self.0.get(key).map(Value::is_truthy).unwrap_or(false)
    }

    pub fn iter(&self) -> indexmap::map::Iter<'_, String, Value> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &IndexMap<String, Value> {
        &self.0
    }
}

impl From<IndexMap<String, Value>> for Environment {
    fn from(m: IndexMap<String, Value>) -> Self {
        Self(m)
    }
}

// ============================================================================
// Recipe documents (on-disk YAML)
// ============================================================================

/// A recipe or override as written on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipeDocument {
    #[serde(rename = "Identifier")]
    pub identifier: String,

    #[serde(rename = "Description", default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(rename = "MinimumVersion", default, skip_serializing_if = "Option::is_none")]
    pub minimum_version: Option<String>,

    #[serde(rename = "ParentRecipe", default, skip_serializing_if = "Option::is_none")]
    pub parent_recipe: Option<String>,

    #[serde(rename = "Input", default)]
    pub input: IndexMap<String, Value>,

    /// Present on non-overrides only.
    #[serde(rename = "Process", default, skip_serializing_if = "Option::is_none")]
    pub process: Option<Vec<ProcessorStep>>,

    /// Present on overrides only.
    #[serde(
        rename = "ParentRecipeTrustInfo",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub trust_info: Option<TrustInfo>,
}

/// One step of a recipe's `Process` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorStep {
    #[serde(rename = "Processor")]
    pub processor: String,

    #[serde(rename = "Arguments", default)]
    pub arguments: IndexMap<String, Value>,

    #[serde(rename = "Comment", default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl ProcessorStep {
    pub fn named(processor: &str) -> Self {
        Self {
            processor: processor.to_string(),
            arguments: IndexMap::new(),
            comment: None,
        }
    }
}

/// Trust attestations an override author recorded for its ancestry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrustInfo {
    #[serde(default)]
    pub parent_recipes: IndexMap<String, TrustRecord>,

    /// Recipe-adjacent processors used by the chain.
    #[serde(default)]
    pub non_core_processors: IndexMap<String, TrustRecord>,
}

/// A recorded digest for one trusted file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    pub content_hash: String,

    /// Version-control revision, informational only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_hash: Option<String>,
}

// ============================================================================
// Loaded recipes and chains
// ============================================================================

/// A recipe loaded from disk. Immutable after construction.
#[derive(Debug, Clone)]
pub struct Recipe {
    pub identifier: String,
    pub shortname: String,
    pub path: PathBuf,
    pub description: Option<String>,
    pub parent_identifier: Option<String>,
    pub minimum_version: Option<String>,
    pub input: IndexMap<String, Value>,
    pub steps: Vec<ProcessorStep>,
    pub content_hash: String,
    pub is_override: bool,
    pub trust_info: Option<TrustInfo>,
}

impl Recipe {
    pub fn dir(&self) -> PathBuf {
        self.path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// The fully merged execution plan for one recipe or override.
#[derive(Debug, Clone)]
pub struct RecipeChain {
    /// Root first, leaf last.
    pub ordered_identifiers: Vec<String>,
    pub ordered_paths: Vec<PathBuf>,
    pub merged_input: IndexMap<String, Value>,
    pub merged_steps: Vec<ProcessorStep>,
    pub trust_findings: Vec<TrustFinding>,
    /// Directories searched for recipe-adjacent processors, leaf first.
    pub processor_dirs: Vec<PathBuf>,
    /// Directories of recipes outside the chain addressed as `identifier/Name`.
    pub shared_processor_dirs: IndexMap<String, PathBuf>,
    /// Recipes in chain order, root first.
    pub recipes: Vec<Recipe>,
}

impl RecipeChain {
    pub fn leaf(&self) -> Option<&Recipe> {
        self.recipes.last()
    }

    pub fn identifier(&self) -> &str {
        self.ordered_identifiers
            .last()
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn is_trusted(&self) -> bool {
        self.trust_findings.is_empty()
    }
}

/// Why a trust check failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustFindingKind {
    NoTrustInfo,
    MissingRecord,
    HashMismatch,
    NoLongerInChain,
    ProcessorMissingRecord,
    ProcessorHashMismatch,
    ProcessorNotFound,
}

/// A single trust verification finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustFinding {
    /// Recipe identifier or processor name.
    pub subject: String,
    pub kind: TrustFindingKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl fmt::Display for TrustFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TrustFindingKind::NoTrustInfo => {
                write!(f, "{}: override has no parent trust info", self.subject)
            }
            TrustFindingKind::MissingRecord => {
                write!(f, "{}: parent recipe has no trust record", self.subject)
            }
            TrustFindingKind::HashMismatch => {
                write!(f, "{}: parent recipe contents changed", self.subject)?;
                if let Some(ref rev) = self.revision_hash {
                    write!(f, " since revision {}", rev)?;
                }
                Ok(())
            }
            TrustFindingKind::NoLongerInChain => write!(
                f,
                "{}: trusted parent recipe is no longer in the chain",
                self.subject
            ),
            TrustFindingKind::ProcessorMissingRecord => {
                write!(f, "{}: processor has no trust record", self.subject)
            }
            TrustFindingKind::ProcessorHashMismatch => {
                write!(f, "{}: processor contents changed", self.subject)
            }
            TrustFindingKind::ProcessorNotFound => {
                write!(f, "{}: trusted processor can no longer be found", self.subject)
            }
        }
    }
}

// ============================================================================
// Run reports
// ============================================================================

/// Lifecycle of a single pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Skipped,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Skipped => write!(f, "SKIPPED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Execution mode for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunMode {
    #[default]
    Full,
    /// Stop at the end-of-check marker.
    CheckOnly,
}

/// A step that ran to completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub index: usize,
    pub processor: String,
    pub duration_seconds: f64,
}

/// Where and why a run failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processor: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

/// Outcome of running one recipe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub identifier: String,
    pub recipe_path: PathBuf,
    pub status: RunStatus,
    pub steps: Vec<StepRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureRecord>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub summary_results: IndexMap<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trust_findings: Vec<TrustFinding>,
    pub duration_seconds: f64,
    /// Final environment; not serialized into reports.
    #[serde(skip)]
    pub env: Environment,
}

// ============================================================================
// Provenance events
// ============================================================================

/// One transition of a pipeline run, as recorded in the run journal.
///
/// The journal envelope carries the run id, sequence number and timestamp,
/// so events only hold what is specific to the transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        recipe: String,
        recipe_path: PathBuf,
        engine_version: String,
        check_only: bool,
        steps: usize,
    },
    TrustFinding {
        subject: String,
        detail: String,
    },
    StepStarted {
        index: usize,
        processor: String,
    },
    StepCompleted {
        index: usize,
        processor: String,
        duration_seconds: f64,
    },
    StepFailed {
        index: usize,
        processor: String,
        error: String,
    },
    RunSkipped {
        after_step: usize,
    },
    RunCompleted {
        steps_run: usize,
        total_seconds: f64,
    },
    RunFailed {
        error: String,
    },
}

impl RunEvent {
    /// The `event` tag this variant serializes under.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::TrustFinding { .. } => "trust_finding",
            Self::StepStarted { .. } => "step_started",
            Self::StepCompleted { .. } => "step_completed",
            Self::StepFailed { .. } => "step_failed",
            Self::RunSkipped { .. } => "run_skipped",
            Self::RunCompleted { .. } => "run_completed",
            Self::RunFailed { .. } => "run_failed",
        }
    }

    /// True for the events that end a run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::RunSkipped { .. } | Self::RunCompleted { .. } | Self::RunFailed { .. }
        )
    }
}

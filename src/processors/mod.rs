//! Processors: the units of work a recipe's steps name.
//!
//! Each processor:
//! 1. Declares the environment keys it reads and writes
//! 2. Reads its inputs from the shared environment
//! 3. Writes its outputs back, or fails with a message
//!
//! Dispatch goes through a name → factory registry. Unknown names fail
//! closed; recipe-adjacent executables are consulted only after the
//! built-ins.

pub mod external;
pub mod file;
pub mod flow;
pub mod install;
pub mod package;

use crate::core::types::{Environment, RecipeChain, Value};
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// An input or output variable a processor declares.
#[derive(Debug, Clone, Copy)]
pub struct VariableSpec {
    pub name: &'static str,
    pub required: bool,
    /// Inserted as a string when the key is absent.
    pub default: Option<&'static str>,
    pub description: &'static str,
}

impl VariableSpec {
    pub const fn required(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            required: true,
            default: None,
            description,
        }
    }

    pub const fn optional(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            required: false,
            default: None,
            description,
        }
    }

    pub const fn with_default(
        name: &'static str,
        default: &'static str,
        description: &'static str,
    ) -> Self {
        Self {
            name,
            required: false,
            default: Some(default),
            description,
        }
    }
}

/// A processor run that did not succeed.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ProcessorFailure {
    pub message: String,
    /// Longer diagnostic output (stderr, daemon error lines).
    pub detail: Option<String>,
}

impl ProcessorFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl From<String> for ProcessorFailure {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

/// A unit of work threaded through the environment.
pub trait Processor {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn input_variables(&self) -> &[VariableSpec];
    fn output_variables(&self) -> &[VariableSpec];
    fn run(&self, env: &mut Environment) -> Result<(), ProcessorFailure>;
}

type Factory = fn() -> Box<dyn Processor>;

fn make<P: Processor + Default + 'static>() -> Box<dyn Processor> {
    Box::new(P::default())
}

const BUILTINS: &[(&str, Factory)] = &[
    ("EndOfCheckPhase", make::<flow::EndOfCheckPhase>),
    ("StopProcessingIf", make::<flow::StopProcessingIf>),
    ("FileCreator", make::<file::FileCreator>),
    ("Copier", make::<file::Copier>),
    ("PathDeleter", make::<file::PathDeleter>),
    ("PkgRootCreator", make::<package::PkgRootCreator>),
    ("PkgCreator", make::<package::PkgCreator>),
    ("ItemCopier", make::<install::ItemCopier>),
];

/// Name of the check-only boundary marker.
pub const END_OF_CHECK_PHASE: &str = "EndOfCheckPhase";

/// True if `name` is a built-in processor.
pub fn is_core(name: &str) -> bool {
    BUILTINS.iter().any(|(n, _)| *n == name)
}

/// Name → factory map of known processors.
pub struct Registry {
    factories: IndexMap<String, Factory>,
}

impl Registry {
    /// Registry populated with the built-in processors.
    pub fn builtin() -> Self {
        let mut registry = Self {
            factories: IndexMap::new(),
        };
        for (name, factory) in BUILTINS {
            registry.register(name, *factory);
        }
        registry
    }

    pub fn register(&mut self, name: &str, factory: Factory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Instantiate a registered processor.
    pub fn create(&self, name: &str) -> Option<Box<dyn Processor>> {
        self.factories.get(name).map(|f| f())
    }

    /// Resolve a step's processor: registered first, then recipe-adjacent.
    pub fn resolve(
        &self,
        name: &str,
        chain: &RecipeChain,
    ) -> Result<Box<dyn Processor>, ProcessorFailure> {
        if let Some(p) = self.create(name) {
            return Ok(p);
        }
        match external::locate(name, chain) {
            Some(path) => Ok(Box::new(external::ExternalProcessor::new(name, path))),
            None => Err(ProcessorFailure::new(format!("unknown processor: {}", name))),
        }
    }
}

/// Fill defaults for missing optional inputs, then check required ones.
pub fn prepare_inputs(
    processor: &dyn Processor,
    env: &mut Environment,
) -> Result<(), ProcessorFailure> {
    let mut missing = Vec::new();
    for spec in processor.input_variables() {
        if env.contains(spec.name) {
            continue;
        }
        if let Some(default) = spec.default {
            env.insert(spec.name, default);
        } else if spec.required {
            missing.push(spec.name);
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ProcessorFailure::new(format!(
            "{}: missing required input {}",
            processor.name(),
            missing.join(", ")
        )))
    }
}

/// Read a string input.
pub(crate) fn require_str(env: &Environment, key: &str) -> Result<String, ProcessorFailure> {
    match env.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => other.scalar_string().ok_or_else(|| {
            ProcessorFailure::new(format!(
                "{} must be a string, got {}",
                key,
                other.type_name()
            ))
        }),
        None => Err(ProcessorFailure::new(format!(
            "missing required input {}",
            key
        ))),
    }
}

/// Read an optional string input.
pub(crate) fn optional_str(env: &Environment, key: &str) -> Option<String> {
    env.get(key).and_then(Value::scalar_string)
}

/// Decode a structured input (a mapping or list) into a typed request.
pub(crate) fn decode_input<T: DeserializeOwned>(
    env: &Environment,
    key: &str,
) -> Result<T, ProcessorFailure> {
    let value = env
        .get(key)
        .ok_or_else(|| ProcessorFailure::new(format!("missing required input {}", key)))?;
    let json = serde_json::to_value(value)
        .map_err(|e| ProcessorFailure::new(format!("{}: {}", key, e)))?;
    serde_json::from_value(json).map_err(|e| ProcessorFailure::new(format!("invalid {}: {}", key, e)))
}

/// Parse an octal mode string such as `"0755"` or `"644"`.
pub(crate) fn parse_mode(s: &str) -> Result<u32, String> {
    let trimmed = s.trim();
    let digits = trimmed.strip_prefix("0o").unwrap_or(trimmed);
    u32::from_str_radix(digits, 8)
        .ok()
        .filter(|m| *m <= 0o7777)
        .ok_or_else(|| format!("invalid mode '{}'", s))
}

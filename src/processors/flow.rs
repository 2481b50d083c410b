//! Flow-control processors: the check-phase marker and conditional stop.

use super::{Processor, ProcessorFailure, VariableSpec};
use crate::core::types::Environment;

/// Key that ends a run early with status Skipped.
pub const STOP_KEY: &str = "stop_processing_recipe";

/// Marks the end of the check phase. Does nothing when run.
#[derive(Debug, Default)]
pub struct EndOfCheckPhase;

impl Processor for EndOfCheckPhase {
    fn name(&self) -> &str {
        "EndOfCheckPhase"
    }

    fn description(&self) -> &str {
        "Marks the end of the check phase; a check-only run stops here."
    }

    fn input_variables(&self) -> &[VariableSpec] {
        &[]
    }

    fn output_variables(&self) -> &[VariableSpec] {
        &[]
    }

    fn run(&self, _env: &mut Environment) -> Result<(), ProcessorFailure> {
        Ok(())
    }
}

/// Sets `stop_processing_recipe` from a predicate over the environment.
#[derive(Debug, Default)]
pub struct StopProcessingIf;

const STOP_INPUTS: &[VariableSpec] = &[VariableSpec::required(
    "predicate",
    "KEY, !KEY, KEY == value or KEY != value",
)];

const STOP_OUTPUTS: &[VariableSpec] = &[VariableSpec::optional(
    STOP_KEY,
    "true when the predicate held",
)];

impl Processor for StopProcessingIf {
    fn name(&self) -> &str {
        "StopProcessingIf"
    }

    fn description(&self) -> &str {
        "Stops the recipe (status Skipped) when the predicate is true."
    }

    fn input_variables(&self) -> &[VariableSpec] {
        STOP_INPUTS
    }

    fn output_variables(&self) -> &[VariableSpec] {
        STOP_OUTPUTS
    }

    fn run(&self, env: &mut Environment) -> Result<(), ProcessorFailure> {
        let predicate = super::require_str(env, "predicate")?;
        let result = evaluate(&predicate, env).map_err(ProcessorFailure::new)?;
        tracing::debug!("predicate '{}' → {}", predicate, result);
        env.insert(STOP_KEY, result);
        Ok(())
    }
}

/// Evaluate a stop predicate.
pub fn evaluate(predicate: &str, env: &Environment) -> Result<bool, String> {
    let predicate = predicate.trim();
    if predicate.is_empty() {
        return Err("empty predicate".to_string());
    }
    if let Some((key, expected)) = predicate.split_once("!=") {
        return Ok(!equals(env, key, expected)?);
    }
    if let Some((key, expected)) = predicate.split_once("==") {
        return equals(env, key, expected);
    }
    if let Some(key) = predicate.strip_prefix('!') {
        return Ok(!env.is_truthy(check_key(key)?));
    }
    Ok(env.is_truthy(check_key(predicate)?))
}

fn equals(env: &Environment, key: &str, expected: &str) -> Result<bool, String> {
    let key = check_key(key)?;
    let expected = unquote(expected.trim());
    Ok(env
        .get(key)
        .and_then(|v| v.scalar_string())
        .is_some_and(|actual| actual == expected))
}

fn check_key(key: &str) -> Result<&str, String> {
    let key = key.trim();
    if key.is_empty() || !key.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return Err(format!("invalid predicate key '{}'", key));
    }
    Ok(key)
}

fn unquote(s: &str) -> &str {
    for q in ['"', '\''] {
        if s.len() >= 2 && s.starts_with(q) && s.ends_with(q) {
            return &s[1..s.len() - 1];
        }
    }
    s
}

//! Recipe-adjacent processors: executables shipped next to recipes.
//!
//! A step naming `VersionFixer` runs the executable `VersionFixer` found in
//! the directory of a chain recipe (leaf first). `com.example.Shared/Name`
//! addresses the directory of the recipe with that identifier instead.
//!
//! Protocol: the environment is written to stdin as a JSON object; a JSON
//! object on stdout is merged back into the environment. A non-zero exit is
//! a failure carrying stderr as detail.

use super::{Processor, ProcessorFailure, VariableSpec};
use crate::core::types::{Environment, RecipeChain, Value};
use crate::transport::local::{exec, Invocation};
use indexmap::IndexMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Find the executable for a non-built-in processor name.
pub fn locate(name: &str, chain: &RecipeChain) -> Option<PathBuf> {
    if let Some((identifier, file)) = name.split_once('/') {
        if !valid_name(file) {
            return None;
        }
        let dir = chain
            .recipes
            .iter()
            .find(|r| r.identifier == identifier)
            .map(|r| r.dir())
            .or_else(|| chain.shared_processor_dirs.get(identifier).cloned())?;
        let path = dir.join(file);
        return is_executable(&path).then_some(path);
    }
    if !valid_name(name) {
        return None;
    }
    chain
        .processor_dirs
        .iter()
        .map(|dir| dir.join(name))
        .find(|path| is_executable(path))
}

/// A processor backed by an executable.
#[derive(Debug, Clone)]
pub struct ExternalProcessor {
    name: String,
    path: PathBuf,
    description: String,
}

impl ExternalProcessor {
    pub fn new(name: &str, path: PathBuf) -> Self {
        let description = format!("Recipe-adjacent processor at {}", path.display());
        Self {
            name: name.to_string(),
            path,
            description,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Processor for ExternalProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_variables(&self) -> &[VariableSpec] {
        &[]
    }

    fn output_variables(&self) -> &[VariableSpec] {
        &[]
    }

    fn run(&self, env: &mut Environment) -> Result<(), ProcessorFailure> {
        let program = self
            .path
            .to_str()
            .ok_or_else(|| format!("non-UTF-8 processor path {}", self.path.display()))?;
        let input = serde_json::to_vec(env.as_map())
            .map_err(|e| format!("cannot serialize environment: {}", e))?;
        let mut inv = Invocation::new(program).stdin(&input);
        if let Some(dir) = self.path.parent() {
            inv = inv.cwd(dir);
        }
        let out = exec(&inv)?;
        if !out.success() {
            return Err(ProcessorFailure::new(format!(
                "{} exited with code {}",
                self.name, out.exit_code
            ))
            .with_detail(out.stderr.trim().to_string()));
        }
        if !out.stderr.trim().is_empty() {
            tracing::debug!("{} stderr: {}", self.name, out.stderr.trim());
        }

        let stdout = out.stdout.trim();
        if stdout.is_empty() {
            return Ok(());
        }
        let outputs: IndexMap<String, Value> = serde_json::from_str(stdout).map_err(|e| {
            ProcessorFailure::new(format!("{} wrote invalid output: {}", self.name, e))
                .with_detail(stdout.to_string())
        })?;
        env.merge(&outputs);
        Ok(())
    }
}

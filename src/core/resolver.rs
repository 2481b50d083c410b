//! Recipe chain resolution.
//!
//! Walks `ParentRecipe` links from a leaf recipe or override up to the root,
//! then merges input (child wins) and steps (root first, overrides
//! contribute none). Parents are looked up only among non-overrides. Each
//! identifier is visited at most once, so a cycle is reported as invalid.

use super::index::{IndexEntry, LookupScope, RecipeIndex};
use super::parser;
use super::trust;
use super::types::*;
use indexmap::IndexMap;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Why a recipe could not be turned into a chain.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("recipe not found: {0}")]
    NotFound(String),

    #[error("invalid recipe {name}: {reason}")]
    Invalid { name: String, reason: String },

    #[error("{identifier} failed trust verification: {}", render_findings(.findings))]
    Untrusted {
        identifier: String,
        findings: Vec<TrustFinding>,
    },
}

fn render_findings(findings: &[TrustFinding]) -> String {
    findings
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl ResolveError {
    fn invalid(name: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

/// Resolver settings.
#[derive(Debug, Clone)]
pub struct ResolveOptions {
    /// Ignore overrides when locating the leaf.
    pub skip_overrides: bool,
    /// Trust findings abort resolution.
    pub strict_trust: bool,
    /// Version compared against each recipe's `MinimumVersion`.
    pub engine_version: String,
    /// Recipe files under these directories are overrides.
    pub override_dirs: Vec<PathBuf>,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            skip_overrides: false,
            strict_trust: false,
            engine_version: env!("CARGO_PKG_VERSION").to_string(),
            override_dirs: Vec::new(),
        }
    }
}

/// Builds chains against an injected recipe index.
pub struct Resolver<'a> {
    index: &'a mut dyn RecipeIndex,
    options: ResolveOptions,
    rebuilt: bool,
}

impl<'a> Resolver<'a> {
    pub fn new(index: &'a mut dyn RecipeIndex, options: ResolveOptions) -> Self {
        Self {
            index,
            options,
            rebuilt: false,
        }
    }

    /// Resolve a path, shortname, or identifier into a merged chain.
    pub fn resolve(&mut self, name: &str) -> Result<RecipeChain, ResolveError> {
        let leaf_scope = if self.options.skip_overrides {
            LookupScope::RecipesOnly
        } else {
            LookupScope::PreferOverrides
        };
        let leaf_entry = self.locate(name, leaf_scope)?;
        let leaf = self.load(name, &leaf_entry)?;
        if self.options.skip_overrides && leaf.is_override {
            return Err(ResolveError::invalid(
                name,
                "is an override but overrides are being skipped",
            ));
        }

        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(leaf.identifier.clone());
        let mut next = leaf.parent_identifier.clone();
        let mut leaf_first = vec![leaf];

        while let Some(parent_id) = next {
            if !visited.insert(parent_id.clone()) {
                return Err(ResolveError::invalid(
                    name,
                    format!("parent cycle through {}", parent_id),
                ));
            }
            let entry = self.locate(&parent_id, LookupScope::RecipesOnly)?;
            let parent = self.load(&parent_id, &entry)?;
            if parent.is_override {
                return Err(ResolveError::invalid(
                    &parent_id,
                    "an override cannot be a parent recipe",
                ));
            }
            tracing::debug!("{} ← parent {}", name, parent.identifier);
            next = parent.parent_identifier.clone();
            leaf_first.push(parent);
        }

        leaf_first.reverse();
        let recipes = leaf_first;
        self.check_versions(&recipes)?;

        let mut chain = build_chain(recipes).map_err(|reason| ResolveError::invalid(name, reason))?;
        chain.shared_processor_dirs = self.shared_processor_dirs(&chain);
        chain.trust_findings = trust::verify_chain(&chain);

        if !chain.trust_findings.is_empty() {
            for finding in &chain.trust_findings {
                tracing::warn!("trust: {}", finding);
            }
            if self.options.strict_trust {
                return Err(ResolveError::Untrusted {
                    identifier: chain.identifier().to_string(),
                    findings: chain.trust_findings,
                });
            }
        }
        Ok(chain)
    }

    /// Find a recipe file, rebuilding the index once on a miss.
    fn locate(&mut self, name: &str, scope: LookupScope) -> Result<IndexEntry, ResolveError> {
        let as_path = Path::new(name);
        if (as_path.is_absolute() || parser::is_recipe_file(as_path)) && as_path.is_file() {
            return Ok(IndexEntry {
                path: as_path.to_path_buf(),
                identifier: String::new(),
                shortname: parser::shortname_from_path(as_path),
                is_override: self.in_override_dir(as_path),
            });
        }

        if let Some(entry) = self.index.lookup(name, scope) {
            if entry.path.is_file() {
                return Ok(entry);
            }
        }
        if !self.rebuilt {
            self.rebuilt = true;
            tracing::debug!("recipe index miss for {}, rebuilding", name);
            self.index
                .rebuild()
                .map_err(|e| ResolveError::invalid(name, format!("index rebuild failed: {}", e)))?;
            if let Some(entry) = self.index.lookup(name, scope) {
                if entry.path.is_file() {
                    return Ok(entry);
                }
            }
        }
        Err(ResolveError::NotFound(name.to_string()))
    }

    fn load(&self, name: &str, entry: &IndexEntry) -> Result<Recipe, ResolveError> {
        let in_override_dir = entry.is_override || self.in_override_dir(&entry.path);
        parser::load_recipe(&entry.path, in_override_dir)
            .map_err(|reason| ResolveError::invalid(name, reason))
    }

    fn in_override_dir(&self, path: &Path) -> bool {
        self.options
            .override_dirs
            .iter()
            .any(|d| path.starts_with(d))
    }

    fn check_versions(&self, recipes: &[Recipe]) -> Result<(), ResolveError> {
        for recipe in recipes {
            if let Some(ref minimum) = recipe.minimum_version {
                if !parser::version_satisfies(minimum, &self.options.engine_version) {
                    return Err(ResolveError::invalid(
                        &recipe.identifier,
                        format!(
                            "requires version {} (running {})",
                            minimum, self.options.engine_version
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Directories of recipes outside the chain that steps address as `identifier/Name`.
    fn shared_processor_dirs(&mut self, chain: &RecipeChain) -> IndexMap<String, PathBuf> {
        let mut dirs = IndexMap::new();
        for step in &chain.merged_steps {
            let Some((identifier, _)) = step.processor.split_once('/') else {
                continue;
            };
            if dirs.contains_key(identifier)
                || chain.ordered_identifiers.iter().any(|i| i == identifier)
            {
                continue;
            }
            match self.locate(identifier, LookupScope::RecipesOnly) {
                Ok(entry) => {
                    if let Some(dir) = entry.path.parent() {
                        dirs.insert(identifier.to_string(), dir.to_path_buf());
                    }
                }
                Err(e) => tracing::warn!("shared processor recipe {}: {}", identifier, e),
            }
        }
        dirs
    }
}

/// Merge loaded recipes (root first) into a chain without trust findings.
pub fn build_chain(recipes: Vec<Recipe>) -> Result<RecipeChain, String> {
    let root = recipes.first().ok_or("empty recipe chain")?;
    if root.parent_identifier.is_some() {
        return Err(format!("{} has a parent but is first in the chain", root.identifier));
    }
    if root.steps.is_empty() {
        return Err(format!("root recipe {} has no processor steps", root.identifier));
    }
    if let Some(pos) = recipes[..recipes.len() - 1].iter().position(|r| r.is_override) {
        return Err(format!(
            "override {} is not the leaf of its chain",
            recipes[pos].identifier
        ));
    }

    let mut merged_input = IndexMap::new();
    let mut merged_steps = Vec::new();
    for recipe in &recipes {
        for (k, v) in &recipe.input {
            merged_input.insert(k.clone(), v.clone());
        }
        if !recipe.is_override {
            merged_steps.extend(recipe.steps.iter().cloned());
        }
    }

    let mut processor_dirs: Vec<PathBuf> = Vec::new();
    for recipe in recipes.iter().rev() {
        let dir = recipe.dir();
        if !processor_dirs.contains(&dir) {
            processor_dirs.push(dir);
        }
    }

    Ok(RecipeChain {
        ordered_identifiers: recipes.iter().map(|r| r.identifier.clone()).collect(),
        ordered_paths: recipes.iter().map(|r| r.path.clone()).collect(),
        merged_input,
        merged_steps,
        trust_findings: Vec::new(),
        processor_dirs,
        shared_processor_dirs: IndexMap::new(),
        recipes,
    })
}

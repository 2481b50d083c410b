//! Override trust: verification, trust-info generation, override files.
//!
//! An override records the content hash of every recipe above it and of
//! every recipe-adjacent processor its chain uses. Verification recomputes
//! those hashes; any difference is reported as a finding.

use super::parser;
use super::types::*;
use crate::processors;
use crate::provenance::{hasher, revision};
use std::path::{Path, PathBuf};

/// Verify the trust info of a chain's leaf override.
///
/// Chains whose leaf is not an override are trusted unconditionally.
pub fn verify_chain(chain: &RecipeChain) -> Vec<TrustFinding> {
    let Some(leaf) = chain.leaf() else {
        return Vec::new();
    };
    if !leaf.is_override {
        return Vec::new();
    }
    let Some(ref info) = leaf.trust_info else {
        return vec![finding(&leaf.identifier, TrustFindingKind::NoTrustInfo)];
    };

    let ancestors = &chain.recipes[..chain.recipes.len() - 1];
    let mut findings = Vec::new();

    for recipe in ancestors {
        match info.parent_recipes.get(&recipe.identifier) {
            None => findings.push(TrustFinding {
                actual_hash: Some(recipe.content_hash.clone()),
                path: Some(recipe.path.clone()),
                ..finding(&recipe.identifier, TrustFindingKind::MissingRecord)
            }),
            Some(record) => {
                if let Some(actual) = mismatch(record, &recipe.content_hash, &recipe.path) {
                    findings.push(TrustFinding {
                        expected_hash: Some(record.content_hash.clone()),
                        actual_hash: Some(actual),
                        revision_hash: record.revision_hash.clone(),
                        path: Some(recipe.path.clone()),
                        ..finding(&recipe.identifier, TrustFindingKind::HashMismatch)
                    });
                }
            }
        }
    }

    for identifier in info.parent_recipes.keys() {
        if !ancestors.iter().any(|r| &r.identifier == identifier) {
            findings.push(finding(identifier, TrustFindingKind::NoLongerInChain));
        }
    }

    for name in external_processor_names(chain) {
        let located = processors::external::locate(&name, chain);
        match (info.non_core_processors.get(&name), located) {
            // Unresolvable and untrusted: the run itself fails closed.
            (None, None) => {}
            (None, Some(path)) => findings.push(TrustFinding {
                actual_hash: hasher::hash_file(&path).ok(),
                path: Some(path),
                ..finding(&name, TrustFindingKind::ProcessorMissingRecord)
            }),
            (Some(_), None) => findings.push(finding(&name, TrustFindingKind::ProcessorNotFound)),
            (Some(record), Some(path)) => match hasher::rehash_like(&record.content_hash, &path) {
                Ok(actual) if actual == record.content_hash => {}
                Ok(actual) => findings.push(TrustFinding {
                    expected_hash: Some(record.content_hash.clone()),
                    actual_hash: Some(actual),
                    revision_hash: record.revision_hash.clone(),
                    path: Some(path),
                    ..finding(&name, TrustFindingKind::ProcessorHashMismatch)
                }),
                Err(e) => {
                    tracing::warn!("cannot hash processor {}: {}", name, e);
                    findings.push(finding(&name, TrustFindingKind::ProcessorNotFound));
                }
            },
        }
    }

    findings
}

fn finding(subject: &str, kind: TrustFindingKind) -> TrustFinding {
    TrustFinding {
        subject: subject.to_string(),
        kind,
        expected_hash: None,
        actual_hash: None,
        revision_hash: None,
        path: None,
    }
}

/// Compare a record against current content. Returns the current digest on mismatch.
fn mismatch(record: &TrustRecord, content_hash: &str, path: &Path) -> Option<String> {
    if record.content_hash == content_hash {
        return None;
    }
    if record.content_hash.starts_with("sha256:") {
        return match hasher::rehash_like(&record.content_hash, path) {
            Ok(actual) if actual == record.content_hash => None,
            Ok(actual) => Some(actual),
            Err(_) => Some(content_hash.to_string()),
        };
    }
    Some(content_hash.to_string())
}

/// Names of non-core processors referenced by the chain's steps, deduplicated.
pub fn external_processor_names(chain: &RecipeChain) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for step in &chain.merged_steps {
        if !processors::is_core(&step.processor) && !names.contains(&step.processor) {
            names.push(step.processor.clone());
        }
    }
    names
}

/// Compute fresh trust info for everything above an override.
///
/// `ancestors` are the recipes the override will sit on, root first.
pub fn build_trust_info(ancestors: &[Recipe], chain: &RecipeChain) -> Result<TrustInfo, String> {
    let mut info = TrustInfo::default();
    for recipe in ancestors {
        info.parent_recipes.insert(
            recipe.identifier.clone(),
            TrustRecord {
                path: Some(recipe.path.display().to_string()),
                content_hash: recipe.content_hash.clone(),
                revision_hash: revision::git_revision(&recipe.path),
            },
        );
    }
    for name in external_processor_names(chain) {
        match processors::external::locate(&name, chain) {
            Some(path) => {
                info.non_core_processors.insert(
                    name,
                    TrustRecord {
                        content_hash: hasher::hash_file(&path)?,
                        revision_hash: revision::git_revision(&path),
                        path: Some(path.display().to_string()),
                    },
                );
            }
            None => tracing::warn!("processor {} not found; not recorded in trust info", name),
        }
    }
    Ok(info)
}

/// Write a new override for the chain's leaf into `override_dir`.
///
/// The override gets identifier `local.<leaf identifier>`, the chain's
/// merged input, and trust info for every recipe in the chain.
pub fn make_override(
    chain: &RecipeChain,
    override_dir: &Path,
    force: bool,
) -> Result<PathBuf, String> {
    let leaf = chain.leaf().ok_or("empty recipe chain")?;
    if leaf.is_override {
        return Err(format!("{} is already an override", leaf.identifier));
    }
    let path = override_dir.join(format!("{}.recipe.yaml", leaf.shortname));
    if path.exists() && !force {
        return Err(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        ));
    }

    let doc = RecipeDocument {
        identifier: format!("local.{}", leaf.identifier),
        description: None,
        minimum_version: None,
        parent_recipe: Some(leaf.identifier.clone()),
        input: chain.merged_input.clone(),
        process: None,
        trust_info: Some(build_trust_info(&chain.recipes, chain)?),
    };
    write_document(&path, &doc)?;
    Ok(path)
}

/// Recompute and store an override's trust info. Returns true if it changed.
pub fn update_trust_info(chain: &RecipeChain) -> Result<bool, String> {
    let leaf = chain.leaf().ok_or("empty recipe chain")?;
    if !leaf.is_override {
        return Err(format!("{} is not an override", leaf.identifier));
    }
    let ancestors = &chain.recipes[..chain.recipes.len() - 1];
    let fresh = build_trust_info(ancestors, chain)?;
    if leaf.trust_info.as_ref() == Some(&fresh) {
        return Ok(false);
    }

    let text = std::fs::read_to_string(&leaf.path)
        .map_err(|e| format!("cannot read {}: {}", leaf.path.display(), e))?;
    let mut doc = parser::parse_recipe_document(&text)?;
    doc.trust_info = Some(fresh);
    write_document(&leaf.path, &doc)?;
    Ok(true)
}

fn write_document(path: &Path, doc: &RecipeDocument) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("cannot create dir {}: {}", parent.display(), e))?;
    }
    let yaml = serde_yaml_ng::to_string(doc).map_err(|e| format!("serialize error: {}", e))?;
    let tmp_path = path.with_extension("yaml.tmp");
    std::fs::write(&tmp_path, &yaml)
        .map_err(|e| format!("cannot write {}: {}", tmp_path.display(), e))?;
    std::fs::rename(&tmp_path, path).map_err(|e| {
        format!(
            "cannot rename {} → {}: {}",
            tmp_path.display(),
            path.display(),
            e
        )
    })
}

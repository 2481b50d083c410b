//! Recipe document loading and structural validation.
//!
//! A recipe file is read once, hashed over its exact bytes, then parsed.
//! Validation checks:
//! - `Identifier` is present and non-empty
//! - overrides name a `ParentRecipe` and carry no `Process`
//! - root recipes have at least one processor step
//! - every step names a processor

use super::types::*;
use crate::provenance::hasher;
use std::cmp::Ordering;
use std::path::Path;

/// File suffixes recognised as recipes.
pub const RECIPE_SUFFIXES: &[&str] = &[".recipe.yaml", ".recipe.yml"];

/// Validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// True if `path` has a recipe file suffix.
pub fn is_recipe_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| RECIPE_SUFFIXES.iter().any(|s| n.ends_with(s) && n.len() > s.len()))
        .unwrap_or(false)
}

/// Derive a recipe's shortname from its file name (`Foo.pkg.recipe.yaml` → `Foo.pkg`).
pub fn shortname_from_path(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    for suffix in RECIPE_SUFFIXES {
        if let Some(stripped) = name.strip_suffix(suffix) {
            return stripped.to_string();
        }
    }
    name
}

/// Parse a recipe document from a YAML string.
pub fn parse_recipe_document(yaml: &str) -> Result<RecipeDocument, String> {
    serde_yaml_ng::from_str(yaml).map_err(|e| format!("YAML parse error: {}", e))
}

/// Load a recipe from disk, hashing the exact bytes read.
///
/// `in_override_dir` marks files found under an override directory; a file
/// carrying trust info and no `Process` is also treated as an override.
pub fn load_recipe(path: &Path, in_override_dir: bool) -> Result<Recipe, String> {
    let bytes =
        std::fs::read(path).map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    let text = std::str::from_utf8(&bytes)
        .map_err(|e| format!("{} is not UTF-8: {}", path.display(), e))?;
    let doc = parse_recipe_document(text).map_err(|e| format!("{}: {}", path.display(), e))?;

    let is_override = in_override_dir || (doc.trust_info.is_some() && doc.process.is_none());
    let errors = validate_document(&doc, is_override);
    if !errors.is_empty() {
        let joined: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        return Err(format!("{}: {}", path.display(), joined.join("; ")));
    }

    Ok(Recipe {
        identifier: doc.identifier,
        shortname: shortname_from_path(path),
        path: path.to_path_buf(),
        description: doc.description,
        parent_identifier: doc.parent_recipe,
        minimum_version: doc.minimum_version,
        input: doc.input,
        steps: doc.process.unwrap_or_default(),
        content_hash: hasher::hash_bytes(&bytes),
        is_override,
        trust_info: doc.trust_info,
    })
}

/// Check that an identifier can name a single cache directory entry.
pub fn check_identifier(identifier: &str) -> Result<(), String> {
    if identifier.trim().is_empty() {
        return Err("Identifier must not be empty".to_string());
    }
    if identifier.chars().any(char::is_whitespace) {
        return Err(format!("Identifier '{}' contains whitespace", identifier));
    }
    if identifier.contains(['/', '\\', '\0']) || identifier == "." || identifier == ".." {
        return Err(format!(
            "Identifier '{}' is not a plain name",
            identifier.escape_debug()
        ));
    }
    Ok(())
}

/// Validate a parsed document. Returns a list of errors (empty = valid).
pub fn validate_document(doc: &RecipeDocument, is_override: bool) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if let Err(message) = check_identifier(&doc.identifier) {
        errors.push(ValidationError { message });
    }

    if let Some(ref parent) = doc.parent_recipe {
        if parent.trim().is_empty() {
            errors.push(ValidationError {
                message: "ParentRecipe must not be empty".to_string(),
            });
        } else if *parent == doc.identifier {
            errors.push(ValidationError {
                message: format!("recipe '{}' names itself as parent", doc.identifier),
            });
        }
    }

    if is_override {
        if doc.process.is_some() {
            errors.push(ValidationError {
                message: format!("override '{}' must not declare Process", doc.identifier),
            });
        }
        if doc.parent_recipe.is_none() {
            errors.push(ValidationError {
                message: format!("override '{}' has no ParentRecipe", doc.identifier),
            });
        }
    } else {
        let steps = doc.process.as_deref().unwrap_or_default();
        if doc.parent_recipe.is_none() && steps.is_empty() {
            errors.push(ValidationError {
                message: format!("root recipe '{}' has no processor steps", doc.identifier),
            });
        }
        for (i, step) in steps.iter().enumerate() {
            if step.processor.trim().is_empty() {
                errors.push(ValidationError {
                    message: format!("step {} of '{}' names no processor", i, doc.identifier),
                });
            }
        }
    }

    errors
}

/// Compare dotted version strings loosely.
///
/// Components are compared numerically when both are numbers, otherwise as
/// text; missing trailing components count as zero (`1.0 == 1`).
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let pa: Vec<&str> = a.trim().split(['.', '-']).collect();
    let pb: Vec<&str> = b.trim().split(['.', '-']).collect();
    let len = pa.len().max(pb.len());
    for i in 0..len {
        let ca = pa.get(i).copied().unwrap_or("0");
        let cb = pb.get(i).copied().unwrap_or("0");
        let ord = match (ca.parse::<u64>(), cb.parse::<u64>()) {
            (Ok(na), Ok(nb)) => na.cmp(&nb),
            _ => ca.cmp(cb),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// True if `running` is at least `minimum`.
pub fn version_satisfies(minimum: &str, running: &str) -> bool {
    compare_versions(running, minimum) != Ordering::Less
}

//! Filesystem processors: create, copy and delete paths.

use super::{optional_str, parse_mode, require_str, Processor, ProcessorFailure, VariableSpec};
use crate::core::types::{Environment, Value};
use crate::daemon::fsops;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Writes a file with the given content.
#[derive(Debug, Default)]
pub struct FileCreator;

const CREATOR_INPUTS: &[VariableSpec] = &[
    VariableSpec::required("file_path", "Path of the file to write."),
    VariableSpec::with_default("file_content", "", "Contents to write."),
    VariableSpec::optional("file_mode", "Octal permission bits, e.g. 0644."),
];

impl Processor for FileCreator {
    fn name(&self) -> &str {
        "FileCreator"
    }

    fn description(&self) -> &str {
        "Create a file with the given content."
    }

    fn input_variables(&self) -> &[VariableSpec] {
        CREATOR_INPUTS
    }

    fn output_variables(&self) -> &[VariableSpec] {
        &[]
    }

    fn run(&self, env: &mut Environment) -> Result<(), ProcessorFailure> {
        let path = PathBuf::from(require_str(env, "file_path")?);
        let content = optional_str(env, "file_content").unwrap_or_default();
        fs::write(&path, content)
            .map_err(|e| format!("cannot write {}: {}", path.display(), e))?;
        if let Some(mode) = optional_str(env, "file_mode") {
            let mode = parse_mode(&mode)?;
            fs::set_permissions(&path, fs::Permissions::from_mode(mode))
                .map_err(|e| format!("cannot chmod {}: {}", path.display(), e))?;
        }
        tracing::info!("created {}", path.display());
        Ok(())
    }
}

/// Copies a file or directory, optionally replacing the destination.
#[derive(Debug, Default)]
pub struct Copier;

const COPIER_INPUTS: &[VariableSpec] = &[
    VariableSpec::required(
        "source_path",
        "Path to copy. May be a glob; the first match is used.",
    ),
    VariableSpec::required("destination_path", "Where to copy it."),
    VariableSpec::with_default("overwrite", "false", "Replace an existing destination."),
];

/// Expand a glob pattern to its first match, or the pattern itself if it
/// contains no wildcards.
pub(crate) fn first_match(pattern: &str) -> Result<PathBuf, String> {
    if !pattern.contains(['*', '?', '[']) {
        return Ok(PathBuf::from(pattern));
    }
    let mut matches: Vec<PathBuf> = glob::glob(pattern)
        .map_err(|e| format!("invalid pattern '{}': {}", pattern, e))?
        .filter_map(Result::ok)
        .collect();
    matches.sort();
    matches
        .into_iter()
        .next()
        .ok_or_else(|| format!("nothing matches {}", pattern))
}

fn remove_path(path: &Path) -> Result<(), String> {
    let meta =
        fs::symlink_metadata(path).map_err(|e| format!("cannot stat {}: {}", path.display(), e))?;
    let result = if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    result.map_err(|e| format!("cannot remove {}: {}", path.display(), e))
}

impl Processor for Copier {
    fn name(&self) -> &str {
        "Copier"
    }

    fn description(&self) -> &str {
        "Copy a file or directory to a new location."
    }

    fn input_variables(&self) -> &[VariableSpec] {
        COPIER_INPUTS
    }

    fn output_variables(&self) -> &[VariableSpec] {
        &[]
    }

    fn run(&self, env: &mut Environment) -> Result<(), ProcessorFailure> {
        let source = first_match(&require_str(env, "source_path")?)?;
        let dest = PathBuf::from(require_str(env, "destination_path")?);
        if !source.exists() {
            return Err(ProcessorFailure::new(format!(
                "{} does not exist",
                source.display()
            )));
        }
        if fs::symlink_metadata(&dest).is_ok() {
            if !env.is_truthy("overwrite") {
                return Err(ProcessorFailure::new(format!(
                    "{} already exists and overwrite is false",
                    dest.display()
                )));
            }
            remove_path(&dest)?;
        }
        fsops::copy_tree(&source, &dest, None)?;
        tracing::info!("copied {} to {}", source.display(), dest.display());
        Ok(())
    }
}

/// Deletes files and directories.
#[derive(Debug, Default)]
pub struct PathDeleter;

const DELETER_INPUTS: &[VariableSpec] = &[VariableSpec::required(
    "path_list",
    "Paths to delete; a list or a single path.",
)];

impl Processor for PathDeleter {
    fn name(&self) -> &str {
        "PathDeleter"
    }

    fn description(&self) -> &str {
        "Delete files and directories."
    }

    fn input_variables(&self) -> &[VariableSpec] {
        DELETER_INPUTS
    }

    fn output_variables(&self) -> &[VariableSpec] {
        &[]
    }

    fn run(&self, env: &mut Environment) -> Result<(), ProcessorFailure> {
        let paths: Vec<String> = match env.get("path_list") {
            Some(Value::List(items)) => items
                .iter()
                .map(|v| {
                    v.scalar_string().ok_or_else(|| {
                        ProcessorFailure::new(format!(
                            "path_list entries must be strings, got {}",
                            v.type_name()
                        ))
                    })
                })
                .collect::<Result<_, _>>()?,
            _ => vec![require_str(env, "path_list")?],
        };
        for path in paths {
            remove_path(Path::new(&path))?;
            tracing::info!("deleted {}", path);
        }
        Ok(())
    }
}

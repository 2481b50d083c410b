//! User preferences: search paths, cache location, service sockets.
//!
//! Every key, including ones this crate does not interpret, is injected into
//! the run environment at the lowest precedence.

use super::types::Value;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const PREFS_FILE: &str = "config.yaml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Preferences {
    #[serde(rename = "RECIPE_SEARCH_DIRS", default, skip_serializing_if = "Vec::is_empty")]
    pub recipe_search_dirs: Vec<PathBuf>,

    #[serde(rename = "RECIPE_OVERRIDE_DIRS", default, skip_serializing_if = "Vec::is_empty")]
    pub recipe_override_dirs: Vec<PathBuf>,

    #[serde(rename = "CACHE_DIR", default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,

    #[serde(rename = "STRICT_TRUST", default)]
    pub strict_trust: bool,

    #[serde(rename = "PACKAGER_SOCKET", default, skip_serializing_if = "Option::is_none")]
    pub packager_socket: Option<String>,

    #[serde(rename = "INSTALLER_SOCKET", default, skip_serializing_if = "Option::is_none")]
    pub installer_socket: Option<String>,

    /// Keys passed through to processors untouched.
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

/// `<config dir>/pkgsmith/config.yaml`.
pub fn default_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pkgsmith")
        .join(PREFS_FILE)
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pkgsmith")
}

impl Preferences {
    /// Load preferences. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, String> {
        if !path.exists() {
            tracing::debug!("no preferences at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml_ng::from_str(&content)
            .map_err(|e| format!("invalid preferences {}: {}", path.display(), e))
    }

    pub fn search_dirs(&self) -> Vec<PathBuf> {
        if self.recipe_search_dirs.is_empty() {
            vec![PathBuf::from("."), data_dir().join("Recipes")]
        } else {
            self.recipe_search_dirs.clone()
        }
    }

    pub fn override_dirs(&self) -> Vec<PathBuf> {
        if self.recipe_override_dirs.is_empty() {
            vec![data_dir().join("RecipeOverrides")]
        } else {
            self.recipe_override_dirs.clone()
        }
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from(".cache"))
                .join("pkgsmith")
        })
    }

    /// All preference keys as environment values.
    pub fn to_env(&self) -> IndexMap<String, Value> {
        let paths = |dirs: Vec<PathBuf>| {
            Value::List(
                dirs.iter()
                    .map(|d| Value::String(d.display().to_string()))
                    .collect(),
            )
        };
        let mut env = IndexMap::new();
        env.insert("RECIPE_SEARCH_DIRS".to_string(), paths(self.search_dirs()));
        env.insert(
            "RECIPE_OVERRIDE_DIRS".to_string(),
            paths(self.override_dirs()),
        );
        env.insert(
            "CACHE_DIR".to_string(),
            Value::String(self.cache_dir().display().to_string()),
        );
        env.insert("STRICT_TRUST".to_string(), Value::Bool(self.strict_trust));
        if let Some(ref s) = self.packager_socket {
            env.insert("PACKAGER_SOCKET".to_string(), Value::from(s.as_str()));
        }
        if let Some(ref s) = self.installer_socket {
            env.insert("INSTALLER_SOCKET".to_string(), Value::from(s.as_str()));
        }
        for (k, v) in &self.extra {
            env.insert(k.clone(), v.clone());
        }
        env
    }
}

/// Starting preferences written by `pkgsmith init`.
pub fn template() -> String {
    let data = data_dir();
    format!(
        "# pkgsmith preferences\n\
         RECIPE_SEARCH_DIRS:\n  - .\n  - {recipes}\n\
         RECIPE_OVERRIDE_DIRS:\n  - {overrides}\n\
         # CACHE_DIR: /path/to/cache\n\
         STRICT_TRUST: false\n\
         # PACKAGER_SOCKET: /var/run/pkgsmith/packager.sock\n\
         # INSTALLER_SOCKET: /var/run/pkgsmith/installer.sock\n",
        recipes = data.join("Recipes").display(),
        overrides = data.join("RecipeOverrides").display(),
    )
}

/// Write the template. Refuses to replace an existing file.
pub fn write_template(path: &Path) -> Result<(), String> {
    if path.exists() {
        return Err(format!("{} already exists", path.display()));
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("cannot create {}: {}", parent.display(), e))?;
    }
    std::fs::write(path, template()).map_err(|e| format!("cannot write {}: {}", path.display(), e))
}

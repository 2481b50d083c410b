//! Recipe name/identifier → path index, cached as JSON between runs.

use super::parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// File name of the persisted index inside the cache directory.
pub const INDEX_FILE: &str = "recipe_index.json";

/// One discovered recipe file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub path: PathBuf,
    pub identifier: String,
    pub shortname: String,
    pub is_override: bool,
}

/// Which entries a lookup may return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupScope {
    /// Overrides win over recipes with the same name.
    PreferOverrides,
    /// Overrides are invisible (parent lookups, `skip_overrides`).
    RecipesOnly,
}

/// Source of recipe locations for the resolver.
pub trait RecipeIndex {
    /// All known entries, in discovery order.
    fn entries(&self) -> &[IndexEntry];

    /// Rediscover recipes on disk.
    fn rebuild(&mut self) -> Result<(), String>;

    /// Find an entry by shortname or identifier.
    fn lookup(&self, name: &str, scope: LookupScope) -> Option<IndexEntry> {
        let matches = |e: &&IndexEntry| e.shortname == name || e.identifier == name;
        if scope == LookupScope::PreferOverrides {
            if let Some(e) = self.entries().iter().filter(|e| e.is_override).find(matches) {
                return Some(e.clone());
            }
        }
        self.entries()
            .iter()
            .filter(|e| !e.is_override)
            .find(matches)
            .cloned()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexFile {
    generator: String,
    entries: Vec<IndexEntry>,
}

/// Index backed by `<cache_dir>/recipe_index.json`.
#[derive(Debug)]
pub struct FileRecipeIndex {
    cache_path: PathBuf,
    search_dirs: Vec<PathBuf>,
    override_dirs: Vec<PathBuf>,
    entries: Vec<IndexEntry>,
}

impl FileRecipeIndex {
    /// Open the index, loading the cached file when present.
    ///
    /// An unreadable or corrupt cache is treated as empty; the first lookup
    /// miss rebuilds it.
    pub fn open(cache_dir: &Path, search_dirs: &[PathBuf], override_dirs: &[PathBuf]) -> Self {
        let cache_path = cache_dir.join(INDEX_FILE);
        let entries = match load_index(&cache_path) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!("ignoring recipe index: {}", e);
                Vec::new()
            }
        };
        Self {
            cache_path,
            search_dirs: search_dirs.to_vec(),
            override_dirs: override_dirs.to_vec(),
            entries,
        }
    }

    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    pub fn override_dirs(&self) -> &[PathBuf] {
        &self.override_dirs
    }

    /// True if `path` lies under one of the override directories.
    pub fn in_override_dir(&self, path: &Path) -> bool {
        self.override_dirs.iter().any(|d| path.starts_with(d))
    }
}

impl RecipeIndex for FileRecipeIndex {
    fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    fn rebuild(&mut self) -> Result<(), String> {
        let mut entries = Vec::new();
        for dir in &self.override_dirs {
            entries.extend(discover(dir, true));
        }
        for dir in &self.search_dirs {
            entries.extend(discover(dir, false));
        }
        tracing::debug!(
            "rebuilt recipe index: {} entries → {}",
            entries.len(),
            self.cache_path.display()
        );
        self.entries = entries;
        save_index(&self.cache_path, &self.entries)
    }
}

/// Find recipe files under `dir`, recursively, sorted by path.
fn discover(dir: &Path, override_dir: bool) -> Vec<IndexEntry> {
    let mut paths = Vec::new();
    for suffix in parser::RECIPE_SUFFIXES {
        let pattern = format!("{}/**/*{}", glob::Pattern::escape(&dir.to_string_lossy()), suffix);
        match glob::glob(&pattern) {
            Ok(found) => paths.extend(found.filter_map(Result::ok)),
            Err(e) => tracing::warn!("bad recipe search pattern {}: {}", pattern, e),
        }
    }
    paths.sort();
    paths.dedup();

    let mut entries = Vec::new();
    for path in paths {
        let text = match std::fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!("skipping {}: {}", path.display(), e);
                continue;
            }
        };
        let doc = match parser::parse_recipe_document(&text) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!("skipping {}: {}", path.display(), e);
                continue;
            }
        };
        let is_override = override_dir || (doc.trust_info.is_some() && doc.process.is_none());
        entries.push(IndexEntry {
            shortname: parser::shortname_from_path(&path),
            identifier: doc.identifier,
            is_override,
            path,
        });
    }
    entries
}

fn load_index(path: &Path) -> Result<Vec<IndexEntry>, String> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    let file: IndexFile = serde_json::from_str(&content)
        .map_err(|e| format!("invalid index file {}: {}", path.display(), e))?;
    Ok(file.entries)
}

/// Save the index atomically (write to temp, then rename).
fn save_index(path: &Path, entries: &[IndexEntry]) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("cannot create dir {}: {}", parent.display(), e))?;
    }
    let file = IndexFile {
        generator: format!("pkgsmith {}", env!("CARGO_PKG_VERSION")),
        entries: entries.to_vec(),
    };
    let json =
        serde_json::to_string_pretty(&file).map_err(|e| format!("serialize error: {}", e))?;

    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &json)
        .map_err(|e| format!("cannot write {}: {}", tmp_path.display(), e))?;
    std::fs::rename(&tmp_path, path).map_err(|e| {
        format!(
            "cannot rename {} → {}: {}",
            tmp_path.display(),
            path.display(),
            e
        )
    })?;
    Ok(())
}

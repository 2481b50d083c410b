//! Filesystem primitives for the privileged services.
//!
//! Paths supplied by clients are walked one component at a time and never
//! through a symlink. Ownership changes use `lchown`, so a symlink inside a
//! copied tree cannot redirect a chown to a file outside it.

use std::fs;
use std::os::unix::fs::{lchown, MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

/// User or group given by name or numeric id.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(untagged)]
pub enum Principal {
    Id(u32),
    Name(String),
}

impl std::fmt::Display for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{}", id),
            Self::Name(name) => write!(f, "{}", name),
        }
    }
}

/// Resolve a user to a uid. Numeric strings are taken as ids.
pub fn resolve_user(user: &Principal) -> Result<u32, String> {
    match user {
        Principal::Id(id) => Ok(*id),
        Principal::Name(name) => {
            if let Ok(id) = name.parse::<u32>() {
                return Ok(id);
            }
            match nix::unistd::User::from_name(name) {
                Ok(Some(u)) => Ok(u.uid.as_raw()),
                Ok(None) => Err(format!("unknown user '{}'", name)),
                Err(e) => Err(format!("cannot look up user '{}': {}", name, e)),
            }
        }
    }
}

/// Resolve a group to a gid. Numeric strings are taken as ids.
pub fn resolve_group(group: &Principal) -> Result<u32, String> {
    match group {
        Principal::Id(id) => Ok(*id),
        Principal::Name(name) => {
            if let Ok(id) = name.parse::<u32>() {
                return Ok(id);
            }
            match nix::unistd::Group::from_name(name) {
                Ok(Some(g)) => Ok(g.gid.as_raw()),
                Ok(None) => Err(format!("unknown group '{}'", name)),
                Err(e) => Err(format!("cannot look up group '{}': {}", name, e)),
            }
        }
    }
}

/// Check that `rel` is a plain relative path: no root, `.` or `..` components.
pub fn check_relative(rel: &str) -> Result<(), String> {
    if rel.is_empty() {
        return Err("empty path".to_string());
    }
    let path = Path::new(rel);
    for component in path.components() {
        match component {
            Component::Normal(_) => {}
            Component::CurDir | Component::ParentDir => {
                return Err(format!("path '{}' must not contain '.' or '..'", rel))
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(format!("path '{}' must be relative", rel))
            }
        }
    }
    // `components()` normalises away interior `.`; check the raw text too.
    if rel.split('/').any(|c| c == "." || c == "..") {
        return Err(format!("path '{}' must not contain '.' or '..'", rel));
    }
    Ok(())
}

/// Resolve `rel` under `root` one component at a time.
///
/// Every component must exist and none may be a symlink.
pub fn resolve_under(root: &Path, rel: &str) -> Result<PathBuf, String> {
    check_relative(rel)?;
    let mut current = root.to_path_buf();
    for part in rel.split('/').filter(|p| !p.is_empty()) {
        current.push(part);
        let meta = fs::symlink_metadata(&current)
            .map_err(|e| format!("{}: {}", current.display(), e))?;
        if meta.file_type().is_symlink() {
            return Err(format!("{} is a symlink", current.display()));
        }
    }
    Ok(current)
}

/// Reject entries a privileged copy must not read.
///
/// Only files, directories and symlinks are copied. With `owner` set, a
/// regular file with more than one link must belong to `owner`: a hard link
/// is how an unprivileged tree would reach a file its owner cannot read.
fn check_entry(path: &Path, meta: &fs::Metadata, owner: Option<u32>) -> Result<(), String> {
    let ft = meta.file_type();
    if ft.is_symlink() || ft.is_dir() {
        return Ok(());
    }
    if !ft.is_file() {
        return Err(format!("{} is not a file, directory or symlink", path.display()));
    }
    match owner {
        Some(uid) if meta.nlink() > 1 && meta.uid() != uid => Err(format!(
            "{} is a hard link to a file not owned by uid {}",
            path.display(),
            uid
        )),
        _ => Ok(()),
    }
}

/// Check a whole tree with the rules `copy_tree` applies, without copying.
pub fn check_copyable(src: &Path, owner: Option<u32>) -> Result<(), String> {
    walk(src, &mut |p, meta| check_entry(p, meta, owner))
}

/// Copy a file or directory tree, preserving permission bits and symlinks.
///
/// `owner` is the uid the source tree belongs to; see `check_entry`.
pub fn copy_tree(src: &Path, dst: &Path, owner: Option<u32>) -> Result<(), String> {
    let meta =
        fs::symlink_metadata(src).map_err(|e| format!("cannot stat {}: {}", src.display(), e))?;
    check_entry(src, &meta, owner)?;
    let ft = meta.file_type();
    if ft.is_symlink() {
        let target = fs::read_link(src)
            .map_err(|e| format!("cannot read link {}: {}", src.display(), e))?;
        std::os::unix::fs::symlink(&target, dst)
            .map_err(|e| format!("cannot create link {}: {}", dst.display(), e))?;
    } else if ft.is_dir() {
        fs::create_dir(dst).map_err(|e| format!("cannot create {}: {}", dst.display(), e))?;
        let mut entries: Vec<_> = fs::read_dir(src)
            .map_err(|e| format!("cannot read {}: {}", src.display(), e))?
            .filter_map(Result::ok)
            .collect();
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            copy_tree(&entry.path(), &dst.join(entry.file_name()), owner)?;
        }
        fs::set_permissions(dst, fs::Permissions::from_mode(meta.mode() & 0o7777))
            .map_err(|e| format!("cannot chmod {}: {}", dst.display(), e))?;
    } else {
        fs::copy(src, dst).map_err(|e| {
            format!("cannot copy {} → {}: {}", src.display(), dst.display(), e)
        })?;
    }
    Ok(())
}

/// `lchown` every entry of a tree, including the root.
pub fn chown_tree(path: &Path, uid: u32, gid: u32) -> Result<(), String> {
    walk(path, &mut |p, meta| {
        if meta.uid() == uid && meta.gid() == gid {
            return Ok(());
        }
        lchown(p, Some(uid), Some(gid)).map_err(|e| format!("cannot chown {}: {}", p.display(), e))
    })
}

/// Set permission bits on every non-symlink entry of a tree.
pub fn chmod_tree(path: &Path, mode: u32) -> Result<(), String> {
    walk(path, &mut |p, meta| {
        if meta.file_type().is_symlink() {
            return Ok(());
        }
        fs::set_permissions(p, fs::Permissions::from_mode(mode))
            .map_err(|e| format!("cannot chmod {}: {}", p.display(), e))
    })
}

fn walk(
    path: &Path,
    visit: &mut dyn FnMut(&Path, &fs::Metadata) -> Result<(), String>,
) -> Result<(), String> {
    let meta =
        fs::symlink_metadata(path).map_err(|e| format!("cannot stat {}: {}", path.display(), e))?;
    if meta.is_dir() {
        for entry in
            fs::read_dir(path).map_err(|e| format!("cannot read {}: {}", path.display(), e))?
        {
            let entry = entry.map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
            walk(&entry.path(), visit)?;
        }
    }
    visit(path, &meta)
}

/// Owner uid/gid of a path, without following a final symlink.
pub fn owner_of(path: &Path) -> Result<(u32, u32), String> {
    let meta =
        fs::symlink_metadata(path).map_err(|e| format!("cannot stat {}: {}", path.display(), e))?;
    Ok((meta.uid(), meta.gid()))
}

/// Closest ancestor of `path` (or `path` itself) that exists.
pub fn nearest_existing(path: &Path) -> Option<PathBuf> {
    path.ancestors()
        .find(|p| fs::symlink_metadata(p).is_ok())
        .map(Path::to_path_buf)
}

/// Create missing directories of `path`, each inheriting owner and mode
/// from the nearest existing ancestor.
///
/// Returns the directories created, outermost first. On failure the ones
/// already created are removed again.
pub fn create_dirs_inheriting(path: &Path) -> Result<Vec<PathBuf>, String> {
    let mut created = Vec::new();
    if path.is_dir() {
        return Ok(created);
    }
    let anchor = nearest_existing(path)
        .ok_or_else(|| format!("no existing ancestor of {}", path.display()))?;
    let meta =
        fs::metadata(&anchor).map_err(|e| format!("cannot stat {}: {}", anchor.display(), e))?;
    if !meta.is_dir() {
        return Err(format!("{} is not a directory", anchor.display()));
    }
    let rest = path
        .strip_prefix(&anchor)
        .map_err(|e| format!("{}: {}", path.display(), e))?;
    let mut current = anchor.clone();
    for component in rest.components() {
        current.push(component);
        if let Err(e) = fs::create_dir(&current) {
            remove_created_dirs(&created);
            return Err(format!("cannot create {}: {}", current.display(), e));
        }
        created.push(current.clone());
        tracing::debug!(
            "created {} (uid {}, gid {}, mode {:o})",
            current.display(),
            meta.uid(),
            meta.gid(),
            meta.mode() & 0o7777
        );
        let applied = lchown(&current, Some(meta.uid()), Some(meta.gid()))
            .map_err(|e| format!("cannot chown {}: {}", current.display(), e))
            .and_then(|_| {
                fs::set_permissions(&current, fs::Permissions::from_mode(meta.mode() & 0o7777))
                    .map_err(|e| format!("cannot chmod {}: {}", current.display(), e))
            });
        if let Err(e) = applied {
            remove_created_dirs(&created);
            return Err(e);
        }
    }
    Ok(created)
}

/// Remove directories returned by `create_dirs_inheriting`, innermost first.
/// Directories that are no longer empty are left alone.
pub fn remove_created_dirs(created: &[PathBuf]) {
    for dir in created.iter().rev() {
        if let Err(e) = fs::remove_dir(dir) {
            tracing::warn!("cannot remove {}: {}", dir.display(), e);
        }
    }
}

/// Current process uid/gid.
pub fn current_ids() -> (u32, u32) {
    (
        nix::unistd::getuid().as_raw(),
        nix::unistd::getgid().as_raw(),
    )
}

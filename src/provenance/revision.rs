//! Best-effort version-control revision lookup for trusted files.

use crate::transport::local::{exec, Invocation};
use std::path::Path;

/// Return the last git commit that touched `path`, if any.
///
/// Any failure (no git, not a repository, untracked file) yields `None`.
pub fn git_revision(path: &Path) -> Option<String> {
    let dir = path.parent()?;
    let name = path.file_name()?.to_str()?;
    let out = exec(
        &Invocation::new("git")
            .arg("log")
            .arg("-n")
            .arg("1")
            .arg("--format=%H")
            .arg("--")
            .arg(name)
            .cwd(dir),
    )
    .ok()?;
    if !out.success() {
        return None;
    }
    let rev = out.stdout.trim();
    if rev.len() == 40 && rev.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(rev.to_string())
    } else {
        None
    }
}

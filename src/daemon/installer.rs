//! Item installation service: copies items off a mounted image into place.

use super::auth::PeerCredentials;
use super::fsops;
use super::protocol::Responder;
use super::validate::{self, ItemCopyRequest, ValidCopyItem};
use super::{DaemonError, RequestHandler};
use std::fs;
use std::path::PathBuf;

/// The item copy service. Stateless; each request is validated in full
/// before the first item is touched.
#[derive(Debug, Default, Clone, Copy)]
pub struct Installer;

/// An item copied into a temporary directory beside its destination,
/// waiting to be renamed into place.
struct Staged<'a> {
    item: &'a ValidCopyItem,
    staging: tempfile::TempDir,
    /// Destination directories this request created, outermost first.
    created: Vec<PathBuf>,
    /// Whether an existing item was moved aside on commit.
    replaced: bool,
}

impl Staged<'_> {
    fn staged(&self) -> PathBuf {
        self.staging.path().join("new")
    }

    fn displaced(&self) -> PathBuf {
        self.staging.path().join("old")
    }

    /// Rename the staged copy into place, moving any existing item aside.
    fn commit(&mut self) -> Result<(), String> {
        let target = self.item.target();
        let replacing = fs::symlink_metadata(&target).is_ok();
        if replacing {
            fs::rename(&target, self.displaced())
                .map_err(|e| format!("cannot move aside {}: {}", target.display(), e))?;
        }
        if let Err(e) = fs::rename(self.staged(), &target) {
            if replacing {
                if let Err(restore) = fs::rename(self.displaced(), &target) {
                    tracing::error!("cannot restore {}: {}", target.display(), restore);
                }
            }
            return Err(format!("cannot rename into {}: {}", target.display(), e));
        }
        self.replaced = replacing;
        Ok(())
    }

    /// Undo a successful `commit`.
    fn revert(&self) {
        let target = self.item.target();
        if let Err(e) = fs::rename(&target, self.staged()) {
            tracing::error!("cannot move back {}: {}", target.display(), e);
            return;
        }
        if self.replaced {
            if let Err(e) = fs::rename(self.displaced(), &target) {
                tracing::error!("cannot restore {}: {}", target.display(), e);
            }
        }
    }

    /// Remove the staging directory, and with `discard` the directories
    /// created for this item.
    fn finish(self, discard: bool) {
        let path = self.staging.path().to_path_buf();
        if let Err(e) = self.staging.close() {
            tracing::warn!("cannot remove {}: {}", path.display(), e);
        }
        if discard {
            fsops::remove_created_dirs(&self.created);
        }
    }
}

/// Copy one item into a staging directory beside its destination.
fn stage_item(item: &ValidCopyItem) -> Result<Staged<'_>, String> {
    let created = fsops::create_dirs_inheriting(&item.destination_dir)?;
    let staging = match tempfile::Builder::new()
        .prefix(".pkgsmith-copy-")
        .tempdir_in(&item.destination_dir)
    {
        Ok(staging) => staging,
        Err(e) => {
            fsops::remove_created_dirs(&created);
            return Err(format!("cannot stage in {}: {}", item.destination_dir.display(), e));
        }
    };
    let staged = Staged {
        item,
        staging,
        created,
        replaced: false,
    };
    let copied = fsops::copy_tree(&item.source, &staged.staged(), Some(item.source_owner))
        .and_then(|_| fsops::chown_tree(&staged.staged(), item.uid, item.gid))
        .and_then(|_| match item.mode {
            Some(mode) => fsops::chmod_tree(&staged.staged(), mode),
            None => Ok(()),
        });
    match copied {
        Ok(()) => Ok(staged),
        Err(e) => {
            staged.finish(true);
            Err(e)
        }
    }
}

/// Drop stagings newest first so nested created directories empty out
/// before their parents.
fn discard(staged: Vec<Staged<'_>>) {
    for s in staged.into_iter().rev() {
        s.finish(true);
    }
}

/// Stage every item. Nothing is left behind if any item fails.
fn stage_all<'a>(
    items: &'a [ValidCopyItem],
    on_item: &mut dyn FnMut(&ValidCopyItem),
) -> Result<Vec<Staged<'a>>, String> {
    let mut staged = Vec::with_capacity(items.len());
    for item in items {
        on_item(item);
        match stage_item(item) {
            Ok(s) => staged.push(s),
            Err(e) => {
                discard(staged);
                return Err(e);
            }
        }
    }
    Ok(staged)
}

/// Rename every staged item into place, or none of them.
fn commit_all(mut staged: Vec<Staged<'_>>) -> Result<(), String> {
    for n in 0..staged.len() {
        if let Err(e) = staged[n].commit() {
            for done in staged[..n].iter().rev() {
                done.revert();
            }
            discard(staged);
            return Err(e);
        }
    }
    for s in staged {
        s.finish(false);
    }
    Ok(())
}

/// Install all items of a validated request.
///
/// Every item is copied to a sibling temporary directory first, so the
/// final step is a rename on the same filesystem. Renames start only once
/// all copies succeeded; if one fails, the items already renamed are moved
/// back out, replaced items restored, and created directories removed.
pub fn install_items(
    items: &[ValidCopyItem],
    on_item: &mut dyn FnMut(&ValidCopyItem),
) -> Result<(), String> {
    let staged = stage_all(items, on_item)?;
    commit_all(staged)
}

impl RequestHandler for Installer {
    fn service(&self) -> &str {
        "installer"
    }

    fn handle(
        &self,
        request: &ciborium::Value,
        peer: &PeerCredentials,
        out: &mut Responder,
    ) -> Result<String, DaemonError> {
        let req: ItemCopyRequest = request
            .deserialized()
            .map_err(|e| DaemonError::Validation(format!("malformed item copy request: {}", e)))?;
        let items = validate::validate_item_copy(&req, peer)?;

        install_items(&items, &mut |item| {
            out.status(&format!(
                "Copying {} to {}",
                item.source.display(),
                item.target().display()
            ))
        })
        .map_err(DaemonError::Privileged)?;

        let installed: Vec<String> = items
            .iter()
            .map(|item| item.target().display().to_string())
            .collect();
        serde_json::to_string(&installed)
            .map_err(|e| DaemonError::Protocol(format!("serialize error: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::fsops::current_ids;
    use crate::daemon::validate::CopyItem;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn me() -> PeerCredentials {
        let (uid, gid) = current_ids();
        PeerCredentials { uid, gid, pid: None }
    }

    fn mount(tmp: &Path) -> PathBuf {
        let mount = tmp.join("Volumes/Foo");
        fs::create_dir_all(mount.join("Foo.app/Contents")).unwrap();
        fs::write(mount.join("Foo.app/Contents/binary"), "v2").unwrap();
        fs::write(mount.join("tool"), "#!/bin/sh\n").unwrap();
        mount
    }

    fn item(source: &str, dest: &Path) -> CopyItem {
        CopyItem {
            source_item: source.to_string(),
            destination_path: dest.display().to_string(),
            destination_item: None,
            user: None,
            group: None,
            mode: None,
        }
    }

    fn send(req: &ItemCopyRequest, peer: &PeerCredentials) -> Result<String, DaemonError> {
        let value = ciborium::Value::serialized(req).unwrap();
        let mut buf = Vec::new();
        let mut out = Responder::new(&mut buf);
        Installer.handle(&value, peer, &mut out)
    }

    #[test]
    fn test_copy_into_missing_destination() {
        let tmp = tempfile::tempdir().unwrap();
        let mount = mount(tmp.path());
        let apps = tmp.path().join("root/Applications");
        let req = ItemCopyRequest {
            mount_point: mount.display().to_string(),
            items_to_copy: vec![item("Foo.app", &apps)],
        };
        let payload = send(&req, &me()).unwrap();
        let installed: Vec<String> = serde_json::from_str(&payload).unwrap();
        assert_eq!(installed, vec![apps.join("Foo.app").display().to_string()]);
        assert_eq!(
            fs::read_to_string(apps.join("Foo.app/Contents/binary")).unwrap(),
            "v2"
        );
        // Only the item itself; staging directory removed.
        assert_eq!(fs::read_dir(&apps).unwrap().count(), 1);
    }

    #[test]
    fn test_replace_existing_item_with_mode_and_rename() {
        let tmp = tempfile::tempdir().unwrap();
        let mount = mount(tmp.path());
        let bin = tmp.path().join("usr/local/bin");
        fs::create_dir_all(&bin).unwrap();
        fs::write(bin.join("footool"), "old").unwrap();

        let mut copy = item("tool", &bin);
        copy.destination_item = Some("footool".to_string());
        copy.mode = Some("0755".to_string());
        let req = ItemCopyRequest {
            mount_point: mount.display().to_string(),
            items_to_copy: vec![copy],
        };
        send(&req, &me()).unwrap();
        let target = bin.join("footool");
        assert_eq!(fs::read_to_string(&target).unwrap(), "#!/bin/sh\n");
        let mode = fs::metadata(&target).unwrap().permissions().mode();
        assert_eq!(mode & 0o7777, 0o755);
        assert_eq!(fs::read_dir(&bin).unwrap().count(), 1);
    }

    #[test]
    fn test_foreign_mount_point_changes_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let mount = mount(tmp.path());
        let apps = tmp.path().join("Applications");
        let stranger = PeerCredentials {
            uid: me().uid.wrapping_add(1),
            ..me()
        };
        let req = ItemCopyRequest {
            mount_point: mount.display().to_string(),
            items_to_copy: vec![item("Foo.app", &apps)],
        };
        assert!(matches!(send(&req, &stranger), Err(DaemonError::Validation(_))));
        assert!(!apps.exists());
    }

    #[test]
    fn test_second_item_invalid_copies_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let mount = mount(tmp.path());
        let apps = tmp.path().join("Applications");
        let req = ItemCopyRequest {
            mount_point: mount.display().to_string(),
            items_to_copy: vec![item("Foo.app", &apps), item("../escape", &apps)],
        };
        assert!(send(&req, &me()).is_err());
        assert!(!apps.exists());
    }

    #[test]
    fn test_special_file_item_rejected_before_copying() {
        let tmp = tempfile::tempdir().unwrap();
        let mount = mount(tmp.path());
        nix::unistd::mkfifo(
            &mount.join("pipe"),
            nix::sys::stat::Mode::from_bits_truncate(0o644),
        )
        .unwrap();
        let first = tmp.path().join("first/dir");
        let second = tmp.path().join("second/a/b");
        let req = ItemCopyRequest {
            mount_point: mount.display().to_string(),
            items_to_copy: vec![item("tool", &first), item("pipe", &second)],
        };
        match send(&req, &me()) {
            Err(DaemonError::Validation(msg)) => {
                assert!(msg.contains("not a file, directory or symlink"), "{}", msg)
            }
            other => panic!("expected validation error, got {:?}", other),
        }
        assert!(!tmp.path().join("first").exists());
        assert!(!tmp.path().join("second").exists());
    }

    #[test]
    fn test_failed_staging_removes_earlier_items_and_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let mount = mount(tmp.path());
        let first = tmp.path().join("root/first/dir");
        fs::write(tmp.path().join("blocker"), "").unwrap();
        let second = tmp.path().join("blocker/sub");
        let req = ItemCopyRequest {
            mount_point: mount.display().to_string(),
            items_to_copy: vec![item("tool", &first), item("Foo.app", &second)],
        };
        assert!(matches!(send(&req, &me()), Err(DaemonError::Privileged(_))));
        assert!(!tmp.path().join("root").exists());
        assert!(tmp.path().join("blocker").is_file());
    }

    #[test]
    fn test_failed_rename_rolls_back_committed_items() {
        let tmp = tempfile::tempdir().unwrap();
        let mount = mount(tmp.path());
        let bin = tmp.path().join("bin");
        fs::create_dir(&bin).unwrap();
        fs::write(bin.join("tool"), "old").unwrap();
        let apps = tmp.path().join("new/Applications");
        let req = ItemCopyRequest {
            mount_point: mount.display().to_string(),
            items_to_copy: vec![item("tool", &bin), item("Foo.app", &apps)],
        };
        let items = validate::validate_item_copy(&req, &me()).unwrap();
        let staged = stage_all(&items, &mut |_| {}).unwrap();
        // Lose the second staged copy so its rename fails.
        fs::remove_dir_all(staged[1].staged()).unwrap();

        let err = commit_all(staged).unwrap_err();
        assert!(err.contains("cannot rename into"), "{}", err);
        assert_eq!(fs::read_to_string(bin.join("tool")).unwrap(), "old");
        assert_eq!(fs::read_dir(&bin).unwrap().count(), 1);
        assert!(!tmp.path().join("new").exists());
    }
}

//! Request types and the checks that run before any privileged action.

use super::auth::PeerCredentials;
use super::fsops::{self, Principal};
use super::DaemonError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Longest accepted `pkgname`, `id` or `version`.
pub const MAX_FIELD_LEN: usize = 80;

static FIELD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9 ._\-]+$").expect("valid regex"));

/// A request to assemble a package from a staged root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageRequest {
    pub pkgroot: String,
    pub pkgdir: String,
    pub pkgname: String,
    pub id: String,
    pub version: String,
    #[serde(default = "default_pkgtype")]
    pub pkgtype: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infofile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scripts: Option<String>,
    #[serde(default)]
    pub chown: Vec<ChownEntry>,
}

fn default_pkgtype() -> String {
    "flat".to_string()
}

/// Ownership change applied inside the package root copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChownEntry {
    pub path: String,
    pub user: Principal,
    pub group: Principal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

/// A request to copy items from a mounted volume onto the live filesystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemCopyRequest {
    pub mount_point: String,
    pub items_to_copy: Vec<CopyItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyItem {
    pub source_item: String,
    pub destination_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_item: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<Principal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<Principal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

/// A chown entry with ids resolved and mode parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedChown {
    pub path: String,
    pub uid: u32,
    pub gid: u32,
    pub mode: Option<u32>,
}

/// A package request that passed validation.
#[derive(Debug, Clone)]
pub struct ValidPackage {
    pub pkgroot: PathBuf,
    pub pkgdir: PathBuf,
    pub pkgname: String,
    pub id: String,
    pub version: String,
    pub infofile: Option<PathBuf>,
    pub scripts: Option<PathBuf>,
    pub chown: Vec<ResolvedChown>,
}

/// One item of a copy request that passed validation.
#[derive(Debug, Clone)]
pub struct ValidCopyItem {
    pub source: PathBuf,
    /// Uid of the requester, who owns the mounted source tree.
    pub source_owner: u32,
    pub destination_dir: PathBuf,
    pub destination_name: String,
    pub uid: u32,
    pub gid: u32,
    pub mode: Option<u32>,
}

impl ValidCopyItem {
    pub fn target(&self) -> PathBuf {
        self.destination_dir.join(&self.destination_name)
    }
}

fn invalid(message: impl Into<String>) -> DaemonError {
    DaemonError::Validation(message.into())
}

/// Check a name-like field against the allowed pattern and length.
pub fn check_field(label: &str, value: &str) -> Result<(), DaemonError> {
    if value.len() > MAX_FIELD_LEN {
        return Err(invalid(format!(
            "{} is longer than {} characters",
            label, MAX_FIELD_LEN
        )));
    }
    if !FIELD.is_match(value) {
        return Err(invalid(format!("{} '{}' contains illegal characters", label, value)));
    }
    Ok(())
}

/// Check that `path` exists, is not a symlink, and belongs to the peer.
fn check_owned(
    label: &str,
    path: &Path,
    peer: &PeerCredentials,
) -> Result<std::fs::Metadata, DaemonError> {
    if !path.is_absolute() {
        return Err(invalid(format!("{} must be an absolute path", label)));
    }
    let meta = std::fs::symlink_metadata(path)
        .map_err(|e| invalid(format!("{} {}: {}", label, path.display(), e)))?;
    if meta.file_type().is_symlink() {
        return Err(invalid(format!("{} {} is a symlink", label, path.display())));
    }
    if meta.uid() != peer.uid {
        return Err(invalid(format!(
            "{} {} is not owned by uid {}",
            label,
            path.display(),
            peer.uid
        )));
    }
    Ok(meta)
}

fn parse_mode(mode: &Option<String>) -> Result<Option<u32>, DaemonError> {
    mode.as_deref()
        .map(|m| crate::processors::parse_mode(m).map_err(invalid))
        .transpose()
}

/// Validate a package request against the requesting peer.
pub fn validate_package(
    req: &PackageRequest,
    peer: &PeerCredentials,
) -> Result<ValidPackage, DaemonError> {
    if req.pkgtype != "flat" {
        return Err(invalid(format!("unsupported pkgtype '{}'", req.pkgtype)));
    }
    check_field("pkgname", &req.pkgname)?;
    check_field("id", &req.id)?;
    check_field("version", &req.version)?;
    if req.id.split('.').filter(|c| !c.is_empty()).count() < 2 {
        return Err(invalid(format!(
            "id '{}' needs at least two dot-separated components",
            req.id
        )));
    }

    let pkgroot = PathBuf::from(&req.pkgroot);
    if !check_owned("pkgroot", &pkgroot, peer)?.is_dir() {
        return Err(invalid(format!("pkgroot {} is not a directory", pkgroot.display())));
    }
    let pkgdir = PathBuf::from(&req.pkgdir);
    if !check_owned("pkgdir", &pkgdir, peer)?.is_dir() {
        return Err(invalid(format!("pkgdir {} is not a directory", pkgdir.display())));
    }

    let infofile = match req.infofile {
        Some(ref p) => {
            let path = PathBuf::from(p);
            if !check_owned("infofile", &path, peer)?.is_file() {
                return Err(invalid(format!("infofile {} is not a file", path.display())));
            }
            Some(path)
        }
        None => None,
    };
    let scripts = match req.scripts {
        Some(ref p) => {
            let path = PathBuf::from(p);
            if !check_owned("scripts", &path, peer)?.is_dir() {
                return Err(invalid(format!("scripts {} is not a directory", path.display())));
            }
            Some(path)
        }
        None => None,
    };

    let mut chown = Vec::with_capacity(req.chown.len());
    for entry in &req.chown {
        fsops::check_relative(&entry.path)
            .map_err(|e| invalid(format!("chown path: {}", e)))?;
        chown.push(ResolvedChown {
            path: entry.path.clone(),
            uid: fsops::resolve_user(&entry.user).map_err(invalid)?,
            gid: fsops::resolve_group(&entry.group).map_err(invalid)?,
            mode: parse_mode(&entry.mode)?,
        });
    }

    Ok(ValidPackage {
        pkgroot,
        pkgdir,
        pkgname: req.pkgname.clone(),
        id: req.id.clone(),
        version: req.version.clone(),
        infofile,
        scripts,
        chown,
    })
}

/// Validate an item copy request against the requesting peer.
pub fn validate_item_copy(
    req: &ItemCopyRequest,
    peer: &PeerCredentials,
) -> Result<Vec<ValidCopyItem>, DaemonError> {
    let mount_point = PathBuf::from(&req.mount_point);
    if !check_owned("mount_point", &mount_point, peer)?.is_dir() {
        return Err(invalid(format!(
            "mount_point {} is not a directory",
            mount_point.display()
        )));
    }
    if req.items_to_copy.is_empty() {
        return Err(invalid("items_to_copy is empty"));
    }

    let mut items = Vec::with_capacity(req.items_to_copy.len());
    for item in &req.items_to_copy {
        let source = fsops::resolve_under(&mount_point, &item.source_item)
            .map_err(|e| invalid(format!("source_item: {}", e)))?;
        fsops::check_copyable(&source, Some(peer.uid))
            .map_err(|e| invalid(format!("source_item: {}", e)))?;

        let destination_dir = PathBuf::from(&item.destination_path);
        if !destination_dir.is_absolute() {
            return Err(invalid(format!(
                "destination_path '{}' must be absolute",
                item.destination_path
            )));
        }
        if item
            .destination_path
            .split('/')
            .any(|c| c == "." || c == "..")
        {
            return Err(invalid(format!(
                "destination_path '{}' must not contain '.' or '..'",
                item.destination_path
            )));
        }

        let destination_name = match item.destination_item {
            Some(ref name) => name.clone(),
            None => source
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .ok_or_else(|| invalid("source_item has no file name"))?,
        };
        if destination_name.contains('/') || destination_name == "." || destination_name == ".." {
            return Err(invalid(format!(
                "destination_item '{}' must be a plain name",
                destination_name
            )));
        }

        let (default_uid, default_gid) = fsops::nearest_existing(&destination_dir)
            .map(|p| fsops::owner_of(&p))
            .transpose()
            .map_err(invalid)?
            .unwrap_or((0, 0));
        let uid = match item.user {
            Some(ref u) => fsops::resolve_user(u).map_err(invalid)?,
            None => default_uid,
        };
        let gid = match item.group {
            Some(ref g) => fsops::resolve_group(g).map_err(invalid)?,
            None => default_gid,
        };

        items.push(ValidCopyItem {
            source,
            source_owner: peer.uid,
            destination_dir,
            destination_name,
            uid,
            gid,
            mode: parse_mode(&item.mode)?,
        });
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::fsops::current_ids;

    fn me() -> PeerCredentials {
        let (uid, gid) = current_ids();
        PeerCredentials { uid, gid, pid: None }
    }

    fn someone_else() -> PeerCredentials {
        let (uid, gid) = current_ids();
        PeerCredentials {
            uid: uid.wrapping_add(1),
            gid,
            pid: None,
        }
    }

    fn request(root: &Path, dir: &Path) -> PackageRequest {
        PackageRequest {
            pkgroot: root.display().to_string(),
            pkgdir: dir.display().to_string(),
            pkgname: "Foo-1.0".to_string(),
            id: "com.example.foo".to_string(),
            version: "1.0".to_string(),
            pkgtype: "flat".to_string(),
            infofile: None,
            scripts: None,
            chown: vec![],
        }
    }

    fn dirs() -> (tempfile::TempDir, PathBuf, PathBuf) {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("root");
        let out = tmp.path().join("out");
        std::fs::create_dir(&root).unwrap();
        std::fs::create_dir(&out).unwrap();
        (tmp, root, out)
    }

    #[test]
    fn test_check_field() {
        assert!(check_field("pkgname", "Foo App-1.0_beta").is_ok());
        assert!(check_field("pkgname", "Foo;rm -rf").is_err());
        assert!(check_field("pkgname", "../Foo").is_err());
        assert!(check_field("pkgname", "").is_err());
        assert!(check_field("pkgname", &"a".repeat(81)).is_err());
        assert!(check_field("pkgname", &"a".repeat(80)).is_ok());
    }

    #[test]
    fn test_valid_package_request() {
        let (_tmp, root, out) = dirs();
        let valid = validate_package(&request(&root, &out), &me()).unwrap();
        assert_eq!(valid.pkgroot, root);
        assert!(valid.chown.is_empty());
    }

    #[test]
    fn test_pkgroot_owned_by_other_rejected() {
        let (_tmp, root, out) = dirs();
        let err = validate_package(&request(&root, &out), &someone_else()).unwrap_err();
        assert!(matches!(err, DaemonError::Validation(ref m) if m.contains("not owned")));
    }

    #[test]
    fn test_id_needs_two_components() {
        let (_tmp, root, out) = dirs();
        let mut req = request(&root, &out);
        req.id = "foo".to_string();
        assert!(validate_package(&req, &me()).is_err());
    }

    #[test]
    fn test_pkgtype_must_be_flat() {
        let (_tmp, root, out) = dirs();
        let mut req = request(&root, &out);
        req.pkgtype = "bundle".to_string();
        assert!(validate_package(&req, &me()).is_err());
    }

    #[test]
    fn test_symlinked_pkgroot_rejected() {
        let (tmp, root, out) = dirs();
        let link = tmp.path().join("link");
        std::os::unix::fs::symlink(&root, &link).unwrap();
        let err = validate_package(&request(&link, &out), &me()).unwrap_err();
        assert!(err.to_string().contains("symlink"));
    }

    #[test]
    fn test_chown_dotdot_rejected() {
        let (_tmp, root, out) = dirs();
        let mut req = request(&root, &out);
        req.chown.push(ChownEntry {
            path: "Applications/../../etc".to_string(),
            user: Principal::Name("root".to_string()),
            group: Principal::Id(0),
            mode: None,
        });
        let err = validate_package(&req, &me()).unwrap_err();
        assert!(err.to_string().contains(".."));
    }

    #[test]
    fn test_chown_unknown_user_rejected() {
        let (_tmp, root, out) = dirs();
        let mut req = request(&root, &out);
        req.chown.push(ChownEntry {
            path: "Applications".to_string(),
            user: Principal::Name("no-such-user-pkgsmith".to_string()),
            group: Principal::Id(0),
            mode: Some("0755".to_string()),
        });
        assert!(validate_package(&req, &me()).is_err());
    }

    #[test]
    fn test_item_copy_validation() {
        let (_tmp, mount, dest) = dirs();
        std::fs::write(mount.join("Tool"), "bin").unwrap();
        let req = ItemCopyRequest {
            mount_point: mount.display().to_string(),
            items_to_copy: vec![CopyItem {
                source_item: "Tool".to_string(),
                destination_path: dest.join("bin").display().to_string(),
                destination_item: None,
                user: None,
                group: None,
                mode: Some("0755".to_string()),
            }],
        };
        let items = validate_item_copy(&req, &me()).unwrap();
        assert_eq!(items[0].destination_name, "Tool");
        assert_eq!(items[0].target(), dest.join("bin/Tool"));
        assert_eq!((items[0].uid, items[0].gid), fsops::owner_of(&dest).unwrap());
        assert_eq!(items[0].mode, Some(0o755));
    }

    #[test]
    fn test_item_copy_rejections() {
        let (_tmp, mount, dest) = dirs();
        std::fs::write(mount.join("Tool"), "bin").unwrap();
        let item = CopyItem {
            source_item: "Tool".to_string(),
            destination_path: dest.display().to_string(),
            destination_item: None,
            user: None,
            group: None,
            mode: None,
        };
        let make = |item: CopyItem| ItemCopyRequest {
            mount_point: mount.display().to_string(),
            items_to_copy: vec![item],
        };

        let mut missing = item.clone();
        missing.source_item = "Nope".to_string();
        assert!(validate_item_copy(&make(missing), &me()).is_err());

        let mut escape = item.clone();
        escape.source_item = "../Tool".to_string();
        assert!(validate_item_copy(&make(escape), &me()).is_err());

        let mut relative = item.clone();
        relative.destination_path = "usr/local".to_string();
        assert!(validate_item_copy(&make(relative), &me()).is_err());

        let mut bad_name = item.clone();
        bad_name.destination_item = Some("a/b".to_string());
        assert!(validate_item_copy(&make(bad_name), &me()).is_err());

        assert!(validate_item_copy(&make(item), &someone_else()).is_err());
    }

    #[test]
    fn test_package_request_from_cbor_defaults() {
        let mut map = indexmap::IndexMap::new();
        for (k, v) in [
            ("pkgroot", "/r"),
            ("pkgdir", "/d"),
            ("pkgname", "n"),
            ("id", "a.b"),
            ("version", "1"),
        ] {
            map.insert(k, v);
        }
        let bytes = crate::daemon::protocol::encode_request(&map).unwrap();
        let value = crate::daemon::protocol::read_request(bytes.as_slice(), 4096).unwrap();
        let req: PackageRequest = value.deserialized().unwrap();
        assert_eq!(req.pkgtype, "flat");
        assert!(req.chown.is_empty());
    }
}

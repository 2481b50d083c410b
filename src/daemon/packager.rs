//! Package assembly service.
//!
//! Request flow:
//! 1. Decode and validate (no filesystem writes before this succeeds)
//! 2. Copy the package root into a private work directory
//! 3. Apply the requested ownership and modes to the copy
//! 4. Build the package from the copy
//! 5. Hand the artifact to the requester and rename it into `pkgdir`
//!
//! The work directory is removed on every path out of `handle`.

use super::auth::PeerCredentials;
use super::fsops;
use super::protocol::Responder;
use super::validate::{self, PackageRequest, ValidPackage};
use super::{DaemonError, RequestHandler};
use crate::transport::local::{exec, Invocation};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Read;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Component manifest stored at the top of a flat package.
pub const MANIFEST_NAME: &str = "PackageInfo.json";

/// Metadata embedded in every flat package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageManifest {
    pub identifier: String,
    pub version: String,
    pub relocatable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
    #[serde(default)]
    pub scripts: bool,
}

/// Turns a prepared root into a package file.
pub trait PackageBuilder {
    /// File extension of produced packages.
    fn extension(&self) -> &str;

    /// Build `output` from `root`. `scratch` is private to this request.
    fn build(
        &self,
        root: &Path,
        pkg: &ValidPackage,
        scratch: &Path,
        output: &Path,
    ) -> Result<(), String>;
}

/// Portable gzip'd tar package with an embedded component manifest.
#[derive(Debug, Default, Clone, Copy)]
pub struct FlatArchiveBuilder;

impl PackageBuilder for FlatArchiveBuilder {
    fn extension(&self) -> &str {
        "pkg"
    }

    fn build(
        &self,
        root: &Path,
        pkg: &ValidPackage,
        _scratch: &Path,
        output: &Path,
    ) -> Result<(), String> {
        let info = match pkg.infofile {
            Some(ref p) => Some(
                fs::read_to_string(p).map_err(|e| format!("cannot read {}: {}", p.display(), e))?,
            ),
            None => None,
        };
        let manifest = PackageManifest {
            identifier: pkg.id.clone(),
            version: pkg.version.clone(),
            relocatable: false,
            info,
            scripts: pkg.scripts.is_some(),
        };
        let json = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| format!("serialize error: {}", e))?;

        let file = File::create(output)
            .map_err(|e| format!("cannot create {}: {}", output.display(), e))?;
        let mut tar = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        tar.mode(tar::HeaderMode::Complete);
        tar.follow_symlinks(false);

        let mut header = tar::Header::new_gnu();
        header.set_size(json.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        );
        header.set_cksum();
        tar.append_data(&mut header, MANIFEST_NAME, json.as_slice())
            .map_err(|e| format!("cannot write manifest: {}", e))?;
        tar.append_dir_all("Payload", root)
            .map_err(|e| format!("cannot archive {}: {}", root.display(), e))?;
        if let Some(ref scripts) = pkg.scripts {
            tar.append_dir_all("Scripts", scripts)
                .map_err(|e| format!("cannot archive {}: {}", scripts.display(), e))?;
        }
        tar.into_inner()
            .and_then(|gz| gz.finish())
            .map_err(|e| format!("cannot finish {}: {}", output.display(), e))?;
        Ok(())
    }
}

/// Builds with the platform `pkgbuild` tool.
#[derive(Debug, Default, Clone, Copy)]
pub struct PkgbuildBuilder;

static RELOCATABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(<key>BundleIsRelocatable</key>\s*)<true\s*/>").expect("valid regex")
});

/// Set every `BundleIsRelocatable` in a component plist to false.
pub fn disable_relocation(plist: &str) -> String {
    RELOCATABLE.replace_all(plist, "${1}<false/>").into_owned()
}

impl PackageBuilder for PkgbuildBuilder {
    fn extension(&self) -> &str {
        "pkg"
    }

    fn build(
        &self,
        root: &Path,
        pkg: &ValidPackage,
        scratch: &Path,
        output: &Path,
    ) -> Result<(), String> {
        let plist = scratch.join("component.plist");
        let analyze = exec(
            &Invocation::new("pkgbuild")
                .arg("--analyze")
                .arg("--root")
                .arg(root.display().to_string())
                .arg(plist.display().to_string()),
        )?;
        if !analyze.success() {
            return Err(analyze.failure_summary("pkgbuild --analyze"));
        }
        let text = fs::read_to_string(&plist)
            .map_err(|e| format!("cannot read {}: {}", plist.display(), e))?;
        fs::write(&plist, disable_relocation(&text))
            .map_err(|e| format!("cannot write {}: {}", plist.display(), e))?;

        let mut inv = Invocation::new("pkgbuild")
            .arg("--root")
            .arg(root.display().to_string())
            .arg("--identifier")
            .arg(pkg.id.as_str())
            .arg("--version")
            .arg(pkg.version.as_str())
            .arg("--component-plist")
            .arg(plist.display().to_string())
            .arg("--ownership")
            .arg("preserve");
        if let Some(ref info) = pkg.infofile {
            inv = inv.arg("--info").arg(info.display().to_string());
        }
        if let Some(ref scripts) = pkg.scripts {
            inv = inv.arg("--scripts").arg(scripts.display().to_string());
        }
        let out = exec(&inv.arg(output.display().to_string()))?;
        if !out.success() {
            return Err(out.failure_summary("pkgbuild"));
        }
        Ok(())
    }
}

/// Archive tool used to read `pkgbuild` output.
pub const XAR_TOOL: &str = "xar";

/// Leading bytes of a xar archive, the container `pkgbuild` writes.
const XAR_MAGIC: &[u8; 4] = b"xar!";

static PKG_INFO_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<pkg-info\b([^>]*)>").expect("valid regex"));

static PKG_INFO_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:^|\s)(identifier|version)\s*=\s*"([^"]*)""#).expect("valid regex")
});

/// Build a manifest from the `PackageInfo` document of a component package.
pub fn parse_package_info(xml: &str) -> Result<PackageManifest, String> {
    let attrs = PKG_INFO_TAG
        .captures(xml)
        .and_then(|c| c.get(1))
        .ok_or("PackageInfo has no pkg-info element")?
        .as_str();
    let mut identifier = None;
    let mut version = None;
    for cap in PKG_INFO_ATTR.captures_iter(attrs) {
        match &cap[1] {
            "identifier" => identifier = Some(cap[2].to_string()),
            _ => version = Some(cap[2].to_string()),
        }
    }
    Ok(PackageManifest {
        identifier: identifier.ok_or("pkg-info has no identifier")?,
        version: version.ok_or("pkg-info has no version")?,
        relocatable: xml.contains("<relocate"),
        info: None,
        scripts: xml.contains("<scripts"),
    })
}

/// Read the manifest of a built package, either format.
pub fn read_manifest(path: &Path) -> Result<PackageManifest, String> {
    read_manifest_with(path, XAR_TOOL)
}

/// `read_manifest` with an explicit xar executable.
pub fn read_manifest_with(path: &Path, xar: &str) -> Result<PackageManifest, String> {
    let mut magic = [0u8; 4];
    let mut file =
        File::open(path).map_err(|e| format!("cannot open {}: {}", path.display(), e))?;
    let is_xar = file.read_exact(&mut magic).is_ok() && &magic == XAR_MAGIC;
    drop(file);
    if is_xar {
        read_xar_manifest(path, xar)
    } else {
        read_flat_manifest(path)
    }
}

fn read_xar_manifest(path: &Path, xar: &str) -> Result<PackageManifest, String> {
    let out_dir = tempfile::tempdir().map_err(|e| format!("cannot create temp dir: {}", e))?;
    let out = exec(
        &Invocation::new(xar)
            .arg("-x")
            .arg("-f")
            .arg(path.display().to_string())
            .arg("-C")
            .arg(out_dir.path().display().to_string())
            .arg("PackageInfo"),
    )?;
    if !out.success() {
        return Err(out.failure_summary("xar -x"));
    }
    let info = out_dir.path().join("PackageInfo");
    let xml = fs::read_to_string(&info)
        .map_err(|e| format!("{} has no PackageInfo: {}", path.display(), e))?;
    parse_package_info(&xml).map_err(|e| format!("{}: {}", path.display(), e))
}

fn read_flat_manifest(path: &Path) -> Result<PackageManifest, String> {
    let file = File::open(path).map_err(|e| format!("cannot open {}: {}", path.display(), e))?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    let entries = archive
        .entries()
        .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    for entry in entries {
        let entry = entry.map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
        let is_manifest = entry
            .path()
            .map(|p| p.as_ref() == Path::new(MANIFEST_NAME))
            .unwrap_or(false);
        if is_manifest {
            return serde_json::from_reader(entry)
                .map_err(|e| format!("invalid manifest in {}: {}", path.display(), e));
        }
    }
    Err(format!("{} has no {}", path.display(), MANIFEST_NAME))
}

/// The package assembly service.
pub struct Packager<B: PackageBuilder> {
    builder: B,
    work_dir: PathBuf,
}

impl<B: PackageBuilder> Packager<B> {
    pub fn new(builder: B, work_dir: &Path) -> Self {
        Self {
            builder,
            work_dir: work_dir.to_path_buf(),
        }
    }

    fn build(
        &self,
        pkg: &ValidPackage,
        peer: &PeerCredentials,
        out: &mut Responder,
    ) -> Result<PathBuf, DaemonError> {
        let artifact = pkg
            .pkgdir
            .join(format!("{}.{}", pkg.pkgname, self.builder.extension()));
        if let Ok(meta) = fs::symlink_metadata(&artifact) {
            if meta.file_type().is_symlink() || meta.uid() != peer.uid {
                return Err(DaemonError::Validation(format!(
                    "existing {} is not a file owned by uid {}",
                    artifact.display(),
                    peer.uid
                )));
            }
        }

        fs::create_dir_all(&self.work_dir).map_err(|e| {
            DaemonError::Privileged(format!("cannot create {}: {}", self.work_dir.display(), e))
        })?;
        let work = tempfile::Builder::new()
            .prefix("pkgsmith-build-")
            .tempdir_in(&self.work_dir)
            .map_err(|e| DaemonError::Privileged(format!("cannot create work dir: {}", e)))?;

        out.status(&format!("Copying {}", pkg.pkgroot.display()));
        let root = work.path().join("root");
        fsops::copy_tree(&pkg.pkgroot, &root, Some(peer.uid)).map_err(DaemonError::Privileged)?;

        for entry in &pkg.chown {
            let target = fsops::resolve_under(&root, &entry.path)
                .map_err(|e| DaemonError::Validation(format!("chown path: {}", e)))?;
            out.status(&format!(
                "Setting owner of {} to {}:{}",
                entry.path, entry.uid, entry.gid
            ));
            fsops::chown_tree(&target, entry.uid, entry.gid).map_err(DaemonError::Privileged)?;
            if let Some(mode) = entry.mode {
                fsops::chmod_tree(&target, mode).map_err(DaemonError::Privileged)?;
            }
        }

        out.status(&format!("Building {} {}", pkg.id, pkg.version));
        let built = work.path().join("package.out");
        self.builder
            .build(&root, pkg, work.path(), &built)
            .map_err(DaemonError::Privileged)?;

        install_artifact(&built, &artifact, peer).map_err(DaemonError::Privileged)?;
        out.status(&format!("Created {}", artifact.display()));
        Ok(artifact)
    }
}

/// Copy `built` next to `artifact`, give it to the peer, rename into place.
fn install_artifact(built: &Path, artifact: &Path, peer: &PeerCredentials) -> Result<(), String> {
    let dir = artifact
        .parent()
        .ok_or_else(|| format!("{} has no parent", artifact.display()))?;
    let mut staged = tempfile::Builder::new()
        .prefix(".pkgsmith-")
        .tempfile_in(dir)
        .map_err(|e| format!("cannot stage in {}: {}", dir.display(), e))?;
    let mut src =
        File::open(built).map_err(|e| format!("cannot open {}: {}", built.display(), e))?;
    std::io::copy(&mut src, staged.as_file_mut())
        .map_err(|e| format!("cannot copy package: {}", e))?;
    std::os::unix::fs::chown(staged.path(), Some(peer.uid), Some(peer.gid))
        .map_err(|e| format!("cannot chown {}: {}", staged.path().display(), e))?;
    fs::set_permissions(staged.path(), fs::Permissions::from_mode(0o644))
        .map_err(|e| format!("cannot chmod {}: {}", staged.path().display(), e))?;
    staged
        .persist(artifact)
        .map_err(|e| format!("cannot rename into {}: {}", artifact.display(), e.error))?;
    Ok(())
}

impl<B: PackageBuilder> RequestHandler for Packager<B> {
    fn service(&self) -> &str {
        "packager"
    }

    fn handle(
        &self,
        request: &ciborium::Value,
        peer: &PeerCredentials,
        out: &mut Responder,
    ) -> Result<String, DaemonError> {
        let req: PackageRequest = request
            .deserialized()
            .map_err(|e| DaemonError::Validation(format!("malformed package request: {}", e)))?;
        let pkg = validate::validate_package(&req, peer)?;
        let artifact = self.build(&pkg, peer, out)?;
        Ok(artifact.display().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::fsops::{current_ids, Principal};
    use crate::daemon::validate::ChownEntry;

    struct Setup {
        _tmp: tempfile::TempDir,
        root: PathBuf,
        pkgdir: PathBuf,
        work: PathBuf,
    }

    fn setup() -> Setup {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("pkgroot");
        let pkgdir = tmp.path().join("pkgs");
        let work = tmp.path().join("work");
        fs::create_dir_all(root.join("Applications/Foo.app")).unwrap();
        fs::write(root.join("Applications/Foo.app/binary"), "bin").unwrap();
        fs::create_dir(&pkgdir).unwrap();
        Setup {
            _tmp: tmp,
            root,
            pkgdir,
            work,
        }
    }

    fn me() -> PeerCredentials {
        let (uid, gid) = current_ids();
        PeerCredentials { uid, gid, pid: None }
    }

    fn request(s: &Setup) -> PackageRequest {
        let (uid, gid) = current_ids();
        PackageRequest {
            pkgroot: s.root.display().to_string(),
            pkgdir: s.pkgdir.display().to_string(),
            pkgname: "Foo-1.0".to_string(),
            id: "com.example.foo".to_string(),
            version: "1.0".to_string(),
            pkgtype: "flat".to_string(),
            infofile: None,
            scripts: None,
            chown: vec![ChownEntry {
                path: "Applications".to_string(),
                user: Principal::Id(uid),
                group: Principal::Id(gid),
                mode: Some("0755".to_string()),
            }],
        }
    }

    fn send(
        s: &Setup,
        req: &PackageRequest,
        peer: &PeerCredentials,
    ) -> (Result<String, DaemonError>, String) {
        let value = ciborium::Value::serialized(req).unwrap();
        let packager = Packager::new(FlatArchiveBuilder, &s.work);
        let mut buf = Vec::new();
        let result = {
            let mut out = Responder::new(&mut buf);
            packager.handle(&value, peer, &mut out)
        };
        (result, String::from_utf8(buf).unwrap())
    }

    fn archive_paths(path: &Path) -> Vec<String> {
        let mut archive = tar::Archive::new(GzDecoder::new(File::open(path).unwrap()));
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect()
    }

    #[test]
    fn test_build_flat_package() {
        let s = setup();
        let (result, log) = send(&s, &request(&s), &me());
        let artifact = PathBuf::from(result.unwrap());
        assert_eq!(artifact, s.pkgdir.join("Foo-1.0.pkg"));
        assert!(log.contains("Building com.example.foo 1.0"));

        let manifest = read_manifest(&artifact).unwrap();
        assert_eq!(manifest.identifier, "com.example.foo");
        assert_eq!(manifest.version, "1.0");
        assert!(!manifest.relocatable);

        let paths = archive_paths(&artifact);
        assert_eq!(paths[0], MANIFEST_NAME);
        assert!(paths.iter().any(|p| p.ends_with("Applications/Foo.app/binary")));
        assert_eq!(fsops::owner_of(&artifact).unwrap(), current_ids());
        // Work directory cleaned up.
        assert_eq!(fs::read_dir(&s.work).unwrap().count(), 0);
    }

    #[test]
    fn test_foreign_pkgroot_leaves_pkgdir_untouched() {
        let s = setup();
        let other = PeerCredentials {
            uid: me().uid.wrapping_add(1),
            ..me()
        };
        let (result, _) = send(&s, &request(&s), &other);
        assert!(matches!(result, Err(DaemonError::Validation(_))));
        assert_eq!(fs::read_dir(&s.pkgdir).unwrap().count(), 0);
        assert!(!s.work.exists());
    }

    #[test]
    fn test_chown_through_symlink_rejected() {
        let s = setup();
        std::os::unix::fs::symlink("/etc", s.root.join("etc")).unwrap();
        let mut req = request(&s);
        req.chown[0].path = "etc/passwd".to_string();
        let (result, _) = send(&s, &req, &me());
        let err = result.unwrap_err();
        assert!(err.to_string().contains("symlink"));
        assert_eq!(fs::read_dir(&s.pkgdir).unwrap().count(), 0);
        assert_eq!(fs::read_dir(&s.work).unwrap().count(), 0);
    }

    #[test]
    fn test_rebuild_replaces_owned_artifact() {
        let s = setup();
        send(&s, &request(&s), &me()).0.unwrap();
        let mut req = request(&s);
        req.version = "1.1".to_string();
        let artifact = PathBuf::from(send(&s, &req, &me()).0.unwrap());
        assert_eq!(read_manifest(&artifact).unwrap().version, "1.1");
        // Only the artifact; no staging leftovers.
        assert_eq!(fs::read_dir(&s.pkgdir).unwrap().count(), 1);
    }

    #[test]
    fn test_malformed_request() {
        let s = setup();
        let packager = Packager::new(FlatArchiveBuilder, &s.work);
        let value = ciborium::Value::Text("not a map".to_string());
        let mut buf = Vec::new();
        let mut out = Responder::new(&mut buf);
        let err = packager.handle(&value, &me(), &mut out).unwrap_err();
        assert!(matches!(err, DaemonError::Validation(_)));
    }

    #[test]
    fn test_disable_relocation() {
        let plist = "<dict>\n<key>BundleIsRelocatable</key>\n\t<true/>\n<key>Other</key><true/>\n</dict>";
        let edited = disable_relocation(plist);
        assert!(edited.contains("<key>BundleIsRelocatable</key>\n\t<false/>"));
        assert!(edited.contains("<key>Other</key><true/>"));
    }

    #[test]
    fn test_read_manifest_not_a_package() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.pkg");
        fs::write(&path, "plain text").unwrap();
        assert!(read_manifest(&path).is_err());
    }

    const PACKAGE_INFO: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<pkg-info overwrite-permissions="true" relocatable="false" format-version="2" identifier="com.example.foo" version="1.2.3" install-location="/" auth="root">
    <payload numberOfFiles="3" installKBytes="12"/>
    <scripts>
        <postinstall file="./postinstall"/>
    </scripts>
</pkg-info>
"#;

    #[test]
    fn test_parse_package_info() {
        let manifest = parse_package_info(PACKAGE_INFO).unwrap();
        assert_eq!(manifest.identifier, "com.example.foo");
        assert_eq!(manifest.version, "1.2.3");
        assert!(manifest.scripts);
        assert!(!manifest.relocatable);

        assert!(parse_package_info("<pkg-info identifier=\"x\"/>").is_err());
        assert!(parse_package_info("<installer-gui-script/>").is_err());
    }

    #[test]
    fn test_read_pkgbuild_manifest_through_xar() {
        let dir = tempfile::tempdir().unwrap();
        let xar = dir.path().join("xar");
        fs::write(
            &xar,
            format!(
                "#!/bin/sh\nwhile [ $# -gt 0 ]; do\n  case \"$1\" in -C) shift; out=\"$1\";; esac\n  shift\ndone\ncat > \"$out/PackageInfo\" <<'EOF'\n{}EOF\n",
                PACKAGE_INFO
            ),
        )
        .unwrap();
        fs::set_permissions(&xar, fs::Permissions::from_mode(0o755)).unwrap();
        let pkg = dir.path().join("Foo-1.2.3.pkg");
        fs::write(&pkg, b"xar!\x00\x1c\x00\x01rest of archive").unwrap();

        let manifest = read_manifest_with(&pkg, &xar.display().to_string()).unwrap();
        assert_eq!(manifest.identifier, "com.example.foo");
        assert_eq!(manifest.version, "1.2.3");

        // Failing extraction is an error, not a mismatch.
        let broken = dir.path().join("false");
        fs::write(&broken, "#!/bin/sh\nexit 1\n").unwrap();
        fs::set_permissions(&broken, fs::Permissions::from_mode(0o755)).unwrap();
        assert!(read_manifest_with(&pkg, &broken.display().to_string()).is_err());
    }
}

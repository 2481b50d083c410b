//! Package processors: staging a package root and requesting a build.

use super::{
    decode_input, optional_str, parse_mode, require_str, Processor, ProcessorFailure,
    VariableSpec,
};
use crate::core::executor::KEY_CACHE_DIR;
use crate::core::types::{Environment, Value};
use crate::daemon::packager::{read_manifest_with, XAR_TOOL};
use crate::daemon::protocol::send_request;
use crate::daemon::validate::PackageRequest;
use crate::daemon::{fsops, DEFAULT_PACKAGER_SOCKET};
use indexmap::IndexMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Environment key holding the packaging service socket.
pub const SOCKET_KEY: &str = "PACKAGER_SOCKET";

/// Environment key naming the xar executable used to inspect built packages.
pub const XAR_KEY: &str = "XAR_TOOL";

/// Creates an empty package root with a directory skeleton.
#[derive(Debug, Default)]
pub struct PkgRootCreator;

const ROOT_INPUTS: &[VariableSpec] = &[
    VariableSpec::required("pkgroot", "Package root to (re)create."),
    VariableSpec::required(
        "pkgdirs",
        "Mapping of relative directory to octal mode, e.g. Applications: \"0775\".",
    ),
];

impl Processor for PkgRootCreator {
    fn name(&self) -> &str {
        "PkgRootCreator"
    }

    fn description(&self) -> &str {
        "Create a package root and a directory structure inside it."
    }

    fn input_variables(&self) -> &[VariableSpec] {
        ROOT_INPUTS
    }

    fn output_variables(&self) -> &[VariableSpec] {
        &[]
    }

    fn run(&self, env: &mut Environment) -> Result<(), ProcessorFailure> {
        let pkgroot = PathBuf::from(require_str(env, "pkgroot")?);
        let pkgdirs: IndexMap<String, Value> = decode_input(env, "pkgdirs")?;

        // Check everything before touching the filesystem.
        let mut plan = Vec::with_capacity(pkgdirs.len());
        for (rel, mode) in &pkgdirs {
            fsops::check_relative(rel)?;
            let mode = mode
                .scalar_string()
                .ok_or_else(|| format!("mode for {} must be a string", rel))?;
            plan.push((rel.as_str(), parse_mode(&mode)?));
        }

        if fs::symlink_metadata(&pkgroot).is_ok() {
            fs::remove_dir_all(&pkgroot)
                .map_err(|e| format!("cannot remove {}: {}", pkgroot.display(), e))?;
        }
        fs::create_dir_all(&pkgroot)
            .map_err(|e| format!("cannot create {}: {}", pkgroot.display(), e))?;
        for (rel, mode) in plan {
            let dir = pkgroot.join(rel);
            fs::create_dir_all(&dir)
                .map_err(|e| format!("cannot create {}: {}", dir.display(), e))?;
            fs::set_permissions(&dir, fs::Permissions::from_mode(mode))
                .map_err(|e| format!("cannot chmod {}: {}", dir.display(), e))?;
        }
        tracing::info!("created package root {}", pkgroot.display());
        Ok(())
    }
}

/// Asks the packaging service to build a package.
#[derive(Debug, Default)]
pub struct PkgCreator;

const CREATOR_INPUTS: &[VariableSpec] = &[
    VariableSpec::required(
        "pkg_request",
        "Mapping with pkgroot, pkgname, id, version and optional pkgdir, chown, scripts, infofile.",
    ),
    VariableSpec::with_default(
        "force_pkg_build",
        "false",
        "Build even if a package with the same identifier and version exists.",
    ),
    VariableSpec::with_default(SOCKET_KEY, DEFAULT_PACKAGER_SOCKET, "Packaging service socket."),
    VariableSpec::with_default(XAR_KEY, XAR_TOOL, "xar executable for reading existing packages."),
];

const CREATOR_OUTPUTS: &[VariableSpec] = &[
    VariableSpec::optional("pkg_path", "Path of the package."),
    VariableSpec::optional("new_package_request", "True if a package was built."),
    VariableSpec::optional("pkg_creator_summary_result", "Description of the built package."),
];

/// Fill request defaults relative to the recipe cache directory.
fn complete_request(env: &Environment) -> Result<PackageRequest, ProcessorFailure> {
    let mut raw: IndexMap<String, Value> = decode_input(env, "pkg_request")?;
    // YAML may give versions as numbers.
    for key in ["pkgname", "id", "version"] {
        if let Some(text) = raw.get(key).and_then(Value::scalar_string) {
            raw.insert(key.to_string(), Value::String(text));
        }
    }
    let cache_dir = optional_str(env, KEY_CACHE_DIR).map(PathBuf::from);
    let has_pkgdir = raw
        .get("pkgdir")
        .and_then(Value::as_str)
        .is_some_and(|d| !d.is_empty());
    if !has_pkgdir {
        let dir = cache_dir
            .as_ref()
            .ok_or_else(|| ProcessorFailure::new("pkg_request has no pkgdir"))?;
        raw.insert("pkgdir".to_string(), Value::from(dir.display().to_string()));
    }
    let mut scratch = Environment::new();
    scratch.insert("pkg_request", raw);
    let mut req: PackageRequest = decode_input(&scratch, "pkg_request")?;

    let anchor = |p: &str| -> String {
        match cache_dir {
            Some(ref dir) if !Path::new(p).is_absolute() => dir.join(p).display().to_string(),
            _ => p.to_string(),
        }
    };
    req.pkgroot = anchor(&req.pkgroot);
    req.pkgdir = anchor(&req.pkgdir);
    req.scripts = req.scripts.as_deref().map(&anchor);
    req.infofile = req.infofile.as_deref().map(&anchor);
    Ok(req)
}

/// True if `path` is a package built from the same identifier and version.
fn up_to_date(path: &Path, req: &PackageRequest, xar: &str) -> bool {
    if !path.exists() {
        return false;
    }
    match read_manifest_with(path, xar) {
        Ok(m) => m.identifier == req.id && m.version == req.version,
        Err(e) => {
            tracing::debug!("cannot inspect existing {}: {}", path.display(), e);
            false
        }
    }
}

impl Processor for PkgCreator {
    fn name(&self) -> &str {
        "PkgCreator"
    }

    fn description(&self) -> &str {
        "Build a package through the privileged packaging service."
    }

    fn input_variables(&self) -> &[VariableSpec] {
        CREATOR_INPUTS
    }

    fn output_variables(&self) -> &[VariableSpec] {
        CREATOR_OUTPUTS
    }

    fn run(&self, env: &mut Environment) -> Result<(), ProcessorFailure> {
        let req = complete_request(env)?;
        let existing = Path::new(&req.pkgdir).join(format!("{}.pkg", req.pkgname));
        let xar = optional_str(env, XAR_KEY).unwrap_or_else(|| XAR_TOOL.to_string());
        if !env.is_truthy("force_pkg_build") && up_to_date(&existing, &req, &xar) {
            tracing::info!(
                "package {} already exists for {} {}",
                existing.display(),
                req.id,
                req.version
            );
            env.insert("pkg_path", existing.display().to_string());
            env.insert("new_package_request", false);
            return Ok(());
        }

        let socket = optional_str(env, SOCKET_KEY)
            .unwrap_or_else(|| DEFAULT_PACKAGER_SOCKET.to_string());
        let pkg_path = send_request(Path::new(&socket), &req, None).map_err(|e| {
            ProcessorFailure::new(format!("package request failed for {}", req.pkgname))
                .with_detail(e.to_string())
        })?;

        let mut data = IndexMap::new();
        data.insert("identifier".to_string(), Value::from(req.id.as_str()));
        data.insert("version".to_string(), Value::from(req.version.as_str()));
        data.insert("pkg_path".to_string(), Value::from(pkg_path.as_str()));
        let mut summary = IndexMap::new();
        summary.insert(
            "summary_text".to_string(),
            Value::from("The following packages were built:"),
        );
        summary.insert("data".to_string(), Value::Map(data));

        env.insert("pkg_path", pkg_path);
        env.insert("new_package_request", true);
        env.insert("pkg_creator_summary_result", summary);
        Ok(())
    }
}

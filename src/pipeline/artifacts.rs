//! Locally generated artifacts a deploy ships to every host
//!
//! All lookups happen before any connection opens; anything missing is a
//! [`PipelineError::MissingArtifact`].

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::{PipelineError, PipelineResult};
use crate::config::ClusterConfig;

/// Install script name under `serve_dir`
pub const INSTALL_SCRIPT: &str = "dcos_install.sh";

/// Pointer file naming the current package list id
pub const PACKAGE_LIST_POINTER: &str = "cluster-package-list.latest";

/// One package from `cluster_packages.json`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageArtifact {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct PackageEntry {
    filename: String,
}

/// Everything `deploy` copies
#[derive(Debug, Clone)]
pub struct DeployArtifacts {
    pub install_script: PathBuf,
    pub bootstrap_tarball: PathBuf,
    pub package_list: PathBuf,
    pub packages: Vec<PackageArtifact>,
}

impl DeployArtifacts {
    pub fn resolve(config: &ClusterConfig) -> PipelineResult<Self> {
        let artifacts = Self {
            install_script: install_script(config)?,
            bootstrap_tarball: bootstrap_tarball(config)?,
            package_list: cluster_package_list(config)?,
            packages: cluster_packages(config)?,
        };
        tracing::debug!(
            bootstrap = %artifacts.bootstrap_tarball.display(),
            package_list = %artifacts.package_list.display(),
            packages = artifacts.packages.len(),
            "resolved deploy artifacts"
        );
        Ok(artifacts)
    }
}

fn require_file(path: PathBuf, hint: &str) -> PipelineResult<PathBuf> {
    if path.is_file() {
        Ok(path)
    } else {
        tracing::error!(path = %path.display(), "{}", hint);
        Err(PipelineError::MissingArtifact(format!(
            "{} does not exist",
            path.display()
        )))
    }
}

/// `<serve_dir>/dcos_install.sh`
pub fn install_script(config: &ClusterConfig) -> PipelineResult<PathBuf> {
    require_file(
        config.serve_dir.join(INSTALL_SCRIPT),
        "install script missing, generate the configuration first",
    )
}

/// `<bootstrap_dir>/<bootstrap_id>.bootstrap.tar.xz`
pub fn bootstrap_tarball(config: &ClusterConfig) -> PipelineResult<PathBuf> {
    let id = config.bootstrap_id().ok_or_else(|| {
        PipelineError::MissingArtifact(
            "bootstrap_id is not configured and BOOTSTRAP_ID is not set".to_string(),
        )
    })?;
    require_file(
        config
            .bootstrap_dir
            .join(format!("{}.bootstrap.tar.xz", id)),
        "bootstrap tarball missing, check bootstrap_id",
    )
}

/// Follow `<serve_dir>/cluster-package-list.latest` to
/// `<package_list_dir>/<id>.package_list.json`.
pub fn cluster_package_list(config: &ClusterConfig) -> PipelineResult<PathBuf> {
    let pointer = require_file(
        config.serve_dir.join(PACKAGE_LIST_POINTER),
        "package list pointer missing, generate the configuration first",
    )?;
    let id = fs::read_to_string(&pointer)?;
    let id = id.trim();
    if id.is_empty() {
        return Err(PipelineError::MissingArtifact(format!(
            "{} is empty",
            pointer.display()
        )));
    }
    require_file(
        config
            .package_list_dir
            .join(format!("{}.package_list.json", id)),
        "package list missing, generate the configuration first",
    )
}

/// Packages named by `cluster_packages.json`, resolved under `serve_dir`.
pub fn cluster_packages(config: &ClusterConfig) -> PipelineResult<Vec<PackageArtifact>> {
    let manifest = require_file(
        config.cluster_packages_path.clone(),
        "cluster packages manifest missing",
    )?;
    let entries = read_manifest(&manifest)?;

    entries
        .into_iter()
        .map(|(name, entry)| {
            let path = require_file(config.serve_dir.join(&entry.filename), "package missing")?;
            Ok(PackageArtifact { name, path })
        })
        .collect()
}

fn read_manifest(path: &Path) -> PipelineResult<BTreeMap<String, PackageEntry>> {
    let json = fs::read_to_string(path)?;
    serde_json::from_str(&json).map_err(|e| PipelineError::InvalidArtifact {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

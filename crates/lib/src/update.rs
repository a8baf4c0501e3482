//! Checking the update server for a new OS image and fetching it.
//!
//! The server is a plain HTTP directory: `<repo>/<branch>` holds the latest
//! version string and `<repo>/os-<version>.img` the image archive.

use std::process::Command;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use abupdate_utils::CommandRunExt;

use crate::kv::KeyValues;

/// The agent configuration file.
pub const AGENT_CONFIG_PATH: &str = "/etc/abupdate.conf";
/// Version of the running system.
pub const VERSION_PATH: &str = "/usr/lib/abupdate/version";
/// Where downloads go.
pub const FETCH_DIR: &str = "/var/tmp/abupdate";

/// Temporary file holding the fetched version string.
const NEW_VERSION_FILE: &str = "newver";

/// Where updates come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// Base URL of the update server
    pub repo: String,
    /// Name of the version file to follow on the server
    pub branch: String,
}

/// A newer version on the server than the one running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateAvailable {
    /// Installed version
    pub old: String,
    /// Version on the server
    pub new: String,
}

impl AgentConfig {
    /// Load the configuration from `path`.
    #[context("Loading {path}")]
    pub fn load(path: &Utf8Path) -> Result<Self> {
        let buf = std::fs::read_to_string(path)?;
        Self::parse(&buf)
    }

    fn parse(buf: &str) -> Result<Self> {
        let kv = KeyValues::parse(buf)?;
        Ok(Self {
            repo: kv.require("repo")?.trim_end_matches('/').to_string(),
            branch: kv.require("branch")?.to_string(),
        })
    }

    fn url(&self, name: &str) -> String {
        format!("{}/{name}", self.repo)
    }
}

/// File name of the image for `version`.
pub fn image_name(version: &str) -> String {
    format!("os-{version}.img")
}

fn read_version(path: &Utf8Path) -> Result<String> {
    let buf = std::fs::read_to_string(path).with_context(|| format!("Reading {path}"))?;
    Ok(buf.trim().to_string())
}

/// Ask the server for its latest version; `None` if it is the one recorded
/// in `version_path` as running. The server's answer is fetched into
/// `fetch_dir` and removed again.
#[context("Checking for updates")]
pub fn check(
    agent: &AgentConfig,
    version_path: &Utf8Path,
    fetch_dir: &Utf8Path,
) -> Result<Option<UpdateAvailable>> {
    let old = read_version(version_path)?;
    std::fs::create_dir_all(fetch_dir).with_context(|| format!("Creating {fetch_dir}"))?;
    let dest = fetch_dir.join(NEW_VERSION_FILE);
    let fetched = Command::new("curl")
        .args(["-sfo", dest.as_str()])
        .arg(agent.url(&agent.branch))
        .log_debug()
        .run_capture_stderr()
        .and_then(|()| read_version(&dest));
    if let Err(e) = std::fs::remove_file(&dest) {
        tracing::debug!("Removing {dest}: {e}");
    }
    let new = fetched?;
    tracing::debug!("Installed: {old}, available: {new}");
    Ok((new != old).then_some(UpdateAvailable { old, new }))
}

/// Download the image for `version` into `fetch_dir`, resuming a partial
/// download, and return its path.
#[context("Downloading version {version}")]
pub fn download(agent: &AgentConfig, fetch_dir: &Utf8Path, version: &str) -> Result<Utf8PathBuf> {
    let name = image_name(version);
    let dest = fetch_dir.join(&name);
    std::fs::create_dir_all(fetch_dir).with_context(|| format!("Creating {fetch_dir}"))?;
    Command::new("curl")
        .args(["-#LfC", "-", "-o", dest.as_str()])
        .arg(agent.url(&name))
        .log_debug()
        .run_inherited()?;
    Ok(dest)
}

/// Delete everything in `fetch_dir` except the files named in `keep`.
#[context("Cleaning {fetch_dir}")]
pub fn clear_fetch_files(fetch_dir: &Utf8Path, keep: &[&str]) -> Result<()> {
    if !fetch_dir.try_exists()? {
        return Ok(());
    }
    for entry in fetch_dir.read_dir_utf8()? {
        let entry = entry?;
        if keep.contains(&entry.file_name()) {
            continue;
        }
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            crate::fsops::remove_tree(path)?;
        } else {
            std::fs::remove_file(path).with_context(|| format!("Removing {path}"))?;
        }
    }
    Ok(())
}

/// Ask whether to install `update`.
pub fn confirm(update: &UpdateAvailable) -> Result<bool> {
    let r = dialoguer::Confirm::new()
        .with_prompt(format!(
            "A new version is available ({} -> {}). Update?",
            update.old, update.new
        ))
        .default(true)
        .interact()?;
    Ok(r)
}

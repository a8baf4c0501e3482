//! Helpers for interacting with mountpoints

use std::fmt::Display;
use std::process::Command;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use abupdate_utils::CommandRunExt;

/// A single mount to perform.
///
/// The source is anything `mount(8)` accepts: a device path, a
/// `UUID=`/`LABEL=` spec, a directory for bind mounts, or the conventional
/// name of a virtual filesystem (e.g. `proc`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    /// What to mount
    pub source: String,
    /// Where to mount it
    pub target: Utf8PathBuf,
    /// Explicit filesystem type; autodetected if unset
    pub fstype: Option<String>,
    /// Comma separated mount options
    pub options: Option<String>,
}

impl MountSpec {
    /// A mount of a block device (or device spec) with autodetected type.
    pub fn new(source: &str, target: impl Into<Utf8PathBuf>) -> Self {
        Self {
            source: source.to_string(),
            target: target.into(),
            fstype: None,
            options: None,
        }
    }

    /// A virtual filesystem such as `proc` or `tmpfs`; the source is the
    /// filesystem type itself.
    pub fn new_virtual(fstype: &str, target: impl Into<Utf8PathBuf>) -> Self {
        Self {
            fstype: Some(fstype.to_string()),
            ..Self::new(fstype, target)
        }
    }

    /// A bind mount of an existing directory.
    pub fn new_bind(source: &Utf8Path, target: impl Into<Utf8PathBuf>) -> Self {
        Self {
            options: Some("bind".into()),
            ..Self::new(source.as_str(), target)
        }
    }

    /// The arguments to pass to `mount(8)`.
    pub fn to_args(&self) -> Vec<String> {
        let mut r = Vec::new();
        if let Some(fstype) = self.fstype.as_deref() {
            r.extend(["-t".to_string(), fstype.to_string()]);
        }
        if let Some(options) = self.options.as_deref() {
            r.extend(["-o".to_string(), options.to_string()]);
        }
        r.push(self.source.clone());
        r.push(self.target.to_string());
        r
    }
}

impl Display for MountSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} on {}", self.source, self.target)?;
        if let Some(fstype) = self.fstype.as_deref() {
            write!(f, " type {fstype}")?;
        }
        if let Some(options) = self.options.as_deref() {
            write!(f, " ({options})")?;
        }
        Ok(())
    }
}

/// Perform the given mount.
#[context("Mounting {spec}")]
pub fn mount(spec: &MountSpec) -> Result<()> {
    Command::new("mount")
        .args(spec.to_args())
        .log_debug()
        .run_capture_stderr()
}

/// Unmount the target and everything mounted beneath it.
#[context("Unmounting {target}")]
pub fn unmount_recursive(target: &Utf8Path) -> Result<()> {
    Command::new("umount")
        .arg("-R")
        .arg(target.as_str())
        .log_debug()
        .run_capture_stderr()
}

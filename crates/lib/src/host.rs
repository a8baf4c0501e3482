//! The side effects an update has on the machine.
//!
//! Everything that needs privileges or real block devices goes through
//! [`HostOps`], so the transaction logic in [`crate::replace`] only touches
//! the filesystem directly for tree merges under paths it is given.

use std::process::Command;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use abupdate_mount::MountSpec;
use abupdate_utils::CommandRunExt;

/// Commands run inside the staged root to regenerate the initramfs and the
/// bootloader configuration.
const BOOT_ARTIFACT_COMMANDS: &[&[&str]] = &[
    &["mkinitcpio", "-P"],
    &["grub-mkconfig", "-o", "/boot/grub/grub.cfg"],
];

/// Operations on the host system used by an update.
pub trait HostOps {
    /// Resolve a device identifier (a path or a `UUID=`-style spec) to a
    /// device node; `None` if nothing matches.
    fn resolve_device(&self, spec: &str) -> Result<Option<Utf8PathBuf>>;

    /// Create a fresh root filesystem on the device, destroying its contents.
    fn mkfs(&self, dev: &Utf8Path) -> Result<()>;

    /// The filesystem UUID of the device, if it has one.
    fn probe_uuid(&self, dev: &Utf8Path) -> Result<Option<String>>;

    /// Perform a mount.
    fn mount(&self, spec: &MountSpec) -> Result<()>;

    /// Unmount `target` and everything beneath it.
    fn unmount_recursive(&self, target: &Utf8Path) -> Result<()>;

    /// Unpack an OS image archive into `dest`, keeping permissions and
    /// extended attributes.
    fn extract_archive(&self, image: &Utf8Path, dest: &Utf8Path) -> Result<()>;

    /// Regenerate boot artifacts by running tools chrooted into `root`.
    fn generate_boot_artifacts(&self, root: &Utf8Path) -> Result<()>;
}

/// The running system, driven through the usual command line tools.
#[derive(Debug, Default)]
pub struct SystemHost;

impl HostOps for SystemHost {
    fn resolve_device(&self, spec: &str) -> Result<Option<Utf8PathBuf>> {
        abupdate_blockdev::resolve_device(spec)
    }

    fn mkfs(&self, dev: &Utf8Path) -> Result<()> {
        abupdate_blockdev::mkfs(dev)
    }

    fn probe_uuid(&self, dev: &Utf8Path) -> Result<Option<String>> {
        abupdate_blockdev::probe_fs_uuid(dev)
    }

    fn mount(&self, spec: &MountSpec) -> Result<()> {
        abupdate_mount::mount(spec)
    }

    fn unmount_recursive(&self, target: &Utf8Path) -> Result<()> {
        abupdate_mount::unmount_recursive(target)
    }

    #[context("Extracting {image} to {dest}")]
    fn extract_archive(&self, image: &Utf8Path, dest: &Utf8Path) -> Result<()> {
        Command::new("tar")
            .arg("xpf")
            .arg(image.as_str())
            .args(["--xattrs", "--xattrs-include=*", "-C"])
            .arg(dest.as_str())
            .log_debug()
            .run_capture_stderr()
    }

    fn generate_boot_artifacts(&self, root: &Utf8Path) -> Result<()> {
        for argv in BOOT_ARTIFACT_COMMANDS {
            tracing::info!("Running {} in {root}", argv.join(" "));
            Command::new("chroot")
                .arg(root.as_str())
                .args(*argv)
                .log_debug()
                .run_capture_stderr()
                .with_context(|| format!("Running {} in {root}", argv[0]))?;
        }
        Ok(())
    }
}

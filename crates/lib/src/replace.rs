//! The update transaction: install an OS image into the inactive slot and
//! make it the active one.
//!
//! The steps, in order:
//!
//! - Load the slot registry, reformat the opposite partition and persist its
//!   new identifier right away.
//! - Mount it at the staging directory and unpack the image there.
//! - Merge the `*.def` overlays shipped in the image: `boot.def` into the
//!   *running* system's `/boot`, `etc.def` and `var.def` into the new root.
//!   Then delete them from the new root.
//! - Assemble the staged root: virtual filesystems, bind mounts of the live
//!   `/boot`, `/root`, `/var` and `/etc`, and the data partition.
//! - Flip and persist the active slot, then regenerate the initramfs and
//!   bootloader configuration chrooted into the staged root.
//! - Unmount everything and point the mount table at the new root.
//!
//! If anything fails after the staging mount, the flip (if it happened) is
//! reverted and the staging tree is unmounted before the original error is
//! returned. Reformatting cannot be undone.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use abupdate_mount::MountSpec;

use crate::compensation::Compensation;
use crate::host::HostOps;
use crate::slots::{SlotConfig, SLOT_CONFIG_PATH};
use crate::{fsops, fstab, partition, UpdateError};

/// Where the new root is assembled.
pub const STAGING_PATH: &str = "/mnt/.abupdate-next";

/// Directories created in the staged root to mount things on.
const STAGING_DIRS: &[&str] = &[
    "run", "tmp", "proc", "sys", "dev", "data", "boot", "var", "etc", "root",
];

/// (filesystem type, directory in the staged root)
const VIRTUAL_MOUNTS: &[(&str, &str)] = &[
    ("tmpfs", "run"),
    ("tmpfs", "tmp"),
    ("proc", "proc"),
    ("sysfs", "sys"),
    ("devtmpfs", "dev"),
];

/// Live directories bind mounted at the same place in the staged root.
const BIND_MOUNTS: &[&str] = &["boot", "root", "var", "etc"];

/// Filesystem locations used by a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    /// The slot registry
    pub slot_config: Utf8PathBuf,
    /// Mountpoint for the new root
    pub staging: Utf8PathBuf,
    /// Root of the running system
    pub live_root: Utf8PathBuf,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            slot_config: SLOT_CONFIG_PATH.into(),
            staging: STAGING_PATH.into(),
            live_root: "/".into(),
        }
    }
}

impl Layout {
    /// The destination of an overlay.
    pub fn overlay_dest(&self, overlay: &OverlayMerge) -> Utf8PathBuf {
        match overlay.root {
            OverlayRoot::Live => self.live_root.join(overlay.dest),
            OverlayRoot::Staging => self.staging.join(overlay.dest),
        }
    }

    /// The system mount table that gets rewritten on commit.
    pub fn fstab(&self) -> Utf8PathBuf {
        self.live_root.join(fstab::FSTAB_PATH)
    }
}

/// Which tree an overlay is merged into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayRoot {
    /// The running system
    Live,
    /// The new root
    Staging,
}

/// A default tree shipped in the image, merged into place and then removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverlayMerge {
    /// Directory name in the image root
    pub source: &'static str,
    /// Tree holding the destination
    pub root: OverlayRoot,
    /// Destination, relative to `root`
    pub dest: &'static str,
    /// Whether existing non-directory entries are overwritten
    pub replace: bool,
}

/// The overlays, in merge order.
pub const OVERLAYS: [OverlayMerge; 3] = [
    OverlayMerge {
        source: "boot.def",
        root: OverlayRoot::Live,
        dest: "boot",
        replace: true,
    },
    OverlayMerge {
        source: "etc.def",
        root: OverlayRoot::Staging,
        dest: "etc",
        replace: false,
    },
    OverlayMerge {
        source: "var.def",
        root: OverlayRoot::Staging,
        dest: "var",
        replace: false,
    },
];

/// Checkpoints of a transaction, in the order they are reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Nothing done yet
    Start,
    /// The slot registry was read
    ConfigLoaded,
    /// The opposite partition was reformatted
    PartitionInitialized,
    /// Its new identifier was persisted
    ConfigPersisted,
    /// It is mounted at the staging directory
    StagingMounted,
    /// The image was unpacked
    ImageExtracted,
    /// The overlays were merged
    OverlaysMerged,
    /// The overlay sources were deleted
    OverlaysCleaned,
    /// Mountpoints exist in the staged root
    MountPointsPrepared,
    /// Virtual filesystems, binds and the data partition are mounted
    VirtualMountsAttached,
    /// The opposite slot was made active and persisted
    SlotFlipped,
    /// Initramfs and bootloader configuration were regenerated
    BootArtifactsGenerated,
    /// The flip stands and the staging tree was unmounted
    Committed,
    /// A step after the staging mount failed and the compensations ran
    RolledBack,
}

fn advance(state: &mut TransactionState, next: TransactionState) {
    tracing::debug!("Transaction: {state:?} -> {next:?}");
    *state = next;
}

fn mount_staged(host: &dyn HostOps, spec: &MountSpec) -> Result<()> {
    host.mount(spec)
        .context(UpdateError::Mount(spec.target.clone()))
}

/// Install `image` into the inactive slot and switch to it.
///
/// The error returned is always the one from the step that failed; errors
/// while rolling back are only logged. Use `downcast_ref::<UpdateError>()`
/// on it to find out which step that was.
#[context("Installing {image}")]
pub fn replace(host: &dyn HostOps, layout: &Layout, image: &Utf8Path) -> Result<()> {
    let mut state = TransactionState::Start;
    let r = run(host, layout, image, &mut state);
    match &r {
        Ok(()) => tracing::info!("Update installed; reboot to use it"),
        Err(e) => tracing::error!("Update failed ({state:?}): {e:#}"),
    }
    r
}

fn run(
    host: &dyn HostOps,
    layout: &Layout,
    image: &Utf8Path,
    state: &mut TransactionState,
) -> Result<()> {
    let staging = layout.staging.as_path();

    let mut cfg = SlotConfig::read(&layout.slot_config)?;
    advance(state, TransactionState::ConfigLoaded);
    tracing::info!(
        "Active: {} ({}); installing to {} ({})",
        cfg.active(),
        cfg.current(),
        cfg.active().other(),
        cfg.opposite()
    );

    partition::initialize_opposite(host, &mut cfg)?;
    advance(state, TransactionState::PartitionInitialized);
    cfg.write()?;
    advance(state, TransactionState::ConfigPersisted);

    fsops::ensure_dir(staging)?;
    mount_staged(host, &MountSpec::new(cfg.opposite(), staging))?;
    let unmount = Compensation::new(format!("Unmounting {staging}"), move || {
        host.unmount_recursive(staging)
            .context(UpdateError::Unmount(staging.to_owned()))
    });
    advance(state, TransactionState::StagingMounted);

    let previous = cfg.current().to_string();
    if let Err(e) = stage(host, layout, image, &mut cfg, state) {
        // The flip, if any, was already reverted on the way out of `stage`
        drop(unmount);
        advance(state, TransactionState::RolledBack);
        return Err(e);
    }
    unmount.finish()?;
    advance(state, TransactionState::Committed);

    fstab::replace_source(&layout.fstab(), &previous, cfg.current())?;
    cfg.write()?;
    Ok(())
}

/// Everything between mounting the new root and committing: fill it, make
/// it bootable and flip to it. On error the flip is reverted.
fn stage(
    host: &dyn HostOps,
    layout: &Layout,
    image: &Utf8Path,
    cfg: &mut SlotConfig,
    state: &mut TransactionState,
) -> Result<()> {
    let staging = layout.staging.as_path();

    tracing::info!("Extracting {image}");
    host.extract_archive(image, staging)
        .context(UpdateError::ArchiveExtraction(image.to_owned()))?;
    advance(state, TransactionState::ImageExtracted);

    for overlay in &OVERLAYS {
        let to = layout.overlay_dest(overlay);
        tracing::info!("Merging {} into {to}", overlay.source);
        fsops::merge_dir(&to, &staging.join(overlay.source), overlay.replace)?;
    }
    advance(state, TransactionState::OverlaysMerged);
    for overlay in &OVERLAYS {
        fsops::remove_tree(&staging.join(overlay.source))?;
    }
    advance(state, TransactionState::OverlaysCleaned);

    for dir in STAGING_DIRS {
        fsops::ensure_dir(&staging.join(dir))?;
    }
    advance(state, TransactionState::MountPointsPrepared);

    for (fstype, dir) in VIRTUAL_MOUNTS {
        mount_staged(host, &MountSpec::new_virtual(fstype, staging.join(dir)))?;
    }
    for dir in BIND_MOUNTS {
        let live = layout.live_root.join(dir);
        mount_staged(host, &MountSpec::new_bind(&live, staging.join(dir)))?;
    }
    mount_staged(host, &MountSpec::new(&cfg.data, staging.join("data")))?;
    advance(state, TransactionState::VirtualMountsAttached);

    cfg.flip();
    cfg.write()?;
    tracing::info!("Switched to {}", cfg.active());
    let flip_back = Compensation::new("Restoring the active slot", || {
        cfg.flip();
        cfg.write()
    });
    advance(state, TransactionState::SlotFlipped);

    host.generate_boot_artifacts(staging)
        .context(UpdateError::BootArtifactGeneration)?;
    advance(state, TransactionState::BootArtifactsGenerated);

    flip_back.cancel();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::fake::FakeHost;
    use crate::slots::Slot;

    const UUID: &str = "965eb3c7-5a3f-470d-aaa2-1bcf04334bc6";

    struct Fixture {
        _td: tempfile::TempDir,
        layout: Layout,
        image: Utf8PathBuf,
    }

    fn write(path: &Utf8Path, contents: &str) -> Result<()> {
        std::fs::create_dir_all(path.parent().unwrap())?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn fixture() -> Result<Fixture> {
        let td = tempfile::tempdir()?;
        let root = Utf8Path::from_path(td.path()).unwrap().to_owned();
        let layout = Layout {
            slot_config: root.join("partitions"),
            staging: root.join("staging"),
            live_root: root.join("live"),
        };
        std::fs::write(
            &layout.slot_config,
            "ROOT1=/dev/sda1\nROOT2=/dev/sda2\nDATA=/dev/sda3\nCURRENT=1\n",
        )?;
        write(
            &layout.fstab(),
            indoc::indoc! { "
                /dev/sda1 / ext4 rw,relatime 0 1
                /dev/sda3 /data ext4 rw,relatime 0 2
            " },
        )?;
        write(&layout.live_root.join("boot/grub/grub.cfg"), "old")?;

        // The fake host "extracts" an image by copying a directory
        let image = root.join("image");
        write(&image.join("usr/bin/hello"), "hello")?;
        write(&image.join("boot.def/grub/grub.cfg"), "new")?;
        write(&image.join("boot.def/vmlinuz-linux"), "kernel")?;
        write(&image.join("etc.def/hostname"), "archlinux")?;
        write(&image.join("var.def/lib/pacman/local/ALPM_DB_VERSION"), "9")?;

        Ok(Fixture {
            _td: td,
            layout,
            image,
        })
    }

    fn host() -> FakeHost {
        FakeHost {
            uuid: Some(UUID.into()),
            ..FakeHost::with_devices(&[("/dev/sda2", "/dev/sda2")])
        }
    }

    #[test]
    fn test_overlays() {
        let layout = Layout::default();
        let dests = OVERLAYS
            .iter()
            .map(|o| layout.overlay_dest(o).to_string())
            .collect::<Vec<_>>();
        assert_eq!(dests, ["/boot", "/mnt/.abupdate-next/etc", "/mnt/.abupdate-next/var"]);
        assert_eq!(layout.fstab().as_str(), "/etc/fstab");
    }

    #[test]
    fn test_replace() -> Result<()> {
        let f = fixture()?;
        let host = host();
        replace(&host, &f.layout, &f.image)?;

        let cfg = SlotConfig::read(&f.layout.slot_config)?;
        assert_eq!(cfg.active(), Slot::Slot2);
        assert_eq!(cfg.current(), format!("UUID={UUID}"));
        assert_eq!(cfg.opposite(), "/dev/sda1");
        assert_eq!(cfg.data, "/dev/sda3");

        let fstab = std::fs::read_to_string(f.layout.fstab())?;
        assert!(!fstab.contains("/dev/sda1"), "{fstab}");
        assert!(fstab.starts_with(&format!("UUID={UUID} / ext4")), "{fstab}");

        assert!(host.mounted.borrow().is_empty());

        let staging = &f.layout.staging;
        for overlay in &OVERLAYS {
            assert!(!staging.join(overlay.source).try_exists()?);
        }
        for dir in STAGING_DIRS {
            assert!(staging.join(dir).is_dir(), "{dir}");
        }
        assert_eq!(std::fs::read_to_string(staging.join("usr/bin/hello"))?, "hello");
        assert_eq!(std::fs::read_to_string(staging.join("etc/hostname"))?, "archlinux");
        assert!(staging.join("var/lib/pacman/local/ALPM_DB_VERSION").is_file());
        let live_boot = f.layout.live_root.join("boot");
        assert_eq!(std::fs::read_to_string(live_boot.join("grub/grub.cfg"))?, "new");
        assert_eq!(std::fs::read_to_string(live_boot.join("vmlinuz-linux"))?, "kernel");

        let live = &f.layout.live_root;
        let expected = vec![
            "resolve /dev/sda2".to_string(),
            "mkfs /dev/sda2".into(),
            "probe /dev/sda2".into(),
            format!("mount UUID={UUID} on {staging}"),
            format!("extract {}", f.image),
            format!("mount tmpfs on {staging}/run type tmpfs"),
            format!("mount tmpfs on {staging}/tmp type tmpfs"),
            format!("mount proc on {staging}/proc type proc"),
            format!("mount sysfs on {staging}/sys type sysfs"),
            format!("mount devtmpfs on {staging}/dev type devtmpfs"),
            format!("mount {live}/boot on {staging}/boot (bind)"),
            format!("mount {live}/root on {staging}/root (bind)"),
            format!("mount {live}/var on {staging}/var (bind)"),
            format!("mount {live}/etc on {staging}/etc (bind)"),
            format!("mount /dev/sda3 on {staging}/data"),
            format!("boot {staging}"),
            format!("umount -R {staging}"),
        ];
        similar_asserts::assert_eq!(host.calls(), expected);
        Ok(())
    }

    #[test]
    fn test_boot_failure_rolls_back() -> Result<()> {
        let f = fixture()?;
        let host = FakeHost {
            fail_boot: true,
            ..host()
        };
        let e = replace(&host, &f.layout, &f.image).unwrap_err();
        assert_eq!(
            e.downcast_ref::<UpdateError>(),
            Some(&UpdateError::BootArtifactGeneration)
        );
        assert!(format!("{e:#}").contains("mkinitcpio failed"), "{e:#}");

        let cfg = SlotConfig::read(&f.layout.slot_config)?;
        assert_eq!(cfg.active(), Slot::Slot1);
        assert_eq!(cfg.current(), "/dev/sda1");
        // The reformatted partition keeps its new identifier
        assert_eq!(cfg.opposite(), format!("UUID={UUID}"));

        assert!(host.mounted.borrow().is_empty());
        let calls = host.calls();
        assert_eq!(
            calls.last().map(|s| s.as_str()),
            Some(format!("umount -R {}", f.layout.staging).as_str())
        );
        // The mount table is only touched on success
        assert!(std::fs::read_to_string(f.layout.fstab())?.contains("/dev/sda1"));
        Ok(())
    }

    #[test]
    fn test_rollback_failure_keeps_original_error() -> Result<()> {
        let f = fixture()?;
        let host = FakeHost {
            fail_boot: true,
            fail_unmount: true,
            clobber_on_boot: Some(f.layout.slot_config.clone()),
            ..host()
        };
        let e = replace(&host, &f.layout, &f.image).unwrap_err();
        assert_eq!(
            e.downcast_ref::<UpdateError>(),
            Some(&UpdateError::BootArtifactGeneration)
        );
        let msg = format!("{e:#}");
        assert!(msg.contains("mkinitcpio failed"), "{msg}");
        assert!(!msg.contains("busy"), "{msg}");
        // Both compensations were attempted
        assert_eq!(
            host.calls().last().map(|s| s.as_str()),
            Some(format!("umount -R {}", f.layout.staging).as_str())
        );
        assert!(!host.mounted.borrow().is_empty());
        Ok(())
    }

    #[test]
    fn test_unmount_failure_on_commit() -> Result<()> {
        let f = fixture()?;
        let host = FakeHost {
            fail_unmount: true,
            ..host()
        };
        let e = replace(&host, &f.layout, &f.image).unwrap_err();
        assert_eq!(
            e.downcast_ref::<UpdateError>(),
            Some(&UpdateError::Unmount(f.layout.staging.clone()))
        );
        // The flip stands, the mount table is left alone
        assert_eq!(
            SlotConfig::read(&f.layout.slot_config)?.active(),
            Slot::Slot2
        );
        assert!(std::fs::read_to_string(f.layout.fstab())?.starts_with("/dev/sda1 "));
        Ok(())
    }

    #[test]
    fn test_states() -> Result<()> {
        let f = fixture()?;
        let mut state = TransactionState::Start;
        run(&host(), &f.layout, &f.image, &mut state)?;
        assert_eq!(state, TransactionState::Committed);

        let f = fixture()?;
        let host = FakeHost {
            fail_boot: true,
            ..host()
        };
        let mut state = TransactionState::Start;
        run(&host, &f.layout, &f.image, &mut state).unwrap_err();
        assert_eq!(state, TransactionState::RolledBack);
        assert!(host.mounted.borrow().is_empty());

        // Nothing to roll back before the staging mount
        let f = fixture()?;
        let mut state = TransactionState::Start;
        run(&FakeHost::default(), &f.layout, &f.image, &mut state).unwrap_err();
        assert_eq!(state, TransactionState::ConfigLoaded);
        Ok(())
    }

    #[test]
    fn test_extract_failure_unmounts() -> Result<()> {
        let f = fixture()?;
        let host = host();
        let missing = f.image.with_file_name("missing.tar");
        let e = replace(&host, &f.layout, &missing).unwrap_err();
        assert_eq!(
            e.downcast_ref::<UpdateError>(),
            Some(&UpdateError::ArchiveExtraction(missing))
        );
        assert_eq!(
            SlotConfig::read(&f.layout.slot_config)?.active(),
            Slot::Slot1
        );
        assert!(host.mounted.borrow().is_empty());
        assert!(!host.calls().iter().any(|c| c.starts_with("boot ")));
        Ok(())
    }

    #[test]
    fn test_device_not_found() -> Result<()> {
        let f = fixture()?;
        let host = FakeHost::default();
        let before = std::fs::read_to_string(&f.layout.slot_config)?;
        let e = replace(&host, &f.layout, &f.image).unwrap_err();
        assert_eq!(
            e.downcast_ref::<UpdateError>(),
            Some(&UpdateError::DeviceNotFound("/dev/sda2".into()))
        );
        assert_eq!(host.calls(), ["resolve /dev/sda2"]);
        assert_eq!(std::fs::read_to_string(&f.layout.slot_config)?, before);
        assert!(!f.layout.staging.try_exists()?);
        Ok(())
    }
}

//! The kinds of failure an update transaction can report.
//!
//! These are attached as [`anyhow::Context`] to the underlying error, so the
//! full chain is preserved for display while callers can still classify a
//! failure with `err.downcast_ref::<UpdateError>()`. The outermost kind wins.

use camino::Utf8PathBuf;

/// Classification of a failed update step.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpdateError {
    /// The slot configuration could not be read or is malformed.
    #[error("Reading slot configuration {0}")]
    ConfigRead(Utf8PathBuf),
    /// The slot configuration could not be written.
    #[error("Writing slot configuration {0}")]
    ConfigWrite(Utf8PathBuf),
    /// The opposite slot's identifier does not resolve to any device.
    #[error("No such partition: {0}")]
    DeviceNotFound(String),
    /// Creating the new filesystem failed.
    #[error("Formatting {0}")]
    Format(Utf8PathBuf),
    /// A mount failed; carries the mount target.
    #[error("Mounting {0}")]
    Mount(Utf8PathBuf),
    /// Tearing down the staging mounts failed.
    #[error("Unmounting {0}")]
    Unmount(Utf8PathBuf),
    /// Unpacking the OS image failed.
    #[error("Extracting {0}")]
    ArchiveExtraction(Utf8PathBuf),
    /// Copying, merging or deleting a tree failed.
    #[error("Merging {from} into {to}")]
    Merge {
        /// Source tree
        from: Utf8PathBuf,
        /// Destination tree
        to: Utf8PathBuf,
    },
    /// Removing a tree failed.
    #[error("Removing {0}")]
    Remove(Utf8PathBuf),
    /// Creating a directory needed for the staged root failed.
    #[error("Preparing {0}")]
    StagingSetup(Utf8PathBuf),
    /// Regenerating the initramfs or bootloader configuration failed.
    #[error("Generating boot artifacts")]
    BootArtifactGeneration,
    /// Rewriting the system mount table failed.
    #[error("Updating mount table {0}")]
    MountTable(Utf8PathBuf),
}

//! Recursive copy, merge and delete of directory trees.
//!
//! Everything here is built on [`walk`], a depth-first traversal with a hook
//! before and after each entry. All access below the starting point goes
//! through open directory handles: symlinks are never followed into
//! subdirectories, so a link planted in a tree cannot redirect a copy or a
//! deletion somewhere else. The traversal is recursive, so stack usage is
//! proportional to the depth of the tree; OS image trees are shallow enough
//! for that to be fine. File names must be valid UTF-8.

use std::io::ErrorKind;

use anyhow::{anyhow, Context, Result};
use camino::Utf8Path;
use cap_std::fs::{Dir, DirBuilder, DirBuilderExt as _, Metadata, MetadataExt};
use cap_fs_ext::DirExt as _;
use cap_std_ext::cap_std;
use cap_std_ext::dirext::CapStdExtDirExt;
use rustix::fs::{AtFlags, Gid, Mode, Uid};

use crate::UpdateError;

/// Permission bits of a `st_mode`, without the file type.
const PERMS_MASK: u32 = 0o7777;

/// An entry visited by [`walk`].
#[derive(Debug)]
pub struct WalkEntry<'a> {
    /// The directory holding the entry
    pub parent: &'a Dir,
    /// Name of the entry in `parent`
    pub name: &'a str,
    /// Path relative to where the walk started, including the prefix
    pub rel: &'a str,
    /// The entry's own (not followed) metadata
    pub meta: &'a Metadata,
}

impl WalkEntry<'_> {
    /// How to refer to the entry in messages.
    fn path(&self) -> &str {
        if self.rel.is_empty() {
            self.name
        } else {
            self.rel
        }
    }
}

/// A hook that does nothing, for walks that only need one side.
fn noop(_: &WalkEntry) -> Result<()> {
    Ok(())
}

/// Join a relative path with a single `/`.
fn join_rel(rel: &str, name: &str) -> String {
    if rel.is_empty() {
        name.to_string()
    } else if rel.ends_with('/') {
        format!("{rel}{name}")
    } else {
        format!("{rel}/{name}")
    }
}

/// Open the directory holding `path` and return it with the final component.
fn open_parent(path: &Utf8Path) -> Result<(Dir, &str)> {
    let name = path
        .file_name()
        .ok_or_else(|| anyhow!("{path} has no file name"))?;
    let parent = match path.parent() {
        Some(p) if !p.as_str().is_empty() => p,
        _ => Utf8Path::new("."),
    };
    let dir = Dir::open_ambient_dir(parent, cap_std::ambient_authority())
        .with_context(|| format!("Opening {parent}"))?;
    Ok((dir, name))
}

/// Visit `name` in `parent` and, if it is a directory, everything beneath it.
///
/// `on_enter` runs before an entry's children and `on_exit` after them; for
/// anything but a directory the two run back to back. The starting entry
/// gets `rel` as its relative path and its children are joined onto it.
/// Children are visited in name order. Directories are opened without
/// following symlinks, so a symlink is always a leaf. The first hook error
/// stops the walk and is returned; whatever was already done is left as is.
pub fn walk<E, X>(
    parent: &Dir,
    name: &str,
    rel: &str,
    on_enter: &mut E,
    on_exit: &mut X,
) -> Result<()>
where
    E: FnMut(&WalkEntry) -> Result<()>,
    X: FnMut(&WalkEntry) -> Result<()>,
{
    let shown = if rel.is_empty() { name } else { rel };
    let meta = parent
        .symlink_metadata(name)
        .with_context(|| format!("Querying {shown}"))?;
    let entry = WalkEntry {
        parent,
        name,
        rel,
        meta: &meta,
    };
    on_enter(&entry)?;
    if meta.is_dir() {
        let dir = parent
            .open_dir_nofollow(name)
            .with_context(|| format!("Opening directory {shown}"))?;
        let mut names = Vec::new();
        for child in dir
            .entries()
            .with_context(|| format!("Reading directory {shown}"))?
        {
            let child = child.with_context(|| format!("Reading directory {shown}"))?;
            let child = child
                .file_name()
                .into_string()
                .map_err(|n| anyhow!("Invalid UTF-8 file name {n:?} in {shown}"))?;
            names.push(child);
        }
        names.sort();
        for child in &names {
            walk(&dir, child, &join_rel(rel, child), on_enter, on_exit)?;
        }
    }
    on_exit(&entry)
}

fn copy_owner(dir: &Dir, name: &str, meta: &Metadata) -> Result<()> {
    rustix::fs::chownat(
        dir,
        name,
        Some(Uid::from_raw(meta.uid())),
        Some(Gid::from_raw(meta.gid())),
        AtFlags::SYMLINK_NOFOLLOW,
    )
    .with_context(|| format!("Changing owner of {name}"))
}

/// Apply the ownership and then the permission bits of `meta` to `name`,
/// which must not be a symlink.
fn copy_owner_and_mode(dir: &Dir, name: &str, meta: &Metadata) -> Result<()> {
    copy_owner(dir, name, meta)?;
    let mode = Mode::from_raw_mode(meta.mode() & PERMS_MASK);
    rustix::fs::chmodat(dir, name, mode, AtFlags::empty())
        .with_context(|| format!("Changing mode of {name}"))
}

/// Copy the single entry `src` to `name` in `to`.
///
/// Directories are created (not recursively, and an existing one is fine)
/// with the source mode and owner. Regular files are copied in full, then
/// get the source owner and mode. Symlinks are recreated with the same
/// target and nothing else. Other file types are skipped.
pub fn copy_entry(src: &WalkEntry, to: &Dir, name: &str) -> Result<()> {
    let ft = src.meta.file_type();
    if ft.is_dir() {
        let mut db = DirBuilder::new();
        db.mode(src.meta.mode() & PERMS_MASK);
        match to.create_dir_with(name, &db) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e).with_context(|| format!("Creating directory {name}")),
        }
        copy_owner(to, name, src.meta)?;
    } else if ft.is_file() {
        let buf = src
            .parent
            .read(src.name)
            .with_context(|| format!("Reading {}", src.path()))?;
        to.write(name, buf)
            .with_context(|| format!("Writing {name}"))?;
        copy_owner_and_mode(to, name, src.meta)?;
    } else if ft.is_symlink() {
        let target = src
            .parent
            .read_link_contents(src.name)
            .with_context(|| format!("Reading link {}", src.path()))?;
        to.symlink_contents(&target, name)
            .with_context(|| format!("Creating symlink {name}"))?;
    } else {
        tracing::debug!("Skipping special file {}", src.path());
    }
    Ok(())
}

fn merge_entry(src: &WalkEntry, to: &Dir, name: &str, replace: bool) -> Result<()> {
    let Some(existing) = to
        .symlink_metadata_optional(name)
        .with_context(|| format!("Querying {name}"))?
    else {
        return copy_entry(src, to, name);
    };
    let ft = existing.file_type();
    if ft.is_symlink() {
        tracing::trace!("Leaving symlink {} untouched", src.path());
        return Ok(());
    }
    if ft.is_dir() || !replace {
        // A symlink source has no mode or owner of its own to hand on
        if src.meta.file_type().is_symlink() {
            return Ok(());
        }
        return copy_owner_and_mode(to, name, src.meta);
    }
    to.remove_file(name)
        .with_context(|| format!("Removing {name}"))?;
    copy_entry(src, to, name)
}

/// Open `name` in `dir` for merging into, if it is a real directory.
fn open_merge_target(dir: &Dir, name: &str) -> Result<Option<Dir>> {
    match dir.symlink_metadata_optional(name)? {
        Some(m) if m.is_dir() => Ok(Some(dir.open_dir_nofollow(name)?)),
        _ => Ok(None),
    }
}

fn merge_dir_impl(to: &Utf8Path, from: &Utf8Path, replace: bool) -> Result<()> {
    let (from_parent, from_name) = open_parent(from)?;
    let (to_parent, to_name) = open_parent(to)?;
    // Destination directory for each depth of the walk; `None` below
    // anything that is not a real directory in the destination.
    let mut dests = vec![Some(to_parent)];
    let mut on_enter = |src: &WalkEntry<'_>| -> Result<()> {
        let depth = if src.rel.is_empty() {
            0
        } else {
            src.rel.split('/').count()
        };
        dests.truncate(depth + 1);
        let target = match dests.get(depth) {
            Some(Some(dir)) => {
                let name = if depth == 0 { to_name } else { src.name };
                merge_entry(src, dir, name, replace)?;
                if src.meta.is_dir() {
                    open_merge_target(dir, name)
                        .with_context(|| format!("Opening {}", src.path()))?
                } else {
                    None
                }
            }
            _ => {
                tracing::debug!("Skipping {}: no directory to merge into", src.path());
                None
            }
        };
        if src.meta.is_dir() {
            dests.push(target);
        }
        Ok(())
    };
    walk(&from_parent, from_name, "", &mut on_enter, &mut noop)
}

/// Merge the tree at `from` into the tree at `to`.
///
/// Entries missing from `to` are copied. Existing directories, and every
/// existing entry when `replace` is false, keep their contents and only take
/// the owner and mode of the source. With `replace`, other existing entries
/// are deleted and copied over. Symlinks in `to` are never modified, and
/// nothing is merged through them.
pub fn merge_dir(to: &Utf8Path, from: &Utf8Path, replace: bool) -> Result<()> {
    tracing::debug!("Merging {from} into {to} (replace: {replace})");
    merge_dir_impl(to, from, replace).context(UpdateError::Merge {
        from: from.to_owned(),
        to: to.to_owned(),
    })
}

fn remove_tree_impl(path: &Utf8Path) -> Result<()> {
    let (parent, name) = open_parent(path)?;
    walk(&parent, name, "", &mut noop, &mut |e: &WalkEntry| {
        if e.meta.is_dir() {
            e.parent.remove_dir(e.name)
        } else {
            e.parent.remove_file(e.name)
        }
        .with_context(|| format!("Removing {}", e.path()))
    })
}

/// Delete `dir` and everything beneath it, children before parents.
/// Stops at the first entry that cannot be removed.
pub fn remove_tree(dir: &Utf8Path) -> Result<()> {
    tracing::debug!("Removing {dir}");
    remove_tree_impl(dir).context(UpdateError::Remove(dir.to_owned()))
}

/// Create `path` as a directory unless one is already there.
pub(crate) fn ensure_dir(path: &Utf8Path) -> Result<()> {
    if path.is_dir() {
        return Ok(());
    }
    std::fs::create_dir(path)
        .with_context(|| format!("Creating {path}"))
        .context(UpdateError::StagingSetup(path.to_owned()))
}

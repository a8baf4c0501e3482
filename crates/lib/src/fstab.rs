//! Rewriting the device identifiers in the mount table.

use anyhow::{Context, Result};
use camino::Utf8Path;

use crate::UpdateError;

/// Relative to the live root.
pub const FSTAB_PATH: &str = "etc/fstab";

/// Replace the device column of every entry whose device is exactly `old`.
/// Comments and all other columns are kept as they are.
fn substitute(buf: &str, old: &str, new: &str) -> String {
    let mut r = String::with_capacity(buf.len());
    for line in buf.split_inclusive('\n') {
        let body = line.trim_start();
        let indent = &line[..line.len() - body.len()];
        let end = body.find(char::is_whitespace).unwrap_or(body.len());
        let (source, rest) = body.split_at(end);
        if source == old && !source.starts_with('#') {
            r.push_str(indent);
            r.push_str(new);
            r.push_str(rest);
        } else {
            r.push_str(line);
        }
    }
    r
}

/// Point the entries for device `old` in the mount table at `path` to
/// `new`, in place.
pub fn replace_source(path: &Utf8Path, old: &str, new: &str) -> Result<()> {
    let run = || -> Result<()> {
        let buf = std::fs::read_to_string(path).with_context(|| format!("Reading {path}"))?;
        let updated = substitute(&buf, old, new);
        if updated == buf {
            tracing::warn!("{old} not found in {path}");
            return Ok(());
        }
        std::fs::write(path, updated).with_context(|| format!("Writing {path}"))?;
        tracing::debug!("Replaced {old} with {new} in {path}");
        Ok(())
    };
    run().context(UpdateError::MountTable(path.to_owned()))
}

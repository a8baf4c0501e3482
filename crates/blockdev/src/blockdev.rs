use std::process::Command;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use abupdate_utils::{CommandError, CommandRunExt};

/// The filesystem type every root slot is formatted with.
pub const ROOT_FSTYPE: &str = "ext4";

/// Tags understood by `findfs` and `mount` in place of a device path.
const SPEC_TAGS: &[&str] = &["UUID", "LABEL", "PARTUUID", "PARTLABEL"];

/// Split a `TAG=value` partition spec, e.g. `UUID=1234-abcd`.
/// Returns `None` for anything else, such as a plain device path.
pub fn split_tag(spec: &str) -> Option<(&str, &str)> {
    let (tag, value) = spec.split_once('=')?;
    if value.is_empty() {
        return None;
    }
    SPEC_TAGS
        .iter()
        .find(|t| t.eq_ignore_ascii_case(tag))
        .map(|t| (*t, value))
}

/// Resolve a partition spec (raw path or `TAG=value`) to a device node.
/// Returns `None` if nothing matches.
#[context("Resolving device {spec}")]
pub fn resolve_device(spec: &str) -> Result<Option<Utf8PathBuf>> {
    if let Some((tag, value)) = split_tag(spec) {
        let r = Command::new("findfs")
            .arg(format!("{tag}={value}"))
            .log_debug()
            .run_get_string();
        return match r {
            Ok(dev) => Ok(parse_probe_value(&dev).map(Utf8PathBuf::from)),
            // findfs exits nonzero when there is no match
            Err(e)
                if matches!(
                    e.downcast_ref::<CommandError>(),
                    Some(CommandError::Failed { .. })
                ) =>
            {
                tracing::debug!("findfs found nothing for {spec}: {e:#}");
                Ok(None)
            }
            Err(e) => Err(e),
        };
    }
    let path = Utf8Path::new(spec);
    if spec.is_empty() || !path.try_exists()? {
        return Ok(None);
    }
    // Follow e.g. /dev/disk/by-id symlinks to the real node
    let dev = path
        .canonicalize_utf8()
        .with_context(|| format!("Canonicalizing {path}"))?;
    Ok(Some(dev))
}

/// Create a fresh [`ROOT_FSTYPE`] filesystem on the given device, destroying
/// whatever was there before.
#[context("Creating filesystem on {dev}")]
pub fn mkfs(dev: &Utf8Path) -> Result<()> {
    Command::new(format!("mkfs.{ROOT_FSTYPE}"))
        .args(["-q", "-F"])
        .arg(dev.as_str())
        .log_debug()
        .run_capture_stderr()
}

/// Probe the device directly (bypassing the blkid cache, which is stale right
/// after `mkfs`) for its filesystem UUID.
#[context("Probing filesystem UUID of {dev}")]
pub fn probe_fs_uuid(dev: &Utf8Path) -> Result<Option<String>> {
    let r = Command::new("blkid")
        .args(["-p", "-s", "UUID", "-o", "value"])
        .arg(dev.as_str())
        .log_debug()
        .run_get_string();
    match r {
        Ok(out) => Ok(parse_probe_value(&out)),
        // blkid exits 2 when nothing could be identified
        Err(e) => match e.downcast_ref::<CommandError>() {
            Some(c) if c.exit_code() == Some(2) => Ok(None),
            _ => Err(e),
        },
    }
}

/// Take the first non-empty line of tool output.
fn parse_probe_value(out: &str) -> Option<String> {
    out.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(ToOwned::to_owned)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_split_tag() {
        assert_eq!(
            split_tag("UUID=965eb3c7-5a3f-470d-aaa2-1bcf04334bc6"),
            Some(("UUID", "965eb3c7-5a3f-470d-aaa2-1bcf04334bc6"))
        );
        assert_eq!(split_tag("label=root"), Some(("LABEL", "root")));
        assert_eq!(split_tag("PARTUUID=abcd"), Some(("PARTUUID", "abcd")));
        for v in ["/dev/sda1", "", "UUID=", "FOO=bar", "/dev/disk/by-label/a=b"] {
            assert_eq!(split_tag(v), None, "{v}");
        }
    }

    #[test]
    fn test_parse_probe_value() {
        assert_eq!(
            parse_probe_value("f7436547-20ac-43cb-aa2f-eac9632183f6\n").as_deref(),
            Some("f7436547-20ac-43cb-aa2f-eac9632183f6")
        );
        assert_eq!(parse_probe_value("\n  /dev/vda4 \n").as_deref(), Some("/dev/vda4"));
        assert_eq!(parse_probe_value(""), None);
        assert_eq!(parse_probe_value(" \n\n"), None);
    }

    #[test]
    fn test_resolve_plain_path() -> Result<()> {
        let td = tempfile::tempdir()?;
        let root = Utf8Path::from_path(td.path()).unwrap();
        let node = root.join("fakedev");
        std::fs::write(&node, b"")?;
        let link = root.join("by-label");
        std::os::unix::fs::symlink(&node, &link)?;

        let resolved = resolve_device(link.as_str())?.unwrap();
        assert_eq!(resolved, node.canonicalize_utf8()?);
        assert!(resolve_device(root.join("missing").as_str())?.is_none());
        assert!(resolve_device("")?.is_none());
        Ok(())
    }
}

//! Re-initialization of the inactive root partition.

use anyhow::{Context, Result};

use crate::host::HostOps;
use crate::slots::SlotConfig;
use crate::UpdateError;

/// Format the opposite slot's partition and record its new identifier.
///
/// Resolving the device is the last point at which nothing has been
/// changed; once the filesystem is created the old contents are gone. The
/// opposite root is then identified by `UUID=<uuid>` of the new filesystem,
/// or by the raw device path if no UUID can be probed. The caller is
/// responsible for persisting `cfg`.
pub fn initialize_opposite(host: &dyn HostOps, cfg: &mut SlotConfig) -> Result<()> {
    let spec = cfg.opposite().to_string();
    let dev = host
        .resolve_device(&spec)
        .and_then(|dev| dev.ok_or_else(|| anyhow::anyhow!("Failed to resolve {spec}")))
        .context(UpdateError::DeviceNotFound(spec.clone()))?;
    tracing::info!("Formatting {} ({dev})", cfg.active().other());
    host.mkfs(&dev).context(UpdateError::Format(dev.clone()))?;

    let ident = match host.probe_uuid(&dev) {
        Ok(Some(uuid)) => format!("UUID={uuid}"),
        Ok(None) => {
            tracing::debug!("No filesystem UUID on {dev}");
            dev.to_string()
        }
        Err(e) => {
            tracing::warn!("Probing {dev}: {e:#}");
            dev.to_string()
        }
    };
    tracing::info!("Opposite root is now {ident}");
    *cfg.opposite_mut() = ident;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::fake::FakeHost;
    use crate::slots::Slot;

    const UUID: &str = "965eb3c7-5a3f-470d-aaa2-1bcf04334bc6";

    fn fixture() -> SlotConfig {
        SlotConfig::new(
            "/nonexistent",
            "/dev/sda1",
            "LABEL=root-b",
            "/dev/sda3",
            Slot::Slot1,
        )
    }

    #[test]
    fn test_uuid_identifier() -> Result<()> {
        let host = FakeHost {
            uuid: Some(UUID.into()),
            ..FakeHost::with_devices(&[("LABEL=root-b", "/dev/sda2")])
        };
        let mut cfg = fixture();
        initialize_opposite(&host, &mut cfg)?;
        assert_eq!(cfg.opposite(), format!("UUID={UUID}"));
        assert_eq!(cfg.current(), "/dev/sda1");
        assert_eq!(cfg.active(), Slot::Slot1);
        assert_eq!(
            host.calls(),
            ["resolve LABEL=root-b", "mkfs /dev/sda2", "probe /dev/sda2"]
        );
        Ok(())
    }

    #[test]
    fn test_raw_path_fallback() -> Result<()> {
        let host = FakeHost::with_devices(&[("LABEL=root-b", "/dev/sda2")]);
        let mut cfg = fixture();
        initialize_opposite(&host, &mut cfg)?;
        assert_eq!(cfg.opposite(), "/dev/sda2");
        Ok(())
    }

    #[test]
    fn test_device_not_found() {
        let host = FakeHost::default();
        let mut cfg = fixture();
        let e = initialize_opposite(&host, &mut cfg).unwrap_err();
        assert_eq!(
            e.downcast_ref::<UpdateError>(),
            Some(&UpdateError::DeviceNotFound("LABEL=root-b".into()))
        );
        // Nothing was formatted
        assert_eq!(host.calls(), ["resolve LABEL=root-b"]);
        assert_eq!(cfg, fixture());
    }

    #[test]
    fn test_format_failure() {
        let host = FakeHost {
            fail_mkfs: true,
            ..FakeHost::with_devices(&[("LABEL=root-b", "/dev/sda2")])
        };
        let mut cfg = fixture();
        let e = initialize_opposite(&host, &mut cfg).unwrap_err();
        assert_eq!(
            e.downcast_ref::<UpdateError>(),
            Some(&UpdateError::Format("/dev/sda2".into()))
        );
        assert_eq!(cfg, fixture());
    }
}

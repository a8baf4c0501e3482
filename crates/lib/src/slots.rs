//! The persisted registry of the two root slots.
//!
//! On disk this is a small `KEY=value` file:
//!
//! ```text
//! ROOT1=/dev/sda1
//! ROOT2=UUID=965eb3c7-5a3f-470d-aaa2-1bcf04334bc6
//! DATA=/dev/sda3
//! CURRENT=1
//! ```
//!
//! Every field is read on load and every field is rewritten on save.

use std::fmt::Display;
use std::io::Write;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::Serialize;

use crate::kv::KeyValues;
use crate::UpdateError;

/// Default location of the slot registry; it lives on the data partition
/// shared by both slots.
pub const SLOT_CONFIG_PATH: &str = "/data/partitions";

const KEY_ROOT1: &str = "ROOT1";
const KEY_ROOT2: &str = "ROOT2";
const KEY_DATA: &str = "DATA";
const KEY_CURRENT: &str = "CURRENT";

/// One of the two root slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Slot {
    /// The first root partition (`ROOT1`)
    Slot1,
    /// The second root partition (`ROOT2`)
    Slot2,
}

impl Slot {
    /// The other slot.
    pub fn other(self) -> Self {
        match self {
            Slot::Slot1 => Slot::Slot2,
            Slot::Slot2 => Slot::Slot1,
        }
    }

    fn index(self) -> usize {
        match self {
            Slot::Slot1 => 0,
            Slot::Slot2 => 1,
        }
    }

    /// The value stored under `CURRENT`.
    fn as_persisted(self) -> &'static str {
        match self {
            Slot::Slot1 => "1",
            Slot::Slot2 => "2",
        }
    }
}

impl FromStr for Slot {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "1" => Ok(Slot::Slot1),
            "2" => Ok(Slot::Slot2),
            o => Err(anyhow!("Invalid slot {o:?}, expected 1 or 2")),
        }
    }
}

impl Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "slot {}", self.as_persisted())
    }
}

/// In-memory copy of the slot registry, bound to the file it was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotConfig {
    path: Utf8PathBuf,
    roots: [String; 2],
    /// Identifier of the shared data partition
    pub data: String,
    active: Slot,
}

/// A snapshot of the registry for display.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotStatus<'a> {
    /// The slot the running system booted from
    pub active: Slot,
    /// Identifier of the active root
    pub current: &'a str,
    /// Identifier of the root the next update will be installed to
    pub opposite: &'a str,
    /// Identifier of the data partition
    pub data: &'a str,
}

impl SlotConfig {
    /// Construct a registry that has not been persisted yet.
    pub fn new(
        path: impl Into<Utf8PathBuf>,
        root1: &str,
        root2: &str,
        data: &str,
        active: Slot,
    ) -> Self {
        Self {
            path: path.into(),
            roots: [root1.to_string(), root2.to_string()],
            data: data.to_string(),
            active,
        }
    }

    /// Load the registry. All four keys are required and `CURRENT` must be
    /// `1` or `2`.
    pub fn read(path: impl AsRef<Utf8Path>) -> Result<Self> {
        let path = path.as_ref();
        Self::read_impl(path).context(UpdateError::ConfigRead(path.to_owned()))
    }

    fn read_impl(path: &Utf8Path) -> Result<Self> {
        let buf = std::fs::read_to_string(path).with_context(|| format!("Opening {path}"))?;
        let kv = KeyValues::parse(&buf)?;
        let active = kv.require(KEY_CURRENT)?.parse()?;
        Ok(Self::new(
            path,
            kv.require(KEY_ROOT1)?,
            kv.require(KEY_ROOT2)?,
            kv.require(KEY_DATA)?,
            active,
        ))
    }

    /// Serialize every field, replacing the file wholesale.
    pub fn write(&self) -> Result<()> {
        std::fs::write(&self.path, self.serialize())
            .with_context(|| format!("Writing {}", self.path))
            .context(UpdateError::ConfigWrite(self.path.clone()))?;
        tracing::debug!("Wrote {}: active {}", self.path, self.active);
        Ok(())
    }

    fn serialize(&self) -> String {
        format!(
            "{KEY_ROOT1}={}\n{KEY_ROOT2}={}\n{KEY_DATA}={}\n{KEY_CURRENT}={}\n",
            self.roots[0],
            self.roots[1],
            self.data,
            self.active.as_persisted()
        )
    }

    /// The file this registry is persisted to.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// The active slot.
    pub fn active(&self) -> Slot {
        self.active
    }

    /// The identifier of the given slot's root partition.
    pub fn root(&self, slot: Slot) -> &str {
        &self.roots[slot.index()]
    }

    /// The identifier of the active root.
    pub fn current(&self) -> &str {
        self.root(self.active)
    }

    /// The identifier of the inactive root.
    pub fn opposite(&self) -> &str {
        self.root(self.active.other())
    }

    /// Mutable access to the identifier of the active root.
    pub fn current_mut(&mut self) -> &mut String {
        &mut self.roots[self.active.index()]
    }

    /// Mutable access to the identifier of the inactive root.
    pub fn opposite_mut(&mut self) -> &mut String {
        &mut self.roots[self.active.other().index()]
    }

    /// Make the opposite slot the active one. Applying this twice is a no-op.
    pub fn flip(&mut self) {
        self.active = self.active.other();
    }

    /// A serializable view of the registry.
    pub fn status(&self) -> SlotStatus<'_> {
        SlotStatus {
            active: self.active,
            current: self.current(),
            opposite: self.opposite(),
            data: &self.data,
        }
    }
}

/// Load and print the registry, for the `status` command.
#[context("Querying slot status")]
pub(crate) fn print_status(path: &Utf8Path, json: bool) -> Result<()> {
    let cfg = SlotConfig::read(path)?;
    let status = cfg.status();
    let mut out = std::io::stdout().lock();
    if json {
        serde_json::to_writer_pretty(&mut out, &status)?;
        writeln!(out)?;
    } else {
        writeln!(out, "Active:   {}", status.active)?;
        writeln!(out, "Current:  {}", status.current)?;
        writeln!(out, "Opposite: {}", status.opposite)?;
        writeln!(out, "Data:     {}", status.data)?;
    }
    Ok(())
}

//! Reader for the simple `KEY=value` files used for both the agent
//! configuration and the slot registry.

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};

/// Parsed `KEY=value` pairs.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct KeyValues(BTreeMap<String, String>);

impl KeyValues {
    /// Parse the file contents. Blank lines and lines starting with `#` are
    /// ignored; whitespace around keys and values is trimmed and a value may
    /// be wrapped in double quotes. A later duplicate key overrides an
    /// earlier one.
    pub(crate) fn parse(s: &str) -> Result<Self> {
        let mut r = BTreeMap::new();
        for (i, line) in s.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (k, v) = line
                .split_once('=')
                .ok_or_else(|| anyhow!("Line {}: expected KEY=value, found {line:?}", i + 1))?;
            let v = v.trim();
            let v = v
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(v);
            r.insert(k.trim().to_string(), v.to_string());
        }
        Ok(Self(r))
    }

    pub(crate) fn get(&self, k: &str) -> Option<&str> {
        self.0.get(k).map(|s| s.as_str())
    }

    /// Look up a key that must be present and non-empty.
    pub(crate) fn require(&self, k: &str) -> Result<&str> {
        match self.get(k) {
            Some(v) if !v.is_empty() => Ok(v),
            Some(_) => Err(anyhow!("Empty value for key {k}")),
            None => Err(anyhow!("Missing key {k}")),
        }
    }
}

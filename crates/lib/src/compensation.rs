//! Undo actions that run unless explicitly dismissed.
//!
//! A [`Compensation`] is created right after a step that needs undoing on
//! failure. If the transaction bails out with `?`, dropping the guard runs
//! the action. On success the caller either [`Compensation::cancel`]s it (the
//! step stands) or [`Compensation::finish`]es it (the undo is also the normal
//! cleanup, and its failure matters).

use anyhow::{Context, Result};

type Action<'a> = Box<dyn FnOnce() -> Result<()> + 'a>;

/// A pending compensating action.
#[must_use = "dropping a Compensation runs its action immediately"]
pub struct Compensation<'a> {
    label: String,
    action: Option<Action<'a>>,
}

impl std::fmt::Debug for Compensation<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compensation")
            .field("label", &self.label)
            .field("armed", &self.action.is_some())
            .finish()
    }
}

impl<'a> Compensation<'a> {
    /// Arm a new compensation.
    pub fn new(label: impl Into<String>, action: impl FnOnce() -> Result<()> + 'a) -> Self {
        let label = label.into();
        tracing::trace!("Armed compensation: {label}");
        Self {
            label,
            action: Some(Box::new(action)),
        }
    }

    /// Dismiss the action without running it.
    pub fn cancel(mut self) {
        tracing::trace!("Cancelled compensation: {}", self.label);
        self.action.take();
    }

    /// Run the action now and return its result.
    pub fn finish(mut self) -> Result<()> {
        match self.action.take() {
            Some(action) => action().with_context(|| self.label.clone()),
            None => Ok(()),
        }
    }
}

impl Drop for Compensation<'_> {
    fn drop(&mut self) {
        if let Some(action) = self.action.take() {
            tracing::info!("Rolling back: {}", self.label);
            if let Err(e) = action() {
                tracing::warn!("{}: {e:#}", self.label);
            }
        }
    }
}

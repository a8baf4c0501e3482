//! # A/B root slot update agent
//!
//! The machine has two root partitions. One is running; the other receives
//! the next OS image, which is unpacked, completed with the default
//! configuration trees it ships, and made bootable before the active slot
//! is flipped. A failure before the flip leaves the running slot active.

pub mod cli;
pub mod compensation;
mod error;
pub mod fsops;
pub mod fstab;
pub mod host;
mod kv;
pub mod partition;
pub mod replace;
pub mod slots;
pub mod update;

pub use error::UpdateError;

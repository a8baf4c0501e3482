//! Helpers shared by the abupdate crates that only depend on the standard
//! library and a few core crates: running external tools and setting up
//! logging.
//!
mod command;
pub use command::*;
mod tracing_util;
pub use tracing_util::*;

//! # A/B root slot update agent
//!
//! Command line tool to install new OS images into the inactive root slot.

use std::ffi::OsString;

use anyhow::{ensure, Result};
use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;

use crate::host::SystemHost;
use crate::replace::Layout;
use crate::update::{AgentConfig, AGENT_CONFIG_PATH, FETCH_DIR, VERSION_PATH};

/// Perform an update, fetching the image from the configured server.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct UpdateOpts {
    /// Do not ask for confirmation.
    #[clap(long, short = 'y')]
    pub(crate) yes: bool,
}

/// Install a local image.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct ReplaceOpts {
    /// Path to the image archive.
    pub(crate) image: Utf8PathBuf,
}

/// Show the slot configuration.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct StatusOpts {
    /// Output in JSON format.
    #[clap(long)]
    pub(crate) json: bool,
}

/// Install OS images to the inactive root partition and switch to it on the
/// next boot.
#[derive(Debug, Parser, PartialEq, Eq)]
#[clap(name = "abupdate")]
#[clap(rename_all = "kebab-case")]
#[clap(version, long_version = clap::crate_version!())]
pub(crate) enum Opt {
    /// Check for a new version and install it.
    Update(UpdateOpts),
    /// Install the given image.
    Replace(ReplaceOpts),
    /// Display the active and inactive slots.
    Status(StatusOpts),
}

fn require_root() -> Result<()> {
    ensure!(
        rustix::process::getuid().is_root(),
        "This command requires root privileges"
    );
    Ok(())
}

fn update(opts: UpdateOpts) -> Result<()> {
    let agent = AgentConfig::load(Utf8Path::new(AGENT_CONFIG_PATH))?;
    let fetch_dir = Utf8Path::new(FETCH_DIR);
    let version = Utf8Path::new(VERSION_PATH);
    let Some(update) = crate::update::check(&agent, version, fetch_dir)? else {
        println!("No updates available.");
        return Ok(());
    };
    if !opts.yes && !crate::update::confirm(&update)? {
        anyhow::bail!("Update not confirmed");
    }
    let name = crate::update::image_name(&update.new);
    crate::update::clear_fetch_files(fetch_dir, &[name.as_str()])?;
    let image = crate::update::download(&agent, fetch_dir, &update.new)?;
    crate::replace::replace(&SystemHost, &Layout::default(), &image)?;
    crate::update::clear_fetch_files(fetch_dir, &[])?;
    println!("Updated {} -> {}; reboot to use it.", update.old, update.new);
    Ok(())
}

/// Parse the provided arguments and execute.
pub fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    run_from_opt(Opt::parse_from(args))
}

fn run_from_opt(opt: Opt) -> Result<()> {
    match opt {
        Opt::Update(opts) => {
            require_root()?;
            update(opts)
        }
        Opt::Replace(opts) => {
            require_root()?;
            crate::replace::replace(&SystemHost, &Layout::default(), &opts.image)
        }
        Opt::Status(opts) => {
            crate::slots::print_status(Utf8Path::new(crate::slots::SLOT_CONFIG_PATH), opts.json)
        }
    }
}

use anyhow::{Context, Result};
use captive_core::RedirectPolicy;
use clap::Parser;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    #[clap(short, long, value_parser, default_value = "/etc/captive/captive.toml")]
    pub config_file: PathBuf,

    /// Validate the configuration and exit.
    #[clap(long)]
    pub check: bool,
}

pub fn load_policy(args: &Args) -> Result<RedirectPolicy> {
    load_policy_from_path(&args.config_file)
}

/// Reads, parses and validates a policy file.
pub fn load_policy_from_path(path: &Path) -> Result<RedirectPolicy> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let policy: RedirectPolicy =
        toml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?;
    policy.validate()?;
    info!("Loaded redirect policy from {}", path.display());
    Ok(policy)
}

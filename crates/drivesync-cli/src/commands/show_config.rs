//! Config command - print the effective configuration.

use anyhow::Result;
use clap::Args as ClapArgs;

use crate::config::{config_path, Config};

#[derive(ClapArgs, Clone)]
pub struct Args {
    /// Print the default config file location instead
    #[arg(long)]
    pub path: bool,
}

pub fn execute(args: &Args, config: &Config) -> Result<()> {
    if args.path {
        println!("{}", config_path()?.display());
        return Ok(());
    }
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

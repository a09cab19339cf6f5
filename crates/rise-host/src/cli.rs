//! Argv surface for `rise-host`, kept deliberately small: the host is
//! meant to be wired up by a caller (an assistant front end) rather than
//! operated by hand, so the CLI exists mainly for local testing against a
//! plugins directory.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "rise-host", about = "Plugin runtime host engine")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Overrides the plugins directory from config/env (highest precedence).
    #[arg(long, global = true)]
    pub plugins_dir: Option<PathBuf>,

    /// Path to a `rise.toml` config file. Defaults to `./rise.toml`; a
    /// missing file is not an error, config.rs just falls back to defaults.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    /// Discover plugins, start the engine, and read turns from stdin until
    /// Ctrl-C or EOF. The default when no subcommand is given.
    Run,
    /// Discover and start plugins once, report startup failures, then exit
    /// non-zero if any plugin failed to start.
    Check,
}

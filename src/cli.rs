//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Edge trust service - client device authentication, authorization and certificates
#[derive(Parser, Debug)]
#[command(name = "edge-trust")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "EDGE_TRUST_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "EDGE_TRUST_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "EDGE_TRUST_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Do not watch the configuration file for changes
    #[arg(long)]
    pub no_watch: bool,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the service until interrupted (default)
    Serve,

    /// Load and validate a configuration, then print a summary
    Validate,
}

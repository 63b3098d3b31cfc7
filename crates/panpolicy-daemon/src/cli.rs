//! Command-line interface definitions and parsing

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "panpolicyd", author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path (TOML)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Socket to listen on, overriding `rpc.socket_path`
    #[arg(short, long)]
    pub socket: Option<PathBuf>,

    /// Lua policy script; selects the script selector
    #[arg(long)]
    pub script: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

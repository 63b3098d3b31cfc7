//! Daemon configuration loading
//!
//! Precedence, lowest first: built-in defaults, the TOML file, CLI flags.

use std::path::Path;

use tracing::info;

use panpolicy_core::{PolicyConfig, SelectorKind};

use crate::cli::Cli;
use crate::error::{DaemonError, Result};

/// Parse a TOML document; absent keys take their defaults
pub fn parse_config(document: &str) -> Result<PolicyConfig> {
    Ok(toml::from_str(document)?)
}

pub fn load_from_file(path: &Path) -> Result<PolicyConfig> {
    let document = std::fs::read_to_string(path).map_err(|source| DaemonError::ConfigRead {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&document)
}

/// Apply command-line overrides on top of `config`
pub fn apply_overrides(mut config: PolicyConfig, cli: &Cli) -> PolicyConfig {
    if let Some(socket) = &cli.socket {
        config.rpc.socket_path = socket.clone();
    }
    if let Some(script) = &cli.script {
        config.selector.mode = SelectorKind::Script;
        config.selector.script_path = Some(script.clone());
    }
    config
}

/// Load configuration from file or use defaults, then apply CLI flags
pub fn load_configuration(cli: &Cli) -> Result<PolicyConfig> {
    let config = match &cli.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            load_from_file(path)?
        }
        None => {
            info!("Using default configuration");
            PolicyConfig::default()
        }
    };
    let config = apply_overrides(config, cli);
    config.validate()?;
    Ok(config)
}

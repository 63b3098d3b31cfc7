//! Centralized Configuration Management
//!
//! Configuration structures shared by the runtime builder and the daemon.
//! Every section deserializes with defaults for absent keys, so a partial
//! TOML document is a valid configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{ConfigError, PolicyError, Result};

/// Socket the daemon listens on when nothing else is configured
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/panpolicyd.sock";

// ----------------------------------------------------------------------------
// Selector Configuration
// ----------------------------------------------------------------------------

/// Which selector variant to build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectorKind {
    #[default]
    Default,
    Remote,
    Script,
}

/// Resolved selector choice
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectorMode {
    Default,
    Remote { socket: PathBuf },
    Script { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    /// Selector variant
    pub mode: SelectorKind,
    /// Daemon socket for the remote variant (falls back to `rpc.socket_path`)
    pub socket_path: Option<PathBuf>,
    /// Script file for the script variant
    pub script_path: Option<PathBuf>,
    /// Wrap the selector in the debug decorator with this delay
    pub debug_delay_ms: Option<u64>,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            mode: SelectorKind::Default,
            socket_path: None,
            script_path: None,
            debug_delay_ms: None,
        }
    }
}

impl SelectorConfig {
    pub fn debug_delay(&self) -> Option<Duration> {
        self.debug_delay_ms.map(Duration::from_millis)
    }
}

// ----------------------------------------------------------------------------
// Telemetry Configuration
// ----------------------------------------------------------------------------

/// Which tracer variant to build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryKind {
    #[default]
    Noop,
    Logging,
    Remote,
    Script,
}

/// Resolved tracer choice
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelemetryMode {
    Noop,
    Logging,
    Remote { socket: PathBuf },
    Script { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub mode: TelemetryKind,
    /// Daemon socket for the remote variant (falls back to `rpc.socket_path`)
    pub socket_path: Option<PathBuf>,
    /// Script file for the script variant (falls back to `selector.script_path`)
    pub script_path: Option<PathBuf>,
}

// ----------------------------------------------------------------------------
// Call Substrate Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Unix socket of the policy daemon
    pub socket_path: PathBuf,
    /// Largest accepted frame body in bytes
    pub max_frame_size: usize,
    /// Connect timeout in milliseconds
    pub connect_timeout_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            max_frame_size: 16 * 1024 * 1024, // 16 MiB, far above any path batch
            connect_timeout_ms: 5000,         // 5 seconds
        }
    }
}

impl RpcConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Create configuration optimized for testing
    pub fn testing() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            max_frame_size: 1024 * 1024,
            connect_timeout_ms: 500,
        }
    }
}

// ----------------------------------------------------------------------------
// Script Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptConfig {
    /// Heartbeat interval of the `periodic` entry point in milliseconds
    pub periodic_interval_ms: u64,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            periodic_interval_ms: 1000, // once per second
        }
    }
}

impl ScriptConfig {
    pub fn periodic_interval(&self) -> Duration {
        Duration::from_millis(self.periodic_interval_ms)
    }

    /// Create configuration optimized for testing
    pub fn testing() -> Self {
        Self {
            periodic_interval_ms: 20,
        }
    }
}

// ----------------------------------------------------------------------------
// Unified Configuration
// ----------------------------------------------------------------------------

/// Complete policy configuration
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub selector: SelectorConfig,
    pub telemetry: TelemetryConfig,
    pub rpc: RpcConfig,
    pub script: ScriptConfig,
}

impl PolicyConfig {
    /// Create configuration optimized for testing
    pub fn testing() -> Self {
        Self {
            selector: SelectorConfig::default(),
            telemetry: TelemetryConfig::default(),
            rpc: RpcConfig::testing(),
            script: ScriptConfig::testing(),
        }
    }

    /// Resolve the selector section into a concrete mode
    pub fn selector_mode(&self) -> Result<SelectorMode> {
        match self.selector.mode {
            SelectorKind::Default => Ok(SelectorMode::Default),
            SelectorKind::Remote => Ok(SelectorMode::Remote {
                socket: self
                    .selector
                    .socket_path
                    .clone()
                    .unwrap_or_else(|| self.rpc.socket_path.clone()),
            }),
            SelectorKind::Script => match &self.selector.script_path {
                Some(path) => Ok(SelectorMode::Script { path: path.clone() }),
                None => Err(invalid("selector.mode = \"script\" requires selector.script_path")),
            },
        }
    }

    /// Resolve the telemetry section into a concrete mode
    pub fn telemetry_mode(&self) -> Result<TelemetryMode> {
        match self.telemetry.mode {
            TelemetryKind::Noop => Ok(TelemetryMode::Noop),
            TelemetryKind::Logging => Ok(TelemetryMode::Logging),
            TelemetryKind::Remote => Ok(TelemetryMode::Remote {
                socket: self
                    .telemetry
                    .socket_path
                    .clone()
                    .unwrap_or_else(|| self.rpc.socket_path.clone()),
            }),
            TelemetryKind::Script => self
                .telemetry
                .script_path
                .clone()
                .or_else(|| self.selector.script_path.clone())
                .map(|path| TelemetryMode::Script { path })
                .ok_or_else(|| invalid("telemetry.mode = \"script\" requires a script path")),
        }
    }

    /// Validate the configuration for consistency
    pub fn validate(&self) -> Result<()> {
        if self.rpc.max_frame_size < 1024 {
            return Err(invalid("rpc.max_frame_size must be at least 1024 bytes"));
        }
        if self.rpc.connect_timeout_ms == 0 {
            return Err(invalid("rpc.connect_timeout_ms must be greater than 0"));
        }
        if self.script.periodic_interval_ms == 0 {
            return Err(invalid("script.periodic_interval_ms must be greater than 0"));
        }
        self.selector_mode()?;
        self.telemetry_mode()?;
        Ok(())
    }
}

fn invalid(reason: &str) -> PolicyError {
    PolicyError::Config(ConfigError::Invalid {
        reason: reason.to_string(),
    })
}

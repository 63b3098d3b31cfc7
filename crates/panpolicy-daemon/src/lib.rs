//! Policy daemon library
//!
//! Command-line parsing, configuration loading and the socket server behind
//! the `panpolicyd` binary.

pub mod cli;
pub mod config;
pub mod daemon;
pub mod error;

pub use cli::Cli;
pub use config::load_configuration;
pub use daemon::{shutdown_signal, Daemon};
pub use error::{DaemonError, Result};

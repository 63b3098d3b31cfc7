//! Scripted Policy Host
//!
//! Embeds a Lua 5.4 runtime and exposes the selector and telemetry
//! callbacks to user scripts. All entry into a script is serialized through
//! one lock per host, and a background heartbeat drives the script's
//! `periodic` entry point.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod convert;
pub mod host;
pub mod selector;
pub mod stats;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use convert::{event_to_value, interface_to_table, path_to_table};
pub use host::{entry_point, invoke, ScriptHost, PANAPI, PERIODIC, STATS};
pub use selector::ScriptSelector;
pub use stats::{ScriptTracer, TRACER_FOR_CONNECTION};

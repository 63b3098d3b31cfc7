//! Policy Runtime
//!
//! Assembles the selector and tracer a path-aware client uses from
//! configuration: default, debug, remote-proxy or scripted selection, and
//! no-op, logging, forwarding or scripted telemetry.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod builder;
pub mod policy;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use builder::{Policy, PolicyBuilder};
pub use policy::PolicySelector;

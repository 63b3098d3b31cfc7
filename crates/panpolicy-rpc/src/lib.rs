//! Policy Call Substrate
//!
//! Length-prefixed request/response calls over a persistent byte stream,
//! multiplexed by call id, plus the two protocols built on them: selector
//! proxying and connection telemetry forwarding.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod client;
pub mod selector;
pub mod server;
pub mod tracer;
pub mod wire;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use client::CallClient;
pub use selector::{PathRecord, PathReply, RemoteSelector, SelectorMsg, SelectorServer};
pub use server::{CallContext, CallServer, ClientId};
pub use tracer::{method_for, required_fields, ConnectionTracerMsg, ForwardingTracer, TracerServer};
pub use wire::{Frame, FrameBody};

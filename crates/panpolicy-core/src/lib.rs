//! Path-Selection Policy Core
//!
//! This crate provides the foundational types for delegating path choice and
//! connection telemetry to a policy: the path model, the `Selector` and
//! `Tracer` contracts, the handle bridge used by out-of-process and scripted
//! policies, the built-in selectors and the shared error and configuration
//! types.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod errors;
pub mod handles;
pub mod path;
pub mod selector;
pub mod telemetry;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::{
    PolicyConfig, RpcConfig, ScriptConfig, SelectorConfig, SelectorKind, SelectorMode,
    TelemetryConfig, TelemetryKind, TelemetryMode, DEFAULT_SOCKET_PATH,
};
pub use errors::{
    CallError, ConfigError, MethodError, MethodErrorKind, PolicyError, PolicyResult, Result,
    ScriptError, SelectorError,
};
pub use handles::HandleTable;
pub use path::{GeoCoordinates, LinkType, Path, PathInterface, PathMetadata};
pub use selector::{
    DebugSelector, DefaultSelector, RemoteLifecycle, RemoteState, Selector, MAX_CLOSED_REMOTES,
};
pub use telemetry::{
    ConnectionEvent, ConnectionId, ConnectionTracer, EventKind, LoggingTracer, NoopTracer,
    Perspective, Tracer,
};
pub use types::{Fingerprint, IsdAs, PathHandle, RemoteAddr, TracingId, TracingIdAllocator};

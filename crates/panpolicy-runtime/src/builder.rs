//! Policy Builder API
//!
//! Turns a `PolicyConfig` (or explicit modes) into a ready selector and
//! tracer. A remote daemon that cannot be reached, or a script that does
//! not load, is not fatal here: the builder logs a warning and falls back to
//! the default selector, or to the no-op tracer for telemetry.

use std::collections::HashMap;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use panpolicy_core::{
    CallError, DebugSelector, DefaultSelector, LoggingTracer, NoopTracer, PolicyConfig,
    PolicyResult, ScriptError, SelectorKind, SelectorMode, TelemetryKind, TelemetryMode, Tracer,
};
use panpolicy_rpc::{CallClient, ForwardingTracer, RemoteSelector};
use panpolicy_script::{ScriptHost, ScriptSelector, ScriptTracer};

use crate::policy::PolicySelector;

// ----------------------------------------------------------------------------
// Built Policy
// ----------------------------------------------------------------------------

/// Selector and tracer produced by [`PolicyBuilder::build`]
pub struct Policy {
    pub selector: PolicySelector,
    /// Kind actually built, after any fallback
    pub selector_kind: SelectorKind,
    pub tracer: Arc<dyn Tracer>,
    /// Kind actually built, after any fallback
    pub tracer_kind: TelemetryKind,
}

impl Policy {
    pub fn into_parts(self) -> (PolicySelector, Arc<dyn Tracer>) {
        (self.selector, self.tracer)
    }
}

impl core::fmt::Debug for Policy {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Policy")
            .field("selector", &self.selector.name())
            .field("selector_kind", &self.selector_kind)
            .field("tracer_kind", &self.tracer_kind)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Policy Builder
// ----------------------------------------------------------------------------

/// Builder for the selector/tracer pair of one path-aware client
#[derive(Debug, Clone, Default)]
pub struct PolicyBuilder {
    config: PolicyConfig,
    selector: Option<SelectorMode>,
    telemetry: Option<TelemetryMode>,
    debug_delay: Option<Duration>,
}

/// Connections and script hosts opened during one build, shared between the
/// selector and the tracer when they name the same socket or script
#[derive(Default)]
struct Shared {
    clients: HashMap<PathBuf, CallClient>,
    hosts: HashMap<PathBuf, Arc<ScriptHost>>,
}

impl Shared {
    async fn client(&mut self, socket: &FsPath, config: &PolicyConfig) -> Result<CallClient, CallError> {
        if let Some(client) = self.clients.get(socket).filter(|c| !c.is_closed()) {
            return Ok(client.clone());
        }
        let client = CallClient::connect_unix(socket, &config.rpc).await?;
        self.clients.insert(socket.to_path_buf(), client.clone());
        Ok(client)
    }

    /// Load the script at `path` once; `heartbeat` starts its periodic tick
    fn host(&mut self, path: &FsPath, config: &PolicyConfig, heartbeat: bool) -> Result<Arc<ScriptHost>, ScriptError> {
        let host = match self.hosts.get(path) {
            Some(host) => Arc::clone(host),
            None => {
                let host = Arc::new(ScriptHost::load_file(path)?);
                self.hosts.insert(path.to_path_buf(), Arc::clone(&host));
                host
            }
        };
        if heartbeat && !host.is_heartbeat_running() {
            host.spawn_heartbeat(&config.script);
        }
        Ok(host)
    }
}

impl PolicyBuilder {
    /// Create a builder with the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the policy configuration
    pub fn with_config(mut self, config: PolicyConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the selector section of the configuration
    pub fn with_selector(mut self, mode: SelectorMode) -> Self {
        self.selector = Some(mode);
        self
    }

    /// Override the telemetry section of the configuration
    pub fn with_telemetry(mut self, mode: TelemetryMode) -> Self {
        self.telemetry = Some(mode);
        self
    }

    /// Wrap the selector in the debug decorator
    pub fn with_debug_delay(mut self, delay: Duration) -> Self {
        self.debug_delay = Some(delay);
        self
    }

    /// Build the selector and tracer
    ///
    /// Fails only on an inconsistent configuration; unreachable daemons and
    /// broken scripts fall back as described in the module documentation.
    pub async fn build(self) -> PolicyResult<Policy> {
        self.config.validate()?;
        let selector_mode = match self.selector {
            Some(mode) => mode,
            None => self.config.selector_mode()?,
        };
        let telemetry_mode = match self.telemetry {
            Some(mode) => mode,
            None => self.config.telemetry_mode()?,
        };
        let debug_delay = self.debug_delay.or_else(|| self.config.selector.debug_delay());

        let mut shared = Shared::default();
        let (selector, selector_kind) = build_selector(&selector_mode, &self.config, &mut shared).await;
        let selector = match debug_delay {
            Some(delay) => {
                info!(delay_ms = delay.as_millis() as u64, "wrapping selector in debug decorator");
                PolicySelector::Debug(DebugSelector::new(delay, Arc::new(selector)))
            }
            None => selector,
        };
        let (tracer, tracer_kind) = build_tracer(&telemetry_mode, &self.config, &mut shared).await;

        info!(selector = ?selector_kind, tracer = ?tracer_kind, "policy built");
        Ok(Policy {
            selector,
            selector_kind,
            tracer,
            tracer_kind,
        })
    }
}

async fn build_selector(
    mode: &SelectorMode,
    config: &PolicyConfig,
    shared: &mut Shared,
) -> (PolicySelector, SelectorKind) {
    let fallback = || (PolicySelector::Default(DefaultSelector::new()), SelectorKind::Default);
    match mode {
        SelectorMode::Default => fallback(),
        SelectorMode::Remote { socket } => match shared.client(socket, config).await {
            Ok(client) => {
                info!(socket = %socket.display(), "using remote selector");
                (PolicySelector::Remote(RemoteSelector::new(client)), SelectorKind::Remote)
            }
            Err(e) => {
                warn!(socket = %socket.display(), error = %e, "policy daemon unreachable, falling back to default selector");
                fallback()
            }
        },
        SelectorMode::Script { path } => match shared.host(path, config, true) {
            Ok(host) => {
                info!(script = %path.display(), "using script selector");
                (PolicySelector::Scripted(ScriptSelector::new(host)), SelectorKind::Script)
            }
            Err(e) => {
                warn!(script = %path.display(), error = %e, "script failed to load, falling back to default selector");
                fallback()
            }
        },
    }
}

async fn build_tracer(
    mode: &TelemetryMode,
    config: &PolicyConfig,
    shared: &mut Shared,
) -> (Arc<dyn Tracer>, TelemetryKind) {
    let fallback = || (Arc::new(NoopTracer) as Arc<dyn Tracer>, TelemetryKind::Noop);
    match mode {
        TelemetryMode::Noop => fallback(),
        TelemetryMode::Logging => (Arc::new(LoggingTracer::new()), TelemetryKind::Logging),
        TelemetryMode::Remote { socket } => match shared.client(socket, config).await {
            Ok(client) => (Arc::new(ForwardingTracer::new(client)), TelemetryKind::Remote),
            Err(e) => {
                warn!(socket = %socket.display(), error = %e, "telemetry daemon unreachable, dropping telemetry");
                fallback()
            }
        },
        TelemetryMode::Script { path } => match shared.host(path, config, false) {
            Ok(host) => (Arc::new(ScriptTracer::new(host)), TelemetryKind::Script),
            Err(e) => {
                warn!(script = %path.display(), error = %e, "telemetry script failed to load, dropping telemetry");
                fallback()
            }
        },
    }
}

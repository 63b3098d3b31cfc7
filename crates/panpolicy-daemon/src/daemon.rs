//! Daemon runner
//!
//! Serves the selector methods and the telemetry methods on one Unix socket
//! until a shutdown signal arrives.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::{UnixListener, UnixStream};
use tracing::{info, warn};

use panpolicy_core::{PolicyConfig, SelectorKind, SelectorMode, TelemetryKind, TelemetryMode};
use panpolicy_rpc::{CallServer, SelectorServer, TracerServer};
use panpolicy_runtime::PolicyBuilder;

use crate::error::{DaemonError, Result};

/// Policy daemon with its methods registered, not yet listening
pub struct Daemon {
    socket: PathBuf,
    server: Arc<CallServer>,
    selector_server: Arc<SelectorServer>,
    tracer_server: Arc<TracerServer>,
}

impl Daemon {
    /// Build the server-side selector and tracer and register their methods
    ///
    /// The daemon selects with the script when one is configured and with the
    /// default policy otherwise; telemetry goes to the script's `stats`
    /// entry points when telemetry is in script mode and to the log otherwise.
    pub async fn new(config: &PolicyConfig) -> Result<Self> {
        let selector = match config.selector.mode {
            SelectorKind::Script => config.selector_mode()?,
            SelectorKind::Remote => {
                warn!("selector.mode = \"remote\" makes no sense for the daemon itself, using default");
                SelectorMode::Default
            }
            SelectorKind::Default => SelectorMode::Default,
        };
        let telemetry = match config.telemetry.mode {
            TelemetryKind::Script => config.telemetry_mode()?,
            _ => TelemetryMode::Logging,
        };

        let policy = PolicyBuilder::new()
            .with_config(config.clone())
            .with_selector(selector)
            .with_telemetry(telemetry)
            .build()
            .await?;
        info!(selector = ?policy.selector_kind, tracer = ?policy.tracer_kind, "daemon policy ready");
        let (selector, tracer) = policy.into_parts();

        let selector_server = SelectorServer::new(Arc::new(selector));
        let tracer_server = TracerServer::new(tracer);
        let mut server = CallServer::new(config.rpc.max_frame_size);
        selector_server.register(&mut server);
        tracer_server.register(&mut server);

        Ok(Self {
            socket: config.rpc.socket_path.clone(),
            server: Arc::new(server),
            selector_server,
            tracer_server,
        })
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    pub fn methods(&self) -> Vec<&str> {
        self.server.methods()
    }

    /// Number of clients holding selector state
    pub fn selector_clients(&self) -> usize {
        self.selector_server.client_count()
    }

    /// Number of registered telemetry connections
    pub fn traced_connections(&self) -> usize {
        self.tracer_server.connection_count()
    }

    /// Bind the socket and serve until `shutdown` resolves
    ///
    /// A stale socket file is removed first; a socket some other process is
    /// still listening on is an error. The socket file is removed again on
    /// the way out.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        if UnixStream::connect(&self.socket).await.is_ok() {
            return Err(DaemonError::AlreadyRunning(self.socket.clone()));
        }
        match std::fs::remove_file(&self.socket) {
            Ok(()) => info!("Removed stale socket {}", self.socket.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let listener = UnixListener::bind(&self.socket)?;
        info!("panpolicyd listening on {}", self.socket.display());

        let res = Arc::clone(&self.server).serve_unix(listener, shutdown).await;
        if let Err(e) = std::fs::remove_file(&self.socket) {
            warn!(error = %e, "failed to remove socket {}", self.socket.display());
        }
        info!("panpolicyd stopped");
        res.map_err(Into::into)
    }
}

impl core::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Daemon")
            .field("socket", &self.socket)
            .finish_non_exhaustive()
    }
}

/// Resolves on Ctrl-C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Ctrl-C received, shutting down"),
        _ = terminate => info!("SIGTERM received, shutting down"),
    }
}

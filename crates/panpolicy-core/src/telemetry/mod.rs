//! Connection telemetry
//!
//! A `Tracer` receives the lifecycle events of many connections, each keyed
//! by the [`TracingId`] it was registered under. Local sinks live here; the
//! forwarding and script sinks live in their own crates.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::errors::Result;
use crate::types::{TracingId, TracingIdAllocator};

mod events;
mod types;

pub use events::{ConnectionEvent, EventKind};
pub use types::*;

// ----------------------------------------------------------------------------
// Tracer Trait
// ----------------------------------------------------------------------------

/// Sink for connection-lifecycle events
#[async_trait]
pub trait Tracer: Send + Sync {
    /// Register a new connection under `id`
    async fn tracer_for_connection(
        &self,
        id: TracingId,
        perspective: Perspective,
        odcid: &ConnectionId,
    ) -> Result<()>;

    /// Record one event for a registered connection
    async fn record(&self, id: TracingId, event: ConnectionEvent) -> Result<()>;
}

#[async_trait]
impl<T: Tracer + ?Sized> Tracer for Arc<T> {
    async fn tracer_for_connection(
        &self,
        id: TracingId,
        perspective: Perspective,
        odcid: &ConnectionId,
    ) -> Result<()> {
        (**self).tracer_for_connection(id, perspective, odcid).await
    }

    async fn record(&self, id: TracingId, event: ConnectionEvent) -> Result<()> {
        (**self).record(id, event).await
    }
}

// ----------------------------------------------------------------------------
// Connection Tracer Handle
// ----------------------------------------------------------------------------

/// Event source for one connection, bound to a tracing id
#[derive(Clone)]
pub struct ConnectionTracer {
    id: TracingId,
    perspective: Perspective,
    tracer: Arc<dyn Tracer>,
}

impl ConnectionTracer {
    /// Allocate a tracing id and register the connection with `tracer`
    pub async fn start(
        tracer: Arc<dyn Tracer>,
        ids: &TracingIdAllocator,
        perspective: Perspective,
        odcid: &ConnectionId,
    ) -> Result<Self> {
        let id = ids.allocate();
        tracer.tracer_for_connection(id, perspective, odcid).await?;
        Ok(Self {
            id,
            perspective,
            tracer,
        })
    }

    pub fn id(&self) -> TracingId {
        self.id
    }

    pub fn perspective(&self) -> Perspective {
        self.perspective
    }

    pub async fn emit(&self, event: ConnectionEvent) -> Result<()> {
        self.tracer.record(self.id, event).await
    }

    /// Emit `Close`, ending the connection's telemetry
    pub async fn close(self) -> Result<()> {
        self.emit(ConnectionEvent::Close).await
    }
}

impl core::fmt::Debug for ConnectionTracer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ConnectionTracer")
            .field("id", &self.id)
            .field("perspective", &self.perspective)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Local Sinks
// ----------------------------------------------------------------------------

/// Tracer that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracer;

#[async_trait]
impl Tracer for NoopTracer {
    async fn tracer_for_connection(&self, _: TracingId, _: Perspective, _: &ConnectionId) -> Result<()> {
        Ok(())
    }

    async fn record(&self, _: TracingId, _: ConnectionEvent) -> Result<()> {
        Ok(())
    }
}

/// Tracer writing every event as structured `tracing` output
#[derive(Debug, Default)]
pub struct LoggingTracer {
    connections: Mutex<HashMap<TracingId, ConnectionId>>,
}

impl LoggingTracer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of connections registered and not yet closed
    pub fn open_connections(&self) -> usize {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl Tracer for LoggingTracer {
    async fn tracer_for_connection(
        &self,
        id: TracingId,
        perspective: Perspective,
        odcid: &ConnectionId,
    ) -> Result<()> {
        info!(tracing_id = %id, %perspective, odcid = %odcid, "NewTracerForConnection");
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, odcid.clone());
        Ok(())
    }

    async fn record(&self, id: TracingId, event: ConnectionEvent) -> Result<()> {
        let odcid = {
            let mut connections = self.connections.lock().unwrap_or_else(PoisonError::into_inner);
            if matches!(event, ConnectionEvent::Close) {
                connections.remove(&id)
            } else {
                connections.get(&id).cloned()
            }
        };
        let Some(odcid) = odcid else {
            warn!(tracing_id = %id, event = %event.kind(), "event for unregistered connection");
            return Ok(());
        };

        match &event {
            ConnectionEvent::StartedConnection { local, remote, .. } => {
                info!(tracing_id = %id, odcid = %odcid, %local, %remote, "StartedConnection");
            }
            ConnectionEvent::ClosedConnection { reason } => {
                info!(tracing_id = %id, odcid = %odcid, reason = ?reason, "ClosedConnection");
            }
            ConnectionEvent::Close => info!(tracing_id = %id, odcid = %odcid, "Close"),
            ConnectionEvent::Debug { name, message } => {
                info!(tracing_id = %id, odcid = %odcid, %name, %message, "Debug");
            }
            other => debug!(tracing_id = %id, odcid = %odcid, event = ?other, "{}", other.kind()),
        }
        Ok(())
    }
}

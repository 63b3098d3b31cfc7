//! Call server
//!
//! A registry of named methods served over any number of connections. Each
//! connection gets a [`ClientId`]; each request runs in its own task so one
//! slow method never blocks the others on the same connection.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

use panpolicy_core::{CallError, MethodError, MethodErrorKind};

use crate::wire::{read_frame, write_frame, Frame, FrameBody};

type HandlerFn =
    Arc<dyn Fn(CallContext, Vec<u8>) -> BoxFuture<'static, Result<Vec<u8>, MethodError>> + Send + Sync>;
type DisconnectHook = Arc<dyn Fn(ClientId) + Send + Sync>;

/// Responses buffered ahead of a connection's writer task
const RESPONSE_BUFFER: usize = 64;

// ----------------------------------------------------------------------------
// Call Context
// ----------------------------------------------------------------------------

/// Server-side identity of one client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(u64);

impl ClientId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(&self) -> u64 {
        self.0
    }
}

impl core::fmt::Display for ClientId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Per-call information handed to every handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallContext {
    pub client_id: ClientId,
}

// ----------------------------------------------------------------------------
// Call Server
// ----------------------------------------------------------------------------

pub struct CallServer {
    handlers: HashMap<String, HandlerFn>,
    disconnect_hooks: Vec<DisconnectHook>,
    next_client: AtomicU64,
    max_frame_size: usize,
}

impl CallServer {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            handlers: HashMap::new(),
            disconnect_hooks: Vec::new(),
            next_client: AtomicU64::new(1),
            max_frame_size,
        }
    }

    /// Register a typed handler under `method`
    ///
    /// A later registration under the same name replaces the earlier one.
    pub fn register<Req, Resp, F, Fut>(&mut self, method: impl Into<String>, handler: F) -> &mut Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(CallContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, MethodError>> + Send + 'static,
    {
        let method = method.into();
        let name = method.clone();
        let handler = Arc::new(handler);
        let erased: HandlerFn = Arc::new(move |ctx, payload| {
            let handler = Arc::clone(&handler);
            let name = name.clone();
            Box::pin(async move {
                let request: Req = bincode::deserialize(&payload).map_err(|e| {
                    MethodError::new(
                        MethodErrorKind::Internal,
                        format!("{name}: undecodable request: {e}"),
                    )
                })?;
                let response = handler(ctx, request).await?;
                bincode::serialize(&response).map_err(|e| {
                    MethodError::new(
                        MethodErrorKind::Internal,
                        format!("{name}: unencodable response: {e}"),
                    )
                })
            })
        });
        self.handlers.insert(method, erased);
        self
    }

    /// Run `hook` whenever a client connection ends
    pub fn on_disconnect<F>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(ClientId) + Send + Sync + 'static,
    {
        self.disconnect_hooks.push(Arc::new(hook));
        self
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    /// Registered method names, sorted
    pub fn methods(&self) -> Vec<&str> {
        let mut methods: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        methods.sort_unstable();
        methods
    }

    /// Run one call against the registry
    pub async fn dispatch(
        &self,
        ctx: CallContext,
        method: &str,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, MethodError> {
        let Some(handler) = self.handlers.get(method) else {
            warn!(client = %ctx.client_id, method, "call to unknown method");
            return Err(MethodError::unknown_method(method));
        };
        handler(ctx, payload).await
    }

    /// Accept connections until `shutdown` resolves
    pub async fn serve_unix<F>(self: Arc<Self>, listener: UnixListener, shutdown: F) -> Result<(), CallError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        connections.spawn(Arc::clone(&self).serve_connection(stream));
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                _ = &mut shutdown => {
                    info!(connections = connections.len(), "call server shutting down");
                    break;
                }
            }
            while connections.try_join_next().is_some() {}
        }
        connections.abort_all();
        Ok(())
    }

    /// Serve one client connection until it closes
    pub async fn serve_connection<S>(self: Arc<Self>, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let client_id = ClientId(self.next_client.fetch_add(1, Ordering::Relaxed));
        debug!(client = %client_id, "client connected");

        let (mut read_half, mut write_half) = tokio::io::split(stream);
        let (responses, mut rx) = mpsc::channel::<Frame>(RESPONSE_BUFFER);
        let max_frame_size = self.max_frame_size;

        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let written = match write_frame(&mut write_half, &frame, max_frame_size).await {
                    Err(CallError::FrameTooLarge { size, max }) => {
                        warn!(client = %client_id, size, max, "response too large");
                        let error = MethodError::new(
                            MethodErrorKind::Internal,
                            format!("response of {size} bytes exceeds frame limit of {max}"),
                        );
                        write_frame(&mut write_half, &Frame::response(frame.call_id, Err(error)), max_frame_size)
                            .await
                    }
                    other => other,
                };
                if let Err(e) = written {
                    warn!(client = %client_id, error = %e, "failed to write response");
                    return;
                }
            }
        });

        let mut in_flight = JoinSet::new();
        loop {
            let frame = match read_frame(&mut read_half, max_frame_size).await {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    warn!(client = %client_id, error = %e, "client connection failed");
                    break;
                }
            };
            let call_id = frame.call_id;
            let FrameBody::Request { method, payload } = frame.body else {
                warn!(client = %client_id, call_id, "unexpected response frame from client");
                continue;
            };

            trace!(client = %client_id, call_id, method = %method, "dispatching call");
            let server = Arc::clone(&self);
            let responses = responses.clone();
            in_flight.spawn(async move {
                let ctx = CallContext { client_id };
                let outcome = server.dispatch(ctx, &method, payload).await;
                if let Err(e) = &outcome {
                    debug!(client = %client_id, method = %method, error = %e, "call failed");
                }
                let _ = responses.send(Frame::response(call_id, outcome)).await;
            });
            while in_flight.try_join_next().is_some() {}
        }

        while in_flight.join_next().await.is_some() {}
        drop(responses);
        let _ = writer.await;

        for hook in &self.disconnect_hooks {
            hook(client_id);
        }
        debug!(client = %client_id, "client disconnected");
    }
}

impl core::fmt::Debug for CallServer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CallServer")
            .field("methods", &self.methods())
            .field("max_frame_size", &self.max_frame_size)
            .finish()
    }
}

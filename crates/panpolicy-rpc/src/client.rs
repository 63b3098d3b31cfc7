//! Call client
//!
//! One `CallClient` owns one stream. A writer task drains outgoing frames, a
//! reader task routes responses to the waiting caller by call id. When the
//! stream fails every pending and future call fails with `ConnectionLost`;
//! nothing is retried.

use std::path::Path as FsPath;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use panpolicy_core::{CallError, RpcConfig};

use crate::wire::{decode_payload, encode_payload, read_frame, write_frame, Frame, FrameBody};

type Reply = Result<Vec<u8>, CallError>;

/// Outgoing frames buffered ahead of the writer task
const OUTGOING_BUFFER: usize = 64;

// ----------------------------------------------------------------------------
// Shared Connection State
// ----------------------------------------------------------------------------

#[derive(Default)]
struct Pending {
    calls: DashMap<u64, oneshot::Sender<Reply>>,
    closed: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl Pending {
    /// Mark the connection dead and fail every waiting call
    fn fail_all(&self, reason: &str) {
        {
            let mut slot = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_none() {
                *slot = Some(reason.to_string());
            }
        }
        self.closed.store(true, Ordering::SeqCst);

        let ids: Vec<u64> = self.calls.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.calls.remove(&id) {
                let _ = tx.send(Err(self.lost_error()));
            }
        }
    }

    fn lost_error(&self) -> CallError {
        let reason = self
            .reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_else(|| "connection closed".to_string());
        CallError::ConnectionLost { reason }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Removes a call's pending entry however its caller stops waiting
struct PendingCall<'a> {
    pending: &'a Pending,
    call_id: u64,
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        self.pending.calls.remove(&self.call_id);
    }
}

struct Inner {
    endpoint: String,
    outgoing: mpsc::Sender<Frame>,
    pending: Arc<Pending>,
    next_call_id: AtomicU64,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

// ----------------------------------------------------------------------------
// Call Client
// ----------------------------------------------------------------------------

/// Handle to one call connection; clones share the connection
#[derive(Clone)]
pub struct CallClient {
    inner: Arc<Inner>,
}

impl CallClient {
    /// Connect to a policy daemon over a Unix socket
    pub async fn connect_unix(socket: &FsPath, config: &RpcConfig) -> Result<Self, CallError> {
        let endpoint = socket.display().to_string();
        let connect = UnixStream::connect(socket);
        let stream = match tokio::time::timeout(config.connect_timeout(), connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(CallError::Connect {
                    endpoint,
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(CallError::Connect {
                    endpoint,
                    reason: "timed out".to_string(),
                })
            }
        };
        debug!(endpoint = %endpoint, "connected to policy daemon");
        Ok(Self::from_stream(stream, endpoint, config.max_frame_size))
    }

    /// Run the client over any reliable ordered byte stream
    pub fn from_stream<S>(stream: S, endpoint: impl Into<String>, max_frame_size: usize) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut read_half, mut write_half) = tokio::io::split(stream);
        let (outgoing, mut rx) = mpsc::channel::<Frame>(OUTGOING_BUFFER);
        let pending = Arc::new(Pending::default());

        let writer_pending = Arc::clone(&pending);
        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = write_frame(&mut write_half, &frame, max_frame_size).await {
                    if let CallError::FrameTooLarge { .. } = e {
                        // Only this call is affected; the stream is still in sync.
                        if let Some((_, tx)) = writer_pending.calls.remove(&frame.call_id) {
                            let _ = tx.send(Err(e));
                        }
                        continue;
                    }
                    warn!(error = %e, "call connection write failed");
                    writer_pending.fail_all(&e.to_string());
                    return;
                }
            }
        });

        let reader_pending = Arc::clone(&pending);
        let reader = tokio::spawn(async move {
            loop {
                match read_frame(&mut read_half, max_frame_size).await {
                    Ok(Some(Frame {
                        call_id,
                        body: FrameBody::Response { outcome },
                    })) => {
                        let Some((_, tx)) = reader_pending.calls.remove(&call_id) else {
                            trace!(call_id, "response for unknown call dropped");
                            continue;
                        };
                        let _ = tx.send(outcome.map_err(|error| CallError::Method {
                            method: String::new(),
                            error,
                        }));
                    }
                    Ok(Some(Frame { call_id, .. })) => {
                        warn!(call_id, "unexpected request frame on client connection");
                    }
                    Ok(None) => {
                        reader_pending.fail_all("connection closed by peer");
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, "call connection read failed");
                        reader_pending.fail_all(&e.to_string());
                        return;
                    }
                }
            }
        });

        Self {
            inner: Arc::new(Inner {
                endpoint: endpoint.into(),
                outgoing,
                pending,
                next_call_id: AtomicU64::new(1),
                reader,
                writer,
            }),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    /// Whether the connection has failed or been closed by the peer
    pub fn is_closed(&self) -> bool {
        self.inner.pending.is_closed()
    }

    /// Calls still waiting for their response
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.calls.len()
    }

    /// Issue one call and wait for its response
    ///
    /// Dropping the returned future abandons the call; a late response is
    /// discarded.
    pub async fn call<Req, Resp>(&self, method: &str, request: &Req) -> Result<Resp, CallError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let payload = encode_payload("request", request)?;
        let bytes = self.call_raw(method, payload).await.map_err(|e| match e {
            CallError::Method { error, .. } => CallError::Method {
                method: method.to_string(),
                error,
            },
            other => other,
        })?;
        decode_payload("response", &bytes)
    }

    async fn call_raw(&self, method: &str, payload: Vec<u8>) -> Reply {
        let inner = &self.inner;
        let call_id = inner.next_call_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        inner.pending.calls.insert(call_id, tx);
        let _entry = PendingCall {
            pending: &inner.pending,
            call_id,
        };
        if inner.pending.is_closed() {
            return Err(inner.pending.lost_error());
        }

        trace!(call_id, method, "issuing call");
        if inner
            .outgoing
            .send(Frame::request(call_id, method, payload))
            .await
            .is_err()
        {
            return Err(inner.pending.lost_error());
        }

        match rx.await {
            Ok(reply) => reply,
            Err(_) => Err(inner.pending.lost_error()),
        }
    }
}

impl core::fmt::Debug for CallClient {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CallClient")
            .field("endpoint", &self.inner.endpoint)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_abandoned_call_leaves_no_pending_entry() {
        // The far end is held open but never answers
        let (client_end, _silent) = tokio::io::duplex(64 * 1024);
        let client = CallClient::from_stream(client_end, "silent", 1024 * 1024);

        let outcome =
            tokio::time::timeout(Duration::from_millis(20), client.call::<_, ()>("Selector.Path", &())).await;
        assert!(outcome.is_err(), "call should still be waiting");
        assert_eq!(client.pending_calls(), 0);
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn test_calls_fail_once_peer_is_gone() {
        let (client_end, far_end) = tokio::io::duplex(1024);
        let client = CallClient::from_stream(client_end, "gone", 1024);
        drop(far_end);

        let err = client.call::<_, ()>("Selector.Path", &()).await.unwrap_err();
        assert!(err.is_connection_failure());
        assert_eq!(client.pending_calls(), 0);
    }
}

//! Selector proxying
//!
//! [`RemoteSelector`] implements `Selector` by calling a policy daemon;
//! [`SelectorServer`] exposes any local `Selector` to such callers. On both
//! ends paths are referenced by [`PathHandle`]; the daemon only ever answers
//! with a handle it was given, and the caller resolves it to the native path
//! it already holds.

use std::path::Path as FsPath;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use panpolicy_core::{
    Fingerprint, HandleTable, MethodError, Path, PathHandle, PathInterface, RemoteAddr,
    RemoteLifecycle, Result, RpcConfig, Selector,
};

use crate::client::CallClient;
use crate::server::{CallContext, CallServer, ClientId};

// ----------------------------------------------------------------------------
// Protocol
// ----------------------------------------------------------------------------

pub const INITIALIZE: &str = "Selector.Initialize";
pub const PATH: &str = "Selector.Path";
pub const PATH_DOWN: &str = "Selector.PathDown";
pub const REFRESH: &str = "Selector.Refresh";
pub const CLOSE: &str = "Selector.Close";

/// A path as sent across the boundary, tagged with its handle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathRecord {
    pub handle: PathHandle,
    pub path: Path,
}

/// Request record shared by every selector method
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectorMsg {
    pub remote: Option<RemoteAddr>,
    pub paths: Option<Vec<PathRecord>>,
    pub fingerprint: Option<Fingerprint>,
    pub interface: Option<PathInterface>,
}

impl SelectorMsg {
    fn for_remote(remote: &RemoteAddr) -> Self {
        Self {
            remote: Some(remote.clone()),
            ..Default::default()
        }
    }
}

/// Response to [`PATH`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathReply {
    pub handle: Option<PathHandle>,
}

fn required<T>(method: &str, field: &str, value: Option<T>) -> core::result::Result<T, MethodError> {
    value.ok_or_else(|| MethodError::missing_field(method, field))
}

// ----------------------------------------------------------------------------
// Remote Selector
// ----------------------------------------------------------------------------

/// Selector delegating every decision to a policy daemon
#[derive(Debug)]
pub struct RemoteSelector {
    client: CallClient,
    handles: HandleTable<PathHandle>,
    lifecycle: RemoteLifecycle,
}

impl RemoteSelector {
    pub fn new(client: CallClient) -> Self {
        Self {
            client,
            handles: HandleTable::new(),
            lifecycle: RemoteLifecycle::new(),
        }
    }

    /// Connect to the daemon at `socket`
    pub async fn connect(socket: &FsPath, config: &RpcConfig) -> Result<Self> {
        Ok(Self::new(CallClient::connect_unix(socket, config).await?))
    }

    pub fn client(&self) -> &CallClient {
        &self.client
    }

    /// Handle table mirroring what the daemon was told
    pub fn handles(&self) -> &HandleTable<PathHandle> {
        &self.handles
    }

    /// Reissue handles for `remote` and build the batch sent in one call
    fn batch(&self, remote: &RemoteAddr, paths: &[Arc<Path>]) -> SelectorMsg {
        let handles = self.handles.replace(remote, paths);
        let records = handles
            .into_iter()
            .zip(paths)
            .map(|(handle, path)| PathRecord {
                handle,
                path: Path::clone(path),
            })
            .collect();
        SelectorMsg {
            paths: Some(records),
            ..SelectorMsg::for_remote(remote)
        }
    }
}

#[async_trait]
impl Selector for RemoteSelector {
    async fn initialize(&self, remote: &RemoteAddr, paths: &[Arc<Path>]) -> Result<()> {
        let msg = self.batch(remote, paths);
        self.client.call::<_, ()>(INITIALIZE, &msg).await?;
        self.lifecycle.mark_populated(remote);
        Ok(())
    }

    async fn path(&self, remote: &RemoteAddr) -> Result<Option<Arc<Path>>> {
        self.lifecycle.ensure_open(remote, "path")?;
        let reply: PathReply = self.client.call(PATH, &SelectorMsg::for_remote(remote)).await?;
        let Some(handle) = reply.handle else {
            return Ok(None);
        };
        let path = self.handles.resolve(&handle);
        if path.is_none() {
            warn!(remote = %remote, handle = %handle, "daemon answered with a handle that is no longer valid");
        }
        Ok(path)
    }

    async fn path_down(
        &self,
        remote: &RemoteAddr,
        fingerprint: &Fingerprint,
        interface: &PathInterface,
    ) -> Result<()> {
        self.lifecycle.ensure_open(remote, "path_down")?;
        let msg = SelectorMsg {
            fingerprint: Some(fingerprint.clone()),
            interface: Some(interface.clone()),
            ..SelectorMsg::for_remote(remote)
        };
        self.client.call::<_, ()>(PATH_DOWN, &msg).await?;
        if let Some(handle) = self.handles.remove_path(remote, fingerprint) {
            debug!(remote = %remote, handle = %handle, "dropped handle of failed path");
        }
        Ok(())
    }

    async fn refresh(&self, remote: &RemoteAddr, paths: &[Arc<Path>]) -> Result<()> {
        self.lifecycle.ensure_open(remote, "refresh")?;
        let msg = self.batch(remote, paths);
        self.client.call::<_, ()>(REFRESH, &msg).await?;
        self.lifecycle.mark_populated(remote);
        Ok(())
    }

    async fn close(&self, remote: &RemoteAddr) -> Result<()> {
        self.lifecycle.ensure_open(remote, "close")?;
        let res = self
            .client
            .call::<_, ()>(CLOSE, &SelectorMsg::for_remote(remote))
            .await;
        self.handles.remove_remote(remote);
        self.lifecycle.mark_closed(remote);
        res.map_err(Into::into)
    }
}

// ----------------------------------------------------------------------------
// Selector Server
// ----------------------------------------------------------------------------

/// Serves a local selector to remote callers
///
/// Handles are remembered per client connection and remote, so two callers
/// can never resolve each other's handles. The wrapped selector sees every
/// remote scoped to its client as `client-<n>/<remote>`, so two callers
/// offering paths to the same remote keep separate selector state.
pub struct SelectorServer {
    selector: Arc<dyn Selector>,
    clients: DashMap<ClientId, Arc<HandleTable<PathHandle>>>,
}

impl SelectorServer {
    pub fn new(selector: Arc<dyn Selector>) -> Arc<Self> {
        Arc::new(Self {
            selector,
            clients: DashMap::new(),
        })
    }

    /// Register the selector methods and the per-client cleanup on `server`
    pub fn register(self: &Arc<Self>, server: &mut CallServer) {
        let this = Arc::clone(self);
        server.register(INITIALIZE, move |ctx, msg: SelectorMsg| {
            let this = Arc::clone(&this);
            async move { this.set_paths(INITIALIZE, ctx, msg).await }
        });
        let this = Arc::clone(self);
        server.register(REFRESH, move |ctx, msg: SelectorMsg| {
            let this = Arc::clone(&this);
            async move { this.set_paths(REFRESH, ctx, msg).await }
        });
        let this = Arc::clone(self);
        server.register(PATH, move |ctx, msg: SelectorMsg| {
            let this = Arc::clone(&this);
            async move { this.path(ctx, msg).await }
        });
        let this = Arc::clone(self);
        server.register(PATH_DOWN, move |ctx, msg: SelectorMsg| {
            let this = Arc::clone(&this);
            async move { this.path_down(ctx, msg).await }
        });
        let this = Arc::clone(self);
        server.register(CLOSE, move |ctx, msg: SelectorMsg| {
            let this = Arc::clone(&this);
            async move { this.close(ctx, msg).await }
        });
        let this = Arc::clone(self);
        server.on_disconnect(move |client| this.release_client(client));
    }

    /// Forget every handle a client was given
    pub fn release_client(&self, client: ClientId) {
        if self.clients.remove(&client).is_some() {
            debug!(client = %client, "released selector handles");
        }
    }

    /// Number of clients with live handle tables
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Remote address as seen by the wrapped selector
    pub fn scoped(client: ClientId, remote: &RemoteAddr) -> RemoteAddr {
        RemoteAddr::new(format!("{client}/{remote}"))
    }

    fn table(&self, client: ClientId) -> Arc<HandleTable<PathHandle>> {
        Arc::clone(self.clients.entry(client).or_default().value())
    }

    async fn set_paths(
        &self,
        method: &'static str,
        ctx: CallContext,
        msg: SelectorMsg,
    ) -> core::result::Result<(), MethodError> {
        let remote = required(method, "remote", msg.remote)?;
        let records = required(method, "paths", msg.paths)?;

        let handles: Vec<PathHandle> = records.iter().map(|r| r.handle).collect();
        let paths: Vec<Arc<Path>> = records.into_iter().map(|r| Arc::new(r.path)).collect();
        let mut index = 0;
        self.table(ctx.client_id).replace_with(&remote, &paths, |_| {
            let handle = handles[index];
            index += 1;
            handle
        });

        let scoped = Self::scoped(ctx.client_id, &remote);
        let res = if method == INITIALIZE {
            self.selector.initialize(&scoped, &paths).await
        } else {
            self.selector.refresh(&scoped, &paths).await
        };
        res.map_err(|e| e.to_method_error())
    }

    async fn path(&self, ctx: CallContext, msg: SelectorMsg) -> core::result::Result<PathReply, MethodError> {
        let remote = required(PATH, "remote", msg.remote)?;
        let chosen = self
            .selector
            .path(&Self::scoped(ctx.client_id, &remote))
            .await
            .map_err(|e| e.to_method_error())?;
        let handle = chosen.and_then(|path| {
            let handle = self.table(ctx.client_id).handle_of(&remote, &path.fingerprint);
            if handle.is_none() {
                warn!(remote = %remote, fingerprint = %path.fingerprint, "selector chose a path the client never offered");
            }
            handle
        });
        Ok(PathReply { handle })
    }

    async fn path_down(&self, ctx: CallContext, msg: SelectorMsg) -> core::result::Result<(), MethodError> {
        let remote = required(PATH_DOWN, "remote", msg.remote)?;
        let fingerprint = required(PATH_DOWN, "fingerprint", msg.fingerprint)?;
        let interface = required(PATH_DOWN, "interface", msg.interface)?;
        self.selector
            .path_down(&Self::scoped(ctx.client_id, &remote), &fingerprint, &interface)
            .await
            .map_err(|e| e.to_method_error())
    }

    async fn close(&self, ctx: CallContext, msg: SelectorMsg) -> core::result::Result<(), MethodError> {
        let remote = required(CLOSE, "remote", msg.remote)?;
        let res = self.selector.close(&Self::scoped(ctx.client_id, &remote)).await;
        self.table(ctx.client_id).remove_remote(&remote);
        res.map_err(|e| e.to_method_error())
    }
}

impl core::fmt::Debug for SelectorServer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SelectorServer")
            .field("clients", &self.clients.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use panpolicy_core::{DefaultSelector, MethodErrorKind};
    use std::time::SystemTime;

    fn ctx(id: u64) -> CallContext {
        CallContext {
            client_id: ClientId::new(id),
        }
    }

    fn record(handle: u64, fp: &str) -> PathRecord {
        PathRecord {
            handle: PathHandle::new(handle),
            path: Path::new("1-ff00:0:110", "1-ff00:0:112", fp, SystemTime::UNIX_EPOCH),
        }
    }

    #[tokio::test]
    async fn test_server_answers_with_offered_handle() {
        let server = SelectorServer::new(Arc::new(DefaultSelector::new()));
        let msg = SelectorMsg {
            remote: Some("r".into()),
            paths: Some(vec![record(7, "a"), record(8, "b")]),
            ..Default::default()
        };
        server.set_paths(INITIALIZE, ctx(1), msg).await.unwrap();

        let reply = server
            .path(ctx(1), SelectorMsg::for_remote(&"r".into()))
            .await
            .unwrap();
        assert_eq!(reply.handle, Some(PathHandle::new(7)));
    }

    #[tokio::test]
    async fn test_server_rejects_missing_fields() {
        let server = SelectorServer::new(Arc::new(DefaultSelector::new()));
        let err = server
            .set_paths(INITIALIZE, ctx(1), SelectorMsg::for_remote(&"r".into()))
            .await
            .unwrap_err();
        assert_eq!(err.kind, MethodErrorKind::MissingField);

        let err = server
            .path_down(ctx(1), SelectorMsg::for_remote(&"r".into()))
            .await
            .unwrap_err();
        assert!(err.message.contains("fingerprint"));
    }

    #[tokio::test]
    async fn test_release_client_drops_its_handles() {
        let server = SelectorServer::new(Arc::new(DefaultSelector::new()));
        let msg = SelectorMsg {
            remote: Some("r".into()),
            paths: Some(vec![record(1, "a")]),
            ..Default::default()
        };
        server.set_paths(INITIALIZE, ctx(3), msg).await.unwrap();
        assert_eq!(server.client_count(), 1);
        server.release_client(ClientId::new(3));
        assert_eq!(server.client_count(), 0);
    }

    #[tokio::test]
    async fn test_clients_sharing_a_remote_keep_separate_state() {
        let server = SelectorServer::new(Arc::new(DefaultSelector::new()));
        let offer = |handles: [(u64, &str); 2]| SelectorMsg {
            remote: Some("r".into()),
            paths: Some(handles.iter().map(|(h, fp)| record(*h, fp)).collect()),
            ..Default::default()
        };
        server.set_paths(INITIALIZE, ctx(1), offer([(1, "a1"), (2, "a2")])).await.unwrap();
        server.set_paths(INITIALIZE, ctx(2), offer([(1, "b1"), (2, "b2")])).await.unwrap();

        let reply = server.path(ctx(1), SelectorMsg::for_remote(&"r".into())).await.unwrap();
        assert_eq!(reply.handle, Some(PathHandle::new(1)));

        server.close(ctx(2), SelectorMsg::for_remote(&"r".into())).await.unwrap();
        let reply = server.path(ctx(1), SelectorMsg::for_remote(&"r".into())).await.unwrap();
        assert_eq!(reply.handle, Some(PathHandle::new(1)));
    }

    #[test]
    fn test_scoped_remote_names_client() {
        let scoped = SelectorServer::scoped(ClientId::new(4), &"1-ff00:0:112,[10.0.0.2]:443".into());
        assert_eq!(scoped.as_str(), "client-4/1-ff00:0:112,[10.0.0.2]:443");
    }
}

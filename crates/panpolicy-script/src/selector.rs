//! Script-driven selector
//!
//! Paths are handed to the script as tables built by [`path_to_table`]. The
//! selector remembers which table stands for which native path, keyed by the
//! table's identity, so whatever table `selectpath` returns resolves back to
//! the caller's own `Arc<Path>` without rebuilding anything. The tables stay
//! referenced here until the remote's next update or close, which keeps their
//! identities from being reused while they are mapped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use mlua::{Lua, Table, Value};
use tracing::{debug, warn};

use panpolicy_core::{
    Fingerprint, HandleTable, Path, PathInterface, RemoteAddr, RemoteLifecycle, RemoteState,
    Result, ScriptConfig, ScriptError, Selector,
};

use crate::convert::{interface_to_table, path_to_table};
use crate::host::{invoke, runtime_error, ScriptHost, PANAPI};

/// Selector backed by the `panapi` entry points of a loaded script
pub struct ScriptSelector {
    host: Arc<ScriptHost>,
    handles: HandleTable<usize>,
    tables: Mutex<HashMap<RemoteAddr, Vec<Table>>>,
    lifecycle: RemoteLifecycle,
}

impl ScriptSelector {
    pub fn new(host: Arc<ScriptHost>) -> Self {
        Self {
            host,
            handles: HandleTable::new(),
            tables: Mutex::new(HashMap::new()),
            lifecycle: RemoteLifecycle::new(),
        }
    }

    /// Load `path` and start its heartbeat
    pub fn load_file(path: impl AsRef<std::path::Path>, config: &ScriptConfig) -> Result<Self> {
        let host = Arc::new(ScriptHost::load_file(path)?);
        host.spawn_heartbeat(config);
        Ok(Self::new(host))
    }

    pub fn host(&self) -> &Arc<ScriptHost> {
        &self.host
    }

    pub fn handles(&self) -> &HandleTable<usize> {
        &self.handles
    }

    /// Replace the tables mapped for `remote` with fresh ones for `paths`
    ///
    /// Must be called with the host lock held.
    fn populate(&self, lua: &Lua, entry: &str, remote: &RemoteAddr, paths: &[Arc<Path>]) -> Result<Table> {
        let tables = paths
            .iter()
            .map(|p| path_to_table(lua, p))
            .collect::<mlua::Result<Vec<_>>>()
            .map_err(|e| runtime_error(entry, e))?;
        let list = lua
            .create_sequence_from(tables.iter().cloned())
            .map_err(|e| runtime_error(entry, e))?;

        let mut next = tables.iter();
        self.handles.replace_with(remote, paths, |_| {
            next.next().map(|t| t.to_pointer() as usize).unwrap_or_default()
        });
        self.tables_guard().insert(remote.clone(), tables);
        Ok(list)
    }

    fn release(&self, remote: &RemoteAddr) {
        self.handles.remove_remote(remote);
        self.tables_guard().remove(remote);
    }

    fn tables_guard(&self) -> std::sync::MutexGuard<'_, HashMap<RemoteAddr, Vec<Table>>> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resolve(&self, remote: &RemoteAddr, chosen: Value) -> Result<Option<Arc<Path>>> {
        match chosen {
            Value::Nil => Ok(None),
            Value::Table(t) => {
                let resolved = self.handles.resolve(&(t.to_pointer() as usize));
                if resolved.is_none() {
                    warn!(remote = %remote, "selectpath returned a table that is not an offered path");
                }
                Ok(resolved)
            }
            other => Err(ScriptError::Runtime {
                entry: "selectpath".to_string(),
                reason: format!("expected a path table or nil, got {}", other.type_name()),
            }
            .into()),
        }
    }
}

#[async_trait]
impl Selector for ScriptSelector {
    async fn initialize(&self, remote: &RemoteAddr, paths: &[Arc<Path>]) -> Result<()> {
        let lua = self.host.lock().await;
        debug!(remote = %remote, paths = paths.len(), "script initialize");
        let list = self.populate(&lua, "initialize", remote, paths)?;
        self.lifecycle.mark_populated(remote);
        invoke::<()>(&lua, PANAPI, "initialize", (remote.as_str(), list))?;
        Ok(())
    }

    async fn path(&self, remote: &RemoteAddr) -> Result<Option<Arc<Path>>> {
        if self.lifecycle.ensure_open(remote, "path")? == RemoteState::Uninitialized {
            return Ok(None);
        }
        let lua = self.host.lock().await;
        let chosen: Value = invoke(&lua, PANAPI, "selectpath", remote.as_str())?;
        self.resolve(remote, chosen)
    }

    async fn path_down(
        &self,
        remote: &RemoteAddr,
        fingerprint: &Fingerprint,
        interface: &PathInterface,
    ) -> Result<()> {
        self.lifecycle.ensure_open(remote, "path_down")?;
        let lua = self.host.lock().await;
        debug!(remote = %remote, fingerprint = %fingerprint, "script pathdown");
        let iface = interface_to_table(&lua, interface).map_err(|e| runtime_error("pathdown", e))?;
        invoke::<()>(&lua, PANAPI, "pathdown", (remote.as_str(), fingerprint.as_str(), iface))?;
        Ok(())
    }

    async fn refresh(&self, remote: &RemoteAddr, paths: &[Arc<Path>]) -> Result<()> {
        self.lifecycle.ensure_open(remote, "refresh")?;
        let lua = self.host.lock().await;
        debug!(remote = %remote, paths = paths.len(), "script refresh");
        let list = self.populate(&lua, "refresh", remote, paths)?;
        self.lifecycle.mark_populated(remote);
        invoke::<()>(&lua, PANAPI, "refresh", (remote.as_str(), list))?;
        Ok(())
    }

    async fn close(&self, remote: &RemoteAddr) -> Result<()> {
        self.lifecycle.ensure_open(remote, "close")?;
        let lua = self.host.lock().await;
        let res = invoke::<()>(&lua, PANAPI, "close", remote.as_str());
        self.release(remote);
        self.lifecycle.mark_closed(remote);
        debug!(remote = %remote, ok = res.is_ok(), "script close");
        res.map_err(Into::into)
    }
}

impl core::fmt::Debug for ScriptSelector {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ScriptSelector")
            .field("host", &self.host)
            .finish()
    }
}

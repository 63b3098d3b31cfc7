//! Built-in path choice of the path-aware network library
//!
//! Keeps the offered list and a current index per remote. Stays on the
//! current path until it is reported down, then moves to the next path in
//! offer order that neither is the failed path nor crosses the failed
//! interface.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::Selector;
use crate::errors::Result;
use crate::path::{Path, PathInterface};
use crate::types::{Fingerprint, RemoteAddr};

#[derive(Debug, Default)]
struct RemotePaths {
    paths: Vec<Arc<Path>>,
    current: usize,
}

impl RemotePaths {
    fn current(&self) -> Option<&Arc<Path>> {
        self.paths.get(self.current)
    }
}

/// Default selector: first path, failing over on `path_down`
#[derive(Debug, Default)]
pub struct DefaultSelector {
    remotes: Mutex<HashMap<RemoteAddr, RemotePaths>>,
}

impl DefaultSelector {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Selector for DefaultSelector {
    async fn initialize(&self, remote: &RemoteAddr, paths: &[Arc<Path>]) -> Result<()> {
        self.remotes.lock().await.insert(
            remote.clone(),
            RemotePaths {
                paths: paths.to_vec(),
                current: 0,
            },
        );
        Ok(())
    }

    async fn path(&self, remote: &RemoteAddr) -> Result<Option<Arc<Path>>> {
        Ok(self
            .remotes
            .lock()
            .await
            .get(remote)
            .and_then(|r| r.current().cloned()))
    }

    async fn path_down(
        &self,
        remote: &RemoteAddr,
        fingerprint: &Fingerprint,
        interface: &PathInterface,
    ) -> Result<()> {
        let mut remotes = self.remotes.lock().await;
        let Some(state) = remotes.get_mut(remote) else {
            return Ok(());
        };
        let Some(current) = state.current() else {
            return Ok(());
        };
        if current.fingerprint != *fingerprint && !current.contains_interface(interface) {
            return Ok(());
        }

        let len = state.paths.len();
        let next = (1..len)
            .map(|offset| (state.current + offset) % len)
            .find(|&i| {
                let p = &state.paths[i];
                p.fingerprint != *fingerprint && !p.contains_interface(interface)
            });
        if let Some(next) = next {
            debug!(remote = %remote, from = state.current, to = next, "default selector failing over");
            state.current = next;
        }
        Ok(())
    }

    async fn refresh(&self, remote: &RemoteAddr, paths: &[Arc<Path>]) -> Result<()> {
        let mut remotes = self.remotes.lock().await;
        let state = remotes.entry(remote.clone()).or_default();
        let current = state
            .current()
            .and_then(|cur| paths.iter().position(|p| p.fingerprint == cur.fingerprint))
            .unwrap_or(0);
        state.paths = paths.to_vec();
        state.current = current;
        Ok(())
    }

    async fn close(&self, remote: &RemoteAddr) -> Result<()> {
        self.remotes.lock().await.remove(remote);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::PathMetadata;
    use std::time::SystemTime;

    fn path(fp: &str, ifaces: &[(&str, u64)]) -> Arc<Path> {
        Arc::new(
            Path::new("1-ff00:0:110", "1-ff00:0:112", fp, SystemTime::UNIX_EPOCH).with_metadata(
                PathMetadata {
                    interfaces: ifaces.iter().map(|(ia, id)| PathInterface::new(*ia, *id)).collect(),
                    ..Default::default()
                },
            ),
        )
    }

    #[tokio::test]
    async fn test_selects_first_path() {
        let selector = DefaultSelector::new();
        let remote = RemoteAddr::from("r");
        assert!(selector.path(&remote).await.unwrap().is_none());

        selector
            .initialize(&remote, &[path("a", &[]), path("b", &[])])
            .await
            .unwrap();
        assert_eq!(selector.path(&remote).await.unwrap().unwrap().fingerprint.as_str(), "a");
    }

    #[tokio::test]
    async fn test_path_down_skips_paths_over_failed_interface() {
        let selector = DefaultSelector::new();
        let remote = RemoteAddr::from("r");
        let paths = [
            path("a", &[("x", 1)]),
            path("b", &[("x", 1)]),
            path("c", &[("y", 2)]),
        ];
        selector.initialize(&remote, &paths).await.unwrap();

        selector
            .path_down(&remote, &Fingerprint::from("zzz"), &PathInterface::new("x", 1))
            .await
            .unwrap();
        assert_eq!(selector.path(&remote).await.unwrap().unwrap().fingerprint.as_str(), "c");
    }

    #[tokio::test]
    async fn test_path_down_for_other_path_is_ignored() {
        let selector = DefaultSelector::new();
        let remote = RemoteAddr::from("r");
        selector
            .initialize(&remote, &[path("a", &[]), path("b", &[])])
            .await
            .unwrap();
        selector
            .path_down(&remote, &Fingerprint::from("b"), &PathInterface::new("q", 9))
            .await
            .unwrap();
        assert_eq!(selector.path(&remote).await.unwrap().unwrap().fingerprint.as_str(), "a");
    }

    #[tokio::test]
    async fn test_refresh_keeps_current_path() {
        let selector = DefaultSelector::new();
        let remote = RemoteAddr::from("r");
        selector
            .initialize(&remote, &[path("a", &[]), path("b", &[])])
            .await
            .unwrap();
        selector
            .path_down(&remote, &Fingerprint::from("a"), &PathInterface::new("q", 9))
            .await
            .unwrap();
        selector
            .refresh(&remote, &[path("c", &[]), path("b", &[])])
            .await
            .unwrap();
        assert_eq!(selector.path(&remote).await.unwrap().unwrap().fingerprint.as_str(), "b");
    }

    #[tokio::test]
    async fn test_close_forgets_remote() {
        let selector = DefaultSelector::new();
        let remote = RemoteAddr::from("r");
        selector.initialize(&remote, &[path("a", &[])]).await.unwrap();
        selector.close(&remote).await.unwrap();
        assert!(selector.path(&remote).await.unwrap().is_none());
    }
}

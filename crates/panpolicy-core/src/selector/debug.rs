//! Debug decorator
//!
//! Wraps another selector, logs entry and exit of every call and sleeps a
//! fixed delay before forwarding. Results pass through unchanged.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use super::{DefaultSelector, Selector};
use crate::errors::Result;
use crate::path::{Path, PathInterface};
use crate::types::{Fingerprint, RemoteAddr};

/// Selector decorator injecting delay and enter/exit logging
pub struct DebugSelector {
    delay: Duration,
    inner: Arc<dyn Selector>,
}

impl DebugSelector {
    /// Wrap `inner`, delaying every call by `delay`
    pub fn new(delay: Duration, inner: Arc<dyn Selector>) -> Self {
        Self { delay, inner }
    }

    /// Wrap a fresh [`DefaultSelector`]
    pub fn around_default(delay: Duration) -> Self {
        Self::new(delay, Arc::new(DefaultSelector::new()))
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    async fn pause(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}

impl core::fmt::Debug for DebugSelector {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DebugSelector")
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Selector for DebugSelector {
    async fn initialize(&self, remote: &RemoteAddr, paths: &[Arc<Path>]) -> Result<()> {
        info!(remote = %remote, paths = paths.len(), "Enter Initialize");
        // Own list, so the caller can reuse its buffer while the wrapped selector runs.
        let paths: Vec<Arc<Path>> = paths.to_vec();
        self.pause().await;
        let res = self.inner.initialize(remote, &paths).await;
        info!(remote = %remote, ok = res.is_ok(), "Return Initialize");
        res
    }

    async fn path(&self, remote: &RemoteAddr) -> Result<Option<Arc<Path>>> {
        info!(remote = %remote, "Enter Path");
        self.pause().await;
        let res = self.inner.path(remote).await;
        info!(
            remote = %remote,
            fingerprint = ?res.as_ref().ok().and_then(|p| p.as_ref()).map(|p| p.fingerprint.as_str()),
            "Return Path"
        );
        res
    }

    async fn path_down(
        &self,
        remote: &RemoteAddr,
        fingerprint: &Fingerprint,
        interface: &PathInterface,
    ) -> Result<()> {
        info!(remote = %remote, fingerprint = %fingerprint, ia = %interface.ia, ifid = interface.ifid, "Enter PathDown");
        self.pause().await;
        let res = self.inner.path_down(remote, fingerprint, interface).await;
        info!(remote = %remote, ok = res.is_ok(), "Return PathDown");
        res
    }

    async fn refresh(&self, remote: &RemoteAddr, paths: &[Arc<Path>]) -> Result<()> {
        info!(remote = %remote, paths = paths.len(), "Enter Refresh");
        let paths: Vec<Arc<Path>> = paths.to_vec();
        self.pause().await;
        let res = self.inner.refresh(remote, &paths).await;
        info!(remote = %remote, ok = res.is_ok(), "Return Refresh");
        res
    }

    async fn close(&self, remote: &RemoteAddr) -> Result<()> {
        info!(remote = %remote, "Enter Close");
        self.pause().await;
        let res = self.inner.close(remote).await;
        info!(remote = %remote, ok = res.is_ok(), "Return Close");
        res
    }
}

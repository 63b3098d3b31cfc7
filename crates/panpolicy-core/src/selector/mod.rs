//! Selector policy contract
//!
//! A `Selector` decides which path to use for traffic to a remote. The
//! transport layer drives it with a fixed call sequence: `initialize` before
//! first use, `path` when a connection starts, `path_down` on path failure,
//! `refresh` when the path set changes and `close` at teardown.
//!
//! Variants in this crate:
//! - [`DefaultSelector`]: the path-aware library's built-in choice
//! - [`DebugSelector`]: delay and enter/exit logging around another selector
//!
//! The remote-proxy and script variants live in their own crates and use
//! [`RemoteLifecycle`] to enforce the per-remote state machine.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::errors::{PolicyError, Result};
use crate::path::{Path, PathInterface};
use crate::types::{Fingerprint, RemoteAddr};

mod debug;
mod default;

pub use debug::DebugSelector;
pub use default::DefaultSelector;

// ----------------------------------------------------------------------------
// Selector Trait
// ----------------------------------------------------------------------------

/// Path-selection policy for one or more remotes
#[async_trait]
pub trait Selector: Send + Sync {
    /// Offer the currently valid paths for `remote` (also known as SetPaths)
    async fn initialize(&self, remote: &RemoteAddr, paths: &[Arc<Path>]) -> Result<()>;

    /// Pick a path for `remote` among those previously offered
    ///
    /// `None` means the selector has no opinion.
    async fn path(&self, remote: &RemoteAddr) -> Result<Option<Arc<Path>>>;

    /// Report that a path, or an interface on it, went down
    async fn path_down(
        &self,
        remote: &RemoteAddr,
        fingerprint: &Fingerprint,
        interface: &PathInterface,
    ) -> Result<()>;

    /// Replace the offered paths for `remote`
    async fn refresh(&self, remote: &RemoteAddr, paths: &[Arc<Path>]) -> Result<()>;

    /// Release everything held for `remote`
    async fn close(&self, remote: &RemoteAddr) -> Result<()>;
}

#[async_trait]
impl<S: Selector + ?Sized> Selector for Arc<S> {
    async fn initialize(&self, remote: &RemoteAddr, paths: &[Arc<Path>]) -> Result<()> {
        (**self).initialize(remote, paths).await
    }

    async fn path(&self, remote: &RemoteAddr) -> Result<Option<Arc<Path>>> {
        (**self).path(remote).await
    }

    async fn path_down(
        &self,
        remote: &RemoteAddr,
        fingerprint: &Fingerprint,
        interface: &PathInterface,
    ) -> Result<()> {
        (**self).path_down(remote, fingerprint, interface).await
    }

    async fn refresh(&self, remote: &RemoteAddr, paths: &[Arc<Path>]) -> Result<()> {
        (**self).refresh(remote, paths).await
    }

    async fn close(&self, remote: &RemoteAddr) -> Result<()> {
        (**self).close(remote).await
    }
}

// ----------------------------------------------------------------------------
// Per-Remote Lifecycle
// ----------------------------------------------------------------------------

/// Lifecycle of one remote inside a stateful selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteState {
    Uninitialized,
    Populated,
    Closed,
}

/// Closed remotes remembered for misuse detection before the oldest is forgotten
pub const MAX_CLOSED_REMOTES: usize = 1024;

/// Tracks `Uninitialized -> Populated -> Closed` per remote
///
/// `initialize` is accepted in every state and (re)opens the remote; every
/// other operation on a closed remote is reported as misuse. Only the last
/// [`MAX_CLOSED_REMOTES`] closed remotes are remembered; an older one reads
/// as `Uninitialized` again.
#[derive(Debug)]
pub struct RemoteLifecycle {
    inner: Mutex<LifecycleInner>,
    max_closed: usize,
}

#[derive(Debug, Default)]
struct LifecycleInner {
    states: HashMap<RemoteAddr, RemoteState>,
    closed: VecDeque<RemoteAddr>,
}

impl Default for RemoteLifecycle {
    fn default() -> Self {
        Self::with_max_closed(MAX_CLOSED_REMOTES)
    }
}

impl RemoteLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_closed(max_closed: usize) -> Self {
        Self {
            inner: Mutex::new(LifecycleInner::default()),
            max_closed,
        }
    }

    pub fn state(&self, remote: &RemoteAddr) -> RemoteState {
        self.lock()
            .states
            .get(remote)
            .copied()
            .unwrap_or(RemoteState::Uninitialized)
    }

    /// Number of remotes with a recorded state
    pub fn tracked(&self) -> usize {
        self.lock().states.len()
    }

    /// Fail with a misuse error if `remote` is closed
    pub fn ensure_open(&self, remote: &RemoteAddr, operation: &'static str) -> Result<RemoteState> {
        match self.state(remote) {
            RemoteState::Closed => Err(PolicyError::remote_closed(remote, operation)),
            state => Ok(state),
        }
    }

    pub fn mark_populated(&self, remote: &RemoteAddr) {
        let mut inner = self.lock();
        if inner.states.insert(remote.clone(), RemoteState::Populated) == Some(RemoteState::Closed) {
            inner.closed.retain(|r| r != remote);
        }
    }

    pub fn mark_closed(&self, remote: &RemoteAddr) {
        let mut inner = self.lock();
        if inner.states.insert(remote.clone(), RemoteState::Closed) == Some(RemoteState::Closed) {
            return;
        }
        inner.closed.push_back(remote.clone());
        while inner.closed.len() > self.max_closed {
            if let Some(oldest) = inner.closed.pop_front() {
                inner.states.remove(&oldest);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, LifecycleInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

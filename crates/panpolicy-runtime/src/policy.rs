//! The closed set of selector variants
//!
//! Callers hold a `PolicySelector` and only ever talk to it through
//! `Selector`; which variant sits behind it is decided once, by the builder.

use std::sync::Arc;

use async_trait::async_trait;

use panpolicy_core::{
    DebugSelector, DefaultSelector, Fingerprint, Path, PathInterface, RemoteAddr, Result,
    Selector, SelectorKind,
};
use panpolicy_rpc::RemoteSelector;
use panpolicy_script::ScriptSelector;

/// One of the four selector variants
#[derive(Debug)]
pub enum PolicySelector {
    Default(DefaultSelector),
    Debug(DebugSelector),
    Remote(RemoteSelector),
    Scripted(ScriptSelector),
}

impl PolicySelector {
    /// Variant name for logging
    pub fn name(&self) -> &'static str {
        match self {
            PolicySelector::Default(_) => "default",
            PolicySelector::Debug(_) => "debug",
            PolicySelector::Remote(_) => "remote",
            PolicySelector::Scripted(_) => "script",
        }
    }

    /// Configured kind this variant implements; `None` for the decorator
    pub fn kind(&self) -> Option<SelectorKind> {
        match self {
            PolicySelector::Default(_) => Some(SelectorKind::Default),
            PolicySelector::Debug(_) => None,
            PolicySelector::Remote(_) => Some(SelectorKind::Remote),
            PolicySelector::Scripted(_) => Some(SelectorKind::Script),
        }
    }

    fn as_selector(&self) -> &dyn Selector {
        match self {
            PolicySelector::Default(s) => s,
            PolicySelector::Debug(s) => s,
            PolicySelector::Remote(s) => s,
            PolicySelector::Scripted(s) => s,
        }
    }
}

#[async_trait]
impl Selector for PolicySelector {
    async fn initialize(&self, remote: &RemoteAddr, paths: &[Arc<Path>]) -> Result<()> {
        self.as_selector().initialize(remote, paths).await
    }

    async fn path(&self, remote: &RemoteAddr) -> Result<Option<Arc<Path>>> {
        self.as_selector().path(remote).await
    }

    async fn path_down(
        &self,
        remote: &RemoteAddr,
        fingerprint: &Fingerprint,
        interface: &PathInterface,
    ) -> Result<()> {
        self.as_selector().path_down(remote, fingerprint, interface).await
    }

    async fn refresh(&self, remote: &RemoteAddr, paths: &[Arc<Path>]) -> Result<()> {
        self.as_selector().refresh(remote, paths).await
    }

    async fn close(&self, remote: &RemoteAddr) -> Result<()> {
        self.as_selector().close(remote).await
    }
}

impl From<DefaultSelector> for PolicySelector {
    fn from(s: DefaultSelector) -> Self {
        PolicySelector::Default(s)
    }
}

impl From<DebugSelector> for PolicySelector {
    fn from(s: DebugSelector) -> Self {
        PolicySelector::Debug(s)
    }
}

impl From<RemoteSelector> for PolicySelector {
    fn from(s: RemoteSelector) -> Self {
        PolicySelector::Remote(s)
    }
}

impl From<ScriptSelector> for PolicySelector {
    fn from(s: ScriptSelector) -> Self {
        PolicySelector::Scripted(s)
    }
}

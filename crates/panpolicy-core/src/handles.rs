//! Handle bridge between native paths and boundary-safe references
//!
//! A policy living behind a process or script boundary cannot hold an
//! `Arc<Path>`. It gets handles instead, and the owning side resolves handles
//! back to paths it already knows. Tables are keyed `RemoteAddr ->
//! Fingerprint -> handle`, with the reverse `handle -> Path`.
//!
//! Every update for a remote drops all of its previous handles before the new
//! ones are inserted, under one lock, so a stale handle resolves to nothing
//! and never to a newer path that happens to reuse a fingerprint.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::trace;

use crate::path::Path;
use crate::types::{Fingerprint, PathHandle, RemoteAddr};

// ----------------------------------------------------------------------------
// Handle Table
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct Inner<K> {
    by_remote: HashMap<RemoteAddr, HashMap<Fingerprint, K>>,
    paths: HashMap<K, Arc<Path>>,
    next_handle: u64,
}

impl<K: Clone + Eq + Hash> Inner<K> {
    fn clear(&mut self, remote: &RemoteAddr) {
        if let Some(handles) = self.by_remote.get_mut(remote) {
            for (_, handle) in handles.drain() {
                self.paths.remove(&handle);
            }
        }
    }
}

/// Two-level mapping from remote and fingerprint to handle, plus the reverse
#[derive(Debug)]
pub struct HandleTable<K = PathHandle> {
    inner: Mutex<Inner<K>>,
}

impl<K: Clone + Eq + Hash> HandleTable<K> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                by_remote: HashMap::new(),
                paths: HashMap::new(),
                next_handle: 1,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K>> {
        // The table holds no invariant a panicking writer could break halfway:
        // clear and insert both leave each map consistent on their own.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop every handle issued for `remote`
    pub fn clear(&self, remote: &RemoteAddr) {
        self.lock().clear(remote);
    }

    /// Drop every handle issued for `remote` and forget the remote entirely
    pub fn remove_remote(&self, remote: &RemoteAddr) {
        let mut inner = self.lock();
        inner.clear(remote);
        inner.by_remote.remove(remote);
    }

    /// Drop the handle of one fingerprint, returning it if there was one
    pub fn remove_path(&self, remote: &RemoteAddr, fingerprint: &Fingerprint) -> Option<K> {
        let mut inner = self.lock();
        let handle = inner.by_remote.get_mut(remote)?.remove(fingerprint)?;
        inner.paths.remove(&handle);
        Some(handle)
    }

    /// Clear `remote`, then issue one handle per path via `mint`
    ///
    /// Handles are returned in input order. Clear and populate happen under a
    /// single lock acquisition, so no concurrent `resolve` can observe a mix
    /// of old and new entries.
    pub fn replace_with<F>(&self, remote: &RemoteAddr, paths: &[Arc<Path>], mut mint: F) -> Vec<K>
    where
        F: FnMut(&Arc<Path>) -> K,
    {
        let mut inner = self.lock();
        inner.clear(remote);

        let mut handles = Vec::with_capacity(paths.len());
        let mut by_fingerprint = HashMap::with_capacity(paths.len());
        for path in paths {
            let handle = mint(path);
            by_fingerprint.insert(path.fingerprint.clone(), handle.clone());
            inner.paths.insert(handle.clone(), Arc::clone(path));
            handles.push(handle);
        }
        inner.by_remote.insert(remote.clone(), by_fingerprint);

        trace!(remote = %remote, count = handles.len(), "handle table repopulated");
        handles
    }

    /// Resolve a handle to the path it currently stands for
    ///
    /// `None` means the policy has no opinion, not an error.
    pub fn resolve(&self, handle: &K) -> Option<Arc<Path>> {
        self.lock().paths.get(handle).cloned()
    }

    /// Current handle of a fingerprint for `remote`
    pub fn handle_of(&self, remote: &RemoteAddr, fingerprint: &Fingerprint) -> Option<K> {
        self.lock()
            .by_remote
            .get(remote)
            .and_then(|handles| handles.get(fingerprint))
            .cloned()
    }

    /// Number of live handles for `remote`
    pub fn len(&self, remote: &RemoteAddr) -> usize {
        self.lock().by_remote.get(remote).map(HashMap::len).unwrap_or(0)
    }

    pub fn is_empty(&self, remote: &RemoteAddr) -> bool {
        self.len(remote) == 0
    }

    /// Whether `remote` has ever been populated and not removed since
    pub fn contains_remote(&self, remote: &RemoteAddr) -> bool {
        self.lock().by_remote.contains_key(remote)
    }
}

impl HandleTable<PathHandle> {
    /// Clear `remote`, then issue fresh wire handles for `paths`
    ///
    /// Handle values come from a counter that only moves forward, so a value
    /// is never issued twice by the same table.
    pub fn replace(&self, remote: &RemoteAddr, paths: &[Arc<Path>]) -> Vec<PathHandle> {
        let mut inner = self.lock();
        inner.clear(remote);

        let mut handles = Vec::with_capacity(paths.len());
        let mut by_fingerprint = HashMap::with_capacity(paths.len());
        for path in paths {
            let handle = PathHandle::new(inner.next_handle);
            inner.next_handle += 1;
            by_fingerprint.insert(path.fingerprint.clone(), handle);
            inner.paths.insert(handle, Arc::clone(path));
            handles.push(handle);
        }
        inner.by_remote.insert(remote.clone(), by_fingerprint);

        trace!(remote = %remote, count = handles.len(), "handle table repopulated");
        handles
    }
}

impl<K: Clone + Eq + Hash> Default for HandleTable<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    fn path(fp: &str) -> Arc<Path> {
        Arc::new(Path::new("1-ff00:0:110", "1-ff00:0:112", fp, SystemTime::UNIX_EPOCH))
    }

    #[test]
    fn test_replace_preserves_input_order() {
        let table = HandleTable::new();
        let remote = RemoteAddr::from("remote");
        let paths = vec![path("a"), path("b"), path("c")];

        let handles = table.replace(&remote, &paths);
        assert_eq!(handles.len(), 3);
        for (handle, p) in handles.iter().zip(&paths) {
            assert_eq!(table.resolve(handle).unwrap().fingerprint, p.fingerprint);
        }
    }

    #[test]
    fn test_reused_fingerprint_does_not_resolve_through_stale_handle() {
        let table = HandleTable::new();
        let remote = RemoteAddr::from("remote");

        let old = table.replace(&remote, &[path("a")]);
        let fresh = path("a");
        let new = table.replace(&remote, &[Arc::clone(&fresh)]);

        assert!(table.resolve(&old[0]).is_none());
        assert!(Arc::ptr_eq(&table.resolve(&new[0]).unwrap(), &fresh));
        assert_ne!(old[0], new[0]);
    }

    #[test]
    fn test_remotes_are_independent() {
        let table = HandleTable::new();
        let r1 = RemoteAddr::from("r1");
        let r2 = RemoteAddr::from("r2");

        let h1 = table.replace(&r1, &[path("a")]);
        let h2 = table.replace(&r2, &[path("a")]);
        table.clear(&r1);

        assert!(table.resolve(&h1[0]).is_none());
        assert!(table.resolve(&h2[0]).is_some());
        assert_eq!(table.handle_of(&r2, &Fingerprint::from("a")), Some(h2[0]));
    }

    #[test]
    fn test_remove_remote_forgets_it() {
        let table = HandleTable::new();
        let remote = RemoteAddr::from("r");
        table.replace(&remote, &[path("a")]);
        assert!(table.contains_remote(&remote));

        table.remove_remote(&remote);
        assert!(!table.contains_remote(&remote));
        assert!(table.is_empty(&remote));
    }

    #[test]
    fn test_replace_with_custom_keys() {
        let table: HandleTable<String> = HandleTable::new();
        let remote = RemoteAddr::from("r");
        let keys = table.replace_with(&remote, &[path("a"), path("b")], |p| {
            format!("key-{}", p.fingerprint)
        });
        assert_eq!(keys, vec!["key-a".to_string(), "key-b".to_string()]);
        assert_eq!(table.resolve(&"key-b".to_string()).unwrap().fingerprint.as_str(), "b");
    }

    #[test]
    fn test_remove_path_drops_only_that_fingerprint() {
        let table = HandleTable::new();
        let remote = RemoteAddr::from("r");
        let handles = table.replace(&remote, &[path("a"), path("b")]);

        assert_eq!(table.remove_path(&remote, &Fingerprint::from("a")), Some(handles[0]));
        assert!(table.resolve(&handles[0]).is_none());
        assert!(table.resolve(&handles[1]).is_some());
        assert_eq!(table.len(&remote), 1);

        assert_eq!(table.remove_path(&remote, &Fingerprint::from("a")), None);
        assert_eq!(table.remove_path(&RemoteAddr::from("other"), &Fingerprint::from("b")), None);
    }
}

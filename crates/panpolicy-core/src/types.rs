//! Core identifier types for path-selection policy
//!
//! Newtype wrappers around the string and integer identities that cross the
//! policy boundary, so that a fingerprint can never be passed where a remote
//! address is expected.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Remote Address
// ----------------------------------------------------------------------------

/// Opaque identifier of a remote endpoint; outer key of all per-remote state
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RemoteAddr(String);

impl RemoteAddr {
    /// Create a remote address from its string form
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    /// Get the string form
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RemoteAddr {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for RemoteAddr {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ----------------------------------------------------------------------------
// Path Fingerprint
// ----------------------------------------------------------------------------

/// Identity of a path, unique among the paths currently valid for one remote
///
/// Not unique over time: after a refresh the same fingerprint may name a
/// different path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(fp: impl Into<String>) -> Self {
        Self(fp.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Fingerprint {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Fingerprint {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ----------------------------------------------------------------------------
// ISD-AS Identifier
// ----------------------------------------------------------------------------

/// Identifier of an autonomous system in the path-aware network (e.g. `1-ff00:0:110`)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IsdAs(String);

impl IsdAs {
    pub fn new(ia: impl Into<String>) -> Self {
        Self(ia.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IsdAs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IsdAs {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for IsdAs {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ----------------------------------------------------------------------------
// Path Handle
// ----------------------------------------------------------------------------

/// Boundary-safe stand-in for a native path reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PathHandle(u64);

impl PathHandle {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for PathHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Tracing Identifier
// ----------------------------------------------------------------------------

/// Per-connection key multiplexing telemetry over one forwarding channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TracingId(u64);

impl TracingId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TracingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Mints tracing ids that are unique for the lifetime of the allocator
#[derive(Debug)]
pub struct TracingIdAllocator {
    next: AtomicU64,
}

impl TracingIdAllocator {
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Allocate the next tracing id
    pub fn allocate(&self) -> TracingId {
        TracingId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for TracingIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_tracing_ids_are_unique() {
        let allocator = TracingIdAllocator::new();
        let ids: HashSet<_> = (0..1000).map(|_| allocator.allocate()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_identifier_display() {
        assert_eq!(RemoteAddr::from("1-ff00:0:112,[10.0.0.2]:443").to_string(), "1-ff00:0:112,[10.0.0.2]:443");
        assert_eq!(PathHandle::new(7).to_string(), "#7");
        assert_eq!(Fingerprint::from("abc").as_str(), "abc");
    }
}

//! Path model
//!
//! Read-only descriptors of routes through the path-aware network. Paths are
//! produced by the path-discovery layer and shared as `Arc<Path>`; nothing in
//! this workspace allocates them for its own purposes or mutates them.

use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::types::{Fingerprint, IsdAs};

// ----------------------------------------------------------------------------
// Path Interface
// ----------------------------------------------------------------------------

/// One interface traversed by a path
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathInterface {
    /// AS owning the interface
    pub ia: IsdAs,
    /// Interface id within that AS
    pub ifid: u64,
}

impl PathInterface {
    pub fn new(ia: impl Into<IsdAs>, ifid: u64) -> Self {
        Self { ia: ia.into(), ifid }
    }
}

// ----------------------------------------------------------------------------
// Path Metadata
// ----------------------------------------------------------------------------

/// Kind of inter-domain link between two hops
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum LinkType {
    #[default]
    Unset,
    Direct,
    MultiHop,
    OpenNet,
}

impl LinkType {
    /// Numeric code as exposed to scripts
    pub fn code(&self) -> u8 {
        match self {
            LinkType::Unset => 0,
            LinkType::Direct => 1,
            LinkType::MultiHop => 2,
            LinkType::OpenNet => 3,
        }
    }
}

/// Geographic hint for a hop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct GeoCoordinates {
    pub latitude: f32,
    pub longitude: f32,
    pub address: String,
}

/// Metadata announced for a path by the path-aware network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PathMetadata {
    /// Path MTU in bytes
    pub mtu: u16,
    /// Interfaces in traversal order
    pub interfaces: Vec<PathInterface>,
    /// Per-hop latency samples
    pub latency: Vec<Duration>,
    /// Per-hop bandwidth in kbit/s
    pub bandwidth: Vec<u64>,
    pub link_type: Vec<LinkType>,
    pub internal_hops: Vec<u32>,
    pub notes: Vec<String>,
    pub geo: Vec<GeoCoordinates>,
}

// ----------------------------------------------------------------------------
// Path
// ----------------------------------------------------------------------------

/// Descriptor of one route between the local and a remote endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Path {
    pub source: IsdAs,
    pub destination: IsdAs,
    pub fingerprint: Fingerprint,
    pub expiry: SystemTime,
    pub metadata: Option<PathMetadata>,
}

impl Path {
    /// Create a path without metadata
    pub fn new(
        source: impl Into<IsdAs>,
        destination: impl Into<IsdAs>,
        fingerprint: impl Into<Fingerprint>,
        expiry: SystemTime,
    ) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            fingerprint: fingerprint.into(),
            expiry,
            metadata: None,
        }
    }

    /// Attach metadata
    pub fn with_metadata(mut self, metadata: PathMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Whether the path traverses the given interface
    pub fn contains_interface(&self, interface: &PathInterface) -> bool {
        self.metadata
            .as_ref()
            .map(|m| m.interfaces.iter().any(|i| i == interface))
            .unwrap_or(false)
    }

    /// Whether the path has expired at `now`
    pub fn is_expired(&self, now: SystemTime) -> bool {
        self.expiry <= now
    }
}

//! Value types carried by connection telemetry events

use core::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Number of bytes
pub type ByteCount = u64;
/// Packet number within one packet number space
pub type PacketNumber = i64;
/// Key phase generation
pub type KeyPhase = u64;

/// Which side of a connection produced the events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Perspective {
    Client,
    Server,
}

impl fmt::Display for Perspective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Perspective::Client => f.write_str("client"),
            Perspective::Server => f.write_str("server"),
        }
    }
}

/// Transport-level connection id
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ConnectionId(Vec<u8>);

impl ConnectionId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

/// Transport protocol version number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionNumber(pub u32);

impl fmt::Display for VersionNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketType {
    Initial,
    Handshake,
    Retry,
    ZeroRtt,
    VersionNegotiation,
    OneRtt,
    StatelessReset,
    NotDetermined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketDropReason {
    KeyUnavailable,
    UnknownConnectionId,
    HeaderParseError,
    PayloadDecryptError,
    ProtocolViolation,
    DosPrevention,
    UnsupportedVersion,
    UnexpectedPacket,
    UnexpectedSourceConnectionId,
    UnexpectedVersion,
    DuplicatePacket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketLossReason {
    ReorderingThreshold,
    TimeThreshold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EncryptionLevel {
    Initial,
    Handshake,
    ZeroRtt,
    OneRtt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CongestionState {
    SlowStart,
    CongestionAvoidance,
    Recovery,
    ApplicationLimited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimerType {
    Ack,
    Pto,
}

/// Long or short packet header as seen on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketHeader {
    pub packet_type: PacketType,
    pub version: Option<VersionNumber>,
    pub dest_conn_id: ConnectionId,
    pub src_conn_id: ConnectionId,
    pub length: ByteCount,
}

/// Header after removal of header protection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedHeader {
    pub header: PacketHeader,
    pub packet_number: PacketNumber,
    pub key_phase: KeyPhase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckRange {
    pub smallest: PacketNumber,
    pub largest: PacketNumber,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckFrame {
    pub ranges: Vec<AckRange>,
    pub delay: Duration,
}

/// Round-trip statistics snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RttStats {
    pub latest_rtt: Duration,
    pub min_rtt: Duration,
    pub smoothed_rtt: Duration,
    pub mean_deviation: Duration,
    pub max_ack_delay: Duration,
    pub pto: Duration,
}

/// Transport parameters exchanged during the handshake
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransportParameters {
    pub initial_max_stream_data_bidi_local: ByteCount,
    pub initial_max_stream_data_bidi_remote: ByteCount,
    pub initial_max_stream_data_uni: ByteCount,
    pub initial_max_data: ByteCount,
    pub max_ack_delay: Duration,
    pub ack_delay_exponent: u8,
    pub disable_active_migration: bool,
    pub max_udp_payload_size: ByteCount,
    pub max_uni_stream_num: u64,
    pub max_bidi_stream_num: u64,
    pub max_idle_timeout: Duration,
    pub original_destination_connection_id: Option<ConnectionId>,
    pub initial_source_connection_id: Option<ConnectionId>,
    pub retry_source_connection_id: Option<ConnectionId>,
    pub stateless_reset_token: Option<[u8; 16]>,
    pub active_connection_id_limit: u64,
    pub max_datagram_frame_size: ByteCount,
}

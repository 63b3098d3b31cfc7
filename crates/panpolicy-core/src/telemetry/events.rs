//! Connection-lifecycle event taxonomy

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use super::types::*;

/// One connection-lifecycle event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConnectionEvent {
    StartedConnection {
        local: String,
        remote: String,
        src_conn_id: ConnectionId,
        dest_conn_id: ConnectionId,
    },
    NegotiatedVersion {
        chosen: VersionNumber,
        client_versions: Vec<VersionNumber>,
        server_versions: Vec<VersionNumber>,
    },
    ClosedConnection {
        /// `None` for a clean close
        reason: Option<String>,
    },
    SentTransportParameters {
        parameters: TransportParameters,
    },
    ReceivedTransportParameters {
        parameters: TransportParameters,
    },
    RestoredTransportParameters {
        parameters: TransportParameters,
    },
    SentPacket {
        header: ExtendedHeader,
        size: ByteCount,
        ack: Option<AckFrame>,
    },
    ReceivedVersionNegotiationPacket {
        header: PacketHeader,
        versions: Vec<VersionNumber>,
    },
    ReceivedRetry {
        header: PacketHeader,
    },
    ReceivedPacket {
        header: ExtendedHeader,
        size: ByteCount,
    },
    BufferedPacket {
        packet_type: PacketType,
    },
    DroppedPacket {
        packet_type: PacketType,
        size: ByteCount,
        reason: PacketDropReason,
    },
    UpdatedMetrics {
        rtt: Option<RttStats>,
        congestion_window: ByteCount,
        bytes_in_flight: ByteCount,
        packets_in_flight: u64,
    },
    AcknowledgedPacket {
        encryption_level: EncryptionLevel,
        packet_number: PacketNumber,
    },
    LostPacket {
        encryption_level: EncryptionLevel,
        packet_number: PacketNumber,
        reason: PacketLossReason,
    },
    UpdatedCongestionState {
        state: CongestionState,
    },
    UpdatedPtoCount {
        value: u32,
    },
    UpdatedKeyFromTls {
        encryption_level: EncryptionLevel,
        perspective: Perspective,
    },
    UpdatedKey {
        generation: KeyPhase,
        remote: bool,
    },
    DroppedEncryptionLevel {
        encryption_level: EncryptionLevel,
    },
    DroppedKey {
        generation: KeyPhase,
    },
    SetLossTimer {
        timer_type: TimerType,
        encryption_level: EncryptionLevel,
        time: SystemTime,
    },
    LossTimerExpired {
        timer_type: TimerType,
        encryption_level: EncryptionLevel,
    },
    LossTimerCanceled,
    Close,
    Debug {
        name: String,
        message: String,
    },
}

impl ConnectionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ConnectionEvent::StartedConnection { .. } => EventKind::StartedConnection,
            ConnectionEvent::NegotiatedVersion { .. } => EventKind::NegotiatedVersion,
            ConnectionEvent::ClosedConnection { .. } => EventKind::ClosedConnection,
            ConnectionEvent::SentTransportParameters { .. } => EventKind::SentTransportParameters,
            ConnectionEvent::ReceivedTransportParameters { .. } => {
                EventKind::ReceivedTransportParameters
            }
            ConnectionEvent::RestoredTransportParameters { .. } => {
                EventKind::RestoredTransportParameters
            }
            ConnectionEvent::SentPacket { .. } => EventKind::SentPacket,
            ConnectionEvent::ReceivedVersionNegotiationPacket { .. } => {
                EventKind::ReceivedVersionNegotiationPacket
            }
            ConnectionEvent::ReceivedRetry { .. } => EventKind::ReceivedRetry,
            ConnectionEvent::ReceivedPacket { .. } => EventKind::ReceivedPacket,
            ConnectionEvent::BufferedPacket { .. } => EventKind::BufferedPacket,
            ConnectionEvent::DroppedPacket { .. } => EventKind::DroppedPacket,
            ConnectionEvent::UpdatedMetrics { .. } => EventKind::UpdatedMetrics,
            ConnectionEvent::AcknowledgedPacket { .. } => EventKind::AcknowledgedPacket,
            ConnectionEvent::LostPacket { .. } => EventKind::LostPacket,
            ConnectionEvent::UpdatedCongestionState { .. } => EventKind::UpdatedCongestionState,
            ConnectionEvent::UpdatedPtoCount { .. } => EventKind::UpdatedPtoCount,
            ConnectionEvent::UpdatedKeyFromTls { .. } => EventKind::UpdatedKeyFromTls,
            ConnectionEvent::UpdatedKey { .. } => EventKind::UpdatedKey,
            ConnectionEvent::DroppedEncryptionLevel { .. } => EventKind::DroppedEncryptionLevel,
            ConnectionEvent::DroppedKey { .. } => EventKind::DroppedKey,
            ConnectionEvent::SetLossTimer { .. } => EventKind::SetLossTimer,
            ConnectionEvent::LossTimerExpired { .. } => EventKind::LossTimerExpired,
            ConnectionEvent::LossTimerCanceled => EventKind::LossTimerCanceled,
            ConnectionEvent::Close => EventKind::Close,
            ConnectionEvent::Debug { .. } => EventKind::Debug,
        }
    }
}

// ----------------------------------------------------------------------------
// Event Kinds
// ----------------------------------------------------------------------------

/// Discriminant of [`ConnectionEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    StartedConnection,
    NegotiatedVersion,
    ClosedConnection,
    SentTransportParameters,
    ReceivedTransportParameters,
    RestoredTransportParameters,
    SentPacket,
    ReceivedVersionNegotiationPacket,
    ReceivedRetry,
    ReceivedPacket,
    BufferedPacket,
    DroppedPacket,
    UpdatedMetrics,
    AcknowledgedPacket,
    LostPacket,
    UpdatedCongestionState,
    UpdatedPtoCount,
    UpdatedKeyFromTls,
    UpdatedKey,
    DroppedEncryptionLevel,
    DroppedKey,
    SetLossTimer,
    LossTimerExpired,
    LossTimerCanceled,
    Close,
    Debug,
}

impl EventKind {
    pub const ALL: [EventKind; 26] = [
        EventKind::StartedConnection,
        EventKind::NegotiatedVersion,
        EventKind::ClosedConnection,
        EventKind::SentTransportParameters,
        EventKind::ReceivedTransportParameters,
        EventKind::RestoredTransportParameters,
        EventKind::SentPacket,
        EventKind::ReceivedVersionNegotiationPacket,
        EventKind::ReceivedRetry,
        EventKind::ReceivedPacket,
        EventKind::BufferedPacket,
        EventKind::DroppedPacket,
        EventKind::UpdatedMetrics,
        EventKind::AcknowledgedPacket,
        EventKind::LostPacket,
        EventKind::UpdatedCongestionState,
        EventKind::UpdatedPtoCount,
        EventKind::UpdatedKeyFromTls,
        EventKind::UpdatedKey,
        EventKind::DroppedEncryptionLevel,
        EventKind::DroppedKey,
        EventKind::SetLossTimer,
        EventKind::LossTimerExpired,
        EventKind::LossTimerCanceled,
        EventKind::Close,
        EventKind::Debug,
    ];

    /// Event name as used in forwarded method names and script entry points
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::StartedConnection => "StartedConnection",
            EventKind::NegotiatedVersion => "NegotiatedVersion",
            EventKind::ClosedConnection => "ClosedConnection",
            EventKind::SentTransportParameters => "SentTransportParameters",
            EventKind::ReceivedTransportParameters => "ReceivedTransportParameters",
            EventKind::RestoredTransportParameters => "RestoredTransportParameters",
            EventKind::SentPacket => "SentPacket",
            EventKind::ReceivedVersionNegotiationPacket => "ReceivedVersionNegotiationPacket",
            EventKind::ReceivedRetry => "ReceivedRetry",
            EventKind::ReceivedPacket => "ReceivedPacket",
            EventKind::BufferedPacket => "BufferedPacket",
            EventKind::DroppedPacket => "DroppedPacket",
            EventKind::UpdatedMetrics => "UpdatedMetrics",
            EventKind::AcknowledgedPacket => "AcknowledgedPacket",
            EventKind::LostPacket => "LostPacket",
            EventKind::UpdatedCongestionState => "UpdatedCongestionState",
            EventKind::UpdatedPtoCount => "UpdatedPTOCount",
            EventKind::UpdatedKeyFromTls => "UpdatedKeyFromTLS",
            EventKind::UpdatedKey => "UpdatedKey",
            EventKind::DroppedEncryptionLevel => "DroppedEncryptionLevel",
            EventKind::DroppedKey => "DroppedKey",
            EventKind::SetLossTimer => "SetLossTimer",
            EventKind::LossTimerExpired => "LossTimerExpired",
            EventKind::LossTimerCanceled => "LossTimerCanceled",
            EventKind::Close => "Close",
            EventKind::Debug => "Debug",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }
}

impl core::fmt::Display for EventKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

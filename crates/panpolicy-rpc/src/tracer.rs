//! Telemetry forwarding
//!
//! Every event kind is its own method, `ConnectionTracer.<EventName>`, and
//! every method takes the same [`ConnectionTracerMsg`]: one optional field
//! per datum, with only the fields of that kind populated. The receiver
//! checks the fields its kind requires before anything reaches the tracer.

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use panpolicy_core::telemetry::{
    AckFrame, ByteCount, CongestionState, EncryptionLevel, ExtendedHeader, KeyPhase,
    PacketDropReason, PacketHeader, PacketLossReason, PacketNumber, PacketType, RttStats,
    TimerType, TransportParameters, VersionNumber,
};
use panpolicy_core::{
    ConnectionEvent, ConnectionId, EventKind, MethodError, MethodErrorKind, Perspective, Result,
    Tracer, TracingId, TracingIdAllocator,
};

use crate::client::CallClient;
use crate::server::{CallContext, CallServer, ClientId};

/// Method registering a new connection
pub const NEW_TRACER_FOR_CONNECTION: &str = "ConnectionTracer.NewTracerForConnection";

/// Method name carrying events of `kind`
pub fn method_for(kind: EventKind) -> String {
    format!("ConnectionTracer.{}", kind.name())
}

/// Record fields an event of `kind` cannot be rebuilt without
///
/// `tracing_id` is required by every method and not listed.
pub fn required_fields(kind: EventKind) -> &'static [&'static str] {
    match kind {
        EventKind::StartedConnection => &["local", "remote", "src_conn_id", "dest_conn_id"],
        EventKind::NegotiatedVersion => &["chosen"],
        EventKind::ClosedConnection => &[],
        EventKind::SentTransportParameters
        | EventKind::ReceivedTransportParameters
        | EventKind::RestoredTransportParameters => &["parameters"],
        EventKind::SentPacket | EventKind::ReceivedPacket => &["extended_header", "byte_count"],
        EventKind::ReceivedVersionNegotiationPacket | EventKind::ReceivedRetry => &["header"],
        EventKind::BufferedPacket => &["packet_type"],
        EventKind::DroppedPacket => &["packet_type", "byte_count", "drop_reason"],
        EventKind::UpdatedMetrics => &["cwnd", "byte_count", "packets"],
        EventKind::AcknowledgedPacket => &["encryption_level", "packet_number"],
        EventKind::LostPacket => &["encryption_level", "packet_number", "loss_reason"],
        EventKind::UpdatedCongestionState => &["congestion_state"],
        EventKind::UpdatedPtoCount => &["pto_count"],
        EventKind::UpdatedKeyFromTls => &["encryption_level", "perspective"],
        EventKind::UpdatedKey => &["generation", "flag"],
        EventKind::DroppedEncryptionLevel => &["encryption_level"],
        EventKind::DroppedKey => &["generation"],
        EventKind::SetLossTimer => &["timer_type", "encryption_level", "time"],
        EventKind::LossTimerExpired => &["timer_type", "encryption_level"],
        EventKind::LossTimerCanceled | EventKind::Close => &[],
        EventKind::Debug => &["key", "value"],
    }
}

// ----------------------------------------------------------------------------
// Request Record
// ----------------------------------------------------------------------------

/// Request record shared by every telemetry method
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionTracerMsg {
    pub tracing_id: Option<TracingId>,
    pub perspective: Option<Perspective>,
    pub odcid: Option<ConnectionId>,
    pub local: Option<String>,
    pub remote: Option<String>,
    pub src_conn_id: Option<ConnectionId>,
    pub dest_conn_id: Option<ConnectionId>,
    pub chosen: Option<VersionNumber>,
    pub versions: Option<Vec<VersionNumber>>,
    pub client_versions: Option<Vec<VersionNumber>>,
    pub server_versions: Option<Vec<VersionNumber>>,
    pub error_msg: Option<String>,
    pub key: Option<String>,
    pub value: Option<String>,
    pub parameters: Option<TransportParameters>,
    pub byte_count: Option<ByteCount>,
    pub cwnd: Option<ByteCount>,
    pub packets: Option<u64>,
    pub rtt: Option<RttStats>,
    pub header: Option<PacketHeader>,
    pub extended_header: Option<ExtendedHeader>,
    pub ack_frame: Option<AckFrame>,
    pub packet_type: Option<PacketType>,
    pub drop_reason: Option<PacketDropReason>,
    pub loss_reason: Option<PacketLossReason>,
    pub encryption_level: Option<EncryptionLevel>,
    pub packet_number: Option<PacketNumber>,
    pub congestion_state: Option<CongestionState>,
    pub pto_count: Option<u32>,
    pub generation: Option<KeyPhase>,
    pub flag: Option<bool>,
    pub timer_type: Option<TimerType>,
    pub time: Option<SystemTime>,
}

impl ConnectionTracerMsg {
    /// Registration record for a new connection
    pub fn registration(id: TracingId, perspective: Perspective, odcid: &ConnectionId) -> Self {
        Self {
            tracing_id: Some(id),
            perspective: Some(perspective),
            odcid: Some(odcid.clone()),
            ..Default::default()
        }
    }

    /// Flatten `event` into the record
    pub fn from_event(id: TracingId, event: ConnectionEvent) -> Self {
        let mut m = Self {
            tracing_id: Some(id),
            ..Default::default()
        };
        match event {
            ConnectionEvent::StartedConnection {
                local,
                remote,
                src_conn_id,
                dest_conn_id,
            } => {
                m.local = Some(local);
                m.remote = Some(remote);
                m.src_conn_id = Some(src_conn_id);
                m.dest_conn_id = Some(dest_conn_id);
            }
            ConnectionEvent::NegotiatedVersion {
                chosen,
                client_versions,
                server_versions,
            } => {
                m.chosen = Some(chosen);
                m.client_versions = Some(client_versions);
                m.server_versions = Some(server_versions);
            }
            ConnectionEvent::ClosedConnection { reason } => m.error_msg = reason,
            ConnectionEvent::SentTransportParameters { parameters }
            | ConnectionEvent::ReceivedTransportParameters { parameters }
            | ConnectionEvent::RestoredTransportParameters { parameters } => {
                m.parameters = Some(parameters);
            }
            ConnectionEvent::SentPacket { header, size, ack } => {
                m.extended_header = Some(header);
                m.byte_count = Some(size);
                m.ack_frame = ack;
            }
            ConnectionEvent::ReceivedVersionNegotiationPacket { header, versions } => {
                m.header = Some(header);
                m.versions = Some(versions);
            }
            ConnectionEvent::ReceivedRetry { header } => m.header = Some(header),
            ConnectionEvent::ReceivedPacket { header, size } => {
                m.extended_header = Some(header);
                m.byte_count = Some(size);
            }
            ConnectionEvent::BufferedPacket { packet_type } => m.packet_type = Some(packet_type),
            ConnectionEvent::DroppedPacket {
                packet_type,
                size,
                reason,
            } => {
                m.packet_type = Some(packet_type);
                m.byte_count = Some(size);
                m.drop_reason = Some(reason);
            }
            ConnectionEvent::UpdatedMetrics {
                rtt,
                congestion_window,
                bytes_in_flight,
                packets_in_flight,
            } => {
                m.rtt = rtt;
                m.cwnd = Some(congestion_window);
                m.byte_count = Some(bytes_in_flight);
                m.packets = Some(packets_in_flight);
            }
            ConnectionEvent::AcknowledgedPacket {
                encryption_level,
                packet_number,
            } => {
                m.encryption_level = Some(encryption_level);
                m.packet_number = Some(packet_number);
            }
            ConnectionEvent::LostPacket {
                encryption_level,
                packet_number,
                reason,
            } => {
                m.encryption_level = Some(encryption_level);
                m.packet_number = Some(packet_number);
                m.loss_reason = Some(reason);
            }
            ConnectionEvent::UpdatedCongestionState { state } => m.congestion_state = Some(state),
            ConnectionEvent::UpdatedPtoCount { value } => m.pto_count = Some(value),
            ConnectionEvent::UpdatedKeyFromTls {
                encryption_level,
                perspective,
            } => {
                m.encryption_level = Some(encryption_level);
                m.perspective = Some(perspective);
            }
            ConnectionEvent::UpdatedKey { generation, remote } => {
                m.generation = Some(generation);
                m.flag = Some(remote);
            }
            ConnectionEvent::DroppedEncryptionLevel { encryption_level } => {
                m.encryption_level = Some(encryption_level);
            }
            ConnectionEvent::DroppedKey { generation } => m.generation = Some(generation),
            ConnectionEvent::SetLossTimer {
                timer_type,
                encryption_level,
                time,
            } => {
                m.timer_type = Some(timer_type);
                m.encryption_level = Some(encryption_level);
                m.time = Some(time);
            }
            ConnectionEvent::LossTimerExpired {
                timer_type,
                encryption_level,
            } => {
                m.timer_type = Some(timer_type);
                m.encryption_level = Some(encryption_level);
            }
            ConnectionEvent::LossTimerCanceled | ConnectionEvent::Close => {}
            ConnectionEvent::Debug { name, message } => {
                m.key = Some(name);
                m.value = Some(message);
            }
        }
        m
    }

    /// Rebuild an event of `kind`, failing on the first absent required field
    ///
    /// Absent version lists, close reason, ack frame and RTT statistics are
    /// not required.
    pub fn into_event(self, kind: EventKind) -> core::result::Result<ConnectionEvent, MethodError> {
        let method = method_for(kind);
        let req = |field: &str| MethodError::missing_field(&method, field);
        let m = self;

        let event = match kind {
            EventKind::StartedConnection => ConnectionEvent::StartedConnection {
                local: m.local.ok_or_else(|| req("local"))?,
                remote: m.remote.ok_or_else(|| req("remote"))?,
                src_conn_id: m.src_conn_id.ok_or_else(|| req("src_conn_id"))?,
                dest_conn_id: m.dest_conn_id.ok_or_else(|| req("dest_conn_id"))?,
            },
            EventKind::NegotiatedVersion => ConnectionEvent::NegotiatedVersion {
                chosen: m.chosen.ok_or_else(|| req("chosen"))?,
                client_versions: m.client_versions.unwrap_or_default(),
                server_versions: m.server_versions.unwrap_or_default(),
            },
            EventKind::ClosedConnection => ConnectionEvent::ClosedConnection { reason: m.error_msg },
            EventKind::SentTransportParameters => ConnectionEvent::SentTransportParameters {
                parameters: m.parameters.ok_or_else(|| req("parameters"))?,
            },
            EventKind::ReceivedTransportParameters => ConnectionEvent::ReceivedTransportParameters {
                parameters: m.parameters.ok_or_else(|| req("parameters"))?,
            },
            EventKind::RestoredTransportParameters => ConnectionEvent::RestoredTransportParameters {
                parameters: m.parameters.ok_or_else(|| req("parameters"))?,
            },
            EventKind::SentPacket => ConnectionEvent::SentPacket {
                header: m.extended_header.ok_or_else(|| req("extended_header"))?,
                size: m.byte_count.ok_or_else(|| req("byte_count"))?,
                ack: m.ack_frame,
            },
            EventKind::ReceivedVersionNegotiationPacket => {
                ConnectionEvent::ReceivedVersionNegotiationPacket {
                    header: m.header.ok_or_else(|| req("header"))?,
                    versions: m.versions.unwrap_or_default(),
                }
            }
            EventKind::ReceivedRetry => ConnectionEvent::ReceivedRetry {
                header: m.header.ok_or_else(|| req("header"))?,
            },
            EventKind::ReceivedPacket => ConnectionEvent::ReceivedPacket {
                header: m.extended_header.ok_or_else(|| req("extended_header"))?,
                size: m.byte_count.ok_or_else(|| req("byte_count"))?,
            },
            EventKind::BufferedPacket => ConnectionEvent::BufferedPacket {
                packet_type: m.packet_type.ok_or_else(|| req("packet_type"))?,
            },
            EventKind::DroppedPacket => ConnectionEvent::DroppedPacket {
                packet_type: m.packet_type.ok_or_else(|| req("packet_type"))?,
                size: m.byte_count.ok_or_else(|| req("byte_count"))?,
                reason: m.drop_reason.ok_or_else(|| req("drop_reason"))?,
            },
            EventKind::UpdatedMetrics => ConnectionEvent::UpdatedMetrics {
                rtt: m.rtt,
                congestion_window: m.cwnd.ok_or_else(|| req("cwnd"))?,
                bytes_in_flight: m.byte_count.ok_or_else(|| req("byte_count"))?,
                packets_in_flight: m.packets.ok_or_else(|| req("packets"))?,
            },
            EventKind::AcknowledgedPacket => ConnectionEvent::AcknowledgedPacket {
                encryption_level: m.encryption_level.ok_or_else(|| req("encryption_level"))?,
                packet_number: m.packet_number.ok_or_else(|| req("packet_number"))?,
            },
            EventKind::LostPacket => ConnectionEvent::LostPacket {
                encryption_level: m.encryption_level.ok_or_else(|| req("encryption_level"))?,
                packet_number: m.packet_number.ok_or_else(|| req("packet_number"))?,
                reason: m.loss_reason.ok_or_else(|| req("loss_reason"))?,
            },
            EventKind::UpdatedCongestionState => ConnectionEvent::UpdatedCongestionState {
                state: m.congestion_state.ok_or_else(|| req("congestion_state"))?,
            },
            EventKind::UpdatedPtoCount => ConnectionEvent::UpdatedPtoCount {
                value: m.pto_count.ok_or_else(|| req("pto_count"))?,
            },
            EventKind::UpdatedKeyFromTls => ConnectionEvent::UpdatedKeyFromTls {
                encryption_level: m.encryption_level.ok_or_else(|| req("encryption_level"))?,
                perspective: m.perspective.ok_or_else(|| req("perspective"))?,
            },
            EventKind::UpdatedKey => ConnectionEvent::UpdatedKey {
                generation: m.generation.ok_or_else(|| req("generation"))?,
                remote: m.flag.ok_or_else(|| req("flag"))?,
            },
            EventKind::DroppedEncryptionLevel => ConnectionEvent::DroppedEncryptionLevel {
                encryption_level: m.encryption_level.ok_or_else(|| req("encryption_level"))?,
            },
            EventKind::DroppedKey => ConnectionEvent::DroppedKey {
                generation: m.generation.ok_or_else(|| req("generation"))?,
            },
            EventKind::SetLossTimer => ConnectionEvent::SetLossTimer {
                timer_type: m.timer_type.ok_or_else(|| req("timer_type"))?,
                encryption_level: m.encryption_level.ok_or_else(|| req("encryption_level"))?,
                time: m.time.ok_or_else(|| req("time"))?,
            },
            EventKind::LossTimerExpired => ConnectionEvent::LossTimerExpired {
                timer_type: m.timer_type.ok_or_else(|| req("timer_type"))?,
                encryption_level: m.encryption_level.ok_or_else(|| req("encryption_level"))?,
            },
            EventKind::LossTimerCanceled => ConnectionEvent::LossTimerCanceled,
            EventKind::Close => ConnectionEvent::Close,
            EventKind::Debug => ConnectionEvent::Debug {
                name: m.key.ok_or_else(|| req("key"))?,
                message: m.value.ok_or_else(|| req("value"))?,
            },
        };
        Ok(event)
    }
}

// ----------------------------------------------------------------------------
// Forwarding Tracer
// ----------------------------------------------------------------------------

/// Tracer forwarding every event to a policy daemon
#[derive(Debug, Clone)]
pub struct ForwardingTracer {
    client: CallClient,
}

impl ForwardingTracer {
    pub fn new(client: CallClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Tracer for ForwardingTracer {
    async fn tracer_for_connection(
        &self,
        id: TracingId,
        perspective: Perspective,
        odcid: &ConnectionId,
    ) -> Result<()> {
        let msg = ConnectionTracerMsg::registration(id, perspective, odcid);
        self.client.call::<_, ()>(NEW_TRACER_FOR_CONNECTION, &msg).await?;
        Ok(())
    }

    async fn record(&self, id: TracingId, event: ConnectionEvent) -> Result<()> {
        let method = method_for(event.kind());
        let msg = ConnectionTracerMsg::from_event(id, event);
        self.client.call::<_, ()>(&method, &msg).await?;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tracer Server
// ----------------------------------------------------------------------------

/// Receives forwarded telemetry and feeds a local tracer
///
/// Sender tracing ids are only unique per sender, so each `(client, id)` pair
/// is mapped to an id minted here before it reaches the local tracer. A
/// mapping lives until its client disconnects.
pub struct TracerServer {
    tracer: Arc<dyn Tracer>,
    ids: TracingIdAllocator,
    connections: DashMap<(ClientId, TracingId), TracingId>,
}

impl TracerServer {
    pub fn new(tracer: Arc<dyn Tracer>) -> Arc<Self> {
        Arc::new(Self {
            tracer,
            ids: TracingIdAllocator::new(),
            connections: DashMap::new(),
        })
    }

    /// Register the registration method, all event methods and per-client cleanup
    pub fn register(self: &Arc<Self>, server: &mut CallServer) {
        let this = Arc::clone(self);
        server.register(NEW_TRACER_FOR_CONNECTION, move |ctx, msg: ConnectionTracerMsg| {
            let this = Arc::clone(&this);
            async move { this.new_connection(ctx, msg).await }
        });
        for kind in EventKind::ALL {
            let this = Arc::clone(self);
            server.register(method_for(kind), move |ctx, msg: ConnectionTracerMsg| {
                let this = Arc::clone(&this);
                async move { this.event(ctx, kind, msg).await }
            });
        }
        let this = Arc::clone(self);
        server.on_disconnect(move |client| this.release_client(client));
    }

    /// Number of registered connections across all clients
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Drop the id mappings of a client that went away
    pub fn release_client(&self, client: ClientId) {
        let before = self.connections.len();
        self.connections.retain(|(owner, _), _| *owner != client);
        let released = before.saturating_sub(self.connections.len());
        if released > 0 {
            debug!(client = %client, released, "released tracing ids");
        }
    }

    async fn new_connection(
        &self,
        ctx: CallContext,
        msg: ConnectionTracerMsg,
    ) -> core::result::Result<(), MethodError> {
        let method = NEW_TRACER_FOR_CONNECTION;
        let remote_id = msg.tracing_id.ok_or_else(|| MethodError::missing_field(method, "tracing_id"))?;
        let perspective = msg.perspective.ok_or_else(|| MethodError::missing_field(method, "perspective"))?;
        let odcid = msg.odcid.ok_or_else(|| MethodError::missing_field(method, "odcid"))?;

        let local_id = self.ids.allocate();
        self.tracer
            .tracer_for_connection(local_id, perspective, &odcid)
            .await
            .map_err(|e| e.to_method_error())?;
        self.connections.insert((ctx.client_id, remote_id), local_id);
        debug!(client = %ctx.client_id, remote_id = %remote_id, local_id = %local_id, "registered connection");
        Ok(())
    }

    async fn event(
        &self,
        ctx: CallContext,
        kind: EventKind,
        msg: ConnectionTracerMsg,
    ) -> core::result::Result<(), MethodError> {
        let method = method_for(kind);
        let remote_id = msg
            .tracing_id
            .ok_or_else(|| MethodError::missing_field(&method, "tracing_id"))?;
        let event = msg.into_event(kind).map_err(|e| {
            warn!(client = %ctx.client_id, error = %e, "malformed telemetry call");
            e
        })?;

        let key = (ctx.client_id, remote_id);
        let local_id = self.connections.get(&key).map(|e| *e.value()).ok_or_else(|| {
            MethodError::new(
                MethodErrorKind::UnknownTracingId,
                format!("{method}: tracing id {remote_id} was never registered"),
            )
        })?;

        // The mapping outlives `Close`: trailing events may still arrive, and
        // the client's disconnect releases it.
        self.tracer
            .record(local_id, event)
            .await
            .map_err(|e| e.to_method_error())
    }
}

impl core::fmt::Debug for TracerServer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TracerServer")
            .field("connections", &self.connections.len())
            .finish()
    }
}

//! Script telemetry sink
//!
//! Events go to `stats.<EventName>(tracing_id, payload)`; registrations go
//! to `stats.TracerForConnection(tracing_id, perspective, odcid)`. A script
//! that does not define an entry point simply does not see that event.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace};

use panpolicy_core::{
    ConnectionEvent, ConnectionId, Perspective, Result, ScriptError, Tracer, TracingId,
};

use crate::convert::event_to_value;
use crate::host::{invoke, runtime_error, ScriptHost, STATS};

/// Registration entry point
pub const TRACER_FOR_CONNECTION: &str = "TracerForConnection";

/// Tracer feeding the `stats` entry points of a loaded script
#[derive(Debug, Clone)]
pub struct ScriptTracer {
    host: Arc<ScriptHost>,
}

impl ScriptTracer {
    pub fn new(host: Arc<ScriptHost>) -> Self {
        Self { host }
    }

    pub fn host(&self) -> &Arc<ScriptHost> {
        &self.host
    }
}

fn skip_missing(entry: &str, res: core::result::Result<(), ScriptError>) -> Result<()> {
    match res {
        Err(ScriptError::NotImplemented { .. }) => {
            trace!(entry, "function {entry} not implemented in script");
            Ok(())
        }
        other => other.map_err(Into::into),
    }
}

#[async_trait]
impl Tracer for ScriptTracer {
    async fn tracer_for_connection(
        &self,
        id: TracingId,
        perspective: Perspective,
        odcid: &ConnectionId,
    ) -> Result<()> {
        let lua = self.host.lock().await;
        debug!(tracing_id = %id, %perspective, "script TracerForConnection");
        let res = invoke::<()>(
            &lua,
            STATS,
            TRACER_FOR_CONNECTION,
            (id.raw(), perspective.to_string(), odcid.to_string()),
        );
        skip_missing(TRACER_FOR_CONNECTION, res)
    }

    async fn record(&self, id: TracingId, event: ConnectionEvent) -> Result<()> {
        let entry = event.kind().name();
        let lua = self.host.lock().await;
        let payload = event_to_value(&lua, &event).map_err(|e| runtime_error(entry, e))?;
        let res = invoke::<()>(&lua, STATS, entry, (id.raw(), payload));
        skip_missing(entry, res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlua::Table;

    fn tracer(source: &str) -> ScriptTracer {
        ScriptTracer::new(Arc::new(
            ScriptHost::from_source("stats.lua", source).expect("Failed to load script"),
        ))
    }

    #[tokio::test]
    async fn test_events_reach_stats_entry_points() {
        let t = tracer(
            r#"
            seen = {}
            function stats.TracerForConnection(id, perspective, odcid)
                seen[#seen + 1] = "register " .. id .. " " .. perspective .. " " .. odcid
            end
            function stats.UpdatedPTOCount(id, ev)
                seen[#seen + 1] = "pto " .. id .. " " .. ev.value
            end
            function stats.Close(id, ev)
                seen[#seen + 1] = "close " .. id .. " " .. tostring(ev)
            end
            "#,
        );
        let id = TracingId::new(3);
        t.tracer_for_connection(id, Perspective::Client, &ConnectionId::new([0xab, 0x01]))
            .await
            .unwrap();
        t.record(id, ConnectionEvent::UpdatedPtoCount { value: 2 }).await.unwrap();
        t.record(id, ConnectionEvent::Close).await.unwrap();

        let lua = t.host().lock().await;
        let seen: Table = lua.globals().get("seen").unwrap();
        let seen: Vec<String> = seen.sequence_values::<String>().collect::<mlua::Result<_>>().unwrap();
        assert_eq!(seen, vec!["register 3 client ab01", "pto 3 2", "close 3 nil"]);
    }

    #[tokio::test]
    async fn test_missing_entry_point_is_skipped() {
        let t = tracer("");
        let id = TracingId::new(1);
        t.tracer_for_connection(id, Perspective::Server, &ConnectionId::default())
            .await
            .expect("missing registration entry should be skipped");
        t.record(id, ConnectionEvent::LossTimerCanceled)
            .await
            .expect("missing event entry should be skipped");
    }

    #[tokio::test]
    async fn test_failing_entry_point_is_reported() {
        let t = tracer("function stats.DroppedKey() error('bad key') end");
        let err = t
            .record(TracingId::new(1), ConnectionEvent::DroppedKey { generation: 1 })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("bad key"));
    }
}

//! Policy builder integration tests
//!
//! Build policies against a live daemon socket and real script files, and
//! check fallback when either is unavailable.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use panpolicy_core::{
    ConnectionEvent, ConnectionId, DefaultSelector, LoggingTracer, Path, Perspective,
    PolicyConfig, RemoteAddr, Selector, SelectorKind, SelectorMode, TelemetryKind, TelemetryMode,
    TracingId,
};
use panpolicy_rpc::{CallServer, SelectorServer, TracerServer};
use panpolicy_runtime::{PolicyBuilder, PolicySelector};

fn path(fp: &str) -> Arc<Path> {
    Arc::new(Path::new(
        "1-ff00:0:110",
        "1-ff00:0:112",
        fp,
        SystemTime::now() + Duration::from_secs(600),
    ))
}

/// Serve selector and tracer methods on `socket`, counting accepted connections
fn spawn_daemon(socket: &std::path::Path) -> (Arc<AtomicUsize>, Arc<TracerServer>) {
    let listener = tokio::net::UnixListener::bind(socket).expect("Failed to bind");
    let selector_server = SelectorServer::new(Arc::new(DefaultSelector::new()));
    let tracer_server = TracerServer::new(Arc::new(LoggingTracer::new()));
    let mut server = CallServer::new(1024 * 1024);
    selector_server.register(&mut server);
    tracer_server.register(&mut server);
    let server = Arc::new(server);

    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&accepted);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(Arc::clone(&server).serve_connection(stream));
        }
    });
    (accepted, tracer_server)
}

#[tokio::test]
async fn test_remote_selector_and_tracer_share_one_connection() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let socket = dir.path().join("panpolicyd.sock");
    let (accepted, tracer_server) = spawn_daemon(&socket);

    let policy = PolicyBuilder::new()
        .with_config(PolicyConfig::testing())
        .with_selector(SelectorMode::Remote { socket: socket.clone() })
        .with_telemetry(TelemetryMode::Remote { socket: socket.clone() })
        .build()
        .await
        .expect("Failed to build policy");
    assert_eq!(policy.selector_kind, SelectorKind::Remote);
    assert_eq!(policy.tracer_kind, TelemetryKind::Remote);

    let remote = RemoteAddr::from("r");
    let a = path("a");
    policy.selector.initialize(&remote, &[Arc::clone(&a)]).await.unwrap();
    assert!(Arc::ptr_eq(&policy.selector.path(&remote).await.unwrap().unwrap(), &a));

    let id = TracingId::new(1);
    policy
        .tracer
        .tracer_for_connection(id, Perspective::Client, &ConnectionId::new([1]))
        .await
        .unwrap();
    assert_eq!(tracer_server.connection_count(), 1);
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unreachable_daemon_falls_back() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("absent.sock");

    let policy = PolicyBuilder::new()
        .with_config(PolicyConfig::testing())
        .with_selector(SelectorMode::Remote { socket: socket.clone() })
        .with_telemetry(TelemetryMode::Remote { socket })
        .build()
        .await
        .expect("fallback should not fail the build");
    assert!(matches!(policy.selector, PolicySelector::Default(_)));
    assert_eq!(policy.tracer_kind, TelemetryKind::Noop);

    // The fallback is fully usable
    let remote = RemoteAddr::from("r");
    let a = path("a");
    policy.selector.initialize(&remote, &[Arc::clone(&a)]).await.unwrap();
    assert!(Arc::ptr_eq(&policy.selector.path(&remote).await.unwrap().unwrap(), &a));
    policy
        .tracer
        .record(TracingId::new(1), ConnectionEvent::Close)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_script_selector_and_tracer_share_one_host() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(
        br#"
        local paths = {}
        events = 0
        function panapi.initialize(remote, ps) paths[remote] = ps end
        function panapi.selectpath(remote) return paths[remote][#paths[remote]] end
        function stats.TracerForConnection(id) events = events + 1 end
        "#,
    )
    .unwrap();

    let mut config = PolicyConfig::testing();
    config.selector.mode = SelectorKind::Script;
    config.selector.script_path = Some(file.path().to_path_buf());
    config.telemetry.mode = TelemetryKind::Script;

    let policy = PolicyBuilder::new().with_config(config).build().await.unwrap();
    assert_eq!(policy.selector_kind, SelectorKind::Script);
    assert_eq!(policy.tracer_kind, TelemetryKind::Script);

    let remote = RemoteAddr::from("r");
    let b = path("b");
    policy.selector.initialize(&remote, &[path("a"), Arc::clone(&b)]).await.unwrap();
    assert!(Arc::ptr_eq(&policy.selector.path(&remote).await.unwrap().unwrap(), &b));

    policy
        .tracer
        .tracer_for_connection(TracingId::new(1), Perspective::Server, &ConnectionId::default())
        .await
        .unwrap();

    let PolicySelector::Scripted(selector) = &policy.selector else {
        panic!("expected script selector");
    };
    assert!(selector.host().is_heartbeat_running());
    let lua = selector.host().lock().await;
    assert_eq!(lua.globals().get::<i64>("events").unwrap(), 1);
}

#[tokio::test]
async fn test_broken_script_falls_back() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"function panapi.selectpath(").unwrap();

    let policy = PolicyBuilder::new()
        .with_config(PolicyConfig::testing())
        .with_selector(SelectorMode::Script {
            path: file.path().to_path_buf(),
        })
        .with_telemetry(TelemetryMode::Logging)
        .build()
        .await
        .unwrap();
    assert_eq!(policy.selector_kind, SelectorKind::Default);
    assert_eq!(policy.tracer_kind, TelemetryKind::Logging);
}

//! Remote selector integration tests
//!
//! Run a `SelectorServer` and a `RemoteSelector` at the two ends of an
//! in-memory stream (and once over a real Unix socket) and check that
//! answers come back as the caller's own path objects.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use panpolicy_core::{
    CallError, DefaultSelector, Fingerprint, MethodErrorKind, Path, PathInterface, PathMetadata,
    PolicyError, RemoteAddr, RpcConfig, Selector,
};
use panpolicy_rpc::{CallClient, CallServer, RemoteSelector, SelectorServer};

const MAX_FRAME: usize = 1024 * 1024;

fn path(fp: &str, ifaces: &[(&str, u64)]) -> Arc<Path> {
    Arc::new(
        Path::new("1-ff00:0:110", "1-ff00:0:112", fp, SystemTime::UNIX_EPOCH + Duration::from_secs(3600))
            .with_metadata(PathMetadata {
                mtu: 1400,
                interfaces: ifaces.iter().map(|(ia, id)| PathInterface::new(*ia, *id)).collect(),
                ..Default::default()
            }),
    )
}

/// Serve a fresh default selector over an in-memory stream
fn connect_pair() -> (RemoteSelector, Arc<SelectorServer>, tokio::task::JoinHandle<()>) {
    let selector_server = SelectorServer::new(Arc::new(DefaultSelector::new()));
    let mut server = CallServer::new(MAX_FRAME);
    selector_server.register(&mut server);
    let server = Arc::new(server);

    let (client_end, server_end) = tokio::io::duplex(64 * 1024);
    let serving = tokio::spawn(server.serve_connection(server_end));
    let client = CallClient::from_stream(client_end, "duplex", MAX_FRAME);
    (RemoteSelector::new(client), selector_server, serving)
}

#[tokio::test]
async fn test_path_resolves_to_callers_own_object() {
    let (remote_selector, _server, _serving) = connect_pair();
    let remote = RemoteAddr::from("1-ff00:0:112,[10.0.0.2]:443");
    let (a, b) = (path("a", &[("x", 1)]), path("b", &[("y", 2)]));

    remote_selector
        .initialize(&remote, &[Arc::clone(&a), Arc::clone(&b)])
        .await
        .expect("Failed to initialize");
    let chosen = remote_selector
        .path(&remote)
        .await
        .expect("Failed to select")
        .expect("daemon should choose a path");
    assert!(Arc::ptr_eq(&chosen, &a));

    remote_selector
        .path_down(&remote, &Fingerprint::from("a"), &PathInterface::new("x", 1))
        .await
        .expect("Failed to report path down");
    let chosen = remote_selector.path(&remote).await.unwrap().unwrap();
    assert!(Arc::ptr_eq(&chosen, &b));
}

#[tokio::test]
async fn test_path_down_drops_local_handle() {
    let (remote_selector, _server, _serving) = connect_pair();
    let remote = RemoteAddr::from("r");
    let (a, b) = (path("a", &[("x", 1)]), path("b", &[]));

    remote_selector.initialize(&remote, &[a, Arc::clone(&b)]).await.unwrap();
    let handle_a = remote_selector
        .handles()
        .handle_of(&remote, &Fingerprint::from("a"))
        .expect("handle issued");

    remote_selector
        .path_down(&remote, &Fingerprint::from("a"), &PathInterface::new("x", 1))
        .await
        .expect("Failed to report path down");
    assert!(remote_selector.handles().resolve(&handle_a).is_none());
    assert!(remote_selector.handles().handle_of(&remote, &Fingerprint::from("a")).is_none());
    assert_eq!(remote_selector.handles().len(&remote), 1);
}

#[tokio::test]
async fn test_refresh_invalidates_previous_handles() {
    let (remote_selector, _server, _serving) = connect_pair();
    let remote = RemoteAddr::from("r");

    remote_selector.initialize(&remote, &[path("a", &[])]).await.unwrap();
    let old = remote_selector
        .handles()
        .handle_of(&remote, &Fingerprint::from("a"))
        .expect("handle issued");

    let fresh = path("a", &[]);
    remote_selector.refresh(&remote, &[Arc::clone(&fresh)]).await.unwrap();
    assert!(remote_selector.handles().resolve(&old).is_none());

    let chosen = remote_selector.path(&remote).await.unwrap().unwrap();
    assert!(Arc::ptr_eq(&chosen, &fresh));
}

#[tokio::test]
async fn test_closed_remote_reports_misuse() {
    let (remote_selector, _server, _serving) = connect_pair();
    let remote = RemoteAddr::from("r");

    remote_selector.initialize(&remote, &[path("a", &[])]).await.unwrap();
    remote_selector.close(&remote).await.expect("Failed to close");
    assert!(remote_selector.handles().is_empty(&remote));

    let err = remote_selector.path(&remote).await.unwrap_err();
    assert!(err.is_misuse());
    assert!(remote_selector.close(&remote).await.unwrap_err().is_misuse());

    // Initialize reopens the remote
    remote_selector.initialize(&remote, &[path("b", &[])]).await.unwrap();
    assert!(remote_selector.path(&remote).await.unwrap().is_some());
}

#[tokio::test]
async fn test_uninitialized_remote_has_no_opinion() {
    let (remote_selector, _server, _serving) = connect_pair();
    assert!(remote_selector
        .path(&RemoteAddr::from("never-seen"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_concurrent_calls_share_one_connection() {
    let (remote_selector, _server, _serving) = connect_pair();
    let remote_selector = Arc::new(remote_selector);

    let mut tasks = Vec::new();
    for i in 0..16 {
        let remote_selector = Arc::clone(&remote_selector);
        tasks.push(tokio::spawn(async move {
            let remote = RemoteAddr::new(format!("remote-{i}"));
            let p = path(&format!("fp-{i}"), &[]);
            remote_selector.initialize(&remote, &[Arc::clone(&p)]).await.unwrap();
            let chosen = remote_selector.path(&remote).await.unwrap().unwrap();
            assert!(Arc::ptr_eq(&chosen, &p));
        }));
    }
    for task in tasks {
        task.await.expect("task panicked");
    }
}

#[tokio::test]
async fn test_lost_connection_fails_calls() {
    let (remote_selector, _server, serving) = connect_pair();
    let remote = RemoteAddr::from("r");
    remote_selector.initialize(&remote, &[path("a", &[])]).await.unwrap();

    serving.abort();
    let _ = serving.await;

    let err = remote_selector.path(&remote).await.unwrap_err();
    match err {
        PolicyError::Call(e) => assert!(e.is_connection_failure(), "unexpected {e}"),
        other => panic!("expected connection failure, got {other}"),
    }
    assert!(remote_selector.client().is_closed());
}

#[tokio::test]
async fn test_server_forgets_client_on_disconnect() {
    let (remote_selector, selector_server, serving) = connect_pair();
    remote_selector
        .initialize(&RemoteAddr::from("r"), &[path("a", &[])])
        .await
        .unwrap();
    assert_eq!(selector_server.client_count(), 1);

    drop(remote_selector);
    serving.await.expect("server task panicked");
    assert_eq!(selector_server.client_count(), 0);
}

#[tokio::test]
async fn test_unknown_method_is_a_method_error() {
    let server = Arc::new(CallServer::new(MAX_FRAME));
    let (client_end, server_end) = tokio::io::duplex(4096);
    let _serving = tokio::spawn(server.serve_connection(server_end));
    let client = CallClient::from_stream(client_end, "duplex", MAX_FRAME);

    let err = client.call::<_, ()>("Selector.Nope", &()).await.unwrap_err();
    assert!(!err.is_connection_failure());
    assert_eq!(err.method_error().map(|e| e.kind), Some(MethodErrorKind::UnknownMethod));
    assert!(matches!(err, CallError::Method { ref method, .. } if method == "Selector.Nope"));
}

#[tokio::test]
async fn test_round_trip_over_unix_socket() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let socket = dir.path().join("panpolicyd.sock");
    let listener = tokio::net::UnixListener::bind(&socket).expect("Failed to bind");

    let selector_server = SelectorServer::new(Arc::new(DefaultSelector::new()));
    let mut server = CallServer::new(MAX_FRAME);
    selector_server.register(&mut server);
    let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
    let serving = tokio::spawn(Arc::new(server).serve_unix(listener, async move {
        let _ = stopped.await;
    }));

    let config = RpcConfig {
        socket_path: socket.clone(),
        ..RpcConfig::testing()
    };
    let remote_selector = RemoteSelector::connect(&socket, &config)
        .await
        .expect("Failed to connect");
    let remote = RemoteAddr::from("r");
    let p = path("a", &[]);
    remote_selector.initialize(&remote, &[Arc::clone(&p)]).await.unwrap();
    assert!(Arc::ptr_eq(&remote_selector.path(&remote).await.unwrap().unwrap(), &p));

    let _ = stop.send(());
    serving.await.expect("server task panicked").expect("server failed");
}

#[tokio::test]
async fn test_connect_to_missing_socket_fails() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("absent.sock");
    let err = RemoteSelector::connect(&socket, &RpcConfig::testing())
        .await
        .unwrap_err();
    assert!(matches!(err, PolicyError::Call(CallError::Connect { .. })));
}

#[tokio::test]
async fn test_clients_of_one_server_stay_isolated() {
    let selector_server = SelectorServer::new(Arc::new(DefaultSelector::new()));
    let mut server = CallServer::new(MAX_FRAME);
    selector_server.register(&mut server);
    let server = Arc::new(server);
    let attach = || {
        let (client_end, server_end) = tokio::io::duplex(64 * 1024);
        tokio::spawn(Arc::clone(&server).serve_connection(server_end));
        RemoteSelector::new(CallClient::from_stream(client_end, "duplex", MAX_FRAME))
    };
    let (first, second) = (attach(), attach());

    let remote = RemoteAddr::from("1-ff00:0:112,[10.0.0.2]:443");
    let (a1, a2) = (path("a1", &[]), path("a2", &[]));
    let (b1, b2) = (path("b1", &[]), path("b2", &[]));
    first.initialize(&remote, &[Arc::clone(&a1), Arc::clone(&a2)]).await.unwrap();
    second.initialize(&remote, &[Arc::clone(&b1), Arc::clone(&b2)]).await.unwrap();

    let chosen = first.path(&remote).await.unwrap().expect("first client lost its paths");
    assert!(Arc::ptr_eq(&chosen, &a1));
    let chosen = second.path(&remote).await.unwrap().expect("second client lost its paths");
    assert!(Arc::ptr_eq(&chosen, &b1));

    second
        .path_down(&remote, &Fingerprint::from("b1"), &PathInterface::new("x", 1))
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&first.path(&remote).await.unwrap().unwrap(), &a1));
    assert!(Arc::ptr_eq(&second.path(&remote).await.unwrap().unwrap(), &b2));

    second.close(&remote).await.expect("Failed to close");
    assert!(Arc::ptr_eq(&first.path(&remote).await.unwrap().unwrap(), &a1));
    assert_eq!(selector_server.client_count(), 2);
}

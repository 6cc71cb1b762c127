// Integration tests for local IPC endpoints over real Unix sockets.
//
// Each test binds a server endpoint in a fresh temp directory and connects
// a client to it through the public API only.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use stationlink::socket::addr::SocketAddress;
use stationlink::socket::connection::{ConnectOptions, ConnectionError};
use stationlink::socket::inbound::handler_fn;
use stationlink::{Envelope, IpcEndpoint, IpcSettings, MsgType, Payload};
use tempfile::TempDir;
use tokio::sync::mpsc;

fn settings(max_retries: u32) -> IpcSettings {
    IpcSettings {
        connect: ConnectOptions {
            max_retries,
            base_backoff: Duration::from_millis(20),
        },
        ..IpcSettings::default()
    }
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Envelope {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for envelope")
        .expect("channel closed")
}

fn collecting(endpoint: &IpcEndpoint) -> mpsc::UnboundedReceiver<Envelope> {
    let (tx, rx) = mpsc::unbounded_channel();
    endpoint.register_handler(handler_fn(move |env| {
        let _ = tx.send(env.clone());
        Ok(())
    }));
    assert!(endpoint.start_dispatch());
    rx
}

#[tokio::test]
async fn test_window_resize_event_arrives_intact() {
    let dir = TempDir::new().unwrap();
    let path = SocketAddress::new(std::process::id(), "ui")
        .unwrap()
        .path_in(dir.path());

    let server = IpcEndpoint::bind("ui", path.clone(), &settings(5)).await.unwrap();
    let mut inbox = collecting(&server);
    let client = IpcEndpoint::connect("ui", path, &settings(5)).await.unwrap();

    let sent = Envelope::event(json!({
        "type": "window",
        "action": "resize",
        "width": 800,
        "height": 600,
    }));
    client.send(&sent).await.unwrap();

    let got = recv(&mut inbox).await;
    assert_eq!(got, sent);
    assert_eq!(got.msg_type, MsgType::Event);
    assert_eq!(got.payload["width"], json!(800));
    assert_eq!(server.stats().received, 1);
}

#[tokio::test]
async fn test_client_started_before_server_retries_then_connects() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ipc-7-late.sock");

    let client_path = path.clone();
    let client = tokio::spawn(async move {
        IpcEndpoint::connect("late", client_path, &settings(5)).await
    });

    tokio::time::sleep(Duration::from_millis(30)).await;
    let server = IpcEndpoint::bind("late", path, &settings(5)).await.unwrap();
    let mut inbox = collecting(&server);

    let client = client.await.unwrap().unwrap();
    client.send(&Envelope::event(json!({ "type": "hello" }))).await.unwrap();
    assert_eq!(recv(&mut inbox).await.payload["type"], json!("hello"));
}

#[tokio::test]
async fn test_missing_server_gives_up_after_retries() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ipc-1-nobody.sock");

    let started = Instant::now();
    let err = IpcEndpoint::connect("nobody", path, &settings(3)).await.unwrap_err();
    match err {
        ConnectionError::ConnectionUnavailable { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("unexpected error: {other}"),
    }
    // Linear backoff between attempts: 20ms + 40ms
    assert!(started.elapsed() >= Duration::from_millis(60));
}

#[tokio::test]
async fn test_messages_arrive_in_send_order_both_ways() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ipc-1-order.sock");

    let server = IpcEndpoint::bind("order", path.clone(), &settings(5)).await.unwrap();
    let mut server_inbox = collecting(&server);
    let client = IpcEndpoint::connect("order", path, &settings(5)).await.unwrap();
    let mut client_inbox = collecting(&client);

    for seq in 0..200 {
        client.send(&Envelope::event(json!({ "seq": seq }))).await.unwrap();
    }
    for seq in 0..200 {
        assert_eq!(recv(&mut server_inbox).await.payload["seq"], json!(seq));
    }

    for seq in 0..50 {
        server.send_direct(&Envelope::event(json!({ "seq": seq }))).await.unwrap();
    }
    for seq in 0..50 {
        assert_eq!(recv(&mut client_inbox).await.payload["seq"], json!(seq));
    }
}

#[tokio::test]
async fn test_close_request_invokes_callback_once() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ipc-1-ctl.sock");

    let server = IpcEndpoint::bind("ctl", path.clone(), &settings(5)).await.unwrap();
    let client = IpcEndpoint::connect("ctl", path, &settings(5)).await.unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    let counter = Arc::clone(&calls);
    let listener = client
        .listen_for_close_request(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = done_tx.send(());
        })
        .unwrap();

    server.send(&Envelope::command("noise", Payload::new())).await.unwrap();
    server.send_close_request().await.unwrap();
    server.send_close_request().await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), done_rx).await.unwrap().unwrap();
    tokio::time::timeout(Duration::from_secs(2), listener).await.unwrap().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_peer_shutdown_closes_other_side() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ipc-1-bye.sock");

    let server = IpcEndpoint::bind("bye", path.clone(), &settings(5)).await.unwrap();
    let client = IpcEndpoint::connect("bye", path.clone(), &settings(5)).await.unwrap();
    client.send(&Envelope::event(json!({ "type": "ping" }))).await.unwrap();

    server.shutdown().await;
    tokio::time::timeout(Duration::from_secs(2), client.closed()).await.unwrap();
    assert!(!client.is_running());
    assert!(client.send(&Envelope::event(json!({}))).await.is_err());
    assert!(!path.exists());
}

// Integration tests for the forwarders against a real WebSocket device.
//
// A tokio-tungstenite server on 127.0.0.1 plays the device; the forwarder
// runs under a supervisor connected to a local endpoint that plays the main
// process.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use stationlink::bridge::{BridgeConnector, BridgeSettings};
use stationlink::socket::inbound::handler_fn;
use stationlink::supervisor::command_forwarder::CommandForwarder;
use stationlink::supervisor::device::{JsonCommandCompiler, JsonStateExtractor};
use stationlink::supervisor::state_forwarder::StateForwarder;
use stationlink::ws::WsConnector;
use stationlink::{Envelope, ExitStatus, IpcEndpoint, IpcSettings, MsgType, Payload, Subprocess, Supervisor};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

fn bridge_settings() -> BridgeSettings {
    BridgeSettings {
        reconnect_delay: Duration::from_millis(50),
        max_message_bytes: 4096,
    }
}

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out")
        .expect("channel closed")
}

/// Main-process endpoint plus a supervised subprocess wired to it.
struct Station {
    _dir: TempDir,
    main: IpcEndpoint,
    inbox: mpsc::UnboundedReceiver<Envelope>,
    running: tokio::task::JoinHandle<ExitStatus>,
}

async fn station<S: Subprocess>(stream: &str, subprocess: S) -> Station {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(format!("ipc-1-{stream}.sock"));
    let settings = IpcSettings::default();

    let main = IpcEndpoint::bind(stream, path.clone(), &settings).await.unwrap();
    let (tx, inbox) = mpsc::unbounded_channel();
    main.register_handler(handler_fn(move |env| {
        let _ = tx.send(env.clone());
        Ok(())
    }));
    main.start_dispatch();

    let child = IpcEndpoint::connect(stream, path, &settings).await.unwrap();
    let supervisor = Supervisor::new(Arc::new(subprocess), Arc::new(child));
    let running = tokio::spawn(async move { supervisor.run().await });
    Station {
        _dir: dir,
        main,
        inbox,
        running,
    }
}

async fn stop(mut station: Station) {
    station
        .main
        .send(&Envelope::command("stop", Payload::new()))
        .await
        .unwrap();
    let ack = recv(&mut station.inbox).await;
    assert_eq!(ack.payload["status"], json!("stopping"));
    let exit = tokio::time::timeout(Duration::from_secs(5), station.running)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(exit, ExitStatus::Clean);
}

#[tokio::test]
async fn test_device_state_reaches_main_process_deduplicated() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/state", listener.local_addr().unwrap());

    // Device: first session sends one state then drops; second sends a
    // duplicate followed by a change.
    let device = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        ws.send(Message::Binary(br#"{"temp": 20}"#.to_vec())).await.unwrap();
        ws.send(Message::Text("ignored".into())).await.unwrap();
        ws.close(None).await.unwrap();

        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        ws.send(Message::Binary(br#"{"temp": 20}"#.to_vec())).await.unwrap();
        ws.send(Message::Binary(br#"{"temp": 21}"#.to_vec())).await.unwrap();
        // Keep the session open until the bridge closes it
        while let Some(Ok(msg)) = ws.next().await {
            if msg.is_close() {
                break;
            }
        }
    });

    let connector: Arc<dyn BridgeConnector> = Arc::new(WsConnector::new(&url));
    let forwarder = StateForwarder::new(connector, Arc::new(JsonStateExtractor), bridge_settings(), 100);
    let mut station = station("state", forwarder).await;

    let first = recv(&mut station.inbox).await;
    assert_eq!(first.msg_type, MsgType::State);
    assert_eq!(first.payload["temp"], json!(20));
    let second = recv(&mut station.inbox).await;
    assert_eq!(second.payload["temp"], json!(21));

    station
        .main
        .send(&Envelope::command("get-stats", Payload::new()))
        .await
        .unwrap();
    let metric = recv(&mut station.inbox).await;
    assert_eq!(metric.payload["value"]["received"], json!(3));
    assert_eq!(metric.payload["value"]["sent"], json!(2));
    assert_eq!(metric.payload["value"]["duplicates"], json!(1));

    stop(station).await;
    tokio::time::timeout(Duration::from_secs(5), device).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_commands_reach_device_as_binary_frames() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/command", listener.local_addr().unwrap());

    let (frames_tx, mut frames) = mpsc::unbounded_channel();
    let device = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        while let Some(Ok(msg)) = ws.next().await {
            match msg {
                Message::Binary(data) => {
                    let _ = frames_tx.send(data);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    let connector: Arc<dyn BridgeConnector> = Arc::new(WsConnector::new(&url));
    let forwarder = CommandForwarder::new(connector, Arc::new(JsonCommandCompiler), bridge_settings());
    let mut station = station("command", forwarder).await;

    // Retry until the bridge is up; early commands fail with command-error
    let mut params = Payload::new();
    params.insert("speed".into(), json!(3));
    let reply = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            station
                .main
                .send(&Envelope::command("set-fan", params.clone()))
                .await
                .unwrap();
            let reply = recv(&mut station.inbox).await;
            if reply.msg_type == MsgType::Response {
                return reply;
            }
            assert_eq!(reply.payload["context"], json!("command-error"));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(reply.payload["status"], json!("sent"));

    let frame: Value = serde_json::from_slice(&recv(&mut frames).await).unwrap();
    assert_eq!(frame, json!({ "action": "set-fan", "params": { "speed": 3 } }));

    stop(station).await;
    tokio::time::timeout(Duration::from_secs(5), device).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_device_handshake_carries_origin() {
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/state", listener.local_addr().unwrap());

    let (origin_tx, origin_rx) = tokio::sync::oneshot::channel();
    let device = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let capture = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            let origin = req
                .headers()
                .get("Origin")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let _ = origin_tx.send(origin);
            Ok(resp)
        };
        let mut ws = tokio_tungstenite::accept_hdr_async(tcp, capture).await.unwrap();
        while let Some(Ok(msg)) = ws.next().await {
            if msg.is_close() {
                break;
            }
        }
    });

    let connector = WsConnector::new(&url).with_device_origin();
    let (mut sink, _source) = connector.open().await.unwrap();
    let origin = tokio::time::timeout(Duration::from_secs(5), origin_rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(origin.as_deref(), Some("https://127.0.0.1"));

    stationlink::bridge::BridgeSink::close(&mut sink).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), device).await.unwrap().unwrap();
}

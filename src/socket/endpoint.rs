//! An endpoint wires one [`Connection`] to its inbound and outbound
//! pipelines.
//!
//! ```text
//!            ┌──────────── IpcEndpoint ─────────────┐
//! socket ──► │ reader ─► Inbound queue ─► handlers  │
//!            │                  │ backpressure      │
//! socket ◄── │ writer ◄─ Outbound ◄─────────────────│◄── send / send_direct
//!            └──────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinHandle;

use super::connection::{ConnectOptions, Connection, ConnectionError, LinkState};
use super::envelope::{Envelope, Payload};
use super::inbound::{EnvelopeHandler, Inbound, InboundSettings, InboundStats, CLOSE_REQUEST_ACTION};
use super::outbound::Outbound;
use crate::constants::{BACKPRESSURE_DELAY, PEER_ATTACH_TIMEOUT};

/// Tunables shared by every endpoint in a process.
#[derive(Debug, Clone, Copy)]
pub struct IpcSettings {
    /// Client retry policy.
    pub connect: ConnectOptions,
    /// Queue and backpressure sizing.
    pub inbound: InboundSettings,
    /// Delay before each throttled send.
    pub backpressure_delay: Duration,
    /// Emit `connection` events on start and stop.
    pub connection_events: bool,
    /// How long a server send waits for its peer.
    pub peer_wait: Duration,
}

impl Default for IpcSettings {
    fn default() -> Self {
        Self {
            connect: ConnectOptions::default(),
            inbound: InboundSettings::default(),
            backpressure_delay: BACKPRESSURE_DELAY,
            connection_events: false,
            peer_wait: PEER_ATTACH_TIMEOUT,
        }
    }
}

/// A running connection plus its pipelines.
#[derive(Debug)]
pub struct IpcEndpoint {
    connection: Connection,
    inbound: Inbound,
    outbound: Outbound,
    connection_events: bool,
}

impl IpcEndpoint {
    fn assemble(connection: Connection, settings: &IpcSettings) -> Self {
        let inbound = Inbound::new(settings.inbound);
        let outbound = Outbound::new(
            connection.clone(),
            inbound.backpressure(),
            settings.backpressure_delay,
        );
        Self {
            connection,
            inbound,
            outbound,
            connection_events: settings.connection_events,
        }
    }

    /// Connect to a server socket, retrying per `settings.connect`.
    pub async fn connect(
        stream: &str,
        path: PathBuf,
        settings: &IpcSettings,
    ) -> Result<Self, ConnectionError> {
        let endpoint = Self::assemble(Connection::client(stream, path, settings.connect), settings);
        endpoint.connection.start(endpoint.inbound.queue()).await?;
        endpoint.announce("connected").await;
        Ok(endpoint)
    }

    /// Bind a server socket that accepts one peer.
    pub async fn bind(
        stream: &str,
        path: PathBuf,
        settings: &IpcSettings,
    ) -> Result<Self, ConnectionError> {
        let endpoint = Self::assemble(
            Connection::server_with_peer_wait(stream, path, settings.peer_wait),
            settings,
        );
        endpoint.connection.start(endpoint.inbound.queue()).await?;
        Ok(endpoint)
    }

    async fn announce(&self, action: &str) {
        if !self.connection_events {
            return;
        }
        let event = Envelope::event(json!({
            "type": "connection",
            "action": action,
            "stream": self.connection.stream_name(),
        }));
        if let Err(e) = self.outbound.send_direct(&event).await {
            log::debug!("[Socket] Could not announce {action}: {e}");
        }
    }

    /// Add a handler; handlers run in registration order.
    pub fn register_handler(&self, handler: Arc<dyn EnvelopeHandler>) {
        self.inbound.register(handler);
    }

    /// Start dispatching queued envelopes to handlers.
    pub fn start_dispatch(&self) -> bool {
        self.inbound.start_dispatch()
    }

    /// Consume the queue waiting for a close request instead of dispatching.
    pub fn listen_for_close_request<F>(&self, on_close: F) -> Option<JoinHandle<()>>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inbound.listen_for_close_request(on_close)
    }

    /// Ask the peer to shut down. No reply is expected.
    pub async fn send_close_request(&self) -> Result<(), ConnectionError> {
        log::info!(
            "[Socket] Sending close request on {}",
            self.connection.stream_name()
        );
        self.outbound
            .send_direct(&Envelope::command(CLOSE_REQUEST_ACTION, Payload::new()))
            .await
    }

    /// Backpressure-aware send.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), ConnectionError> {
        self.outbound.send(envelope).await
    }

    /// Send without the backpressure delay.
    pub async fn send_direct(&self, envelope: &Envelope) -> Result<(), ConnectionError> {
        self.outbound.send_direct(envelope).await
    }

    /// Cloneable sender for tasks that outlive a borrow of the endpoint.
    pub fn outbound(&self) -> Outbound {
        self.outbound.clone()
    }

    /// Underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Stream name.
    pub fn stream_name(&self) -> &str {
        self.connection.stream_name()
    }

    /// True while frames can flow.
    pub fn is_running(&self) -> bool {
        self.connection.is_running()
    }

    /// Connection lifecycle state.
    pub fn state(&self) -> LinkState {
        self.connection.state()
    }

    /// Resolves once the connection is stopped or the peer is gone.
    pub async fn closed(&self) {
        self.connection.closed().await;
    }

    /// Inbound counters.
    pub fn stats(&self) -> InboundStats {
        self.inbound.stats()
    }

    /// Announce (if enabled), then stop.
    pub async fn shutdown(&self) {
        if self.connection.is_running() {
            self.announce("disconnected").await;
        }
        self.stop();
    }

    /// Stop pipelines and connection. Idempotent.
    pub fn stop(&self) {
        self.inbound.stop();
        self.connection.stop();
    }
}

impl Drop for IpcEndpoint {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::envelope::MsgType;
    use crate::socket::inbound::handler_fn;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_connection_events_announced() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.sock");
        let settings = IpcSettings {
            connection_events: true,
            ..IpcSettings::default()
        };

        let server = IpcEndpoint::bind("events", path.clone(), &settings).await.unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        server.register_handler(handler_fn(move |env| {
            let _ = tx.send(env.clone());
            Ok(())
        }));
        server.start_dispatch();

        let client = IpcEndpoint::connect("events", path, &settings).await.unwrap();
        let hello = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hello.msg_type, MsgType::Event);
        assert_eq!(hello.payload["action"], json!("connected"));
        assert_eq!(hello.payload["stream"], json!("events"));

        client.shutdown().await;
        let bye = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bye.payload["action"], json!("disconnected"));
        assert!(!client.is_running());
    }

    #[tokio::test]
    async fn test_close_request_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("close.sock");
        let settings = IpcSettings::default();

        let server = IpcEndpoint::bind("heat", path.clone(), &settings).await.unwrap();
        let client = IpcEndpoint::connect("heat", path, &settings).await.unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let listener = client
            .listen_for_close_request(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        server.send_close_request().await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), listener)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // A second request reaches a queue with no consumer and changes nothing
        server.send_close_request().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_request_without_peer_returns_promptly() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("unclaimed.sock");
        let settings = IpcSettings {
            peer_wait: Duration::from_millis(100),
            ..IpcSettings::default()
        };
        let server = IpcEndpoint::bind("unclaimed", path.clone(), &settings).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), server.send_close_request())
            .await
            .unwrap();
        assert!(matches!(result, Err(ConnectionError::NoPeer { .. })));

        server.shutdown().await;
        assert!(!path.exists());
    }
}

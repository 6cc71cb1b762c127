//! Outbound pipeline: serialize, frame, hand to the connection's writer.
//!
//! [`Outbound::send`] honours backpressure by sleeping a fixed delay before
//! each send while the flag is up. [`Outbound::send_direct`] skips the delay
//! for latency-critical forwarding. Both end in the same single writer task,
//! and neither ever drops a message.

use std::sync::Arc;
use std::time::Duration;

use super::connection::{Connection, ConnectionError};
use super::envelope::Envelope;
use super::framing::encode_frame;
use super::inbound::Backpressure;

/// Cloneable sender bound to one connection.
#[derive(Debug, Clone)]
pub struct Outbound {
    connection: Connection,
    backpressure: Arc<Backpressure>,
    delay: Duration,
}

impl Outbound {
    /// Bind a sender to `connection`, throttled by `backpressure`.
    pub fn new(connection: Connection, backpressure: Arc<Backpressure>, delay: Duration) -> Self {
        Self {
            connection,
            backpressure,
            delay,
        }
    }

    /// Backpressure-aware send.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), ConnectionError> {
        if self.backpressure.is_active() {
            tokio::time::sleep(self.delay).await;
        }
        self.write(envelope).await
    }

    /// Send without the backpressure delay.
    pub async fn send_direct(&self, envelope: &Envelope) -> Result<(), ConnectionError> {
        self.write(envelope).await
    }

    async fn write(&self, envelope: &Envelope) -> Result<(), ConnectionError> {
        let frame = encode_frame(&envelope.encode()?)?;
        self.connection.send(frame).await.inspect_err(|e| {
            log::warn!(
                "[Outbound] {} send of {} {} failed: {e}",
                self.connection.stream_name(),
                envelope.msg_type,
                envelope.msg_id
            );
        })
    }

    /// Whether sends are currently being throttled.
    pub fn is_throttled(&self) -> bool {
        self.backpressure.is_active()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::connection::ConnectOptions;
    use crate::socket::inbound::{handler_fn, Inbound, InboundSettings};
    use serde_json::json;
    use std::time::Instant;
    use tempfile::TempDir;

    async fn pair(dir: &TempDir) -> (Connection, Connection, tokio::sync::mpsc::UnboundedReceiver<Envelope>, Inbound, Inbound) {
        let path = dir.path().join("out.sock");
        let server_in = Inbound::new(InboundSettings::default());
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        server_in.register(handler_fn(move |env| {
            let _ = tx.send(env.clone());
            Ok(())
        }));
        server_in.start_dispatch();
        let server = Connection::server("out", path.clone());
        server.start(server_in.queue()).await.unwrap();

        let client_in = Inbound::new(InboundSettings::default());
        let client = Connection::client("out", path, ConnectOptions::default());
        client.start(client_in.queue()).await.unwrap();
        (server, client, rx, server_in, client_in)
    }

    #[tokio::test]
    async fn test_throttled_send_is_delayed_but_delivered() {
        let dir = TempDir::new().unwrap();
        let (server, client, mut rx, _server_in, _client_in) = pair(&dir).await;

        let bp = Arc::new(Backpressure::new(1, 0));
        bp.observe(5);
        let out = Outbound::new(client.clone(), Arc::clone(&bp), Duration::from_millis(30));
        assert!(out.is_throttled());

        let started = Instant::now();
        for n in 0..3 {
            out.send(&Envelope::event(json!({ "n": n }))).await.unwrap();
        }
        assert!(started.elapsed() >= Duration::from_millis(90));

        for n in 0..3 {
            let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(got.payload["n"], json!(n));
        }
        client.stop();
        server.stop();
    }

    #[tokio::test]
    async fn test_direct_send_skips_delay() {
        let dir = TempDir::new().unwrap();
        let (server, client, mut rx, _server_in, _client_in) = pair(&dir).await;

        let bp = Arc::new(Backpressure::new(1, 0));
        bp.observe(5);
        let out = Outbound::new(client.clone(), bp, Duration::from_secs(5));

        let env = Envelope::event(json!({"fast": true}));
        tokio::time::timeout(Duration::from_secs(1), out.send_direct(&env))
            .await
            .unwrap()
            .unwrap();
        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, env);
        client.stop();
        server.stop();
    }

    #[tokio::test]
    async fn test_send_after_stop_fails() {
        let dir = TempDir::new().unwrap();
        let (server, client, _rx, _server_in, _client_in) = pair(&dir).await;
        let out = Outbound::new(
            client.clone(),
            Arc::new(Backpressure::new(1, 0)),
            Duration::from_millis(1),
        );
        client.stop();
        assert!(matches!(
            out.send(&Envelope::event(json!({}))).await,
            Err(ConnectionError::NotRunning)
        ));
        server.stop();
    }
}

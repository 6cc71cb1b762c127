//! `command` subprocess: main-process commands → device.
//!
//! Every action the supervisor does not own is compiled into device bytes
//! and sent over the bridge. The main process gets a `response` with
//! `status: "sent"` or a `command-error`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use super::device::CommandCompiler;
use super::{ActionOutcome, Subprocess, SupervisorContext};
use crate::bridge::{BridgeConnector, BridgeHandler, BridgeSettings, RemoteBridge};
use crate::socket::envelope::{Envelope, Payload};

/// Device replies are only logged.
struct DeviceReplies;

#[async_trait]
impl BridgeHandler for DeviceReplies {
    async fn on_message(&self, message: Vec<u8>) {
        log::debug!("[Command] Device reply ({} bytes)", message.len());
    }
}

/// Compiles and forwards commands to the device.
pub struct CommandForwarder {
    connector: Arc<dyn BridgeConnector>,
    compiler: Arc<dyn CommandCompiler>,
    settings: BridgeSettings,
    bridge: Mutex<Option<Arc<RemoteBridge>>>,
    received: AtomicU64,
    sent: AtomicU64,
    failed: AtomicU64,
}

impl std::fmt::Debug for CommandForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandForwarder")
            .field("device", &self.connector.describe())
            .field("sent", &self.sent.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl CommandForwarder {
    /// Forwarder writing to `connector`.
    pub fn new(
        connector: Arc<dyn BridgeConnector>,
        compiler: Arc<dyn CommandCompiler>,
        settings: BridgeSettings,
    ) -> Self {
        Self {
            connector,
            compiler,
            settings,
            bridge: Mutex::new(None),
            received: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    fn bridge(&self) -> Option<Arc<RemoteBridge>> {
        self.bridge.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn ws_connected(&self) -> bool {
        self.bridge().is_some_and(|b| b.is_connected())
    }

    fn stats(&self) -> Value {
        json!({
            "received": self.received.load(Ordering::Relaxed),
            "sent": self.sent.load(Ordering::Relaxed),
            "failed": self.failed.load(Ordering::Relaxed),
            "ws-connected": self.ws_connected(),
        })
    }

    async fn forward(&self, action: &str, params: &Payload) -> Result<()> {
        let bytes = self
            .compiler
            .compile(action, params)
            .with_context(|| format!("cannot compile {action}"))?;
        let bridge = self.bridge().context("device bridge not started")?;
        bridge.send(bytes).await
    }
}

#[async_trait]
impl Subprocess for CommandForwarder {
    fn name(&self) -> &str {
        "command"
    }

    fn status(&self) -> Payload {
        match self.stats() {
            Value::Object(map) => map,
            _ => Payload::new(),
        }
    }

    async fn run(&self, ctx: SupervisorContext) -> Result<()> {
        let bridge = Arc::new(RemoteBridge::start(
            "command",
            Arc::clone(&self.connector),
            self.settings,
            Arc::new(DeviceReplies),
        ));
        *self.bridge.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&bridge));

        ctx.shutdown_token().cancelled().await;
        bridge.close().await;
        self.bridge.lock().unwrap_or_else(PoisonError::into_inner).take();
        Ok(())
    }

    async fn handle_action(
        &self,
        action: &str,
        envelope: &Envelope,
        ctx: &SupervisorContext,
    ) -> Result<ActionOutcome> {
        if action == "get-stats" {
            ctx.send(Envelope::metric("command-stats", self.stats())).await;
            return Ok(ActionOutcome::Handled);
        }

        self.received.fetch_add(1, Ordering::Relaxed);
        match self.forward(action, &envelope.payload).await {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                let mut reply = Payload::new();
                reply.insert("action".into(), json!(action));
                reply.insert("status".into(), json!("sent"));
                ctx.respond(reply).await;
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                let message = format!("{e:#}");
                log::warn!("[Command] {action} failed: {message}");
                let mut error = Envelope::error("command-error", &message, ctx.process());
                error.payload.insert("action".into(), json!(action));
                ctx.send(error).await;
            }
        }
        Ok(ActionOutcome::Handled)
    }
}

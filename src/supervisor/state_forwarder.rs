//! `state` subprocess: device state → main process.
//!
//! Each device message is extracted to a map, deduplicated against the last
//! forwarded state, admitted by the rate limiter, and sent as a `state`
//! envelope without backpressure delay.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use super::device::StateExtractor;
use super::{ActionOutcome, Subprocess, SupervisorContext};
use crate::bridge::{BridgeConnector, BridgeHandler, BridgeSettings, RemoteBridge};
use crate::shaping::{Deduplicator, RateLimiter};
use crate::socket::envelope::{Envelope, Payload};

type StateGate = Deduplicator<Payload, RateLimiter>;

struct Shared {
    extractor: Arc<dyn StateExtractor>,
    dedup: Mutex<StateGate>,
    received: AtomicU64,
    sent: AtomicU64,
    bridge: Mutex<Option<Arc<RemoteBridge>>>,
}

impl Shared {
    fn ws_connected(&self) -> bool {
        self.bridge
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|b| b.is_connected())
    }

    fn rate_hz(&self) -> u32 {
        self.dedup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gate()
            .rate_hz()
    }
}

/// Forwards deduplicated, rate-limited device state.
pub struct StateForwarder {
    connector: Arc<dyn BridgeConnector>,
    settings: BridgeSettings,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for StateForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateForwarder")
            .field("device", &self.connector.describe())
            .field("rate_hz", &self.shared.rate_hz())
            .finish_non_exhaustive()
    }
}

impl StateForwarder {
    /// Forwarder reading from `connector` at `rate_hz`.
    ///
    /// # Panics
    ///
    /// Panics if `rate_hz` is 0.
    pub fn new(
        connector: Arc<dyn BridgeConnector>,
        extractor: Arc<dyn StateExtractor>,
        settings: BridgeSettings,
        rate_hz: u32,
    ) -> Self {
        Self {
            connector,
            settings,
            shared: Arc::new(Shared {
                extractor,
                dedup: Mutex::new(Deduplicator::new(RateLimiter::new(rate_hz))),
                received: AtomicU64::new(0),
                sent: AtomicU64::new(0),
                bridge: Mutex::new(None),
            }),
        }
    }

    fn stats(&self) -> Value {
        let dedup = self.shared.dedup.lock().unwrap_or_else(PoisonError::into_inner);
        json!({
            "received": self.shared.received.load(Ordering::Relaxed),
            "sent": self.shared.sent.load(Ordering::Relaxed),
            "duplicates": dedup.duplicates(),
            "rate-limited": dedup.rate_limited(),
            "ws-connected": self.shared.ws_connected(),
            "rate-limit-hz": dedup.gate().rate_hz(),
        })
    }

    fn set_rate(&self, envelope: &Envelope) -> Result<u32> {
        let rate = match envelope.payload.get("rate-hz") {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
            Some(other) => bail!("rate-hz must be a number, got {other}"),
            None => bail!("missing rate-hz"),
        };
        if !(rate >= 1.0 && rate <= f64::from(u32::MAX)) {
            bail!("rate-hz must be at least 1, got {rate}");
        }
        let rate = rate as u32;
        self.shared
            .dedup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .set_gate(RateLimiter::new(rate));
        log::info!("[State] Rate limit set to {rate} Hz");
        Ok(rate)
    }
}

struct ForwardState {
    shared: Arc<Shared>,
    ctx: SupervisorContext,
}

#[async_trait]
impl BridgeHandler for ForwardState {
    async fn on_message(&self, message: Vec<u8>) {
        self.shared.received.fetch_add(1, Ordering::Relaxed);
        let state = match self.shared.extractor.extract(&message) {
            Ok(state) => state,
            Err(e) => {
                log::warn!("[State] Dropping unreadable device state: {e:#}");
                return;
            }
        };

        let forward = self
            .shared
            .dedup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .should_forward(&state);
        if !forward {
            return;
        }

        match self.ctx.endpoint().send_direct(&Envelope::state(state)).await {
            Ok(()) => {
                self.shared.sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => log::warn!("[State] Failed to forward state: {e}"),
        }
    }
}

#[async_trait]
impl Subprocess for StateForwarder {
    fn name(&self) -> &str {
        "state"
    }

    fn status(&self) -> Payload {
        let mut snapshot = Payload::new();
        snapshot.insert("received".into(), json!(self.shared.received.load(Ordering::Relaxed)));
        snapshot.insert("sent".into(), json!(self.shared.sent.load(Ordering::Relaxed)));
        snapshot.insert("ws-connected".into(), json!(self.shared.ws_connected()));
        snapshot.insert("rate-limit-hz".into(), json!(self.shared.rate_hz()));
        snapshot
    }

    async fn run(&self, ctx: SupervisorContext) -> Result<()> {
        let shutdown = ctx.shutdown_token();
        let handler = Arc::new(ForwardState {
            shared: Arc::clone(&self.shared),
            ctx,
        });
        let bridge = Arc::new(RemoteBridge::start(
            "state",
            Arc::clone(&self.connector),
            self.settings,
            handler,
        ));
        *self.shared.bridge.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&bridge));

        shutdown.cancelled().await;
        bridge.close().await;
        self.shared.bridge.lock().unwrap_or_else(PoisonError::into_inner).take();
        Ok(())
    }

    async fn handle_action(
        &self,
        action: &str,
        envelope: &Envelope,
        ctx: &SupervisorContext,
    ) -> Result<ActionOutcome> {
        match action {
            "get-stats" => {
                ctx.send(Envelope::metric("state-stats", self.stats())).await;
                Ok(ActionOutcome::Handled)
            }
            "set-rate-limit" => {
                let rate = self.set_rate(envelope)?;
                let mut reply = Payload::new();
                reply.insert("action".into(), json!("set-rate-limit"));
                reply.insert("rate-hz".into(), json!(rate));
                ctx.respond(reply).await;
                Ok(ActionOutcome::Handled)
            }
            _ => Ok(ActionOutcome::Unhandled),
        }
    }
}

//! Remote bridge: a self-healing streaming link to the device.
//!
//! Unlike a local [`crate::socket::connection::Connection`], which gives up
//! after a bounded number of attempts, the bridge retries forever with a
//! fixed delay while it is enabled. Incoming chunks are reassembled into
//! whole messages under a size cap and handed to a [`BridgeHandler`] in
//! arrival order.
//!
//! The transport sits behind [`BridgeConnector`] so the loop is independent
//! of WebSocket specifics; [`crate::ws::WsConnector`] is the production
//! implementation.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::constants::{BRIDGE_MAX_MESSAGE_BYTES, BRIDGE_RECONNECT_DELAY};

/// A piece of an incoming message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Bytes in this piece.
    pub data: Vec<u8>,
    /// Last piece of the message.
    pub is_final: bool,
}

impl Chunk {
    /// A complete single-piece message.
    pub fn whole(data: Vec<u8>) -> Self {
        Self { data, is_final: true }
    }
}

/// Opens one transport session.
#[async_trait]
pub trait BridgeConnector: Send + Sync {
    /// Connect and return the write and read halves.
    async fn connect(&self) -> Result<(Box<dyn BridgeSink>, Box<dyn BridgeSource>)>;

    /// Where this connector points, for logs.
    fn describe(&self) -> String;
}

/// Write half of a transport session.
#[async_trait]
pub trait BridgeSink: Send {
    /// Send one binary message.
    async fn send_binary(&mut self, data: Vec<u8>) -> Result<()>;

    /// Send the transport's normal close signal.
    async fn close(&mut self) -> Result<()>;
}

/// Read half of a transport session.
#[async_trait]
pub trait BridgeSource: Send {
    /// Next chunk, or `None` when the session has ended.
    async fn next_chunk(&mut self) -> Option<Result<Chunk>>;
}

/// Receives reassembled messages.
#[async_trait]
pub trait BridgeHandler: Send + Sync {
    /// Handle one complete message.
    async fn on_message(&self, message: Vec<u8>);
}

/// Bridge timing and limits.
#[derive(Debug, Clone, Copy)]
pub struct BridgeSettings {
    /// Delay between connect attempts and after a dropped session.
    pub reconnect_delay: Duration,
    /// Reassembly cap for one message.
    pub max_message_bytes: usize,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            reconnect_delay: BRIDGE_RECONNECT_DELAY,
            max_message_bytes: BRIDGE_MAX_MESSAGE_BYTES,
        }
    }
}

// ── Reassembly ──────────────────────────────────────────────────────────

/// Accumulates chunks until a final marker, dropping oversized messages.
#[derive(Debug)]
pub struct Reassembler {
    buf: Vec<u8>,
    cap: usize,
    /// Skipping the tail of a message that already overflowed.
    discarding: bool,
    oversized: u64,
}

impl Reassembler {
    /// Empty buffer with a byte cap.
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Self {
            buf: Vec::new(),
            cap,
            discarding: false,
            oversized: 0,
        }
    }

    /// Add a chunk; returns the message when `chunk` completes it.
    pub fn push(&mut self, chunk: Chunk) -> Option<Vec<u8>> {
        if self.discarding {
            if chunk.is_final {
                self.discarding = false;
            }
            return None;
        }

        if self.buf.len() + chunk.data.len() > self.cap {
            self.oversized += 1;
            log::warn!(
                "[Bridge] Dropping message over {} bytes ({} buffered + {} incoming)",
                self.cap,
                self.buf.len(),
                chunk.data.len()
            );
            self.buf.clear();
            self.discarding = !chunk.is_final;
            return None;
        }

        self.buf.extend_from_slice(&chunk.data);
        chunk.is_final.then(|| std::mem::take(&mut self.buf))
    }

    /// Messages dropped for exceeding the cap.
    pub fn oversized(&self) -> u64 {
        self.oversized
    }

    /// Bytes buffered for an incomplete message.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

// ── Bridge ──────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Counters {
    connects: AtomicU64,
    messages: AtomicU64,
    oversized: AtomicU64,
    sent: AtomicU64,
}

/// Snapshot of bridge counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct BridgeStats {
    /// Successful sessions opened.
    pub connects: u64,
    /// Complete messages delivered to the handler.
    pub messages: u64,
    /// Messages dropped over the cap.
    pub oversized: u64,
    /// Messages sent to the device.
    pub sent: u64,
    /// Link currently up.
    pub connected: bool,
}

type SinkSlot = Arc<tokio::sync::Mutex<Option<Box<dyn BridgeSink>>>>;

/// Handle to a running bridge loop.
pub struct RemoteBridge {
    name: String,
    sink: SinkSlot,
    connected: Arc<AtomicBool>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for RemoteBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteBridge")
            .field("name", &self.name)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl RemoteBridge {
    /// Spawn the connect loop.
    pub fn start(
        name: &str,
        connector: Arc<dyn BridgeConnector>,
        settings: BridgeSettings,
        handler: Arc<dyn BridgeHandler>,
    ) -> Self {
        let bridge = Self {
            name: name.to_string(),
            sink: Arc::new(tokio::sync::Mutex::new(None)),
            connected: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(Counters::default()),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        };

        let ctx = LoopContext {
            name: bridge.name.clone(),
            connector,
            settings,
            handler,
            sink: Arc::clone(&bridge.sink),
            connected: Arc::clone(&bridge.connected),
            counters: Arc::clone(&bridge.counters),
            cancel: bridge.cancel.clone(),
        };
        let handle = tokio::spawn(run_loop(ctx));
        *bridge.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        bridge
    }

    /// Whether a session is currently open.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Send one binary message over the current session.
    pub async fn send(&self, data: Vec<u8>) -> Result<()> {
        let mut slot = self.sink.lock().await;
        let Some(sink) = slot.as_mut() else {
            bail!("Bridge {} not connected", self.name);
        };
        sink.send_binary(data).await?;
        self.counters.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Counters snapshot.
    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            connects: self.counters.connects.load(Ordering::Relaxed),
            messages: self.counters.messages.load(Ordering::Relaxed),
            oversized: self.counters.oversized.load(Ordering::Relaxed),
            sent: self.counters.sent.load(Ordering::Relaxed),
            connected: self.is_connected(),
        }
    }

    /// Disable reconnects, send a normal close and wait for the loop to end.
    pub async fn close(&self) {
        self.cancel.cancel();
        if let Some(mut sink) = self.sink.lock().await.take() {
            if let Err(e) = sink.close().await {
                log::debug!("[Bridge] {} close: {e:#}", self.name);
            }
        }
        self.connected.store(false, Ordering::Release);

        let handle = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        log::info!("[Bridge] {} closed", self.name);
    }
}

impl Drop for RemoteBridge {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct LoopContext {
    name: String,
    connector: Arc<dyn BridgeConnector>,
    settings: BridgeSettings,
    handler: Arc<dyn BridgeHandler>,
    sink: SinkSlot,
    connected: Arc<AtomicBool>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
}

async fn run_loop(ctx: LoopContext) {
    let target = ctx.connector.describe();
    let mut attempt: u64 = 0;

    loop {
        attempt += 1;
        let connected = tokio::select! {
            () = ctx.cancel.cancelled() => break,
            result = ctx.connector.connect() => result,
        };

        match connected {
            Ok((sink, source)) => {
                attempt = 0;
                *ctx.sink.lock().await = Some(sink);
                ctx.connected.store(true, Ordering::Release);
                ctx.counters.connects.fetch_add(1, Ordering::Relaxed);
                log::info!("[Bridge] {} connected to {target}", ctx.name);

                read_session(&ctx, source).await;

                ctx.connected.store(false, Ordering::Release);
                ctx.sink.lock().await.take();
                if ctx.cancel.is_cancelled() {
                    break;
                }
                log::warn!(
                    "[Bridge] {} session ended, reconnecting in {:?}",
                    ctx.name,
                    ctx.settings.reconnect_delay
                );
            }
            Err(e) => {
                log::warn!(
                    "[Bridge] {} connect to {target} failed (attempt {attempt}): {e:#}; retrying in {:?}",
                    ctx.name,
                    ctx.settings.reconnect_delay
                );
            }
        }

        tokio::select! {
            () = ctx.cancel.cancelled() => break,
            () = tokio::time::sleep(ctx.settings.reconnect_delay) => {}
        }
    }
    log::debug!("[Bridge] {} loop exited", ctx.name);
}

async fn read_session(ctx: &LoopContext, mut source: Box<dyn BridgeSource>) {
    let mut reassembler = Reassembler::new(ctx.settings.max_message_bytes);
    loop {
        let next = tokio::select! {
            () = ctx.cancel.cancelled() => return,
            next = source.next_chunk() => next,
        };
        match next {
            Some(Ok(chunk)) => {
                let before = reassembler.oversized();
                if let Some(message) = reassembler.push(chunk) {
                    ctx.counters.messages.fetch_add(1, Ordering::Relaxed);
                    ctx.handler.on_message(message).await;
                }
                if reassembler.oversized() > before {
                    ctx.counters.oversized.fetch_add(1, Ordering::Relaxed);
                }
            }
            Some(Err(e)) => {
                log::warn!("[Bridge] {} read error: {e:#}", ctx.name);
                return;
            }
            None => {
                log::info!("[Bridge] {} remote closed the session", ctx.name);
                return;
            }
        }
    }
}

//! Inbound pipeline: bounded queue, dispatcher and backpressure monitor.
//!
//! ```text
//! reader task ──try_push──► [bounded mpsc + depth counter] ──pop──► dispatcher ──► handlers (in order)
//!                                      │
//!                      monitor (every 100ms) samples depth ──► Backpressure.active
//! ```
//!
//! The reader lives in [`super::connection`]; this module owns everything
//! downstream of the queue. A full queue drops the newest envelope and counts
//! it. Depth is tracked with an exact atomic counter rather than inferred from
//! the channel.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::envelope::Envelope;

/// Action name of the close-request control command.
pub const CLOSE_REQUEST_ACTION: &str = "close-request";

/// Receives every envelope popped off the inbound queue.
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    /// Handle one envelope. Errors are logged and isolated to this handler.
    async fn handle(&self, envelope: &Envelope) -> anyhow::Result<()>;
}

/// Adapter turning a plain closure into an [`EnvelopeHandler`].
pub struct FnHandler<F>(pub F);

impl<F> std::fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnHandler").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F> EnvelopeHandler for FnHandler<F>
where
    F: Fn(&Envelope) -> anyhow::Result<()> + Send + Sync,
{
    async fn handle(&self, envelope: &Envelope) -> anyhow::Result<()> {
        (self.0)(envelope)
    }
}

/// Wrap a closure as a shareable handler.
pub fn handler_fn<F>(f: F) -> Arc<dyn EnvelopeHandler>
where
    F: Fn(&Envelope) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

// ── Queue ───────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Counters {
    depth: AtomicUsize,
    received: AtomicU64,
    dropped: AtomicU64,
    malformed: AtomicU64,
}

/// Producer side of the inbound queue. Cheap to clone; several connections
/// may feed the same queue.
#[derive(Debug, Clone)]
pub struct InboundQueue {
    tx: mpsc::Sender<Envelope>,
    counters: Arc<Counters>,
}

impl InboundQueue {
    /// Non-blocking push. On a full queue the envelope is dropped and counted.
    ///
    /// Returns `false` if the envelope was not queued.
    pub fn try_push(&self, envelope: Envelope) -> bool {
        // Count before sending so the consumer can never decrement below zero
        self.counters.depth.fetch_add(1, Ordering::AcqRel);
        match self.tx.try_send(envelope) {
            Ok(()) => {
                self.counters.received.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(dropped)) => {
                self.counters.depth.fetch_sub(1, Ordering::AcqRel);
                let total = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                log::warn!(
                    "[Inbound] Queue full, dropped {} {} (total dropped: {total})",
                    dropped.msg_type,
                    dropped.msg_id
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.counters.depth.fetch_sub(1, Ordering::AcqRel);
                false
            }
        }
    }

    /// Count a frame whose envelope failed to decode.
    pub fn record_malformed(&self) {
        self.counters.malformed.fetch_add(1, Ordering::Relaxed);
    }

    /// Exact number of envelopes waiting in the queue.
    pub fn depth(&self) -> usize {
        self.counters.depth.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
struct QueueReceiver {
    rx: mpsc::Receiver<Envelope>,
    counters: Arc<Counters>,
}

impl QueueReceiver {
    async fn pop(&mut self) -> Option<Envelope> {
        let envelope = self.rx.recv().await?;
        self.counters.depth.fetch_sub(1, Ordering::AcqRel);
        Some(envelope)
    }
}

// ── Backpressure ────────────────────────────────────────────────────────

/// Advisory flow-control flag with high/low water-mark hysteresis.
#[derive(Debug)]
pub struct Backpressure {
    active: AtomicBool,
    high_water: usize,
    low_water: usize,
}

impl Backpressure {
    /// Create an inactive flag.
    ///
    /// # Panics
    ///
    /// Panics if `low_water > high_water`.
    #[must_use]
    pub fn new(high_water: usize, low_water: usize) -> Self {
        assert!(low_water <= high_water, "low water mark must not exceed high water mark");
        Self {
            active: AtomicBool::new(false),
            high_water,
            low_water,
        }
    }

    /// Feed one depth sample and return the resulting state.
    ///
    /// Turns on at `depth >= high_water`, off at `depth <= low_water`, and
    /// holds its previous value in between.
    pub fn observe(&self, depth: usize) -> bool {
        let active = self.active.load(Ordering::Acquire);
        let next = if active {
            depth > self.low_water
        } else {
            depth >= self.high_water
        };
        if next != active {
            self.active.store(next, Ordering::Release);
        }
        next
    }

    /// Whether senders should currently throttle.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

// ── Pipeline ────────────────────────────────────────────────────────────

/// Sizing and timing for an [`Inbound`] pipeline.
#[derive(Debug, Clone, Copy)]
pub struct InboundSettings {
    /// Queue capacity.
    pub capacity: usize,
    /// Depth that turns backpressure on.
    pub high_water: usize,
    /// Depth that turns backpressure off.
    pub low_water: usize,
    /// Monitor sampling period.
    pub check_interval: Duration,
}

impl Default for InboundSettings {
    fn default() -> Self {
        use crate::constants::{
            BACKPRESSURE_CHECK_INTERVAL, HIGH_WATER_MARK, INBOUND_QUEUE_CAPACITY, LOW_WATER_MARK,
        };
        Self {
            capacity: INBOUND_QUEUE_CAPACITY,
            high_water: HIGH_WATER_MARK,
            low_water: LOW_WATER_MARK,
            check_interval: BACKPRESSURE_CHECK_INTERVAL,
        }
    }
}

/// Snapshot of inbound counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct InboundStats {
    /// Envelopes accepted into the queue.
    pub received: u64,
    /// Envelopes dropped on a full queue.
    pub dropped: u64,
    /// Frames discarded because the envelope did not decode.
    pub malformed: u64,
    /// Envelopes currently queued.
    pub depth: usize,
    /// Backpressure flag at snapshot time.
    pub backpressure: bool,
}

type HandlerList = Arc<RwLock<Vec<Arc<dyn EnvelopeHandler>>>>;

/// Consumer side of the inbound queue plus its background tasks.
///
/// The receiving end is consumed either by the dispatcher
/// ([`Inbound::start_dispatch`]) or by a close-request listener
/// ([`Inbound::listen_for_close_request`]), whichever starts first.
pub struct Inbound {
    queue: InboundQueue,
    receiver: Mutex<Option<QueueReceiver>>,
    handlers: HandlerList,
    backpressure: Arc<Backpressure>,
    check_interval: Duration,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Inbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inbound")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Inbound {
    /// Create the queue. No task runs until a consumer is started.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero or the water marks are inverted.
    #[must_use]
    pub fn new(settings: InboundSettings) -> Self {
        let (tx, rx) = mpsc::channel(settings.capacity);
        let counters = Arc::new(Counters::default());
        Self {
            queue: InboundQueue {
                tx,
                counters: Arc::clone(&counters),
            },
            receiver: Mutex::new(Some(QueueReceiver { rx, counters })),
            handlers: Arc::new(RwLock::new(Vec::new())),
            backpressure: Arc::new(Backpressure::new(settings.high_water, settings.low_water)),
            check_interval: settings.check_interval,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Producer handle for reader tasks.
    pub fn queue(&self) -> InboundQueue {
        self.queue.clone()
    }

    /// Shared backpressure flag, read by the outbound pipeline.
    pub fn backpressure(&self) -> Arc<Backpressure> {
        Arc::clone(&self.backpressure)
    }

    /// Append a handler. Handlers run in registration order.
    pub fn register(&self, handler: Arc<dyn EnvelopeHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    /// Current counters.
    pub fn stats(&self) -> InboundStats {
        let counters = &self.queue.counters;
        InboundStats {
            received: counters.received.load(Ordering::Relaxed),
            dropped: counters.dropped.load(Ordering::Relaxed),
            malformed: counters.malformed.load(Ordering::Relaxed),
            depth: counters.depth.load(Ordering::Acquire),
            backpressure: self.backpressure.is_active(),
        }
    }

    fn take_receiver(&self) -> Option<QueueReceiver> {
        self.receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    /// Start the dispatcher and backpressure monitor.
    ///
    /// Returns `false` if the queue already has a consumer.
    pub fn start_dispatch(&self) -> bool {
        let Some(rx) = self.take_receiver() else {
            log::warn!("[Inbound] Dispatcher not started: queue already consumed");
            return false;
        };
        self.spawn_monitor();
        let handle = tokio::spawn(dispatch_loop(
            rx,
            Arc::clone(&self.handlers),
            self.cancel.child_token(),
        ));
        self.track(handle);
        true
    }

    /// Consume the queue looking only for a `close-request` command.
    ///
    /// The callback runs exactly once, after which the listener exits.
    /// Other envelopes are discarded. Returns `None` if the queue already
    /// has a consumer.
    pub fn listen_for_close_request<F>(&self, on_close: F) -> Option<JoinHandle<()>>
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(rx) = self.take_receiver() else {
            log::warn!("[Inbound] Close listener not started: queue already consumed");
            return None;
        };
        self.spawn_monitor();
        Some(tokio::spawn(close_listen_loop(
            rx,
            Box::new(on_close),
            self.cancel.child_token(),
        )))
    }

    fn spawn_monitor(&self) {
        let handle = tokio::spawn(monitor_loop(
            self.queue.clone(),
            Arc::clone(&self.backpressure),
            self.check_interval,
            self.cancel.child_token(),
        ));
        self.track(handle);
    }

    /// Cancel the dispatcher, listener and monitor. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
        for handle in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            handle.abort();
        }
    }
}

impl Drop for Inbound {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn dispatch_loop(mut rx: QueueReceiver, handlers: HandlerList, cancel: CancellationToken) {
    loop {
        let envelope = tokio::select! {
            () = cancel.cancelled() => break,
            next = rx.pop() => match next {
                Some(envelope) => envelope,
                None => break,
            },
        };

        // Snapshot so handlers can register more handlers without deadlocking
        let snapshot: Vec<Arc<dyn EnvelopeHandler>> = handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for (index, handler) in snapshot.iter().enumerate() {
            match AssertUnwindSafe(handler.handle(&envelope)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::warn!(
                    "[Inbound] Handler #{index} failed on {} {} (action: {}): {e:#}",
                    envelope.msg_type,
                    envelope.msg_id,
                    envelope.action().unwrap_or("-")
                ),
                Err(_) => log::error!(
                    "[Inbound] Handler #{index} panicked on {} {}",
                    envelope.msg_type,
                    envelope.msg_id
                ),
            }
        }
    }
    log::debug!("[Inbound] Dispatcher exited");
}

async fn close_listen_loop(
    mut rx: QueueReceiver,
    on_close: Box<dyn FnOnce() + Send>,
    cancel: CancellationToken,
) {
    loop {
        let envelope = tokio::select! {
            () = cancel.cancelled() => return,
            next = rx.pop() => match next {
                Some(envelope) => envelope,
                None => return,
            },
        };
        if envelope.is_command(CLOSE_REQUEST_ACTION) {
            log::info!("[Inbound] Close request received ({})", envelope.msg_id);
            on_close();
            return;
        }
        log::debug!(
            "[Inbound] Close listener ignoring {} {}",
            envelope.msg_type,
            envelope.msg_id
        );
    }
}

async fn monitor_loop(
    queue: InboundQueue,
    backpressure: Arc<Backpressure>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let depth = queue.depth();
        let was_active = backpressure.is_active();
        let active = backpressure.observe(depth);
        if active != was_active {
            if active {
                log::warn!("[Inbound] Backpressure on (depth {depth})");
            } else {
                log::info!("[Inbound] Backpressure off (depth {depth})");
            }
        }
    }
}

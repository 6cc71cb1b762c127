//! One local Unix-domain endpoint: connect or bind, frame I/O, teardown.
//!
//! A [`Connection`] is created in the `Idle` state by [`Connection::client`]
//! or [`Connection::server`] and brought up by [`Connection::start`], which
//! spawns:
//!
//! - a reader task: socket → [`FrameDecoder`] → [`Envelope::decode`] →
//!   [`InboundQueue::try_push`]
//! - a writer task: the only code that writes to the socket, fed through an
//!   internal channel
//!
//! A server accepts exactly one peer and then closes its listener.
//! [`Connection::stop`] cancels every task (including a pending read),
//! deletes a server-owned socket file, and may be called any number of
//! times from any thread.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::envelope::{Envelope, EnvelopeError};
use super::framing::{FrameDecoder, FrameError};
use super::inbound::InboundQueue;
use crate::constants::{
    CONNECT_BACKOFF_BASE, CONNECT_MAX_RETRIES, MAX_SOCKET_PATH_LEN, PEER_ATTACH_TIMEOUT,
    READ_BUFFER_SIZE,
};

/// Which side of the socket this connection is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Connects to an existing socket file.
    Client,
    /// Owns and binds the socket file.
    Server,
}

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Created, not started.
    Idle,
    /// Started; frames flow.
    Running,
    /// Stopped locally or the peer went away.
    Closed,
    /// Protocol violation from the peer; the stream was abandoned.
    Failed,
}

impl LinkState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Running,
            2 => Self::Closed,
            _ => Self::Failed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Running => 1,
            Self::Closed => 2,
            Self::Failed => 3,
        }
    }
}

/// Connection-level errors.
#[derive(Debug)]
pub enum ConnectionError {
    /// Client gave up after exhausting its connect attempts.
    ConnectionUnavailable {
        /// Target socket path.
        path: PathBuf,
        /// Attempts made.
        attempts: u32,
    },
    /// Socket path exceeds the `sun_path` limit.
    PathTooLong {
        /// Offending path.
        path: PathBuf,
    },
    /// `start` called twice.
    AlreadyStarted,
    /// Connection is not running (never started, stopped, or peer gone).
    NotRunning,
    /// Server has no accepted peer to write to.
    NoPeer {
        /// How long the send waited.
        waited: Duration,
    },
    /// Frame could not be built.
    Frame(FrameError),
    /// Envelope could not be encoded.
    Envelope(EnvelopeError),
    /// Socket setup or write failed.
    Io {
        /// What was being attempted.
        context: String,
        /// Underlying error.
        source: io::Error,
    },
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionUnavailable { path, attempts } => write!(
                f,
                "Connection unavailable: {} (gave up after {attempts} attempts)",
                path.display()
            ),
            Self::PathTooLong { path } => write!(
                f,
                "Socket path too long ({} bytes, max {}): {}",
                path.as_os_str().len(),
                MAX_SOCKET_PATH_LEN - 1,
                path.display()
            ),
            Self::AlreadyStarted => write!(f, "Connection already started"),
            Self::NotRunning => write!(f, "Connection not running"),
            Self::NoPeer { waited } => write!(f, "No peer connected after {waited:?}"),
            Self::Frame(e) => write!(f, "{e}"),
            Self::Envelope(e) => write!(f, "{e}"),
            Self::Io { context, source } => write!(f, "{context}: {source}"),
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Frame(e) => Some(e),
            Self::Envelope(e) => Some(e),
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<FrameError> for ConnectionError {
    fn from(e: FrameError) -> Self {
        Self::Frame(e)
    }
}

impl From<EnvelopeError> for ConnectionError {
    fn from(e: EnvelopeError) -> Self {
        Self::Envelope(e)
    }
}

fn io_error(context: impl Into<String>) -> impl FnOnce(io::Error) -> ConnectionError {
    let context = context.into();
    move |source| ConnectionError::Io { context, source }
}

/// Client connect retry policy.
#[derive(Debug, Clone, Copy)]
pub struct ConnectOptions {
    /// Total attempts before giving up (at least one is always made).
    pub max_retries: u32,
    /// Attempt `n` that fails sleeps `n * base_backoff`.
    pub base_backoff: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            max_retries: CONNECT_MAX_RETRIES,
            base_backoff: CONNECT_BACKOFF_BASE,
        }
    }
}

struct WriteRequest {
    frame: Vec<u8>,
    ack: Option<oneshot::Sender<io::Result<()>>>,
}

struct Inner {
    role: Role,
    stream_name: String,
    path: PathBuf,
    connect: ConnectOptions,
    state: AtomicU8,
    stopped: AtomicBool,
    /// Stop signal for every task.
    cancel: CancellationToken,
    /// Fires once the connection can no longer carry frames.
    closed: CancellationToken,
    /// Fires once the I/O tasks are attached to a stream.
    attached: CancellationToken,
    peer_wait: Duration,
    write_tx: mpsc::UnboundedSender<WriteRequest>,
    write_rx: Mutex<Option<mpsc::UnboundedReceiver<WriteRequest>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Inner {
    fn state(&self) -> LinkState {
        LinkState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Leave `Running` for `next`. No-op from any other state.
    fn end_running(&self, next: LinkState) -> bool {
        self.state
            .compare_exchange(
                LinkState::Running.as_u8(),
                next.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if self.stopped.load(Ordering::Acquire) {
            handle.abort();
        } else {
            tasks.push(handle);
        }
    }
}

/// Handle to one local connection. Clones share the same socket.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.inner.role)
            .field("stream", &self.inner.stream_name)
            .field("path", &self.inner.path)
            .field("state", &self.inner.state())
            .finish_non_exhaustive()
    }
}

impl Connection {
    fn new(role: Role, stream_name: &str, path: PathBuf, connect: ConnectOptions) -> Self {
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                role,
                stream_name: stream_name.to_string(),
                path,
                connect,
                state: AtomicU8::new(LinkState::Idle.as_u8()),
                stopped: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                closed: CancellationToken::new(),
                attached: CancellationToken::new(),
                peer_wait: PEER_ATTACH_TIMEOUT,
                write_tx,
                write_rx: Mutex::new(Some(write_rx)),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Client connection to the socket at `path`.
    pub fn client(stream_name: &str, path: PathBuf, connect: ConnectOptions) -> Self {
        Self::new(Role::Client, stream_name, path, connect)
    }

    /// Server connection owning the socket at `path`.
    pub fn server(stream_name: &str, path: PathBuf) -> Self {
        Self::new(Role::Server, stream_name, path, ConnectOptions::default())
    }

    /// Server whose sends wait at most `peer_wait` for a peer to connect.
    pub fn server_with_peer_wait(stream_name: &str, path: PathBuf, peer_wait: Duration) -> Self {
        let mut conn = Self::new(Role::Server, stream_name, path, ConnectOptions::default());
        if let Some(inner) = Arc::get_mut(&mut conn.inner) {
            inner.peer_wait = peer_wait;
        }
        conn
    }

    /// Connect (client) or bind (server) and spawn the I/O tasks.
    ///
    /// Decoded envelopes are pushed onto `queue`. A server becomes running
    /// as soon as it is bound; a send before a peer is accepted waits up to
    /// the peer wait and then fails with [`ConnectionError::NoPeer`].
    pub async fn start(&self, queue: InboundQueue) -> Result<(), ConnectionError> {
        if self.inner.state() != LinkState::Idle || self.inner.stopped.load(Ordering::Acquire) {
            return Err(ConnectionError::AlreadyStarted);
        }
        validate_socket_path(&self.inner.path)?;

        match self.inner.role {
            Role::Client => {
                let stream = self.connect_with_retry().await?;
                if !self.enter_running() {
                    return Err(ConnectionError::NotRunning);
                }
                log::info!(
                    "[Socket] {} connected to {}",
                    self.inner.stream_name,
                    self.inner.path.display()
                );
                spawn_io(&self.inner, stream, queue);
            }
            Role::Server => {
                let listener = bind_listener(&self.inner.path)?;
                if !self.enter_running() {
                    drop(listener);
                    let _ = std::fs::remove_file(&self.inner.path);
                    return Err(ConnectionError::NotRunning);
                }
                log::info!(
                    "[Socket] {} listening on {}",
                    self.inner.stream_name,
                    self.inner.path.display()
                );
                let handle = tokio::spawn(accept_one(Arc::clone(&self.inner), listener, queue));
                self.inner.track(handle);
            }
        }
        Ok(())
    }

    /// Idle to Running, unless `stop` got there first.
    fn enter_running(&self) -> bool {
        if self.inner.stopped.load(Ordering::Acquire) {
            return false;
        }
        self.inner
            .state
            .compare_exchange(
                LinkState::Idle.as_u8(),
                LinkState::Running.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    async fn connect_with_retry(&self) -> Result<UnixStream, ConnectionError> {
        let inner = &self.inner;
        let max = inner.connect.max_retries.max(1);
        let mut attempts = 0;

        for attempt in 1..=max {
            attempts = attempt;
            if inner.path.exists() {
                match UnixStream::connect(&inner.path).await {
                    Ok(stream) => return Ok(stream),
                    Err(e) => log::debug!(
                        "[Socket] {} connect attempt {attempt}/{max} failed: {e}",
                        inner.stream_name
                    ),
                }
            } else {
                log::debug!(
                    "[Socket] {} socket missing (attempt {attempt}/{max}): {}",
                    inner.stream_name,
                    inner.path.display()
                );
            }

            if attempt < max {
                let delay = inner.connect.base_backoff * attempt;
                tokio::select! {
                    () = inner.cancel.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }

        log::error!(
            "[Socket] {} unavailable after {attempts} attempts: {}",
            inner.stream_name,
            inner.path.display()
        );
        Err(ConnectionError::ConnectionUnavailable {
            path: inner.path.clone(),
            attempts,
        })
    }

    /// Queue an encoded frame for the writer and wait for the write result.
    ///
    /// A server without an accepted peer waits up to its peer wait first.
    pub async fn send(&self, frame: Vec<u8>) -> Result<(), ConnectionError> {
        if self.inner.stopped.load(Ordering::Acquire) || self.inner.state() != LinkState::Running
        {
            return Err(ConnectionError::NotRunning);
        }
        if !self.inner.attached.is_cancelled() {
            let waited = self.inner.peer_wait;
            tokio::select! {
                () = self.inner.attached.cancelled() => {}
                () = self.inner.closed.cancelled() => return Err(ConnectionError::NotRunning),
                () = tokio::time::sleep(waited) => {
                    log::warn!(
                        "[Socket] {} has no peer after {waited:?}, dropping frame",
                        self.inner.stream_name
                    );
                    return Err(ConnectionError::NoPeer { waited });
                }
            }
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        self.inner
            .write_tx
            .send(WriteRequest {
                frame,
                ack: Some(ack_tx),
            })
            .map_err(|_closed| ConnectionError::NotRunning)?;

        let ack = tokio::select! {
            biased;
            ack = ack_rx => ack,
            () = self.inner.closed.cancelled() => return Err(ConnectionError::NotRunning),
        };
        match ack {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(ConnectionError::Io {
                context: format!("Write to {} failed", self.inner.stream_name),
                source,
            }),
            Err(_dropped) => Err(ConnectionError::NotRunning),
        }
    }

    /// Encode and send one envelope.
    pub async fn send_envelope(&self, envelope: &Envelope) -> Result<(), ConnectionError> {
        let frame = super::framing::encode_frame(&envelope.encode()?)?;
        self.send(frame).await
    }

    /// Tear down. Idempotent and safe from any thread.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        // Idle or Running become Closed; a Failed state stays visible
        let _ = self.inner.state.compare_exchange(
            LinkState::Idle.as_u8(),
            LinkState::Closed.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.inner.end_running(LinkState::Closed);

        self.inner.cancel.cancel();
        self.inner.closed.cancel();
        for handle in self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            handle.abort();
        }

        if self.inner.role == Role::Server && self.inner.path.exists() {
            if let Err(e) = std::fs::remove_file(&self.inner.path) {
                log::warn!(
                    "[Socket] Failed to remove {}: {e}",
                    self.inner.path.display()
                );
            }
        }
        log::info!("[Socket] {} stopped", self.inner.stream_name);
    }

    /// True while frames can flow.
    pub fn is_running(&self) -> bool {
        self.inner.state() == LinkState::Running
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LinkState {
        self.inner.state()
    }

    /// Resolves once the connection is stopped or the peer is gone.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await;
    }

    /// Connection role.
    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Stream name used in logs.
    pub fn stream_name(&self) -> &str {
        &self.inner.stream_name
    }

    /// Socket file path.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }
}

/// Reject paths that do not fit in `sun_path`.
pub fn validate_socket_path(path: &Path) -> Result<(), ConnectionError> {
    if path.as_os_str().len() >= MAX_SOCKET_PATH_LEN {
        return Err(ConnectionError::PathTooLong {
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

fn bind_listener(path: &Path) -> Result<UnixListener, ConnectionError> {
    if path.exists() {
        std::fs::remove_file(path)
            .map_err(io_error(format!("Failed to remove stale socket {}", path.display())))?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(io_error(format!("Failed to create {}", parent.display())))?;
    }

    let listener = std::os::unix::net::UnixListener::bind(path)
        .map_err(io_error(format!("Failed to bind socket {}", path.display())))?;

    // Owner-only (0600)
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms).map_err(io_error("Failed to set socket permissions"))?;
    }

    listener
        .set_nonblocking(true)
        .map_err(io_error("Failed to set socket nonblocking"))?;
    UnixListener::from_std(listener).map_err(io_error("Failed to register listener"))
}

async fn accept_one(inner: Arc<Inner>, listener: UnixListener, queue: InboundQueue) {
    let accepted = tokio::select! {
        () = inner.cancel.cancelled() => return,
        accepted = listener.accept() => accepted,
    };
    // One peer per server; stop listening either way
    drop(listener);

    match accepted {
        Ok((stream, _addr)) => {
            log::info!("[Socket] {} peer connected", inner.stream_name);
            spawn_io(&inner, stream, queue);
        }
        Err(e) => {
            log::error!("[Socket] {} accept failed: {e}", inner.stream_name);
            inner.end_running(LinkState::Failed);
            inner.closed.cancel();
        }
    }
}

fn spawn_io(inner: &Arc<Inner>, stream: UnixStream, queue: InboundQueue) {
    let Some(write_rx) = inner
        .write_rx
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take()
    else {
        log::error!("[Socket] {} writer already attached", inner.stream_name);
        return;
    };
    let (read_half, write_half) = stream.into_split();

    let writer = tokio::spawn(write_loop(Arc::clone(inner), write_half, write_rx));
    inner.track(writer);
    let reader = tokio::spawn(read_loop(Arc::clone(inner), read_half, queue));
    inner.track(reader);
    inner.attached.cancel();
}

/// Writer task: sole owner of the socket's write half.
async fn write_loop(
    inner: Arc<Inner>,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<WriteRequest>,
) {
    loop {
        let request = tokio::select! {
            () = inner.cancel.cancelled() => return,
            request = rx.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        let result = writer.write_all(&request.frame).await;
        let failed = result.is_err();
        if let Err(e) = &result {
            log::error!("[Socket] {} write failed: {e}", inner.stream_name);
        }
        if let Some(ack) = request.ack {
            let _ = ack.send(result);
        }
        if failed {
            inner.end_running(LinkState::Closed);
            inner.closed.cancel();
            return;
        }
    }
    let _ = writer.shutdown().await;
}

enum ReadOutcome {
    Stopped,
    Disconnected(Option<FrameError>),
    Violation(FrameError),
}

/// Reader task: sole owner of the socket's read half.
async fn read_loop(inner: Arc<Inner>, mut reader: OwnedReadHalf, queue: InboundQueue) {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    let outcome = loop {
        let read = tokio::select! {
            () = inner.cancel.cancelled() => break ReadOutcome::Stopped,
            read = reader.read(&mut buf) => read,
        };

        match read {
            Ok(0) => break ReadOutcome::Disconnected(decoder.finish().err()),
            Ok(n) => match decoder.feed(&buf[..n]) {
                Ok(frames) => {
                    for payload in frames {
                        match Envelope::decode(&payload) {
                            Ok(envelope) => {
                                queue.try_push(envelope);
                            }
                            Err(e) => {
                                queue.record_malformed();
                                log::warn!(
                                    "[Socket] {} discarded frame ({} bytes): {e}",
                                    inner.stream_name,
                                    payload.len()
                                );
                            }
                        }
                    }
                }
                Err(e) => break ReadOutcome::Violation(e),
            },
            Err(e) => break ReadOutcome::Disconnected(Some(FrameError::Io(e))),
        }
    };

    match outcome {
        ReadOutcome::Stopped => return,
        ReadOutcome::Disconnected(None) => {
            log::info!("[Socket] {} peer disconnected", inner.stream_name);
            inner.end_running(LinkState::Closed);
        }
        ReadOutcome::Disconnected(Some(e)) => {
            log::info!("[Socket] {} peer disconnected: {e}", inner.stream_name);
            inner.end_running(LinkState::Closed);
        }
        ReadOutcome::Violation(e) => {
            log::error!("[Socket] {} protocol violation, closing: {e}", inner.stream_name);
            inner.end_running(LinkState::Failed);
        }
    }
    inner.closed.cancel();
}

//! Process supervisor and command state machine shared by all subprocesses.
//!
//! ```text
//! Created ──start──► Running ──stop/shutdown──► Stopping ──► Stopped
//! ```
//!
//! The supervisor owns one [`IpcEndpoint`] to the main process. It registers
//! a command router on the endpoint's dispatcher, runs the subprocess's
//! domain loop, and tears everything down in order when asked to stop:
//! refuse new commands, signal the domain loop, mark Stopped, close the
//! connection.
//!
//! `ping`, `status`, `stop` and `shutdown` are answered here. A
//! `close-request` from the owner stops the process without a reply. Any
//! other action goes to [`Subprocess::handle_action`].

pub mod command_forwarder;
pub mod device;
pub mod state_forwarder;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::constants::{EXIT_CLEAN, EXIT_COMMAND_ERROR, EXIT_ERROR};
use crate::socket::endpoint::IpcEndpoint;
use crate::socket::envelope::{now_millis, Envelope, MsgType, Payload};
use crate::socket::inbound::{EnvelopeHandler, CLOSE_REQUEST_ACTION};

/// Supervisor lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Built, not started.
    Created,
    /// Handling commands and running the domain loop.
    Running,
    /// Stop requested; no new commands accepted.
    Stopping,
    /// Terminal.
    Stopped,
}

impl ProcessState {
    /// Lowercase name used in status replies.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the process should exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Clean stop via `stop`/`shutdown`.
    Clean,
    /// Unrecoverable startup or runtime error.
    Error,
    /// A command handler reported a fatal error.
    CommandError,
}

impl ExitStatus {
    /// Process exit code.
    pub fn code(self) -> i32 {
        match self {
            Self::Clean => EXIT_CLEAN,
            Self::Error => EXIT_ERROR,
            Self::CommandError => EXIT_COMMAND_ERROR,
        }
    }
}

/// Error a domain handler returns to end the process with exit code 2.
#[derive(Debug)]
pub struct FatalCommand(pub String);

impl fmt::Display for FatalCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fatal command error: {}", self.0)
    }
}

impl std::error::Error for FatalCommand {}

/// Result of offering an action to the domain handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    /// The subprocess took care of it.
    Handled,
    /// Not an action this subprocess knows.
    Unhandled,
}

// ── Control ─────────────────────────────────────────────────────────────

/// Authoritative lifecycle state plus the stop signal.
#[derive(Debug)]
pub struct Control {
    state: Mutex<ProcessState>,
    shutdown: CancellationToken,
    fatal: AtomicBool,
}

impl Control {
    fn new() -> Self {
        Self {
            state: Mutex::new(ProcessState::Created),
            shutdown: CancellationToken::new(),
            fatal: AtomicBool::new(false),
        }
    }

    /// Current state.
    pub fn state(&self) -> ProcessState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, from: ProcessState, to: ProcessState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != from {
            return false;
        }
        log::debug!("[Supervisor] {from} -> {to}");
        *state = to;
        true
    }

    /// Running → Stopping and signal the domain loop. `false` if not running.
    pub fn begin_stop(&self) -> bool {
        if !self.transition(ProcessState::Running, ProcessState::Stopping) {
            return false;
        }
        self.shutdown.cancel();
        true
    }

    fn finish(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *state = ProcessState::Stopped;
        self.shutdown.cancel();
    }
}

// ── Context ─────────────────────────────────────────────────────────────

/// What domain code gets from the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorContext {
    process: String,
    endpoint: Arc<IpcEndpoint>,
    control: Arc<Control>,
}

impl SupervisorContext {
    /// Process name used in replies.
    pub fn process(&self) -> &str {
        &self.process
    }

    /// Endpoint to the main process.
    pub fn endpoint(&self) -> &Arc<IpcEndpoint> {
        &self.endpoint
    }

    /// Cancelled when the domain loop must exit.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.control.shutdown.clone()
    }

    /// Send an envelope, logging failure instead of returning it.
    pub async fn send(&self, envelope: Envelope) {
        if let Err(e) = self.endpoint.send(&envelope).await {
            log::error!(
                "[Supervisor] {} failed to send {} on {}: {e}",
                self.process,
                envelope.msg_type,
                self.endpoint.stream_name()
            );
        }
    }

    /// Reply with a `response` envelope; `process` is added.
    pub async fn respond(&self, mut payload: Payload) {
        payload.insert("process".to_string(), Value::String(self.process.clone()));
        self.send(Envelope::new(MsgType::Response, payload)).await;
    }

    /// Report an `error` envelope for `context`.
    pub async fn report_error(&self, context: &str, error: &str) {
        self.send(Envelope::error(context, error, &self.process)).await;
    }
}

fn object(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => Payload::new(),
    }
}

// ── Subprocess ──────────────────────────────────────────────────────────

/// Domain behaviour plugged into a [`Supervisor`].
#[async_trait]
pub trait Subprocess: Send + Sync + 'static {
    /// Short process name ("state", "command").
    fn name(&self) -> &str;

    /// Extra fields for `status` replies.
    fn status(&self) -> Payload {
        Payload::new()
    }

    /// Domain main loop. Must return once the context's shutdown token is
    /// cancelled.
    async fn run(&self, ctx: SupervisorContext) -> Result<()> {
        ctx.shutdown_token().cancelled().await;
        Ok(())
    }

    /// Handle a command the supervisor does not own.
    async fn handle_action(
        &self,
        action: &str,
        envelope: &Envelope,
        ctx: &SupervisorContext,
    ) -> Result<ActionOutcome> {
        let _ = (action, envelope, ctx);
        Ok(ActionOutcome::Unhandled)
    }
}

/// Dispatcher handler that interprets `command` envelopes.
struct CommandRouter<S> {
    subprocess: Arc<S>,
    ctx: SupervisorContext,
}

#[async_trait]
impl<S: Subprocess> EnvelopeHandler for CommandRouter<S> {
    async fn handle(&self, envelope: &Envelope) -> Result<()> {
        if envelope.msg_type != MsgType::Command {
            return Ok(());
        }
        let name = self.subprocess.name();
        let Some(action) = envelope.action() else {
            log::warn!("[Supervisor] {name}: command {} has no action", envelope.msg_id);
            return Ok(());
        };

        let state = self.ctx.control.state();
        if state != ProcessState::Running {
            log::debug!("[Supervisor] {name}: ignoring {action} while {state}");
            return Ok(());
        }

        match action {
            "ping" => {
                self.ctx
                    .respond(object(json!({ "action": "pong", "timestamp": now_millis() })))
                    .await;
            }
            "status" => {
                let mut payload = self.subprocess.status();
                payload.insert("action".to_string(), json!("status"));
                payload.insert("state".to_string(), json!(state.as_str()));
                payload.insert("stream".to_string(), json!(self.ctx.endpoint.stream_name()));
                payload.insert("queue".to_string(), serde_json::to_value(self.ctx.endpoint.stats())?);
                self.ctx.respond(payload).await;
            }
            "stop" | "shutdown" => {
                log::info!("[Supervisor] {name}: {action} requested");
                self.ctx
                    .respond(object(json!({ "action": action, "status": "stopping" })))
                    .await;
                self.ctx.control.begin_stop();
            }
            CLOSE_REQUEST_ACTION => {
                log::info!("[Supervisor] {name}: close-request from owner");
                self.ctx.control.begin_stop();
            }
            other => match self.subprocess.handle_action(other, envelope, &self.ctx).await {
                Ok(ActionOutcome::Handled) => {}
                Ok(ActionOutcome::Unhandled) => {
                    log::warn!("[Supervisor] {name}: unknown action {other:?}");
                }
                Err(e) => {
                    let message = format!("{e:#}");
                    log::error!("[Supervisor] {name}: action {other:?} failed: {message}");
                    self.ctx.report_error(other, &message).await;
                    if e.downcast_ref::<FatalCommand>().is_some() {
                        self.ctx.control.fatal.store(true, Ordering::Release);
                        self.ctx.control.begin_stop();
                    }
                }
            },
        }
        Ok(())
    }
}

// ── Supervisor ──────────────────────────────────────────────────────────

/// Runs one subprocess against one endpoint.
#[derive(Debug)]
pub struct Supervisor<S> {
    subprocess: Arc<S>,
    endpoint: Arc<IpcEndpoint>,
    control: Arc<Control>,
}

impl<S: Subprocess> Supervisor<S> {
    /// Supervisor in the `Created` state.
    pub fn new(subprocess: Arc<S>, endpoint: Arc<IpcEndpoint>) -> Self {
        Self {
            subprocess,
            endpoint,
            control: Arc::new(Control::new()),
        }
    }

    /// Shared control handle, e.g. for a signal handler.
    pub fn control(&self) -> Arc<Control> {
        Arc::clone(&self.control)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ProcessState {
        self.control.state()
    }

    /// Request a stop from outside the command protocol.
    pub fn request_stop(&self) -> bool {
        self.control.begin_stop()
    }

    /// Run until stopped, the domain loop ends, or the connection drops.
    pub async fn run(&self) -> ExitStatus {
        let name = self.subprocess.name().to_string();
        let stream = self.endpoint.stream_name().to_string();

        if !self.control.transition(ProcessState::Created, ProcessState::Running) {
            log::error!("[Supervisor] {name}: already started");
            return ExitStatus::Error;
        }
        log::info!("[Supervisor] {name} running on stream {stream}");

        let ctx = SupervisorContext {
            process: name.clone(),
            endpoint: Arc::clone(&self.endpoint),
            control: Arc::clone(&self.control),
        };
        self.endpoint.register_handler(Arc::new(CommandRouter {
            subprocess: Arc::clone(&self.subprocess),
            ctx: ctx.clone(),
        }));

        let outcome = if self.endpoint.start_dispatch() {
            let domain = self.subprocess.run(ctx);
            tokio::pin!(domain);
            tokio::select! {
                result = &mut domain => result,
                () = self.endpoint.closed() => {
                    // Let the domain loop release what it started before reporting
                    self.control.shutdown.cancel();
                    if let Err(e) = domain.await {
                        log::debug!("[Supervisor] {name} wind-down: {e:#}");
                    }
                    Err(anyhow!("connection on stream {stream} lost"))
                }
            }
        } else {
            Err(anyhow!("dispatcher for stream {stream} could not start"))
        };

        let stop_requested = self.control.state() == ProcessState::Stopping;
        self.control.finish();
        self.endpoint.shutdown().await;

        let status = if self.control.fatal.load(Ordering::Acquire) {
            ExitStatus::CommandError
        } else {
            match outcome {
                Ok(()) => ExitStatus::Clean,
                Err(_) if stop_requested => ExitStatus::Clean,
                Err(e) => {
                    log::error!("[Supervisor] {name} on stream {stream}: {e:#}");
                    ExitStatus::Error
                }
            }
        };
        log::info!("[Supervisor] {name} stopped (exit {})", status.code());
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::endpoint::IpcSettings;
    use crate::socket::inbound::handler_fn;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct Sensor {
        seen: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl Subprocess for Sensor {
        fn name(&self) -> &str {
            "sensor"
        }

        fn status(&self) -> Payload {
            object(json!({ "widgets": 3 }))
        }

        async fn handle_action(
            &self,
            action: &str,
            _envelope: &Envelope,
            ctx: &SupervisorContext,
        ) -> Result<ActionOutcome> {
            match action {
                "echo" => {
                    let _ = self.seen.send(action.to_string());
                    ctx.respond(object(json!({ "action": "echo" }))).await;
                    Ok(ActionOutcome::Handled)
                }
                "explode" => Err(FatalCommand("boom".to_string()).into()),
                "fail" => anyhow::bail!("soft failure"),
                _ => Ok(ActionOutcome::Unhandled),
            }
        }
    }

    struct Harness {
        _dir: TempDir,
        main: IpcEndpoint,
        replies: mpsc::UnboundedReceiver<Envelope>,
        supervisor: Arc<Supervisor<Sensor>>,
        seen: mpsc::UnboundedReceiver<String>,
    }

    async fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ipc-1-sensor.sock");
        let settings = IpcSettings::default();

        let main = IpcEndpoint::bind("sensor", path.clone(), &settings).await.unwrap();
        let (tx, replies) = mpsc::unbounded_channel();
        main.register_handler(handler_fn(move |env| {
            let _ = tx.send(env.clone());
            Ok(())
        }));
        main.start_dispatch();

        let child = IpcEndpoint::connect("sensor", path, &settings).await.unwrap();
        let (seen_tx, seen) = mpsc::unbounded_channel();
        let supervisor = Arc::new(Supervisor::new(
            Arc::new(Sensor { seen: seen_tx }),
            Arc::new(child),
        ));
        Harness {
            _dir: dir,
            main,
            replies,
            supervisor,
            seen,
        }
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Envelope {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    async fn command(main: &IpcEndpoint, action: &str) {
        main.send(&Envelope::command(action, Payload::new())).await.unwrap();
    }

    #[tokio::test]
    async fn test_ping_status_and_stop() {
        let mut h = harness().await;
        let sup = Arc::clone(&h.supervisor);
        let running = tokio::spawn(async move { sup.run().await });

        command(&h.main, "ping").await;
        let pong = next(&mut h.replies).await;
        assert_eq!(pong.msg_type, MsgType::Response);
        assert_eq!(pong.payload["action"], json!("pong"));
        assert_eq!(pong.payload["process"], json!("sensor"));
        assert!(pong.payload["timestamp"].is_i64());

        command(&h.main, "status").await;
        let status = next(&mut h.replies).await;
        assert_eq!(status.payload["state"], json!("running"));
        assert_eq!(status.payload["widgets"], json!(3));

        command(&h.main, "stop").await;
        command(&h.main, "stop").await;
        let ack = next(&mut h.replies).await;
        assert_eq!(ack.payload["status"], json!("stopping"));

        let exit = tokio::time::timeout(Duration::from_secs(2), running)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, ExitStatus::Clean);
        assert_eq!(h.supervisor.state(), ProcessState::Stopped);
        assert!(!h.supervisor.request_stop());

        // The second stop was ignored: no further reply arrives
        assert!(tokio::time::timeout(Duration::from_millis(100), h.replies.recv())
            .await
            .map_or(true, |reply| reply.is_none()));
    }

    #[tokio::test]
    async fn test_unknown_and_domain_actions() {
        let mut h = harness().await;
        let sup = Arc::clone(&h.supervisor);
        let running = tokio::spawn(async move { sup.run().await });

        command(&h.main, "no-such-action").await;
        command(&h.main, "echo").await;
        assert_eq!(h.seen.recv().await.unwrap(), "echo");
        assert_eq!(next(&mut h.replies).await.payload["action"], json!("echo"));

        command(&h.main, "fail").await;
        let err = next(&mut h.replies).await;
        assert_eq!(err.msg_type, MsgType::Error);
        assert_eq!(err.payload["context"], json!("fail"));
        assert_eq!(h.supervisor.state(), ProcessState::Running);

        command(&h.main, "shutdown").await;
        assert_eq!(next(&mut h.replies).await.payload["action"], json!("shutdown"));
        assert_eq!(running.await.unwrap(), ExitStatus::Clean);
    }

    #[tokio::test]
    async fn test_fatal_command_exits_with_code_two() {
        let mut h = harness().await;
        let sup = Arc::clone(&h.supervisor);
        let running = tokio::spawn(async move { sup.run().await });

        command(&h.main, "explode").await;
        let err = next(&mut h.replies).await;
        assert_eq!(err.msg_type, MsgType::Error);
        let exit = tokio::time::timeout(Duration::from_secs(2), running)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, ExitStatus::CommandError);
        assert_eq!(exit.code(), 2);
    }

    #[tokio::test]
    async fn test_lost_connection_is_an_error() {
        let h = harness().await;
        let sup = Arc::clone(&h.supervisor);
        let running = tokio::spawn(async move { sup.run().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        h.main.stop();
        let exit = tokio::time::timeout(Duration::from_secs(2), running)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, ExitStatus::Error);
        assert_eq!(exit.code(), 1);
    }

    #[tokio::test]
    async fn test_close_request_stops_without_reply() {
        let mut h = harness().await;
        let sup = Arc::clone(&h.supervisor);
        let running = tokio::spawn(async move { sup.run().await });

        h.main.send_close_request().await.unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(2), running)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, ExitStatus::Clean);
        assert!(h.replies.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_external_stop_request() {
        let h = harness().await;
        let sup = Arc::clone(&h.supervisor);
        let running = tokio::spawn(async move { sup.run().await });

        tokio::time::timeout(Duration::from_secs(2), async {
            while h.supervisor.state() != ProcessState::Running {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(h.supervisor.request_stop());
        assert!(!h.supervisor.request_stop());
        assert_eq!(running.await.unwrap(), ExitStatus::Clean);
        assert!(!h.supervisor.endpoint.is_running());
    }
}

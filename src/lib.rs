//! stationlink - local IPC backbone for a station and its subprocesses.
//!
//! A main process owns one Unix socket per stream; device-facing
//! subprocesses connect to it and exchange MessagePack envelopes inside
//! length-prefixed frames.
//!
//! # Modules
//!
//! - [`socket`] - Framing, envelopes, connections and the inbound/outbound
//!   pipelines
//! - [`supervisor`] - Subprocess lifecycle and command handling, plus the
//!   state and command forwarders
//! - [`shaping`] - Rate limiting and deduplication for device traffic
//! - [`bridge`] - Self-healing streaming link to the device
//! - [`ws`] - WebSocket transport for the bridge
//! - [`config`] - Configuration loading

pub mod bridge;
pub mod config;
pub mod constants;
pub mod shaping;
pub mod socket;
pub mod supervisor;
pub mod ws;

pub use config::Config;
pub use socket::endpoint::{IpcEndpoint, IpcSettings};
pub use socket::envelope::{Envelope, MsgType, Payload};
pub use supervisor::{ExitStatus, Subprocess, Supervisor};

//! Unix domain socket IPC between the main process and its subprocesses.
//!
//! # Architecture
//!
//! ```text
//! Main Process                          Subprocess (state, command, video)
//! ┌──────────────────┐                 ┌──────────────────┐
//! │ EndpointRegistry │                 │ Supervisor       │
//! │  IpcEndpoint     │◄───────────────►│  IpcEndpoint     │
//! │   (server)       │  frames over    │   (client)       │
//! │   one per stream │  Unix socket    │                  │
//! └──────────────────┘                 └──────────────────┘
//! ```
//!
//! # Wire Protocol
//!
//! Length-prefixed frames: `[u32 BE length][MessagePack envelope]`
//!
//! See [`framing`] for the frame codec and [`envelope`] for the message
//! shape.

pub mod addr;
pub mod connection;
pub mod endpoint;
pub mod envelope;
pub mod framing;
pub mod inbound;
pub mod outbound;
pub mod registry;

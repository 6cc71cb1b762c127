//! Device-protocol seams for the forwarders.
//!
//! The device speaks its own binary protocol; the forwarders only need two
//! conversions. [`StateExtractor`] turns a device state message into a flat
//! map for `state` envelopes, [`CommandCompiler`] turns a named command into
//! the bytes the device expects. The JSON implementations here are what the
//! CLI ships with.

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};

use crate::socket::envelope::Payload;

/// Device state message → state map.
pub trait StateExtractor: Send + Sync {
    /// Extract the fields worth forwarding.
    fn extract(&self, message: &[u8]) -> Result<Payload>;
}

/// Command name and parameters → device command bytes.
pub trait CommandCompiler: Send + Sync {
    /// Compile one command.
    fn compile(&self, action: &str, params: &Payload) -> Result<Vec<u8>>;
}

/// Treats each device message as a JSON object.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonStateExtractor;

impl StateExtractor for JsonStateExtractor {
    fn extract(&self, message: &[u8]) -> Result<Payload> {
        let value: Value = serde_json::from_slice(message).context("device state is not JSON")?;
        match value {
            Value::Object(map) => Ok(map),
            other => bail!("device state is not an object: {other}"),
        }
    }
}

/// Emits `{"action": .., "params": {..}}` as JSON bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCommandCompiler;

impl CommandCompiler for JsonCommandCompiler {
    fn compile(&self, action: &str, params: &Payload) -> Result<Vec<u8>> {
        if action.is_empty() {
            bail!("empty command action");
        }
        let mut params = params.clone();
        params.remove("action");
        serde_json::to_vec(&json!({ "action": action, "params": params }))
            .context("failed to encode device command")
    }
}

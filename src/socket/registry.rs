//! Process-wide table of live endpoints, keyed by stream name.
//!
//! Created once at startup and passed to whatever needs to look up a
//! stream, in place of a global singleton per stream.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{bail, Result};

use super::endpoint::IpcEndpoint;

/// Stream name → endpoint.
#[derive(Debug, Default)]
pub struct EndpointRegistry {
    endpoints: Mutex<HashMap<String, Arc<IpcEndpoint>>>,
}

impl EndpointRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint under its stream name.
    ///
    /// Fails if a running endpoint already owns the name. A dead one is
    /// replaced.
    pub fn insert(&self, endpoint: IpcEndpoint) -> Result<Arc<IpcEndpoint>> {
        let name = endpoint.stream_name().to_string();
        let mut endpoints = self.endpoints.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = endpoints.get(&name) {
            if existing.is_running() {
                bail!("Stream {name:?} already registered");
            }
            existing.stop();
        }
        let endpoint = Arc::new(endpoint);
        endpoints.insert(name, Arc::clone(&endpoint));
        Ok(endpoint)
    }

    /// Look up a stream.
    pub fn get(&self, stream: &str) -> Option<Arc<IpcEndpoint>> {
        self.endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(stream)
            .cloned()
    }

    /// Remove and stop a stream's endpoint.
    pub fn remove(&self, stream: &str) -> Option<Arc<IpcEndpoint>> {
        let removed = self
            .endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(stream);
        if let Some(endpoint) = &removed {
            endpoint.stop();
        }
        removed
    }

    /// Registered stream names, sorted.
    pub fn streams(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Stop and forget every endpoint.
    pub fn stop_all(&self) {
        let drained: Vec<Arc<IpcEndpoint>> = self
            .endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, endpoint)| endpoint)
            .collect();
        for endpoint in drained {
            endpoint.stop();
        }
    }
}

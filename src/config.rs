//! Configuration loading.
//!
//! Reads `config.json` from the config directory, falls back to defaults
//! when it is absent, then applies `STATIONLINK_*` environment overrides.
//! Runtime components take the typed settings derived from it
//! ([`Config::ipc_settings`], [`Config::bridge_settings`]) rather than the
//! raw struct.

use std::time::Duration;
use std::{fs, path::PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::bridge::BridgeSettings;
use crate::constants;
use crate::socket::addr::default_socket_dir;
use crate::socket::connection::ConnectOptions;
use crate::socket::endpoint::IpcSettings;
use crate::socket::inbound::InboundSettings;

/// Configuration for stationlink processes.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Directory holding `ipc-<pid>-<stream>.sock` files.
    pub socket_dir: PathBuf,
    /// Client connect attempts before giving up.
    pub connect_max_retries: u32,
    /// Linear backoff base between connect attempts, in milliseconds.
    pub connect_backoff_ms: u64,
    /// How long a server send waits for its peer, in milliseconds.
    pub peer_wait_ms: u64,
    /// Inbound queue capacity.
    pub queue_capacity: usize,
    /// Queue depth that turns backpressure on.
    pub high_water_mark: usize,
    /// Queue depth that turns backpressure off.
    pub low_water_mark: usize,
    /// Backpressure sampling period in milliseconds.
    pub backpressure_check_interval_ms: u64,
    /// Delay before each throttled send in milliseconds.
    pub backpressure_delay_ms: u64,
    /// Fixed delay between device bridge reconnects in milliseconds.
    pub bridge_reconnect_delay_ms: u64,
    /// Reassembly cap for one device message.
    pub bridge_max_message_bytes: usize,
    /// Initial state forwarding rate in Hz.
    pub state_rate_hz: u32,
    /// Emit connection events on endpoint start and stop.
    pub connection_events: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_dir: default_socket_dir(),
            connect_max_retries: constants::CONNECT_MAX_RETRIES,
            connect_backoff_ms: constants::CONNECT_BACKOFF_BASE.as_millis() as u64,
            peer_wait_ms: constants::PEER_ATTACH_TIMEOUT.as_millis() as u64,
            queue_capacity: constants::INBOUND_QUEUE_CAPACITY,
            high_water_mark: constants::HIGH_WATER_MARK,
            low_water_mark: constants::LOW_WATER_MARK,
            backpressure_check_interval_ms: constants::BACKPRESSURE_CHECK_INTERVAL.as_millis() as u64,
            backpressure_delay_ms: constants::BACKPRESSURE_DELAY.as_millis() as u64,
            bridge_reconnect_delay_ms: constants::BRIDGE_RECONNECT_DELAY.as_millis() as u64,
            bridge_max_message_bytes: constants::BRIDGE_MAX_MESSAGE_BYTES,
            state_rate_hz: constants::DEFAULT_STATE_RATE_HZ,
            connection_events: false,
        }
    }
}

impl Config {
    /// Returns the configuration directory path.
    ///
    /// Directory selection priority:
    /// 1. `STATIONLINK_CONFIG_DIR` env var: explicit override
    /// 2. Default: platform config dir (Linux: ~/.config/stationlink)
    pub fn config_dir() -> Result<PathBuf> {
        if let Ok(dir) = std::env::var("STATIONLINK_CONFIG_DIR") {
            return Ok(PathBuf::from(dir));
        }
        Ok(dirs::config_dir()
            .context("Could not determine config directory")?
            .join("stationlink"))
    }

    /// Loads configuration from file, with environment variable overrides.
    pub fn load() -> Result<Self> {
        let mut config = match Self::config_dir() {
            Ok(dir) => Self::load_from_file(&dir.join("config.json"))?,
            Err(e) => {
                log::debug!("[Config] {e:#}, using defaults");
                Self::default()
            }
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Read a config file; a missing file yields defaults.
    pub fn load_from_file(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Invalid config {}", path.display()))
    }

    /// Apply `STATIONLINK_*` overrides from `lookup`. Unparseable values are
    /// ignored with a warning.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, raw: &str, slot: &mut T) {
            match raw.trim().parse::<T>() {
                Ok(value) => *slot = value,
                Err(_) => log::warn!("[Config] Ignoring unparseable {key}={raw:?}"),
            }
        }

        if let Some(dir) = lookup("STATIONLINK_SOCKET_DIR") {
            self.socket_dir = PathBuf::from(dir);
        }
        if let Some(raw) = lookup("STATIONLINK_CONNECT_MAX_RETRIES") {
            parse("STATIONLINK_CONNECT_MAX_RETRIES", &raw, &mut self.connect_max_retries);
        }
        if let Some(raw) = lookup("STATIONLINK_CONNECT_BACKOFF_MS") {
            parse("STATIONLINK_CONNECT_BACKOFF_MS", &raw, &mut self.connect_backoff_ms);
        }
        if let Some(raw) = lookup("STATIONLINK_PEER_WAIT_MS") {
            parse("STATIONLINK_PEER_WAIT_MS", &raw, &mut self.peer_wait_ms);
        }
        if let Some(raw) = lookup("STATIONLINK_QUEUE_CAPACITY") {
            parse("STATIONLINK_QUEUE_CAPACITY", &raw, &mut self.queue_capacity);
        }
        if let Some(raw) = lookup("STATIONLINK_HIGH_WATER_MARK") {
            parse("STATIONLINK_HIGH_WATER_MARK", &raw, &mut self.high_water_mark);
        }
        if let Some(raw) = lookup("STATIONLINK_LOW_WATER_MARK") {
            parse("STATIONLINK_LOW_WATER_MARK", &raw, &mut self.low_water_mark);
        }
        if let Some(raw) = lookup("STATIONLINK_BACKPRESSURE_DELAY_MS") {
            parse("STATIONLINK_BACKPRESSURE_DELAY_MS", &raw, &mut self.backpressure_delay_ms);
        }
        if let Some(raw) = lookup("STATIONLINK_BRIDGE_RECONNECT_DELAY_MS") {
            parse(
                "STATIONLINK_BRIDGE_RECONNECT_DELAY_MS",
                &raw,
                &mut self.bridge_reconnect_delay_ms,
            );
        }
        if let Some(raw) = lookup("STATIONLINK_STATE_RATE_HZ") {
            parse("STATIONLINK_STATE_RATE_HZ", &raw, &mut self.state_rate_hz);
        }
        if let Some(raw) = lookup("STATIONLINK_CONNECTION_EVENTS") {
            parse("STATIONLINK_CONNECTION_EVENTS", &raw, &mut self.connection_events);
        }
    }

    /// Reject settings the pipelines cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            bail!("queue_capacity must be positive");
        }
        if self.low_water_mark > self.high_water_mark {
            bail!(
                "low_water_mark ({}) exceeds high_water_mark ({})",
                self.low_water_mark,
                self.high_water_mark
            );
        }
        if self.state_rate_hz == 0 {
            bail!("state_rate_hz must be positive");
        }
        if self.bridge_max_message_bytes == 0 {
            bail!("bridge_max_message_bytes must be positive");
        }
        Ok(())
    }

    /// Settings for local endpoints.
    pub fn ipc_settings(&self) -> IpcSettings {
        IpcSettings {
            connect: ConnectOptions {
                max_retries: self.connect_max_retries,
                base_backoff: Duration::from_millis(self.connect_backoff_ms),
            },
            inbound: InboundSettings {
                capacity: self.queue_capacity,
                high_water: self.high_water_mark,
                low_water: self.low_water_mark,
                check_interval: Duration::from_millis(self.backpressure_check_interval_ms.max(1)),
            },
            backpressure_delay: Duration::from_millis(self.backpressure_delay_ms),
            connection_events: self.connection_events,
            peer_wait: Duration::from_millis(self.peer_wait_ms),
        }
    }

    /// Settings for the device bridge.
    pub fn bridge_settings(&self) -> BridgeSettings {
        BridgeSettings {
            reconnect_delay: Duration::from_millis(self.bridge_reconnect_delay_ms),
            max_message_bytes: self.bridge_max_message_bytes,
        }
    }
}

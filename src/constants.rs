//! Application-wide constants for stationlink.
//!
//! Wire limits, timing defaults and socket naming live here so the
//! transport, pipelines and bridge agree on the same numbers. Most timing
//! values are defaults that [`crate::config::Config`] can override.
//!
//! # Categories
//!
//! - **Wire**: frame and message size limits
//! - **Connect**: local socket retry policy
//! - **Queue & Backpressure**: inbound queue sizing and throttling
//! - **Remote Bridge**: device link reconnect and reassembly
//! - **Process**: exit codes and naming

use std::time::Duration;

// ============================================================================
// Wire
// ============================================================================

/// Maximum frame payload size (10 MiB).
///
/// A declared length of zero or above this value is a protocol violation
/// and closes the connection, since a corrupt length cannot be resynced.
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Size of the big-endian length prefix on every frame.
pub const FRAME_HEADER_LEN: usize = 4;

/// Read buffer size for the per-connection reader task.
pub const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Maximum Unix socket path length (`sun_path` is 104 bytes on macOS).
pub const MAX_SOCKET_PATH_LEN: usize = 104;

// ============================================================================
// Connect
// ============================================================================

/// Default number of connect attempts for a client connection.
pub const CONNECT_MAX_RETRIES: u32 = 5;

/// Base backoff between connect attempts.
///
/// Attempt `n` that fails sleeps `n * CONNECT_BACKOFF_BASE` before the next.
pub const CONNECT_BACKOFF_BASE: Duration = Duration::from_millis(100);

/// How long a server send waits for its peer to be accepted before failing.
pub const PEER_ATTACH_TIMEOUT: Duration = Duration::from_secs(1);

// ============================================================================
// Queue & Backpressure
// ============================================================================

/// Default inbound queue capacity. The newest envelope is dropped when full.
pub const INBOUND_QUEUE_CAPACITY: usize = 1024;

/// Queue depth at which backpressure turns on.
pub const HIGH_WATER_MARK: usize = 768;

/// Queue depth at which backpressure turns off again.
pub const LOW_WATER_MARK: usize = 256;

/// How often the backpressure monitor samples queue depth.
pub const BACKPRESSURE_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Delay inserted before each outbound send while backpressure is active.
pub const BACKPRESSURE_DELAY: Duration = Duration::from_millis(10);

// ============================================================================
// Remote Bridge
// ============================================================================

/// Fixed delay between remote bridge connect attempts.
pub const BRIDGE_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Reassembly cap for one remote message (1 MiB).
pub const BRIDGE_MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// Default state forwarding rate in Hz.
pub const DEFAULT_STATE_RATE_HZ: u32 = 30;

// ============================================================================
// Process
// ============================================================================

/// Exit code for a clean `stop`/`shutdown`.
pub const EXIT_CLEAN: i32 = 0;

/// Exit code for an unrecoverable startup or runtime error.
pub const EXIT_ERROR: i32 = 1;

/// Exit code for a command-level fatal error.
pub const EXIT_COMMAND_ERROR: i32 = 2;

/// Directory name under the system temp dir holding IPC sockets.
pub const SOCKET_DIR_NAME: &str = "stationlink-sockets";

/// Environment variable carrying the owning process id for socket lookup.
pub const PARENT_PID_ENV: &str = "STATIONLINK_PARENT_PID";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_water_marks_ordering() {
        // LOW < HIGH <= CAPACITY, otherwise hysteresis never releases
        assert!(LOW_WATER_MARK < HIGH_WATER_MARK);
        assert!(HIGH_WATER_MARK <= INBOUND_QUEUE_CAPACITY);
    }

    #[test]
    fn test_backpressure_delay_shorter_than_check_interval() {
        assert!(BACKPRESSURE_DELAY < BACKPRESSURE_CHECK_INTERVAL);
    }

    #[test]
    fn test_bridge_message_fits_in_frame() {
        assert!(BRIDGE_MAX_MESSAGE_BYTES < MAX_FRAME_SIZE);
    }

    #[test]
    fn test_exit_codes_are_distinct() {
        assert_ne!(EXIT_CLEAN, EXIT_ERROR);
        assert_ne!(EXIT_ERROR, EXIT_COMMAND_ERROR);
        assert_ne!(EXIT_CLEAN, EXIT_COMMAND_ERROR);
    }
}

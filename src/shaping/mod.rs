//! Traffic shaping for the device bridge.
//!
//! - [`rate_limiter`]: token bucket, capacity = rate
//! - [`dedup`]: drop values identical to the last forwarded one, then ask
//!   the limiter

pub mod dedup;
pub mod rate_limiter;

pub use dedup::{Deduplicator, Fingerprint, Verdict};
pub use rate_limiter::{Admission, RateLimiter, Unlimited};

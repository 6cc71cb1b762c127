//! Consecutive-duplicate suppression in front of a rate limiter.
//!
//! The first value is always forwarded. After that a value is forwarded
//! when it differs from the last forwarded value and the admission gate
//! grants a slot. Hashes only short-circuit the common
//! case of a changed value; a matching hash is always confirmed by full
//! equality.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use serde_json::{Map, Value};

use super::rate_limiter::Admission;

/// Cheap, stable digest used for the fast inequality path.
pub trait Fingerprint {
    /// 64-bit digest. Equal values must produce equal digests.
    fn fingerprint(&self) -> u64;
}

fn hash_bytes(bytes: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

impl Fingerprint for Value {
    fn fingerprint(&self) -> u64 {
        // serde_json maps are ordered, so equal values serialize identically
        hash_bytes(&serde_json::to_vec(self).unwrap_or_default())
    }
}

impl Fingerprint for Map<String, Value> {
    fn fingerprint(&self) -> u64 {
        hash_bytes(&serde_json::to_vec(self).unwrap_or_default())
    }
}

impl Fingerprint for Vec<u8> {
    fn fingerprint(&self) -> u64 {
        hash_bytes(self)
    }
}

impl Fingerprint for String {
    fn fingerprint(&self) -> u64 {
        hash_bytes(self.as_bytes())
    }
}

/// Outcome of one [`Deduplicator::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Forward it.
    Forward,
    /// Same as the last forwarded value.
    Duplicate,
    /// Changed, but the gate refused.
    RateLimited,
}

/// Last-value filter with a swappable admission gate.
#[derive(Debug)]
pub struct Deduplicator<T, A> {
    last: Option<(u64, T)>,
    gate: A,
    forwarded: u64,
    duplicates: u64,
    rate_limited: u64,
}

impl<T, A> Deduplicator<T, A>
where
    T: Fingerprint + PartialEq + Clone,
    A: Admission,
{
    /// Empty filter in front of `gate`.
    pub fn new(gate: A) -> Self {
        Self {
            last: None,
            gate,
            forwarded: 0,
            duplicates: 0,
            rate_limited: 0,
        }
    }

    /// Classify `value`, recording it as the last value only when forwarded.
    pub fn check(&mut self, value: &T) -> Verdict {
        let hash = value.fingerprint();
        let repeat = self
            .last
            .as_ref()
            .map(|(last_hash, last_value)| *last_hash == hash && last_value == value);
        match repeat {
            None => return self.accept(hash, value),
            Some(true) => {
                self.duplicates += 1;
                return Verdict::Duplicate;
            }
            Some(false) => {}
        }
        if !self.gate.try_acquire() {
            self.rate_limited += 1;
            return Verdict::RateLimited;
        }
        self.accept(hash, value)
    }

    fn accept(&mut self, hash: u64, value: &T) -> Verdict {
        self.last = Some((hash, value.clone()));
        self.forwarded += 1;
        Verdict::Forward
    }

    /// `true` iff [`Self::check`] says forward.
    pub fn should_forward(&mut self, value: &T) -> bool {
        self.check(value) == Verdict::Forward
    }

    /// Replace the gate, keeping the last value.
    pub fn set_gate(&mut self, gate: A) {
        self.gate = gate;
    }

    /// Current gate.
    pub fn gate(&self) -> &A {
        &self.gate
    }

    /// Forget the last value so the next one always passes the filter.
    pub fn reset(&mut self) {
        self.last = None;
    }

    /// Values forwarded.
    pub fn forwarded(&self) -> u64 {
        self.forwarded
    }

    /// Values dropped as duplicates.
    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    /// Changed values dropped by the gate.
    pub fn rate_limited(&self) -> u64 {
        self.rate_limited
    }
}

//! Record expiry.
//!
//! A TTL given at write time becomes an absolute `expiresAt` timestamp
//! (milliseconds since the Unix epoch) on the [`StoredEntry`]. Expiry is only
//! checked when an entry is read; nothing sweeps in the background, so an
//! expired entry keeps its bytes until the next read touches it.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Source of the current time in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current time in milliseconds.
    fn now_millis(&self) -> i64;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    /// Create a clock reading `start` milliseconds.
    #[must_use]
    pub fn new(start: i64) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    /// Move the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        let millis = duration_millis(by);
        let _ = self
            .now
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |now| {
                Some(now.saturating_add(millis))
            });
    }

    /// Set the clock to an absolute reading.
    pub fn set(&self, millis: i64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// The persisted envelope around a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntry {
    /// The record itself.
    pub value: Value,
    /// Absolute expiry in milliseconds since the epoch, if any.
    #[serde(
        rename = "expiresAt",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub expires_at: Option<i64>,
}

impl StoredEntry {
    /// Whether this entry is expired at `now`.
    #[must_use]
    pub fn is_expired(&self, now: i64) -> bool {
        is_expired(self, now)
    }

    /// Unwrap the record.
    #[must_use]
    pub fn into_value(self) -> Value {
        self.value
    }
}

/// Wrap `record` with an expiry of `now + ttl` when a TTL is given.
#[must_use]
pub fn with_expiry(record: Value, ttl: Option<Duration>, now: i64) -> StoredEntry {
    StoredEntry {
        value: record,
        expires_at: ttl.map(|ttl| now.saturating_add(duration_millis(ttl))),
    }
}

/// True iff `entry` carries an expiry and `now` has reached it.
#[must_use]
pub fn is_expired(entry: &StoredEntry, now: i64) -> bool {
    entry.expires_at.is_some_and(|at| now >= at)
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_no_ttl_never_expires() {
        let entry = with_expiry(json!({ "id": 1 }), None, 1_000);
        assert_eq!(entry.expires_at, None);
        assert!(!entry.is_expired(i64::MAX));
    }

    #[test]
    fn test_expiry_boundary_is_inclusive() {
        let entry = with_expiry(json!({ "id": 1 }), Some(Duration::from_millis(50)), 1_000);
        assert_eq!(entry.expires_at, Some(1_050));
        assert!(!entry.is_expired(1_049));
        assert!(entry.is_expired(1_050));
        assert!(entry.is_expired(2_000));
    }

    #[test]
    fn test_huge_ttl_saturates() {
        let entry = with_expiry(json!({}), Some(Duration::MAX), 10);
        assert_eq!(entry.expires_at, Some(i64::MAX));
    }

    #[test]
    fn test_envelope_serialization() {
        let plain = with_expiry(json!({ "id": 1 }), None, 0);
        assert_eq!(
            serde_json::to_string(&plain).unwrap(),
            r#"{"value":{"id":1}}"#
        );

        let timed = with_expiry(json!({ "id": 1 }), Some(Duration::from_millis(5)), 10);
        assert_eq!(
            serde_json::to_string(&timed).unwrap(),
            r#"{"value":{"id":1},"expiresAt":15}"#
        );
    }

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(100);
        clock.advance(Duration::from_millis(25));
        assert_eq!(clock.now_millis(), 125);
        clock.set(7);
        assert_eq!(clock.now_millis(), 7);
    }
}

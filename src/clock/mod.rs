//! Sources of "now" for entity timestamps.
//!
//! Readings are milliseconds since the Unix epoch. Wrap a clock in
//! [`AssertMonotonic`] to reject time going backwards, or in
//! [`EnsureMonotonic`] to clamp it.

use chrono::DateTime;
use chrono::TimeZone;
use chrono::Utc;

use crate::errors::EngineError;
use crate::errors::EngineResult;

pub mod monotonic;
pub mod system_clock;
pub mod testing_clock;

pub use monotonic::AssertMonotonic;
pub use monotonic::EnsureMonotonic;
pub use system_clock::SystemClock;
pub use testing_clock::TestingClock;

pub trait Clock: Send + Sync {
    /// Current time in milliseconds since the epoch.
    fn now(&self) -> EngineResult<i64>;
}

impl<C: Clock + ?Sized> Clock for std::sync::Arc<C> {
    fn now(&self) -> EngineResult<i64> {
        (**self).now()
    }
}

/// Convert a clock reading into a timestamp.
pub fn to_datetime(millis: i64) -> EngineResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| EngineError::InvalidOperation(format!("clock reading {millis} is out of range")))
}

#[test]
fn readings_convert_to_timestamps() {
    let ts = to_datetime(1_640_995_200_000).unwrap();
    assert_eq!(ts.to_rfc3339(), "2022-01-01T00:00:00+00:00");
    assert!(to_datetime(i64::MAX).is_err());
}

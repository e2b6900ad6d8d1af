use std::collections::VecDeque;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

use super::Clock;
use crate::errors::EngineError;
use crate::errors::EngineResult;

/// Simulate system time for tests. Increment "now" after each
/// reading.
#[derive(Debug)]
pub struct TestingClock {
    incr_millis: i64,
    current: AtomicI64,
}

impl TestingClock {
    pub fn new(start_at: i64, incr_millis: i64) -> Self {
        Self {
            incr_millis,
            current: AtomicI64::new(start_at),
        }
    }

    /// The next value [`Clock::now`] will return, without advancing.
    pub fn peek(&self) -> i64 {
        self.current.load(Ordering::Acquire)
    }
}

impl Clock for TestingClock {
    fn now(&self) -> EngineResult<i64> {
        Ok(self.current.fetch_add(self.incr_millis, Ordering::AcqRel))
    }
}

/// Replay a fixed list of readings, then fail.
#[derive(Debug)]
pub struct ScriptedClock {
    readings: Mutex<VecDeque<i64>>,
}

impl ScriptedClock {
    pub fn new(readings: impl IntoIterator<Item = i64>) -> Self {
        Self {
            readings: Mutex::new(readings.into_iter().collect()),
        }
    }
}

impl Clock for ScriptedClock {
    fn now(&self) -> EngineResult<i64> {
        self.readings
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .pop_front()
            .ok_or_else(|| EngineError::InvalidOperation("scripted clock ran out of readings".to_owned()))
    }
}

#[test]
fn test_testing_clock() {
    let clock = TestingClock::new(1_000, 1_000);
    assert_eq!(clock.now().unwrap(), 1_000);
    assert_eq!(clock.now().unwrap(), 2_000);
    assert_eq!(clock.peek(), 3_000);
    assert_eq!(clock.now().unwrap(), 3_000);
}

#[test]
fn scripted_clock_runs_dry() {
    let clock = ScriptedClock::new([5, 3]);
    assert_eq!(clock.now().unwrap(), 5);
    assert_eq!(clock.now().unwrap(), 3);
    assert!(clock.now().is_err());
}

//! Monotonicity adapters for clocks.

use std::sync::Mutex;

use super::Clock;
use crate::errors::EngineError;
use crate::errors::EngineResult;

/// Fail any reading earlier than one already returned.
pub struct AssertMonotonic<C> {
    inner: C,
    last: Mutex<Option<i64>>,
}

impl<C: Clock> AssertMonotonic<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            last: Mutex::new(None),
        }
    }
}

impl<C: Clock> Clock for AssertMonotonic<C> {
    fn now(&self) -> EngineResult<i64> {
        let mut last = self.last.lock().unwrap_or_else(|err| err.into_inner());
        let now = self.inner.now()?;
        if let Some(prev) = *last {
            if now < prev {
                return Err(EngineError::InvalidOperation(format!(
                    "clock went backwards from {prev} to {now}"
                )));
            }
        }
        *last = Some(now);
        Ok(now)
    }
}

/// Clamp every reading to the highest one seen so far.
pub struct EnsureMonotonic<C> {
    inner: C,
    max: Mutex<Option<i64>>,
}

impl<C: Clock> EnsureMonotonic<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            max: Mutex::new(None),
        }
    }
}

impl<C: Clock> Clock for EnsureMonotonic<C> {
    fn now(&self) -> EngineResult<i64> {
        let mut max = self.max.lock().unwrap_or_else(|err| err.into_inner());
        let now = self.inner.now()?;
        let clamped = max.map_or(now, |prev| prev.max(now));
        *max = Some(clamped);
        Ok(clamped)
    }
}

use chrono::Utc;

use super::Clock;
use crate::errors::EngineResult;

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> EngineResult<i64> {
        Ok(Utc::now().timestamp_millis())
    }
}

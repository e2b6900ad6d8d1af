//! `Range`: emit a run of consecutive integers, then complete.
//!
//! Emission is driven by a yieldable item-processing task, so a long
//! range is spread over many scheduler quanta. Progress is part of the
//! checkpointed state: a restored range resumes where it was saved.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;

use serde_json::json;

use crate::errors::EngineError;
use crate::errors::EngineResult;
use crate::observer::operator::Operator;
use crate::observer::operator::OperatorExt;
use crate::observer::operator::OperatorNode;
use crate::observer::state::OperatorStateReader;
use crate::observer::state::OperatorStateWriter;
use crate::observer::Downstream;
use crate::observer::Value;
use crate::scheduler::task::ItemProcessor;
use crate::scheduler::task::YieldableItemProcessingTask;
use crate::scheduler::Scheduler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RangeState {
    next: i64,
    remaining: u64,
    completed: bool,
}

enum Emit {
    Next(i64),
    Completed,
    Overflow,
}

/// Whether every value of the range is an `i64`.
pub fn range_fits(start: i64, count: u64) -> bool {
    count == 0 || i128::from(start) + i128::from(count) - 1 <= i128::from(i64::MAX)
}

pub struct RangeOperator {
    node: OperatorNode,
    me: Weak<Self>,
    state: Mutex<RangeState>,
    downstream: Downstream<Value>,
    scheduler: Scheduler,
}

impl RangeOperator {
    pub fn new(start: i64, count: u64, downstream: Downstream<Value>, scheduler: Scheduler) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            node: OperatorNode::new(),
            me: me.clone(),
            state: Mutex::new(RangeState {
                next: start,
                remaining: count,
                completed: false,
            }),
            downstream,
            scheduler,
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, RangeState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Claim the next thing to emit, if any.
    fn advance(&self) -> Option<Emit> {
        let mut state = self.state();
        if state.remaining > 0 {
            if !range_fits(state.next, state.remaining) {
                state.remaining = 0;
                state.completed = true;
                return Some(Emit::Overflow);
            }
            let value = state.next;
            state.remaining -= 1;
            if let Some(next) = value.checked_add(1) {
                state.next = next;
            }
            Some(Emit::Next(value))
        } else if !state.completed {
            state.completed = true;
            Some(Emit::Completed)
        } else {
            None
        }
    }
}

impl ItemProcessor for RangeOperator {
    fn item_count(&self) -> usize {
        if self.is_disposed() {
            return 0;
        }
        let state = self.state();
        let pending = usize::try_from(state.remaining).unwrap_or(usize::MAX);
        pending.saturating_add(usize::from(!state.completed))
    }

    fn process(&self, batch: usize) -> EngineResult<usize> {
        let Some(downstream) = self.downstream.upgrade() else {
            // Nobody is listening anymore.
            self.dispose();
            return Ok(0);
        };
        let mut handled = 0;
        while handled < batch && !self.is_disposed() {
            let Some(emit) = self.advance() else {
                break;
            };
            self.node().mark_state_changed();
            match emit {
                Emit::Next(value) => downstream.on_next(json!(value)),
                Emit::Completed => downstream.on_completed(),
                Emit::Overflow => downstream.on_error(Arc::new(EngineError::Stream(
                    "range runs past the largest integer".to_owned(),
                ))),
            }
            handled += 1;
        }
        Ok(handled)
    }

    fn is_completed(&self) -> bool {
        self.is_disposed() || self.state().completed
    }
}

impl Operator for RangeOperator {
    fn name(&self) -> &str {
        "rx:range"
    }

    fn node(&self) -> &OperatorNode {
        &self.node
    }

    fn on_start(&self) -> EngineResult<()> {
        let Some(me) = self.me.upgrade() else {
            return Ok(());
        };
        let config = self.scheduler.config();
        let task = YieldableItemProcessingTask::new(me)
            .with_batch_size(config.batch_size)
            .with_priority(config.item_priority);
        self.scheduler.schedule(task);
        Ok(())
    }

    fn load_state_core(&self, reader: &mut OperatorStateReader<'_>) -> EngineResult<()> {
        let mut state = self.state();
        state.next = reader.read_i64()?;
        state.remaining = reader.read_u64()?;
        state.completed = reader.read_bool()?;
        Ok(())
    }

    fn save_state_core(&self, writer: &mut OperatorStateWriter) -> EngineResult<()> {
        let state = *self.state();
        writer.write_i64(state.next);
        writer.write_u64(state.remaining);
        writer.write_bool(state.completed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::observer::Notification;
    use crate::observer::Observer;
    use crate::operators::sinks::collect;
    use crate::operators::sinks::Collectors;

    fn small_batches() -> Scheduler {
        Scheduler::new(SchedulerConfig {
            batch_size: 3,
            ..Default::default()
        })
    }

    #[test]
    fn emits_in_batches_then_completes() {
        let scheduler = small_batches();
        let collectors = Collectors::default();
        let sink: Arc<dyn Observer<Value>> = Arc::new(collect(collectors.get_or_create("out")));
        let range = RangeOperator::new(10, 5, Arc::downgrade(&sink), scheduler.clone());
        range.subscribe().unwrap();
        range.start().unwrap();

        scheduler.run_steps(1).unwrap();
        assert_eq!(collectors.received("out").len(), 3);
        assert!(range.state_changed());

        // Two values and the completion.
        assert_eq!(scheduler.run_until_idle().unwrap(), 1);
        let seen = collectors.received("out");
        assert_eq!(seen.len(), 6);
        assert_eq!(seen[4], Notification::Next(json!(14)));
        assert_eq!(seen[5], Notification::Completed);
        assert!(range.is_completed());
    }

    #[test]
    fn restored_range_resumes() {
        let scheduler = small_batches();
        let sink: Arc<dyn Observer<Value>> = Arc::new(collect(Default::default()));
        let range = RangeOperator::new(0, 10, Arc::downgrade(&sink), scheduler.clone());
        range.subscribe().unwrap();
        range.start().unwrap();
        scheduler.run_steps(1).unwrap();

        let mut writer = OperatorStateWriter::new();
        range.save_state(&mut writer, range.version()).unwrap();
        let bytes = writer.into_bytes();

        let scheduler = small_batches();
        let collectors = Collectors::default();
        let sink: Arc<dyn Observer<Value>> = Arc::new(collect(collectors.get_or_create("out")));
        let restored = RangeOperator::new(0, 10, Arc::downgrade(&sink), scheduler.clone());
        restored
            .load_state(&mut OperatorStateReader::new(&bytes), restored.version())
            .unwrap();
        restored.subscribe().unwrap();
        restored.start().unwrap();
        scheduler.run_until_idle().unwrap();

        let seen = collectors.received("out");
        assert_eq!(seen.first(), Some(&Notification::Next(json!(3))));
        assert_eq!(seen.len(), 8);
    }

    #[test]
    fn range_can_end_at_the_largest_integer() {
        let scheduler = small_batches();
        let collectors = Collectors::default();
        let sink: Arc<dyn Observer<Value>> = Arc::new(collect(collectors.get_or_create("out")));
        let range = RangeOperator::new(i64::MAX - 1, 2, Arc::downgrade(&sink), scheduler.clone());
        range.subscribe().unwrap();
        range.start().unwrap();
        scheduler.run_until_idle().unwrap();
        assert_eq!(
            collectors.received("out"),
            vec![
                Notification::Next(json!(i64::MAX - 1)),
                Notification::Next(json!(i64::MAX)),
                Notification::Completed,
            ]
        );
    }

    #[test]
    fn range_past_the_largest_integer_errors() {
        assert!(range_fits(i64::MAX, 1));
        assert!(range_fits(i64::MIN, u64::MAX));
        assert!(!range_fits(i64::MAX, 2));
        assert!(!range_fits(0, u64::MAX));

        let scheduler = small_batches();
        let collectors = Collectors::default();
        let sink: Arc<dyn Observer<Value>> = Arc::new(collect(collectors.get_or_create("out")));
        let range = RangeOperator::new(i64::MAX, 2, Arc::downgrade(&sink), scheduler.clone());
        range.subscribe().unwrap();
        range.start().unwrap();
        scheduler.run_until_idle().unwrap();
        let seen = collectors.received("out");
        assert_eq!(seen.len(), 1);
        assert!(matches!(seen[0], Notification::Error(_)));
        assert!(range.is_completed());
    }

    #[test]
    fn pause_interrupts_mid_batch() {
        let scheduler = small_batches();
        let sink: Arc<dyn Observer<Value>> = Arc::new(collect(Default::default()));
        let range = RangeOperator::new(0, 100, Arc::downgrade(&sink), scheduler.clone());
        range.subscribe().unwrap();
        range.start().unwrap();
        scheduler.pause();
        assert_eq!(scheduler.run_until_idle().unwrap(), 0);
        assert_eq!(range.item_count(), 101);
        scheduler.resume();
        scheduler.run_steps(1).unwrap();
        assert_eq!(range.item_count(), 98);
    }
}

//! Units of schedulable work.
//!
//! A task reports whether it [`SchedulerTask::is_runnable`] and, when
//! picked, performs one quantum in [`SchedulerTask::execute`],
//! returning `true` once it is completely done. Tasks that can stop
//! part-way through a quantum additionally implement
//! [`YieldableSchedulerTask`] and poll a [`YieldToken`].

use std::sync::Arc;

use crate::errors::EngineResult;
use crate::scheduler::Scheduler;
use crate::scheduler::YieldToken;

/// Priority of one-shot action tasks. Lower runs first.
pub const ACTION_TASK_PRIORITY: u32 = 1;

/// Priority of batch item-processing tasks.
pub const ITEM_TASK_PRIORITY: u32 = 2;

/// Items processed per quantum by item-processing tasks.
pub const DEFAULT_BATCH_SIZE: usize = 128;

/// Priority reported by tasks with nothing to do.
pub const IDLE_PRIORITY: u32 = u32::MAX;

pub trait SchedulerTask: Send {
    fn priority(&self) -> u32;

    fn is_runnable(&self) -> bool;

    /// Run one quantum. `Ok(true)` means never schedule again.
    fn execute(&mut self, scheduler: &Scheduler) -> EngineResult<bool>;

    fn recalculate_priority(&mut self) {}

    /// The yieldable view of this task, if it has one.
    fn as_yieldable(&mut self) -> Option<&mut dyn YieldableSchedulerTask> {
        None
    }
}

pub trait YieldableSchedulerTask: SchedulerTask {
    /// Like [`SchedulerTask::execute`], but return early (without
    /// claiming completion) once `token` asks to yield.
    fn execute_yieldable(&mut self, scheduler: &Scheduler, token: &YieldToken)
        -> EngineResult<bool>;
}

type Action = Box<dyn FnOnce(&Scheduler) -> EngineResult<()> + Send>;

/// Run a closure once.
pub struct ActionTask {
    action: Option<Action>,
    priority: u32,
}

impl ActionTask {
    pub fn new(action: impl FnOnce(&Scheduler) -> EngineResult<()> + Send + 'static) -> Self {
        Self {
            action: Some(Box::new(action)),
            priority: ACTION_TASK_PRIORITY,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }
}

impl SchedulerTask for ActionTask {
    fn priority(&self) -> u32 {
        self.priority
    }

    fn is_runnable(&self) -> bool {
        self.action.is_some()
    }

    fn execute(&mut self, scheduler: &Scheduler) -> EngineResult<bool> {
        if let Some(action) = self.action.take() {
            action(scheduler)?;
        }
        Ok(true)
    }
}

type YieldableAction = Box<dyn FnMut(&Scheduler, &YieldToken) -> EngineResult<bool> + Send>;

/// Run a closure repeatedly until it reports it is done.
///
/// The closure gets the yield token and should return `Ok(false)`
/// when it stopped early.
pub struct YieldableActionTask {
    action: YieldableAction,
    priority: u32,
    done: bool,
}

impl YieldableActionTask {
    pub fn new(
        action: impl FnMut(&Scheduler, &YieldToken) -> EngineResult<bool> + Send + 'static,
    ) -> Self {
        Self {
            action: Box::new(action),
            priority: ACTION_TASK_PRIORITY,
            done: false,
        }
    }
}

impl SchedulerTask for YieldableActionTask {
    fn priority(&self) -> u32 {
        self.priority
    }

    fn is_runnable(&self) -> bool {
        !self.done
    }

    fn execute(&mut self, scheduler: &Scheduler) -> EngineResult<bool> {
        self.execute_yieldable(scheduler, &YieldToken::never())
    }

    fn as_yieldable(&mut self) -> Option<&mut dyn YieldableSchedulerTask> {
        Some(self)
    }
}

impl YieldableSchedulerTask for YieldableActionTask {
    fn execute_yieldable(
        &mut self,
        scheduler: &Scheduler,
        token: &YieldToken,
    ) -> EngineResult<bool> {
        self.done = (self.action)(scheduler, token)?;
        Ok(self.done)
    }
}

/// Something with a backlog of items to work through.
pub trait ItemProcessor: Send + Sync {
    /// Pending items. Zero means "not runnable".
    fn item_count(&self) -> usize;

    /// Process up to `batch` items, returning how many were handled.
    fn process(&self, batch: usize) -> EngineResult<usize>;

    /// No further items will ever arrive.
    fn is_completed(&self) -> bool {
        false
    }
}

/// Drain an [`ItemProcessor`] in fixed size batches.
///
/// This bounds how long one quantum can take regardless of backlog.
pub struct ItemProcessingTask {
    processor: Arc<dyn ItemProcessor>,
    batch_size: usize,
    base_priority: u32,
    priority: u32,
}

impl ItemProcessingTask {
    pub fn new(processor: Arc<dyn ItemProcessor>) -> Self {
        Self {
            processor,
            batch_size: DEFAULT_BATCH_SIZE,
            base_priority: ITEM_TASK_PRIORITY,
            priority: ITEM_TASK_PRIORITY,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.base_priority = priority;
        self.priority = priority;
        self
    }
}

impl SchedulerTask for ItemProcessingTask {
    fn priority(&self) -> u32 {
        self.priority
    }

    fn is_runnable(&self) -> bool {
        self.processor.item_count() > 0
    }

    fn execute(&mut self, _scheduler: &Scheduler) -> EngineResult<bool> {
        let batch = self.processor.item_count().min(self.batch_size);
        if batch > 0 {
            let done = self.processor.process(batch)?;
            tracing::trace!("Processed {done} of {batch} items");
        }
        Ok(self.processor.is_completed())
    }

    fn recalculate_priority(&mut self) {
        self.priority = if self.is_runnable() {
            self.base_priority
        } else {
            IDLE_PRIORITY
        };
    }
}

/// Like [`ItemProcessingTask`] but checks the yield token between
/// every item.
pub struct YieldableItemProcessingTask {
    inner: ItemProcessingTask,
}

impl YieldableItemProcessingTask {
    pub fn new(processor: Arc<dyn ItemProcessor>) -> Self {
        Self {
            inner: ItemProcessingTask::new(processor),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.inner = self.inner.with_batch_size(batch_size);
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.inner = self.inner.with_priority(priority);
        self
    }
}

impl SchedulerTask for YieldableItemProcessingTask {
    fn priority(&self) -> u32 {
        self.inner.priority()
    }

    fn is_runnable(&self) -> bool {
        self.inner.is_runnable()
    }

    fn execute(&mut self, scheduler: &Scheduler) -> EngineResult<bool> {
        self.inner.execute(scheduler)
    }

    fn recalculate_priority(&mut self) {
        self.inner.recalculate_priority()
    }

    fn as_yieldable(&mut self) -> Option<&mut dyn YieldableSchedulerTask> {
        Some(self)
    }
}

impl YieldableSchedulerTask for YieldableItemProcessingTask {
    fn execute_yieldable(
        &mut self,
        _scheduler: &Scheduler,
        token: &YieldToken,
    ) -> EngineResult<bool> {
        let processor = &self.inner.processor;
        let mut handled = 0;
        while handled < self.inner.batch_size && processor.item_count() > 0 {
            if token.is_yield_requested() {
                tracing::trace!("Yielding after {handled} items");
                return Ok(false);
            }
            handled += processor.process(1)?;
        }
        Ok(processor.is_completed())
    }
}

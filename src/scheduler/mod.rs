//! Priority task scheduler.
//!
//! Tasks are picked by lowest priority value; ties go to the task
//! that was queued first. A picked task runs outside the queue lock so
//! it can schedule more work. Pausing stops dispatch and raises the
//! yield token so long-running yieldable tasks bail out early. A pause
//! returns only once the quantum in flight, if any, has finished; the
//! engine pauses around checkpoints.
//!
//! [`Scheduler::step`] runs a single quantum and is what tests drive
//! deterministically. [`worker::SchedulerWorker`] runs the same loop
//! on a dedicated thread.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Condvar;
use std::cell::Cell;
use std::sync::Mutex;
use std::time::Duration;

use crate::config::SchedulerConfig;
use crate::engine::events::EventHandlers;
use crate::engine::events::HandlerId;
use crate::engine::events::SchedulerPausingEventArgs;
use crate::errors::EngineResult;
use crate::metrics::SchedulerMetrics;
use crate::with_timer;

pub mod task;
pub mod worker;

use task::SchedulerTask;

thread_local! {
    /// Scheduler whose quantum this thread is running, 0 for none.
    static QUANTUM_OWNER: Cell<usize> = Cell::new(0);
}

/// Cooperative "please stop soon" flag shared with yieldable tasks.
#[derive(Debug, Clone, Default)]
pub struct YieldToken(Arc<AtomicBool>);

impl YieldToken {
    /// A token that is never raised by anyone.
    pub fn never() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_yield_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

struct Entry {
    seq: u64,
    task: Box<dyn SchedulerTask>,
}

#[derive(Default)]
struct TaskQueue {
    entries: Vec<Entry>,
    next_seq: u64,
}

impl TaskQueue {
    fn push(&mut self, task: Box<dyn SchedulerTask>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push(Entry { seq, task });
    }

    /// Remove and return the runnable task that should go next.
    fn pop_next(&mut self) -> Option<Box<dyn SchedulerTask>> {
        for entry in self.entries.iter_mut() {
            entry.task.recalculate_priority();
        }
        let idx = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.task.is_runnable())
            .min_by_key(|(_, entry)| (entry.task.priority(), entry.seq))
            .map(|(idx, _)| idx)?;
        Some(self.entries.remove(idx).task)
    }
}

struct SchedulerInner {
    config: SchedulerConfig,
    queue: Mutex<TaskQueue>,
    /// Held for the length of a quantum.
    quantum: Mutex<()>,
    yield_token: YieldToken,
    paused: AtomicBool,
    pausing: EventHandlers<SchedulerPausingEventArgs>,
    wakeup: (Mutex<bool>, Condvar),
    metrics: SchedulerMetrics,
}

/// Handle to a shared task queue. Clones refer to the same queue.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                queue: Mutex::new(TaskQueue::default()),
                quantum: Mutex::new(()),
                yield_token: YieldToken::default(),
                paused: AtomicBool::new(false),
                pausing: EventHandlers::new(),
                wakeup: (Mutex::new(false), Condvar::new()),
                metrics: SchedulerMetrics::new(),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn schedule(&self, task: impl SchedulerTask + 'static) {
        self.schedule_boxed(Box::new(task));
    }

    pub fn schedule_boxed(&self, task: Box<dyn SchedulerTask>) {
        self.queue().push(task);
        self.notify();
    }

    fn queue(&self) -> std::sync::MutexGuard<'_, TaskQueue> {
        self.inner
            .queue
            .lock()
            .unwrap_or_else(|err| err.into_inner())
    }

    fn notify(&self) {
        let (lock, cvar) = &self.inner.wakeup;
        *lock.lock().unwrap_or_else(|err| err.into_inner()) = true;
        cvar.notify_all();
    }

    /// Run one quantum of the most urgent runnable task.
    ///
    /// Returns `Ok(false)` when paused or when nothing is runnable. A
    /// task that fails is dropped and its error returned.
    pub fn step(&self) -> EngineResult<bool> {
        let quantum = self
            .inner
            .quantum
            .lock()
            .unwrap_or_else(|err| err.into_inner());
        if self.is_paused() {
            return Ok(false);
        }
        let Some(mut task) = self.queue().pop_next() else {
            return Ok(false);
        };
        let outer = QUANTUM_OWNER.with(|owner| owner.replace(self.id()));
        let _span = tracing::debug_span!("step", priority = task.priority()).entered();

        let metrics = &self.inner.metrics;
        let res = with_timer!(
            metrics.task_duration,
            metrics.labels,
            match task.as_yieldable() {
                Some(yieldable) => yieldable.execute_yieldable(self, &self.inner.yield_token),
                None => task.execute(self),
            }
        );
        metrics.executed();
        QUANTUM_OWNER.with(|owner| owner.set(outer));
        drop(quantum);

        match res {
            Ok(true) => {}
            Ok(false) => self.queue().push(task),
            Err(err) => {
                tracing::error!("Task failed and was dropped: {err}");
                return Err(err);
            }
        }
        Ok(true)
    }

    /// Step until nothing is runnable. Returns the number of quanta.
    pub fn run_until_idle(&self) -> EngineResult<usize> {
        let mut steps = 0;
        while self.step()? {
            steps += 1;
        }
        Ok(steps)
    }

    /// Step at most `n` times.
    pub fn run_steps(&self, n: usize) -> EngineResult<usize> {
        let mut steps = 0;
        while steps < n && self.step()? {
            steps += 1;
        }
        Ok(steps)
    }

    /// Stop dispatching and wait for the running quantum to end.
    /// Pausing handlers run first. A task pausing its own scheduler does
    /// not wait for itself.
    pub fn pause(&self) {
        let mut args = SchedulerPausingEventArgs {
            pending_tasks: self.pending_tasks(),
        };
        self.inner.pausing.invoke_safe(&mut args);
        self.inner.paused.store(true, Ordering::Release);
        self.inner.yield_token.request();
        if !self.runs_on_current_thread() {
            drop(
                self.inner
                    .quantum
                    .lock()
                    .unwrap_or_else(|err| err.into_inner()),
            );
        }
        tracing::debug!("Scheduler paused with {} pending tasks", args.pending_tasks);
    }

    pub fn resume(&self) {
        self.inner.yield_token.reset();
        self.inner.paused.store(false, Ordering::Release);
        self.notify();
        tracing::debug!("Scheduler resumed");
    }

    fn id(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    /// Whether the calling thread is inside a quantum of this scheduler.
    fn runs_on_current_thread(&self) -> bool {
        QUANTUM_OWNER.with(|owner| owner.get() == self.id())
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::Acquire)
    }

    pub fn pending_tasks(&self) -> usize {
        self.queue().entries.len()
    }

    pub fn on_pausing(
        &self,
        handler: impl Fn(&mut SchedulerPausingEventArgs) + Send + Sync + 'static,
    ) -> HandlerId {
        self.inner.pausing.subscribe(handler)
    }

    /// Ask the running yieldable task to stop at the next item.
    pub fn request_yield(&self) {
        self.inner.yield_token.request();
    }

    /// Park until work is scheduled, the scheduler resumes, or the
    /// timeout elapses.
    pub fn wait_for_work(&self, timeout: Duration) {
        let (lock, cvar) = &self.inner.wakeup;
        let mut ready = lock.lock().unwrap_or_else(|err| err.into_inner());
        if !*ready {
            ready = cvar
                .wait_timeout(ready, timeout)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|err| err.into_inner().0);
        }
        *ready = false;
    }
}

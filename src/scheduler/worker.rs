//! Dedicated thread driving a [`Scheduler`].

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::errors::prepend_tname;
use crate::scheduler::Scheduler;

pub struct SchedulerWorker {
    scheduler: Scheduler,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SchedulerWorker {
    pub fn spawn(scheduler: Scheduler, name: impl Into<String>) -> std::io::Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_scheduler = scheduler.clone();
        let thread_shutdown = shutdown.clone();
        let handle = std::thread::Builder::new()
            .name(name.into())
            .spawn(move || worker_main(thread_scheduler, thread_shutdown))?;
        Ok(Self {
            scheduler,
            shutdown,
            handle: Some(handle),
        })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Signal the thread to exit and wait for it.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.scheduler.notify();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Scheduler worker thread panicked");
            }
        }
    }
}

impl Drop for SchedulerWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_main(scheduler: Scheduler, shutdown: Arc<AtomicBool>) {
    tracing::info!("Scheduler worker starting");
    let cooldown = scheduler.config().cooldown();
    while !shutdown.load(Ordering::Acquire) {
        match scheduler.step() {
            Ok(true) => {}
            // Nothing runnable, or paused: wait for a nudge.
            Ok(false) => scheduler.wait_for_work(cooldown),
            Err(err) => tracing::error!("{}", prepend_tname(err.to_string())),
        }
    }
    tracing::info!("Scheduler worker stopping");
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;
    use crate::config::SchedulerConfig;
    use crate::errors::EngineError;
    use crate::scheduler::task::ActionTask;

    #[test]
    fn worker_runs_tasks_and_survives_errors() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        let mut worker = SchedulerWorker::spawn(scheduler.clone(), "rxqe-test-worker").unwrap();

        let (tx, rx) = mpsc::channel();
        scheduler.schedule(ActionTask::new(|_| {
            Err(EngineError::Stream("first one fails".to_owned()))
        }));
        scheduler.schedule(ActionTask::new(move |_| {
            tx.send(std::thread::current().name().map(str::to_owned))
                .map_err(|err| EngineError::Stream(err.to_string()))
        }));

        let tname = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(tname.as_deref(), Some("rxqe-test-worker"));
        worker.stop();
        worker.stop();
    }
}

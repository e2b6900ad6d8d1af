//! Sources that emit a fixed signal: `Empty`, `Never`, `Return`,
//! `Throw`.
//!
//! The signal goes out from a scheduler task queued on start, never
//! from inside `start` itself.

use std::sync::Arc;
use std::sync::Weak;

use crate::errors::EngineError;
use crate::errors::EngineResult;
use crate::observer::operator::Operator;
use crate::observer::operator::OperatorExt;
use crate::observer::operator::OperatorNode;
use crate::observer::Downstream;
use crate::observer::Value;
use crate::scheduler::task::ActionTask;
use crate::scheduler::Scheduler;

#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Empty,
    Never,
    Return(Value),
    Throw(String),
}

pub struct SignalSource {
    node: OperatorNode,
    me: Weak<Self>,
    signal: Signal,
    downstream: Downstream<Value>,
    scheduler: Scheduler,
}

impl SignalSource {
    pub fn new(signal: Signal, downstream: Downstream<Value>, scheduler: Scheduler) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            node: OperatorNode::new(),
            me: me.clone(),
            signal,
            downstream,
            scheduler,
        })
    }

    fn fire(&self) {
        if self.is_disposed() {
            return;
        }
        let Some(downstream) = self.downstream.upgrade() else {
            return;
        };
        match &self.signal {
            Signal::Empty => downstream.on_completed(),
            Signal::Never => {}
            Signal::Return(value) => {
                downstream.on_next(value.clone());
                downstream.on_completed();
            }
            Signal::Throw(message) => {
                downstream.on_error(Arc::new(EngineError::Stream(message.clone())))
            }
        }
    }
}

impl Operator for SignalSource {
    fn name(&self) -> &str {
        match self.signal {
            Signal::Empty => "rx:empty",
            Signal::Never => "rx:never",
            Signal::Return(_) => "rx:return",
            Signal::Throw(_) => "rx:throw",
        }
    }

    fn node(&self) -> &OperatorNode {
        &self.node
    }

    fn on_start(&self) -> EngineResult<()> {
        if self.signal == Signal::Never {
            return Ok(());
        }
        let me = self.me.clone();
        let priority = self.scheduler.config().action_priority;
        self.scheduler.schedule(
            ActionTask::new(move |_| {
                if let Some(me) = me.upgrade() {
                    me.fire();
                }
                Ok(())
            })
            .with_priority(priority),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::SchedulerConfig;
    use crate::observer::Notification;
    use crate::observer::Observer;
    use crate::operators::sinks::collect;
    use crate::operators::sinks::Collectors;

    fn run(signal: Signal) -> Vec<Notification<Value>> {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        let collectors = Collectors::default();
        let sink: Arc<dyn Observer<Value>> = Arc::new(collect(collectors.get_or_create("out")));
        let source = SignalSource::new(signal, Arc::downgrade(&sink), scheduler.clone());
        source.subscribe().unwrap();
        source.start().unwrap();
        assert!(collectors.received("out").is_empty());
        scheduler.run_until_idle().unwrap();
        collectors.received("out")
    }

    #[test]
    fn signals_arrive_on_the_scheduler() {
        assert_eq!(run(Signal::Empty), vec![Notification::Completed]);
        assert_eq!(run(Signal::Never), vec![]);
        assert_eq!(
            run(Signal::Return(json!(42))),
            vec![Notification::Next(json!(42)), Notification::Completed]
        );
        assert_eq!(
            run(Signal::Throw("nope".to_owned())),
            vec![Notification::Error("nope".to_owned())]
        );
    }

    #[test]
    fn disposed_source_stays_silent() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        let collectors = Collectors::default();
        let sink: Arc<dyn Observer<Value>> = Arc::new(collect(collectors.get_or_create("out")));
        let source = SignalSource::new(Signal::Empty, Arc::downgrade(&sink), scheduler.clone());
        source.subscribe().unwrap();
        source.start().unwrap();
        source.dispose();
        scheduler.run_until_idle().unwrap();
        assert!(collectors.received("out").is_empty());
    }
}

//! Terminal observers.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use crate::errors::SharedError;
use crate::observer::Notification;
use crate::observer::ObserverBase;
use crate::observer::ObserverCore;
use crate::observer::Value;

/// Notifications delivered to a named `Collect` sink.
pub type Collector = Arc<Mutex<Vec<Notification<Value>>>>;

/// Named collectors, shared by every subscription of an engine.
#[derive(Default)]
pub struct Collectors(Mutex<HashMap<String, Collector>>);

impl Collectors {
    pub fn get_or_create(&self, name: &str) -> Collector {
        self.0
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .entry(name.to_owned())
            .or_default()
            .clone()
    }

    /// Snapshot of what `name` received so far.
    pub fn received(&self, name: &str) -> Vec<Notification<Value>> {
        let collector = self.get_or_create(name);
        let seen = collector.lock().unwrap_or_else(|err| err.into_inner());
        seen.clone()
    }
}

pub struct NopCore;

impl ObserverCore<Value> for NopCore {
    fn on_next_core(&self, _value: Value) {}

    fn on_error_core(&self, _error: SharedError) {}

    fn on_completed_core(&self) {}
}

pub type NopSink = ObserverBase<NopCore>;

pub fn nop() -> NopSink {
    ObserverBase::new(NopCore)
}

pub struct CollectCore {
    collector: Collector,
}

impl CollectCore {
    fn push(&self, notification: Notification<Value>) {
        self.collector
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .push(notification);
    }
}

impl ObserverCore<Value> for CollectCore {
    fn on_next_core(&self, value: Value) {
        self.push(Notification::Next(value));
    }

    fn on_error_core(&self, error: SharedError) {
        self.push(Notification::Error(error.to_string()));
    }

    fn on_completed_core(&self) {
        self.push(Notification::Completed);
    }
}

pub type CollectSink = ObserverBase<CollectCore>;

pub fn collect(collector: Collector) -> CollectSink {
    ObserverBase::new(CollectCore { collector })
}

pub struct LogCore {
    label: String,
}

impl ObserverCore<Value> for LogCore {
    fn on_next_core(&self, value: Value) {
        tracing::info!(label = %self.label, "OnNext({value})");
    }

    fn on_error_core(&self, error: SharedError) {
        tracing::warn!(label = %self.label, "OnError({error})");
    }

    fn on_completed_core(&self) {
        tracing::info!(label = %self.label, "OnCompleted()");
    }
}

pub type LogSink = ObserverBase<LogCore>;

pub fn log(label: impl Into<String>) -> LogSink {
    ObserverBase::new(LogCore {
        label: label.into(),
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::errors::EngineError;
    use crate::observer::Observer;

    #[test]
    fn collect_records_until_terminal() {
        let collectors = Collectors::default();
        let sink = collect(collectors.get_or_create("out"));
        sink.on_next(json!(1));
        sink.on_error(Arc::new(EngineError::Stream("boom".to_owned())));
        sink.on_completed();

        assert_eq!(
            collectors.received("out"),
            vec![Notification::Next(json!(1)), Notification::Error("boom".to_owned())]
        );
    }

    #[test]
    fn collectors_are_shared_by_name() {
        let collectors = Collectors::default();
        collect(collectors.get_or_create("a")).on_next(json!("x"));
        collect(collectors.get_or_create("a")).on_next(json!("y"));
        assert_eq!(collectors.received("a").len(), 2);
        assert!(collectors.received("b").is_empty());
    }
}

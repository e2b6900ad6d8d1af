//! Subjects back streams.
//!
//! A [`Subject`] is a hot artifact: it lives in the engine's
//! [`HotArtifactArena`] and any number of subscriptions read from it
//! ([`SubjectSource`]) or write into it ([`StreamSink`]). Each attached
//! reader or writer holds a reference in the arena for as long as it
//! is attached. The terminal notification is persisted so a stream
//! that completed before a checkpoint stays completed after recovery.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use crate::engine::artifacts::ArtifactHandle;
use crate::engine::artifacts::HotArtifactArena;
use crate::errors::EngineError;
use crate::errors::EngineResult;
use crate::errors::SharedError;
use crate::observer::operator::Operator;
use crate::observer::operator::OperatorNode;
use crate::observer::state::OperatorStateReader;
use crate::observer::state::OperatorStateWriter;
use crate::observer::Downstream;
use crate::observer::Notification;
use crate::observer::Observer;
use crate::observer::Value;

pub type SubjectArena = HotArtifactArena<Arc<Subject>>;

#[derive(Default)]
struct SubjectInner {
    observers: Vec<(u64, Downstream<Value>)>,
    next_id: u64,
    terminal: Option<Notification<Value>>,
}

#[derive(Default)]
pub struct Subject {
    inner: Mutex<SubjectInner>,
}

impl Subject {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, SubjectInner> {
        self.inner.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Attach an observer. A terminated subject replays its terminal
    /// notification instead and returns `None`.
    pub fn subscribe(&self, observer: Downstream<Value>) -> Option<u64> {
        let terminal = {
            let mut inner = self.inner();
            let Some(terminal) = inner.terminal.clone() else {
                let id = inner.next_id;
                inner.next_id += 1;
                inner.observers.push((id, observer));
                return Some(id);
            };
            terminal
        };
        if let Some(observer) = observer.upgrade() {
            deliver_terminal(observer.as_ref(), &terminal);
        }
        None
    }

    pub fn unsubscribe(&self, id: u64) {
        self.inner().observers.retain(|(oid, _)| *oid != id);
    }

    pub fn observer_count(&self) -> usize {
        self.inner().observers.len()
    }

    pub fn is_terminated(&self) -> bool {
        self.inner().terminal.is_some()
    }

    fn live_observers(&self) -> Vec<Arc<dyn Observer<Value>>> {
        self.inner()
            .observers
            .iter()
            .filter_map(|(_, observer)| observer.upgrade())
            .collect()
    }

    fn terminate(&self, terminal: Notification<Value>) {
        let observers = {
            let mut inner = self.inner();
            if inner.terminal.is_some() {
                return;
            }
            inner.terminal = Some(terminal.clone());
            std::mem::take(&mut inner.observers)
        };
        for (_, observer) in observers {
            if let Some(observer) = observer.upgrade() {
                deliver_terminal(observer.as_ref(), &terminal);
            }
        }
    }

    pub fn save_state(&self, writer: &mut OperatorStateWriter) -> EngineResult<()> {
        writer.write(&self.inner().terminal)
    }

    pub fn load_state(&self, reader: &mut OperatorStateReader<'_>) -> EngineResult<()> {
        let terminal: Option<Notification<Value>> = reader.read()?;
        if matches!(terminal, Some(Notification::Next(_))) {
            return Err(EngineError::StateCorrupted(
                "subject terminal state holds a value".to_owned(),
            ));
        }
        self.inner().terminal = terminal;
        Ok(())
    }
}

fn deliver_terminal(observer: &dyn Observer<Value>, terminal: &Notification<Value>) {
    match terminal {
        Notification::Error(message) => {
            observer.on_error(Arc::new(EngineError::Stream(message.clone())))
        }
        Notification::Completed => observer.on_completed(),
        Notification::Next(_) => {}
    }
}

impl Observer<Value> for Subject {
    fn on_next(&self, value: Value) {
        if self.is_terminated() {
            return;
        }
        for observer in self.live_observers() {
            observer.on_next(value.clone());
        }
    }

    fn on_error(&self, error: SharedError) {
        self.terminate(Notification::Error(error.to_string()));
    }

    fn on_completed(&self) {
        self.terminate(Notification::Completed);
    }
}

/// Reads a stream as an observable.
pub struct SubjectSource {
    node: OperatorNode,
    arena: Arc<SubjectArena>,
    handle: ArtifactHandle,
    subject: Arc<Subject>,
    downstream: Downstream<Value>,
    subscription: Mutex<Option<u64>>,
    acquired: AtomicBool,
}

impl SubjectSource {
    pub fn new(
        arena: Arc<SubjectArena>,
        handle: ArtifactHandle,
        downstream: Downstream<Value>,
    ) -> EngineResult<Arc<Self>> {
        let subject = arena.get(handle)?;
        Ok(Arc::new(Self {
            node: OperatorNode::new(),
            arena,
            handle,
            subject,
            downstream,
            subscription: Mutex::new(None),
            acquired: AtomicBool::new(false),
        }))
    }
}

impl Operator for SubjectSource {
    fn name(&self) -> &str {
        "rx:stream"
    }

    fn node(&self) -> &OperatorNode {
        &self.node
    }

    fn on_start(&self) -> EngineResult<()> {
        let refs = self.arena.acquire(self.handle)?;
        self.acquired.store(true, Ordering::Release);
        tracing::trace!("Stream {:?} now has {refs} references", self.handle);
        let id = self.subject.subscribe(self.downstream.clone());
        *self
            .subscription
            .lock()
            .unwrap_or_else(|err| err.into_inner()) = id;
        Ok(())
    }

    fn on_dispose(&self) {
        let id = self
            .subscription
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .take();
        if let Some(id) = id {
            self.subject.unsubscribe(id);
        }
        if self.acquired.swap(false, Ordering::AcqRel) {
            // The stream may have been deleted in the meantime.
            if let Err(err) = self.arena.release(self.handle) {
                tracing::debug!("Not releasing stream reference: {err}");
            }
        }
    }
}

/// Writes into a stream as an observer.
pub struct StreamSink {
    arena: Arc<SubjectArena>,
    handle: ArtifactHandle,
    subject: Arc<Subject>,
}

impl StreamSink {
    pub fn attach(arena: Arc<SubjectArena>, handle: ArtifactHandle) -> EngineResult<Self> {
        let subject = arena.get(handle)?;
        arena.acquire(handle)?;
        Ok(Self {
            arena,
            handle,
            subject,
        })
    }
}

impl Drop for StreamSink {
    fn drop(&mut self) {
        if let Err(err) = self.arena.release(self.handle) {
            tracing::debug!("Not releasing stream reference: {err}");
        }
    }
}

impl Observer<Value> for StreamSink {
    fn on_next(&self, value: Value) {
        self.subject.on_next(value);
    }

    fn on_error(&self, error: SharedError) {
        self.subject.on_error(error);
    }

    fn on_completed(&self) {
        self.subject.on_completed();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::observer::operator::OperatorExt;
    use crate::operators::sinks::collect;
    use crate::operators::sinks::Collectors;

    #[test]
    fn multicasts_and_tracks_references() {
        let arena = Arc::new(SubjectArena::new());
        let handle = arena.insert(Arc::new(Subject::new()));
        let collectors = Collectors::default();

        let a: Arc<dyn Observer<Value>> = Arc::new(collect(collectors.get_or_create("a")));
        let b: Arc<dyn Observer<Value>> = Arc::new(collect(collectors.get_or_create("b")));
        let src_a = SubjectSource::new(arena.clone(), handle, Arc::downgrade(&a)).unwrap();
        let src_b = SubjectSource::new(arena.clone(), handle, Arc::downgrade(&b)).unwrap();
        for src in [&src_a, &src_b] {
            src.subscribe().unwrap();
            src.start().unwrap();
        }
        assert_eq!(arena.ref_count(handle).unwrap(), 2);

        let sink = StreamSink::attach(arena.clone(), handle).unwrap();
        assert_eq!(arena.ref_count(handle).unwrap(), 3);
        sink.on_next(json!("x"));
        src_b.dispose();
        sink.on_next(json!("y"));
        drop(sink);
        assert_eq!(arena.ref_count(handle).unwrap(), 1);

        assert_eq!(
            collectors.received("a"),
            vec![Notification::Next(json!("x")), Notification::Next(json!("y"))]
        );
        assert_eq!(collectors.received("b"), vec![Notification::Next(json!("x"))]);
    }

    #[test]
    fn terminal_state_survives_a_round_trip() {
        let subject = Subject::new();
        subject.on_completed();
        let mut writer = OperatorStateWriter::new();
        subject.save_state(&mut writer).unwrap();
        let bytes = writer.into_bytes();

        let restored = Subject::new();
        restored
            .load_state(&mut OperatorStateReader::new(&bytes))
            .unwrap();
        assert!(restored.is_terminated());

        let collectors = Collectors::default();
        let late: Arc<dyn Observer<Value>> = Arc::new(collect(collectors.get_or_create("late")));
        assert_eq!(restored.subscribe(Arc::downgrade(&late)), None);
        assert_eq!(collectors.received("late"), vec![Notification::Completed]);
    }
}

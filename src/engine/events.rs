//! Events raised by the engine and its scheduler.
//!
//! Handlers get mutable access to the event args so they can steer
//! failure handling (set `handled`, pick a [`Mitigation`]). Handlers
//! are invoked through [`EventHandlers::invoke_safe`]: a handler that
//! panics is traced and skipped, the engine carries on.

use std::any::Any;
use std::panic::catch_unwind;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::RwLock;

use crate::engine::entity::ReactiveEntityKind;
use crate::engine::entity::Uri;
use crate::engine::mitigation::Mitigation;
use crate::errors::SharedError;

/// Identifies a subscribed handler so it can be removed again.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler<E> = Arc<dyn Fn(&mut E) + Send + Sync>;

pub struct EventHandlers<E> {
    handlers: RwLock<Vec<(HandlerId, Handler<E>)>>,
    next_id: AtomicU64,
}

impl<E> Default for EventHandlers<E> {
    fn default() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<E> EventHandlers<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, handler: impl Fn(&mut E) + Send + Sync + 'static) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .unwrap_or_else(|err| err.into_inner())
            .push((id, Arc::new(handler)));
        id
    }

    pub fn unsubscribe(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(|err| err.into_inner());
        let before = handlers.len();
        handlers.retain(|(hid, _)| *hid != id);
        handlers.len() != before
    }

    pub fn len(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call every handler in subscription order, isolating panics.
    pub fn invoke_safe(&self, args: &mut E) {
        // Snapshot so handlers can (un)subscribe while being invoked.
        let handlers: Vec<Handler<E>> = self
            .handlers
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in handlers {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(&mut *args))) {
                tracing::error!(
                    "Event handler panicked; ignoring: {}",
                    panic_message(panic.as_ref())
                );
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "<non-string panic payload>"
    }
}

/// An entity could not be read back from a checkpoint.
#[derive(Debug, Clone)]
pub struct ReactiveEntityLoadFailedEventArgs {
    pub uri: Uri,
    pub kind: ReactiveEntityKind,
    pub error: SharedError,
    pub handled: bool,
    /// What the engine should do about it. Starts at the configured
    /// default.
    pub mitigation: Mitigation,
}

impl ReactiveEntityLoadFailedEventArgs {
    pub fn new(
        uri: Uri,
        kind: ReactiveEntityKind,
        error: SharedError,
        mitigation: Mitigation,
    ) -> Self {
        Self {
            uri,
            kind,
            error,
            handled: false,
            mitigation,
        }
    }
}

/// An entity could not be written into a checkpoint.
#[derive(Debug, Clone)]
pub struct ReactiveEntitySaveFailedEventArgs {
    pub uri: Uri,
    pub kind: ReactiveEntityKind,
    pub error: SharedError,
    pub handled: bool,
}

impl ReactiveEntitySaveFailedEventArgs {
    pub fn new(uri: Uri, kind: ReactiveEntityKind, error: SharedError) -> Self {
        Self {
            uri,
            kind,
            error,
            handled: false,
        }
    }
}

/// A logged operation could not be re-applied after loading a
/// checkpoint.
#[derive(Debug, Clone)]
pub struct ReactiveEntityReplayFailedEventArgs {
    pub uri: Uri,
    pub kind: ReactiveEntityKind,
    pub error: SharedError,
    pub handled: bool,
}

impl ReactiveEntityReplayFailedEventArgs {
    pub fn new(uri: Uri, kind: ReactiveEntityKind, error: SharedError) -> Self {
        Self {
            uri,
            kind,
            error,
            handled: false,
        }
    }
}

/// The scheduler is about to stop dispatching, usually so a
/// checkpoint can run against quiesced state.
#[derive(Debug, Clone, Default)]
pub struct SchedulerPausingEventArgs {
    pub pending_tasks: usize,
}

//! Observers and the subscription-tree node abstraction.
//!
//! An [`Observer`] receives notifications. Terminal notifications
//! (`on_error` / `on_completed`) are delivered at most once, guarded
//! by a [`TerminalLatch`]. `on_next` is deliberately not guarded:
//! values for one subscription are delivered by a single producer, so
//! ordering values against the terminal signal is the caller's job.
//!
//! See [`operator`] for lifecycle and versioned state, and [`state`]
//! for the byte codec used by checkpoint records.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Weak;

use serde::Deserialize;
use serde::Serialize;

use crate::errors::SharedError;

pub mod operator;
pub mod state;

/// Payload flowing through subscriptions.
pub type Value = serde_json::Value;

pub trait Observer<T>: Send + Sync {
    fn on_next(&self, value: T);

    fn on_error(&self, error: SharedError);

    fn on_completed(&self);
}

/// Weak link from an upstream node to its downstream observer.
///
/// Parents own their inputs; children only point back weakly so
/// dropping a subscription tree releases it.
pub type Downstream<T> = Weak<dyn Observer<T>>;

struct Detached;

impl<T> Observer<T> for Detached {
    fn on_next(&self, _value: T) {}

    fn on_error(&self, _error: SharedError) {}

    fn on_completed(&self) {}
}

/// A downstream link that never upgrades.
pub fn detached<T: 'static>() -> Downstream<T> {
    Weak::<Detached>::new()
}

/// Single-assignment latch used for at-most-once termination.
#[derive(Debug, Default)]
pub struct TerminalLatch(AtomicBool);

impl TerminalLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` for exactly one caller, the first.
    pub fn try_stop(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// The part of an observer that actually handles notifications.
///
/// Wrap it in [`ObserverBase`] to get termination guarding.
pub trait ObserverCore<T>: Send + Sync {
    fn on_next_core(&self, value: T);

    fn on_error_core(&self, error: SharedError);

    fn on_completed_core(&self);
}

/// Observer with the at-most-once termination contract.
pub struct ObserverBase<C> {
    core: C,
    stopped: TerminalLatch,
}

impl<C> ObserverBase<C> {
    pub fn new(core: C) -> Self {
        Self {
            core,
            stopped: TerminalLatch::new(),
        }
    }

    pub fn core(&self) -> &C {
        &self.core
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_stopped()
    }
}

impl<T, C> Observer<T> for ObserverBase<C>
where
    C: ObserverCore<T>,
{
    fn on_next(&self, value: T) {
        self.core.on_next_core(value);
    }

    fn on_error(&self, error: SharedError) {
        if self.stopped.try_stop() {
            self.core.on_error_core(error);
        }
    }

    fn on_completed(&self) {
        if self.stopped.try_stop() {
            self.core.on_completed_core();
        }
    }
}

/// A materialized notification, as recorded by collecting sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Notification<T> {
    Next(T),
    Error(String),
    Completed,
}

impl<T> Notification<T> {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Notification::Next(_))
    }
}

//! Root of a subscription tree.
//!
//! The root owns the observer the subscription delivers into and the
//! bound observable underneath it. On the first terminal notification
//! it forwards, then disposes the whole tree.

use std::sync::Arc;
use std::sync::Mutex;

use crate::errors::EngineResult;
use crate::errors::SharedError;
use crate::observer::operator::Operator;
use crate::observer::operator::OperatorExt;
use crate::observer::operator::OperatorNode;
use crate::observer::Observer;
use crate::observer::TerminalLatch;
use crate::observer::Value;

pub struct SubscriptionRoot {
    node: OperatorNode,
    observer: Arc<dyn Observer<Value>>,
    source: Mutex<Option<Arc<dyn Operator>>>,
    stopped: TerminalLatch,
}

impl SubscriptionRoot {
    pub fn new(observer: Arc<dyn Observer<Value>>) -> Arc<Self> {
        Arc::new(Self {
            node: OperatorNode::new(),
            observer,
            source: Mutex::new(None),
            stopped: TerminalLatch::new(),
        })
    }

    pub fn set_source(&self, source: Arc<dyn Operator>) {
        *self.source.lock().unwrap_or_else(|err| err.into_inner()) = Some(source);
    }
}

impl Observer<Value> for SubscriptionRoot {
    fn on_next(&self, value: Value) {
        if !self.is_disposed() {
            self.observer.on_next(value);
        }
    }

    fn on_error(&self, error: SharedError) {
        if self.stopped.try_stop() {
            tracing::debug!("Subscription terminated with error: {error}");
            self.observer.on_error(error);
            self.dispose();
        }
    }

    fn on_completed(&self) {
        if self.stopped.try_stop() {
            self.observer.on_completed();
            self.dispose();
        }
    }
}

impl Operator for SubscriptionRoot {
    fn name(&self) -> &str {
        "rx:subscription"
    }

    fn node(&self) -> &OperatorNode {
        &self.node
    }

    fn on_subscribe(&self) -> EngineResult<Vec<Arc<dyn Operator>>> {
        Ok(self
            .source
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .take()
            .into_iter()
            .collect())
    }
}

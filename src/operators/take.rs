//! `Take`: forward the first `count` values, then complete.

use std::sync::Arc;
use std::sync::Mutex;

use crate::errors::EngineResult;
use crate::errors::SharedError;
use crate::observer::operator::Operator;
use crate::observer::operator::OperatorNode;
use crate::observer::state::OperatorStateReader;
use crate::observer::state::OperatorStateWriter;
use crate::observer::Downstream;
use crate::observer::Observer;
use crate::observer::TerminalLatch;
use crate::observer::Value;

pub struct TakeOperator {
    node: OperatorNode,
    remaining: Mutex<u64>,
    stopped: TerminalLatch,
    downstream: Downstream<Value>,
    source: Mutex<Option<Arc<dyn Operator>>>,
}

impl TakeOperator {
    pub fn new(count: u64, downstream: Downstream<Value>) -> Arc<Self> {
        Arc::new(Self {
            node: OperatorNode::new(),
            remaining: Mutex::new(count),
            stopped: TerminalLatch::new(),
            downstream,
            source: Mutex::new(None),
        })
    }

    /// Attach the upstream operator; it becomes this node's input on
    /// subscribe.
    pub fn set_source(&self, source: Arc<dyn Operator>) {
        *self.source.lock().unwrap_or_else(|err| err.into_inner()) = Some(source);
    }

    fn remaining(&self) -> std::sync::MutexGuard<'_, u64> {
        self.remaining.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn complete(&self) {
        if self.stopped.try_stop() {
            if let Some(downstream) = self.downstream.upgrade() {
                downstream.on_completed();
            }
        }
    }
}

impl Observer<Value> for TakeOperator {
    fn on_next(&self, value: Value) {
        let last = {
            let mut remaining = self.remaining();
            if *remaining == 0 {
                return;
            }
            *remaining -= 1;
            *remaining == 0
        };
        self.node.mark_state_changed();
        if let Some(downstream) = self.downstream.upgrade() {
            downstream.on_next(value);
        }
        if last {
            self.complete();
        }
    }

    fn on_error(&self, error: SharedError) {
        if self.stopped.try_stop() {
            if let Some(downstream) = self.downstream.upgrade() {
                downstream.on_error(error);
            }
        }
    }

    fn on_completed(&self) {
        self.complete();
    }
}

impl Operator for TakeOperator {
    fn name(&self) -> &str {
        "rx:take"
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

    fn on_start(&self) -> EngineResult<()> {
        if *self.remaining() == 0 {
            self.complete();
        }
        Ok(())
    }

    fn load_state_core(&self, reader: &mut OperatorStateReader<'_>) -> EngineResult<()> {
        *self.remaining() = reader.read_u64()?;
        Ok(())
    }

    fn save_state_core(&self, writer: &mut OperatorStateWriter) -> EngineResult<()> {
        writer.write_u64(*self.remaining());
        Ok(())
    }
}

//! Subscription-tree nodes: lifecycle and versioned state.
//!
//! Each node goes **Created → Subscribed → Started → Disposed**.
//!
//! - [`OperatorExt::subscribe`] populates the node's inputs exactly
//!   once via the [`Operator::on_subscribe`] hook and recurses.
//! - [`OperatorExt::start`] runs [`Operator::on_start`], unless the
//!   node is already flagged disposed (because a checkpoint recorded
//!   it completed), in which case it goes straight to dispose.
//! - [`OperatorExt::dispose`] is idempotent: a compare-exchange makes
//!   sure [`Operator::on_dispose`] runs once no matter how many
//!   threads race to dispose.
//!
//! To write a new operator, implement [`Operator`] (usually only
//! `name`, `node` and the hooks you care about) and let the blanket
//! [`OperatorExt`] drive it.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use crate::errors::EngineError;
use crate::errors::EngineResult;
use crate::observer::state::OperatorStateReader;
use crate::observer::state::OperatorStateWriter;
use crate::observer::state::Version;

/// Shared bookkeeping embedded in every operator.
#[derive(Default)]
pub struct OperatorNode {
    inputs: Mutex<Vec<Arc<dyn Operator>>>,
    subscribed: AtomicBool,
    started: AtomicBool,
    /// Set by the one call to `dispose` that wins.
    disposed: AtomicBool,
    /// Set when a loaded checkpoint record says the node completed.
    disposed_from_state: AtomicBool,
    state_changed: AtomicBool,
}

impl OperatorNode {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flag that this node's persisted state is out of date.
    pub fn mark_state_changed(&self) {
        self.state_changed.store(true, Ordering::Release);
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Explicitly disposed in this process.
    pub fn is_disposed_explicitly(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Restored from a record that said the node was disposed.
    pub fn is_disposed_from_state(&self) -> bool {
        self.disposed_from_state.load(Ordering::Acquire)
    }

    fn inputs(&self) -> Vec<Arc<dyn Operator>> {
        self.inputs
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .clone()
    }
}

/// Capabilities of a subscription-tree node.
///
/// Everything except [`Operator::name`] and [`Operator::node`] has a
/// default. Versioned overloads reject any version but the current
/// one; override them to migrate old records explicitly.
pub trait Operator: Send + Sync {
    /// Name used as the checkpoint schema tag together with
    /// [`Operator::version`].
    fn name(&self) -> &str;

    fn version(&self) -> Version {
        Version::V1
    }

    fn node(&self) -> &OperatorNode;

    /// Produce this node's child subscriptions. Called once.
    fn on_subscribe(&self) -> EngineResult<Vec<Arc<dyn Operator>>> {
        Ok(Vec::new())
    }

    fn on_start(&self) -> EngineResult<()> {
        Ok(())
    }

    fn on_dispose(&self) {}

    fn load_state_core(&self, _reader: &mut OperatorStateReader<'_>) -> EngineResult<()> {
        Ok(())
    }

    fn load_state_core_versioned(
        &self,
        _reader: &mut OperatorStateReader<'_>,
        version: Version,
    ) -> EngineResult<()> {
        Err(EngineError::UnsupportedVersion {
            name: self.name().to_owned(),
            version,
            current: self.version(),
        })
    }

    fn save_state_core(&self, _writer: &mut OperatorStateWriter) -> EngineResult<()> {
        Ok(())
    }

    fn save_state_core_versioned(
        &self,
        _writer: &mut OperatorStateWriter,
        version: Version,
    ) -> EngineResult<()> {
        Err(EngineError::UnsupportedVersion {
            name: self.name().to_owned(),
            version,
            current: self.version(),
        })
    }
}

/// Lifecycle driver for every [`Operator`].
pub trait OperatorExt {
    fn subscribe(&self) -> EngineResult<()>;

    fn inputs(&self) -> Vec<Arc<dyn Operator>>;

    fn start(&self) -> EngineResult<()>;

    fn dispose(&self);

    /// Disposed explicitly or according to restored state.
    fn is_disposed(&self) -> bool;

    fn load_state(&self, reader: &mut OperatorStateReader<'_>, version: Version)
        -> EngineResult<()>;

    fn save_state(&self, writer: &mut OperatorStateWriter, version: Version) -> EngineResult<()>;

    fn state_changed(&self) -> bool;

    /// Acknowledge that a checkpoint containing this node committed.
    fn on_state_saved(&self);
}

impl<O> OperatorExt for O
where
    O: Operator + ?Sized,
{
    fn subscribe(&self) -> EngineResult<()> {
        let node = self.node();
        if node
            .subscribed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(EngineError::InvalidOperation(format!(
                "operator '{}' is already subscribed",
                self.name()
            )));
        }
        let inputs = self.on_subscribe()?;
        *node.inputs.lock().unwrap_or_else(|err| err.into_inner()) = inputs.clone();
        for input in inputs {
            input.subscribe()?;
        }
        Ok(())
    }

    fn inputs(&self) -> Vec<Arc<dyn Operator>> {
        self.node().inputs()
    }

    fn start(&self) -> EngineResult<()> {
        if self.is_disposed() {
            tracing::trace!("'{}' restored as disposed; not starting", self.name());
            self.dispose();
            return Ok(());
        }
        let node = self.node();
        if node
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.on_start()?;
        }
        for input in node.inputs() {
            input.start()?;
        }
        Ok(())
    }

    fn dispose(&self) {
        let node = self.node();
        if node
            .disposed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        if !node.is_disposed_from_state() {
            node.mark_state_changed();
        }
        self.on_dispose();
        // Inputs stay attached so a checkpoint of a completed tree
        // still lines up with the tree rebuilt from its expression.
        for input in node.inputs() {
            input.dispose();
        }
    }

    fn is_disposed(&self) -> bool {
        let node = self.node();
        node.is_disposed_explicitly() || node.is_disposed_from_state()
    }

    fn load_state(
        &self,
        reader: &mut OperatorStateReader<'_>,
        version: Version,
    ) -> EngineResult<()> {
        if reader.read_bool()? {
            self.node().disposed_from_state.store(true, Ordering::Release);
        }
        if version == self.version() {
            self.load_state_core(reader)
        } else {
            self.load_state_core_versioned(reader, version)
        }
    }

    fn save_state(&self, writer: &mut OperatorStateWriter, version: Version) -> EngineResult<()> {
        writer.write_bool(self.is_disposed());
        if version == self.version() {
            self.save_state_core(writer)
        } else {
            self.save_state_core_versioned(writer, version)
        }
    }

    fn state_changed(&self) -> bool {
        self.node().state_changed.load(Ordering::Acquire)
    }

    fn on_state_saved(&self) {
        self.node().state_changed.store(false, Ordering::Release);
    }
}

/// Visit a tree pre-order.
pub fn walk(
    root: &Arc<dyn Operator>,
    visit: &mut dyn FnMut(&Arc<dyn Operator>) -> EngineResult<()>,
) -> EngineResult<()> {
    visit(root)?;
    for input in root.inputs() {
        walk(&input, visit)?;
    }
    Ok(())
}

/// Serialize a whole tree as pre-order `(name, version, record)`
/// triples.
pub fn save_tree(root: &Arc<dyn Operator>, writer: &mut OperatorStateWriter) -> EngineResult<()> {
    let mut count = 0u64;
    let mut body = OperatorStateWriter::new();
    walk(root, &mut |op| {
        let mut record = OperatorStateWriter::new();
        op.save_state(&mut record, op.version())?;
        body.write_str(op.name());
        body.write_version(op.version());
        body.write_bytes(&record.into_bytes());
        count += 1;
        Ok(())
    })?;
    writer.write_u64(count);
    writer.write_bytes(&body.into_bytes());
    Ok(())
}

/// Restore a tree rebuilt from its expression from records written by
/// [`save_tree`].
pub fn load_tree(root: &Arc<dyn Operator>, reader: &mut OperatorStateReader<'_>) -> EngineResult<()> {
    let count = reader.read_u64()?;
    let body = reader.read_bytes()?;
    let mut body = OperatorStateReader::new(body);
    let mut seen = 0u64;
    walk(root, &mut |op| {
        seen += 1;
        if seen > count {
            return Err(EngineError::StateCorrupted(format!(
                "checkpoint holds {count} operator records but the tree has more"
            )));
        }
        let name = body.read_str()?;
        if name != op.name() {
            return Err(EngineError::StateCorrupted(format!(
                "expected record for '{}' but found '{name}'",
                op.name()
            )));
        }
        let version = body.read_version()?;
        let record = body.read_bytes()?;
        op.load_state(&mut OperatorStateReader::new(record), version)
    })?;
    if seen != count {
        return Err(EngineError::StateCorrupted(format!(
            "checkpoint holds {count} operator records but the tree has {seen}"
        )));
    }
    Ok(())
}

/// Whether any node in the tree needs a fresh checkpoint.
pub fn tree_state_changed(root: &Arc<dyn Operator>) -> bool {
    let mut changed = false;
    // The visitor never fails.
    let _ = walk(root, &mut |op| {
        changed |= op.state_changed();
        Ok(())
    });
    changed
}

pub fn tree_on_state_saved(root: &Arc<dyn Operator>) {
    let _ = walk(root, &mut |op| {
        op.on_state_saved();
        Ok(())
    });
}

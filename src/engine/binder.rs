//! Turn expressions into operator trees.
//!
//! Observables are bound from the observer end: each operator is made
//! with a weak link to the node it emits into, then its own source is
//! bound with a link back to it. `Ref` expressions resolve through
//! [`ReactiveMetadata`]; a reference to a stream becomes a
//! [`SubjectSource`] in observable position and a [`StreamSink`] in
//! observer position.
//!
//! [`Binder::inline`] expands the definitions a subscription or stream
//! relies on ahead of time, so its record binds again after those
//! definitions are gone. Stream references stay references: streams
//! are entities in their own right.

use std::sync::Arc;

use crate::engine::entity::ReactiveEntityKind;
use crate::engine::metadata::ReactiveMetadata;
use crate::errors::EngineError;
use crate::errors::EngineResult;
use crate::expression::Expr;
use crate::observer::operator::Operator;
use crate::observer::Downstream;
use crate::observer::Observer;
use crate::observer::Value;
use crate::operators::sinks::collect;
use crate::operators::sinks::log;
use crate::operators::sinks::nop;
use crate::operators::Collectors;
use crate::operators::range::range_fits;
use crate::operators::RangeOperator;
use crate::operators::Signal;
use crate::operators::SignalSource;
use crate::operators::StreamSink;
use crate::operators::SubjectArena;
use crate::operators::SubjectSource;
use crate::operators::SubscriptionRoot;
use crate::operators::TakeOperator;
use crate::scheduler::Scheduler;

/// Deepest chain of definitions a reference may expand into.
const MAX_DEPTH: usize = 64;

/// Check that `expr` can be the definition of an entity of `kind`,
/// without resolving any references.
pub fn check_definition(kind: ReactiveEntityKind, expr: &Expr) -> EngineResult<()> {
    check_ranges(expr)?;
    let fits = match kind {
        ReactiveEntityKind::Observable => matches!(
            expr,
            Expr::Empty
                | Expr::Never
                | Expr::Return { .. }
                | Expr::Throw { .. }
                | Expr::Range { .. }
                | Expr::Take { .. }
                | Expr::Ref { .. }
        ),
        ReactiveEntityKind::Observer => matches!(
            expr,
            Expr::Nop | Expr::Collect { .. } | Expr::Log { .. } | Expr::Ref { .. }
        ),
        ReactiveEntityKind::StreamFactory => matches!(expr, Expr::Subject),
        ReactiveEntityKind::SubscriptionFactory | ReactiveEntityKind::Subscription => {
            matches!(expr, Expr::Subscribe { .. } | Expr::Ref { .. })
        }
        ReactiveEntityKind::Stream => matches!(expr, Expr::Ref { .. } | Expr::Subject),
    };
    if fits {
        Ok(())
    } else {
        Err(EngineError::InvalidExpression(format!(
            "{expr:?} cannot define a {kind}"
        )))
    }
}

fn check_ranges(expr: &Expr) -> EngineResult<()> {
    match expr {
        Expr::Range { start, count } if !range_fits(*start, *count) => {
            Err(EngineError::InvalidExpression(format!(
                "range of {count} from {start} runs past {}",
                i64::MAX
            )))
        }
        Expr::Take { source, .. } => check_ranges(source),
        Expr::Subscribe {
            observable,
            observer,
        } => {
            check_ranges(observable)?;
            check_ranges(observer)
        }
        _ => Ok(()),
    }
}

pub struct Binder<'a, M: ?Sized> {
    metadata: &'a M,
    subjects: &'a Arc<SubjectArena>,
    collectors: &'a Arc<Collectors>,
    scheduler: &'a Scheduler,
}

impl<'a, M> Binder<'a, M>
where
    M: ReactiveMetadata + ?Sized,
{
    pub fn new(
        metadata: &'a M,
        subjects: &'a Arc<SubjectArena>,
        collectors: &'a Arc<Collectors>,
        scheduler: &'a Scheduler,
    ) -> Self {
        Self {
            metadata,
            subjects,
            collectors,
            scheduler,
        }
    }

    fn descend(depth: usize) -> EngineResult<usize> {
        if depth >= MAX_DEPTH {
            return Err(EngineError::InvalidExpression(format!(
                "references nest deeper than {MAX_DEPTH}; is there a cycle?"
            )));
        }
        Ok(depth + 1)
    }

    /// Expand every reference to a definition in `expr`. Expressions of
    /// kinds other than subscriptions and streams are returned as is.
    pub fn inline(&self, kind: ReactiveEntityKind, expr: &Expr) -> EngineResult<Expr> {
        match kind {
            ReactiveEntityKind::Subscription => self.inline_subscription(expr, 0),
            ReactiveEntityKind::Stream => match expr {
                Expr::Ref { uri } => match self
                    .metadata
                    .definition(ReactiveEntityKind::StreamFactory, uri)
                {
                    Some(Expr::Subject) => Ok(Expr::Subject),
                    _ => Err(EngineError::InvalidExpression(format!(
                        "'{uri}' is not a known stream factory"
                    ))),
                },
                other => Ok(other.clone()),
            },
            _ => Ok(expr.clone()),
        }
    }

    fn inline_subscription(&self, expr: &Expr, depth: usize) -> EngineResult<Expr> {
        match expr {
            Expr::Subscribe {
                observable,
                observer,
            } => Ok(Expr::subscribe(
                self.inline_observable(observable, depth)?,
                self.inline_observer(observer, depth)?,
            )),
            Expr::Ref { uri } => {
                let definition = self
                    .metadata
                    .definition(ReactiveEntityKind::SubscriptionFactory, uri)
                    .ok_or_else(|| {
                        EngineError::InvalidExpression(format!(
                            "'{uri}' is not a known subscription factory"
                        ))
                    })?;
                self.inline_subscription(definition, Self::descend(depth)?)
            }
            other => Err(EngineError::InvalidExpression(format!(
                "{other:?} is not a subscription"
            ))),
        }
    }

    fn inline_observable(&self, expr: &Expr, depth: usize) -> EngineResult<Expr> {
        match expr {
            Expr::Take { source, count } => {
                Ok(Expr::take(self.inline_observable(source, depth)?, *count))
            }
            Expr::Ref { uri } => {
                if let Some(definition) = self
                    .metadata
                    .definition(ReactiveEntityKind::Observable, uri)
                {
                    self.inline_observable(definition, Self::descend(depth)?)
                } else if self.metadata.stream(uri).is_some() {
                    Ok(expr.clone())
                } else {
                    Err(EngineError::InvalidExpression(format!(
                        "'{uri}' is not a known observable or stream"
                    )))
                }
            }
            other => Ok(other.clone()),
        }
    }

    fn inline_observer(&self, expr: &Expr, depth: usize) -> EngineResult<Expr> {
        match expr {
            Expr::Ref { uri } => {
                if let Some(definition) = self.metadata.definition(ReactiveEntityKind::Observer, uri)
                {
                    self.inline_observer(definition, Self::descend(depth)?)
                } else if self.metadata.stream(uri).is_some() {
                    Ok(expr.clone())
                } else {
                    Err(EngineError::InvalidExpression(format!(
                        "'{uri}' is not a known observer or stream"
                    )))
                }
            }
            other => Ok(other.clone()),
        }
    }

    /// Bind a subscription expression into an unsubscribed tree.
    pub fn bind_subscription(&self, expr: &Expr) -> EngineResult<Arc<dyn Operator>> {
        self.subscription(expr, 0)
    }

    fn subscription(&self, expr: &Expr, depth: usize) -> EngineResult<Arc<dyn Operator>> {
        match expr {
            Expr::Subscribe {
                observable,
                observer,
            } => {
                let observer = self.observer(observer, depth)?;
                let root = SubscriptionRoot::new(observer);
                let weak = Arc::downgrade(&root);
                let downstream: Downstream<Value> = weak;
                let source = self.observable(observable, downstream, depth)?;
                root.set_source(source);
                Ok(root)
            }
            Expr::Ref { uri } => {
                let definition = self
                    .metadata
                    .definition(ReactiveEntityKind::SubscriptionFactory, uri)
                    .ok_or_else(|| {
                        EngineError::InvalidExpression(format!(
                            "'{uri}' is not a known subscription factory"
                        ))
                    })?;
                self.subscription(definition, Self::descend(depth)?)
            }
            other => Err(EngineError::InvalidExpression(format!(
                "{other:?} is not a subscription"
            ))),
        }
    }

    pub fn bind_observable(
        &self,
        expr: &Expr,
        downstream: Downstream<Value>,
    ) -> EngineResult<Arc<dyn Operator>> {
        self.observable(expr, downstream, 0)
    }

    fn observable(
        &self,
        expr: &Expr,
        downstream: Downstream<Value>,
        depth: usize,
    ) -> EngineResult<Arc<dyn Operator>> {
        let signal = match expr {
            Expr::Empty => Some(Signal::Empty),
            Expr::Never => Some(Signal::Never),
            Expr::Return { value } => Some(Signal::Return(value.clone())),
            Expr::Throw { message } => Some(Signal::Throw(message.clone())),
            _ => None,
        };
        if let Some(signal) = signal {
            return Ok(SignalSource::new(signal, downstream, self.scheduler.clone()));
        }
        let op: Arc<dyn Operator> = match expr {
            Expr::Range { start, count } => {
                RangeOperator::new(*start, *count, downstream, self.scheduler.clone())
            }
            Expr::Take { source, count } => {
                let take = TakeOperator::new(*count, downstream);
                let weak = Arc::downgrade(&take);
                let upstream: Downstream<Value> = weak;
                take.set_source(self.observable(source, upstream, depth)?);
                take
            }
            Expr::Ref { uri } => {
                if let Some(definition) = self
                    .metadata
                    .definition(ReactiveEntityKind::Observable, uri)
                {
                    self.observable(definition, downstream, Self::descend(depth)?)?
                } else if let Some(handle) = self.metadata.stream(uri) {
                    let source: Arc<dyn Operator> =
                        SubjectSource::new(self.subjects.clone(), handle, downstream)?;
                    source
                } else {
                    return Err(EngineError::InvalidExpression(format!(
                        "'{uri}' is not a known observable or stream"
                    )));
                }
            }
            other => {
                return Err(EngineError::InvalidExpression(format!(
                    "{other:?} is not an observable"
                )))
            }
        };
        Ok(op)
    }

    pub fn bind_observer(&self, expr: &Expr) -> EngineResult<Arc<dyn Observer<Value>>> {
        self.observer(expr, 0)
    }

    fn observer(&self, expr: &Expr, depth: usize) -> EngineResult<Arc<dyn Observer<Value>>> {
        let observer: Arc<dyn Observer<Value>> = match expr {
            Expr::Nop => Arc::new(nop()),
            Expr::Collect { sink } => Arc::new(collect(self.collectors.get_or_create(sink))),
            Expr::Log { label } => Arc::new(log(label.clone())),
            Expr::Ref { uri } => {
                if let Some(definition) = self.metadata.definition(ReactiveEntityKind::Observer, uri)
                {
                    self.observer(definition, Self::descend(depth)?)?
                } else if let Some(handle) = self.metadata.stream(uri) {
                    let sink: Arc<dyn Observer<Value>> =
                        Arc::new(StreamSink::attach(self.subjects.clone(), handle)?);
                    sink
                } else {
                    return Err(EngineError::InvalidExpression(format!(
                        "'{uri}' is not a known observer or stream"
                    )));
                }
            }
            other => {
                return Err(EngineError::InvalidExpression(format!(
                    "{other:?} is not an observer"
                )))
            }
        };
        Ok(observer)
    }
}

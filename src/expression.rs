//! Resource definitions.
//!
//! An [`Expr`] is the definition the engine persists for every entity
//! and binds into a subscription tree. Expressions are plain data:
//! serializing one and reading it back gives an equal expression, and
//! nothing runs until the engine binds it.

use serde::Deserialize;
use serde::Serialize;

use crate::engine::entity::Uri;
use crate::observer::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Expr {
    // Observables.
    Empty,
    Never,
    Return {
        value: Value,
    },
    Throw {
        message: String,
    },
    Range {
        start: i64,
        count: u64,
    },
    Take {
        source: Box<Expr>,
        count: u64,
    },

    // Observers.
    Nop,
    Collect {
        sink: String,
    },
    Log {
        label: String,
    },

    /// Stream factory body: each stream created from it is a subject.
    Subject,

    /// Subscription: wire an observable into an observer.
    Subscribe {
        observable: Box<Expr>,
        observer: Box<Expr>,
    },

    /// A known resource, resolved by URI at bind time.
    Ref {
        uri: Uri,
    },
}

impl Expr {
    pub fn ret(value: impl Into<Value>) -> Self {
        Self::Return {
            value: value.into(),
        }
    }

    pub fn throw(message: impl Into<String>) -> Self {
        Self::Throw {
            message: message.into(),
        }
    }

    pub fn range(start: i64, count: u64) -> Self {
        Self::Range { start, count }
    }

    pub fn take(source: Expr, count: u64) -> Self {
        Self::Take {
            source: Box::new(source),
            count,
        }
    }

    pub fn collect(sink: impl Into<String>) -> Self {
        Self::Collect { sink: sink.into() }
    }

    pub fn log(label: impl Into<String>) -> Self {
        Self::Log {
            label: label.into(),
        }
    }

    pub fn subscribe(observable: Expr, observer: Expr) -> Self {
        Self::Subscribe {
            observable: Box::new(observable),
            observer: Box::new(observer),
        }
    }

    pub fn reference(uri: impl Into<Uri>) -> Self {
        Self::Ref { uri: uri.into() }
    }

    /// Every URI this expression refers to, in pre-order.
    pub fn references(&self) -> Vec<&Uri> {
        let mut refs = Vec::new();
        self.collect_references(&mut refs);
        refs
    }

    fn collect_references<'a>(&'a self, refs: &mut Vec<&'a Uri>) {
        match self {
            Self::Ref { uri } => refs.push(uri),
            Self::Take { source, .. } => source.collect_references(refs),
            Self::Subscribe {
                observable,
                observer,
            } => {
                observable.collect_references(refs);
                observer.collect_references(refs);
            }
            _ => {}
        }
    }
}

#[test]
fn json_shape_is_tagged() {
    let expr = Expr::subscribe(Expr::take(Expr::range(0, 5), 2), Expr::collect("out"));
    let json = serde_json::to_value(&expr).unwrap();
    assert_eq!(json["type"], "subscribe");
    assert_eq!(json["observable"]["type"], "take");
    assert_eq!(json["observable"]["source"]["count"], 5);
    assert_eq!(json["observer"]["sink"], "out");
    let back: Expr = serde_json::from_value(json).unwrap();
    assert_eq!(back, expr);
}

#[test]
fn references_are_found_in_order() {
    let expr = Expr::subscribe(
        Expr::take(Expr::reference("qe://obs/a"), 1),
        Expr::reference("qe://obr/b"),
    );
    let refs: Vec<_> = expr.references().into_iter().map(Uri::as_str).collect();
    assert_eq!(refs, vec!["qe://obs/a", "qe://obr/b"]);
}

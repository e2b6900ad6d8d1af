//! Concrete operators and observers.
//!
//! Every operator holds a weak [`crate::observer::Downstream`] link to
//! the node it emits into; the parent owns it through its inputs.
//! Generating sources emit from scheduler tasks rather than from
//! `start`.

pub mod range;
pub mod sinks;
pub mod sources;
pub mod subject;
pub mod subscription;
pub mod take;

pub use range::RangeOperator;
pub use sinks::Collector;
pub use sinks::Collectors;
pub use sources::Signal;
pub use sources::SignalSource;
pub use subject::StreamSink;
pub use subject::Subject;
pub use subject::SubjectArena;
pub use subject::SubjectSource;
pub use subscription::SubscriptionRoot;
pub use take::TakeOperator;

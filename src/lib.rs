//! A checkpointable reactive query engine.
//!
//! Clients define observables, observers and factories under URIs,
//! create streams and subscriptions from them, and let the engine's
//! [`scheduler::Scheduler`] run the resulting operator trees. The
//! engine can checkpoint every entity, operator state included, and
//! recover from that checkpoint plus a log of the operations made
//! after it.
//!
//! Start with [`engine::CheckpointingQueryEngine`].

pub mod clock;
pub mod config;
pub mod engine;
pub mod errors;
pub mod expression;
pub mod metrics;
pub mod observer;
pub mod operators;
pub mod recovery;
pub mod scheduler;
pub mod tracing;

pub use engine::CheckpointingQueryEngine;
pub use errors::EngineError;
pub use errors::EngineResult;

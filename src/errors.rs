//! Error taxonomy for the engine and its collaborators.
//!
//! Everything the engine can fail with is an [`EngineError`]. Store
//! backends report [`StoreError`] which is wrapped on the way up.
//! Errors that need to be fanned out to several parties (observers,
//! event handlers) travel as a [`SharedError`].

use std::panic::Location;
use std::sync::Arc;

use thiserror::Error;

use crate::engine::entity::ReactiveEntityKind;
use crate::engine::entity::Uri;
use crate::observer::state::Version;

/// Message used by [`EngineError::EngineUnloaded`] when no custom
/// message is supplied.
pub const ENGINE_UNLOADED_MESSAGE: &str =
    "The engine has been unloaded and cannot serve further requests.";

/// Cheaply clonable error handed to observers and event handlers.
pub type SharedError = Arc<EngineError>;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{kind} entity '{uri}' not found in engine '{engine_uri}' (parameter '{param}')")]
    EntityNotFound {
        uri: Uri,
        kind: ReactiveEntityKind,
        engine_uri: Uri,
        param: &'static str,
    },

    #[error("{kind} entity '{uri}' already exists in engine '{engine_uri}' (parameter '{param}')")]
    EntityAlreadyExists {
        uri: Uri,
        kind: ReactiveEntityKind,
        engine_uri: Uri,
        param: &'static str,
    },

    #[error("failed to save {kind} entity '{uri}'")]
    EntitySaveFailed {
        uri: Uri,
        kind: ReactiveEntityKind,
        #[source]
        source: SharedError,
    },

    #[error("failed to load {kind} entity '{uri}'")]
    EntityLoadFailed {
        uri: Uri,
        kind: ReactiveEntityKind,
        #[source]
        source: SharedError,
    },

    #[error("failed to replay {kind} entity '{uri}'")]
    EntityReplayFailed {
        uri: Uri,
        kind: ReactiveEntityKind,
        #[source]
        source: SharedError,
    },

    #[error("{message}")]
    EngineUnloaded {
        message: String,
        #[source]
        source: Option<SharedError>,
    },

    #[error("state of '{name}' is at version {version} but only {current} is supported")]
    UnsupportedVersion {
        name: String,
        version: Version,
        current: Version,
    },

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("invalid expression: {0}")]
    InvalidExpression(String),

    #[error("corrupted state: {0}")]
    StateCorrupted(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("operation was cancelled")]
    Cancelled,

    #[error("{0}")]
    Stream(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[error("({location}) {message}")]
    Context {
        location: String,
        message: String,
        #[source]
        source: Box<EngineError>,
    },
}

impl EngineError {
    /// Build the unloaded error with the standard message.
    pub fn unloaded() -> Self {
        Self::EngineUnloaded {
            message: ENGINE_UNLOADED_MESSAGE.to_owned(),
            source: None,
        }
    }

    pub fn unloaded_with(message: impl Into<String>, source: Option<SharedError>) -> Self {
        Self::EngineUnloaded {
            message: message.into(),
            source,
        }
    }

    /// Whether this error signals caller misuse of the engine
    /// lifecycle rather than a data or store failure.
    pub fn is_invalid_operation(&self) -> bool {
        match self {
            Self::EngineUnloaded { .. } | Self::InvalidOperation(_) => true,
            Self::Context { source, .. } => source.is_invalid_operation(),
            _ => false,
        }
    }

    /// Strip any [`EngineError::Context`] wrappers.
    pub fn root(&self) -> &EngineError {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Short stable label for logs and metrics.
    pub fn as_label(&self) -> &'static str {
        match self.root() {
            Self::EntityNotFound { .. } => "entity_not_found",
            Self::EntityAlreadyExists { .. } => "entity_already_exists",
            Self::EntitySaveFailed { .. } => "entity_save_failed",
            Self::EntityLoadFailed { .. } => "entity_load_failed",
            Self::EntityReplayFailed { .. } => "entity_replay_failed",
            Self::EngineUnloaded { .. } => "engine_unloaded",
            Self::UnsupportedVersion { .. } => "unsupported_version",
            Self::InvalidOperation(_) => "invalid_operation",
            Self::InvalidExpression(_) => "invalid_expression",
            Self::StateCorrupted(_) => "state_corrupted",
            Self::Config(_) => "config",
            Self::Cancelled => "cancelled",
            Self::Stream(_) => "stream",
            Self::Store(_) => "store",
            Self::Serde(_) => "serde",
            Self::Context { .. } => "context",
        }
    }
}

/// Errors raised by checkpoint stores and key-value logs.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Migration(#[from] rusqlite_migration::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("key '{key}' not found in table '{table}'")]
    KeyNotFound { table: String, key: String },

    #[error("key '{key}' already exists in table '{table}'")]
    KeyExists { table: String, key: String },

    #[error("commit was cancelled")]
    Cancelled,

    #[error("{0}")]
    Injected(String),
}

/// Attach the caller location and a message to an error.
///
/// Example:
///     store.commit().await.reraise("error committing checkpoint")?;
pub trait ResultExt<T> {
    #[track_caller]
    fn reraise(self, msg: &str) -> EngineResult<T>;

    #[track_caller]
    fn reraise_with(self, msg: impl FnOnce() -> String) -> EngineResult<T>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<EngineError>,
{
    #[track_caller]
    fn reraise(self, msg: &str) -> EngineResult<T> {
        let caller = Location::caller();
        self.map_err(|err| EngineError::Context {
            location: caller.to_string(),
            message: msg.to_owned(),
            source: Box::new(err.into()),
        })
    }

    #[track_caller]
    fn reraise_with(self, msg: impl FnOnce() -> String) -> EngineResult<T> {
        let caller = Location::caller();
        self.map_err(|err| EngineError::Context {
            location: caller.to_string(),
            message: msg(),
            source: Box::new(err.into()),
        })
    }
}

/// Prepend the name of the current thread to each line, if present.
pub(crate) fn prepend_tname(msg: String) -> String {
    let tname = std::thread::current()
        .name()
        .unwrap_or("unnamed-thread")
        .to_string();
    msg.lines()
        .map(|line| format!("<{tname}> {line}\n"))
        .collect()
}

#[test]
fn unloaded_uses_standard_message() {
    let err = EngineError::unloaded();
    assert_eq!(err.to_string(), ENGINE_UNLOADED_MESSAGE);
    assert!(err.is_invalid_operation());
}

#[test]
fn reraise_keeps_root() {
    let res: Result<(), EngineError> = Err(EngineError::Cancelled);
    let err = res.reraise("checkpointing").unwrap_err();
    assert!(matches!(err.root(), EngineError::Cancelled));
    assert!(err.to_string().contains("checkpointing"));
    assert!(err.to_string().contains("errors.rs"));
    assert_eq!(err.as_label(), "cancelled");
}

#[test]
fn prepend_tname_marks_every_line() {
    let out = std::thread::Builder::new()
        .name("worker-7".to_owned())
        .spawn(|| prepend_tname("a\nb".to_owned()))
        .unwrap()
        .join()
        .unwrap();
    assert_eq!(out, "<worker-7> a\n<worker-7> b\n");
}

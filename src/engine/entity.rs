//! Reactive entities: what the engine stores under a URI.

use std::fmt;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::errors::EngineError;
use crate::errors::EngineResult;
use crate::errors::ResultExt;
use crate::expression::Expr;
use crate::observer::state::OperatorStateReader;
use crate::observer::state::OperatorStateWriter;

/// Identifier of an entity, unique per kind within one engine.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uri(String);

impl Uri {
    pub fn new(uri: impl Into<String>) -> Self {
        Self(uri.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Uri {
    fn from(uri: &str) -> Self {
        Self::new(uri)
    }
}

impl From<String> for Uri {
    fn from(uri: String) -> Self {
        Self(uri)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactiveEntityKind {
    Observable,
    Observer,
    Stream,
    StreamFactory,
    Subscription,
    SubscriptionFactory,
}

impl ReactiveEntityKind {
    /// Order entities are restored in, so references resolve.
    pub const LOAD_ORDER: [ReactiveEntityKind; 6] = [
        Self::StreamFactory,
        Self::SubscriptionFactory,
        Self::Observable,
        Self::Observer,
        Self::Stream,
        Self::Subscription,
    ];

    /// Store category holding entities of this kind.
    pub fn category(self) -> &'static str {
        match self {
            Self::Observable => "observables",
            Self::Observer => "observers",
            Self::Stream => "streams",
            Self::StreamFactory => "stream_factories",
            Self::Subscription => "subscriptions",
            Self::SubscriptionFactory => "subscription_factories",
        }
    }

    pub fn from_category(category: &str) -> Option<Self> {
        Self::LOAD_ORDER
            .into_iter()
            .find(|kind| kind.category() == category)
    }

    /// Defined resources are undefined explicitly. The rest are
    /// process resources that get created and deleted.
    pub fn is_defined_resource(self) -> bool {
        matches!(
            self,
            Self::Observable | Self::Observer | Self::StreamFactory | Self::SubscriptionFactory
        )
    }
}

impl fmt::Display for ReactiveEntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Observable => "observable",
            Self::Observer => "observer",
            Self::Stream => "stream",
            Self::StreamFactory => "stream factory",
            Self::Subscription => "subscription",
            Self::SubscriptionFactory => "subscription factory",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityLifetime {
    Defined { definition_time: DateTime<Utc> },
    Process { creation_time: DateTime<Utc> },
}

impl EntityLifetime {
    pub fn for_kind(kind: ReactiveEntityKind, at: DateTime<Utc>) -> Self {
        if kind.is_defined_resource() {
            Self::Defined {
                definition_time: at,
            }
        } else {
            Self::Process { creation_time: at }
        }
    }

    pub fn time(&self) -> DateTime<Utc> {
        match self {
            Self::Defined { definition_time } => *definition_time,
            Self::Process { creation_time } => *creation_time,
        }
    }
}

/// The persisted part of an entity, minus runtime state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub uri: Uri,
    pub kind: ReactiveEntityKind,
    pub expression: Expr,
    pub lifetime: EntityLifetime,
}

impl EntityRecord {
    pub fn new(uri: Uri, kind: ReactiveEntityKind, expression: Expr, at: DateTime<Utc>) -> Self {
        Self {
            uri,
            kind,
            expression,
            lifetime: EntityLifetime::for_kind(kind, at),
        }
    }

    /// Checkpoint blob: JSON header, then optional runtime state.
    pub fn encode(&self, state: Option<&[u8]>) -> EngineResult<Vec<u8>> {
        let mut writer = OperatorStateWriter::new();
        writer.write(self)?;
        writer.write_bool(state.is_some());
        if let Some(state) = state {
            writer.write_bytes(state);
        }
        Ok(writer.into_bytes())
    }

    /// Split a blob written by [`EntityRecord::encode`].
    pub fn decode(blob: &[u8]) -> EngineResult<(Self, Option<&[u8]>)> {
        let mut reader = OperatorStateReader::new(blob);
        let record: Self = reader.read().reraise("error decoding entity header")?;
        let state = if reader.read_bool()? {
            Some(reader.read_bytes()?)
        } else {
            None
        };
        if !reader.is_at_end() {
            return Err(EngineError::StateCorrupted(format!(
                "{} trailing bytes after entity '{}'",
                reader.remaining(),
                record.uri
            )));
        }
        Ok((record, state))
    }

    /// Read only the header of a blob, ignoring whatever state follows.
    pub fn decode_header(blob: &[u8]) -> EngineResult<Self> {
        OperatorStateReader::new(blob)
            .read()
            .reraise("error decoding entity header")
    }
}

/// Read-only view of a registered entity.
#[derive(Debug, Clone, PartialEq)]
pub struct ReactiveEntitySnapshot {
    pub record: EntityRecord,
    /// Process resources only: the subscription or stream has
    /// terminated.
    pub is_terminated: bool,
}

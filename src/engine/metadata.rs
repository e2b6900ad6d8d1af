//! Known-resource lookup used while binding expressions.

use crate::engine::artifacts::ArtifactHandle;
use crate::engine::entity::ReactiveEntityKind;
use crate::engine::entity::Uri;
use crate::expression::Expr;

/// Queryable view of the entities of one engine, per kind.
pub trait ReactiveMetadata {
    /// Definition registered for `uri` under `kind`.
    fn definition(&self, kind: ReactiveEntityKind, uri: &Uri) -> Option<&Expr>;

    /// Live subject behind a stream.
    fn stream(&self, uri: &Uri) -> Option<ArtifactHandle>;

    fn uris(&self, kind: ReactiveEntityKind) -> Vec<Uri>;

    fn contains(&self, kind: ReactiveEntityKind, uri: &Uri) -> bool {
        self.definition(kind, uri).is_some()
    }
}

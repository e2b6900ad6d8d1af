//! Entities of one engine, per kind.
//!
//! Besides the live entities the registry remembers what a
//! differential checkpoint needs: which entities went away since the
//! last commit (tombstones) and a fingerprint of each blob that was
//! committed. Blobs of entities that failed to load and were ignored
//! are kept verbatim so later checkpoints carry them forward.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;

use crate::engine::artifacts::ArtifactHandle;
use crate::engine::entity::EntityRecord;
use crate::engine::entity::ReactiveEntityKind;
use crate::engine::entity::ReactiveEntitySnapshot;
use crate::engine::entity::Uri;
use crate::engine::metadata::ReactiveMetadata;
use crate::errors::EngineError;
use crate::errors::EngineResult;
use crate::expression::Expr;
use crate::observer::operator::save_tree;
use crate::observer::operator::tree_state_changed;
use crate::observer::operator::Operator;
use crate::observer::operator::OperatorExt;
use crate::observer::state::OperatorStateWriter;
use crate::operators::Subject;

pub(crate) type EntityKey = (ReactiveEntityKind, Uri);

/// What an entity is running, if anything.
pub enum EntityRuntime {
    /// Defined resources are only definitions.
    None,
    Subscription(Arc<dyn Operator>),
    Stream {
        handle: ArtifactHandle,
        subject: Arc<Subject>,
    },
}

pub struct ReactiveEntity {
    pub record: EntityRecord,
    pub runtime: EntityRuntime,
}

impl ReactiveEntity {
    pub fn new(record: EntityRecord, runtime: EntityRuntime) -> Self {
        Self { record, runtime }
    }

    pub fn key(&self) -> EntityKey {
        (self.record.kind, self.record.uri.clone())
    }

    pub fn is_terminated(&self) -> bool {
        match &self.runtime {
            EntityRuntime::None => false,
            EntityRuntime::Subscription(root) => root.is_disposed(),
            EntityRuntime::Stream { subject, .. } => subject.is_terminated(),
        }
    }

    pub fn snapshot(&self) -> ReactiveEntitySnapshot {
        ReactiveEntitySnapshot {
            record: self.record.clone(),
            is_terminated: self.is_terminated(),
        }
    }

    /// Whether the operator tree changed since its last committed
    /// checkpoint. Always `true` for entities without a tree.
    pub fn state_changed(&self) -> bool {
        match &self.runtime {
            EntityRuntime::Subscription(root) => tree_state_changed(root),
            EntityRuntime::None | EntityRuntime::Stream { .. } => true,
        }
    }

    /// Checkpoint blob of the entity.
    pub fn encode(&self) -> EngineResult<Vec<u8>> {
        let state = match &self.runtime {
            EntityRuntime::None => None,
            EntityRuntime::Subscription(root) => {
                let mut writer = OperatorStateWriter::new();
                save_tree(root, &mut writer)?;
                Some(writer.into_bytes())
            }
            EntityRuntime::Stream { subject, .. } => {
                let mut writer = OperatorStateWriter::new();
                subject.save_state(&mut writer)?;
                Some(writer.into_bytes())
            }
        };
        self.record.encode(state.as_deref())
    }

    /// Stop whatever the entity runs.
    pub fn dispose(&self) {
        if let EntityRuntime::Subscription(root) = &self.runtime {
            root.dispose();
        }
    }
}

pub struct Registry {
    engine_uri: Uri,
    entities: BTreeMap<ReactiveEntityKind, BTreeMap<Uri, ReactiveEntity>>,
    tombstones: BTreeSet<EntityKey>,
    pending: BTreeMap<EntityKey, Vec<u8>>,
    fingerprints: HashMap<EntityKey, u64>,
}

impl Registry {
    pub fn new(engine_uri: Uri) -> Self {
        Self {
            engine_uri,
            entities: BTreeMap::new(),
            tombstones: BTreeSet::new(),
            pending: BTreeMap::new(),
            fingerprints: HashMap::new(),
        }
    }

    fn not_found(&self, kind: ReactiveEntityKind, uri: &Uri, param: &'static str) -> EngineError {
        EngineError::EntityNotFound {
            uri: uri.clone(),
            kind,
            engine_uri: self.engine_uri.clone(),
            param,
        }
    }

    /// Fail if `uri` is already bound for `kind`.
    pub fn ensure_absent(
        &self,
        kind: ReactiveEntityKind,
        uri: &Uri,
        param: &'static str,
    ) -> EngineResult<()> {
        if self.contains(kind, uri) {
            return Err(EngineError::EntityAlreadyExists {
                uri: uri.clone(),
                kind,
                engine_uri: self.engine_uri.clone(),
                param,
            });
        }
        Ok(())
    }

    /// Register an entity. Supersedes an ignored blob under the same
    /// URI.
    pub fn add(&mut self, entity: ReactiveEntity, param: &'static str) -> EngineResult<()> {
        let (kind, uri) = entity.key();
        self.ensure_absent(kind, &uri, param)?;
        let key = (kind, uri);
        self.tombstones.remove(&key);
        self.pending.remove(&key);
        self.entities
            .entry(kind)
            .or_default()
            .insert(key.1, entity);
        Ok(())
    }

    pub fn get(
        &self,
        kind: ReactiveEntityKind,
        uri: &Uri,
        param: &'static str,
    ) -> EngineResult<&ReactiveEntity> {
        self.entities
            .get(&kind)
            .and_then(|entities| entities.get(uri))
            .ok_or_else(|| self.not_found(kind, uri, param))
    }

    /// Remove an entity and remember to delete it from the store.
    pub fn remove(
        &mut self,
        kind: ReactiveEntityKind,
        uri: &Uri,
        param: &'static str,
    ) -> EngineResult<ReactiveEntity> {
        let entity = self
            .entities
            .get_mut(&kind)
            .and_then(|entities| entities.remove(uri))
            .ok_or_else(|| self.not_found(kind, uri, param))?;
        let key = (kind, uri.clone());
        self.fingerprints.remove(&key);
        self.tombstones.insert(key);
        Ok(entity)
    }

    /// Take an entity back out as if it was never added.
    pub fn discard(&mut self, kind: ReactiveEntityKind, uri: &Uri) -> Option<ReactiveEntity> {
        self.entities
            .get_mut(&kind)
            .and_then(|entities| entities.remove(uri))
    }

    pub fn contains(&self, kind: ReactiveEntityKind, uri: &Uri) -> bool {
        self.entities
            .get(&kind)
            .map_or(false, |entities| entities.contains_key(uri))
    }

    pub fn iter(&self, kind: ReactiveEntityKind) -> impl Iterator<Item = &ReactiveEntity> {
        self.entities
            .get(&kind)
            .into_iter()
            .flat_map(|entities| entities.values())
    }

    pub fn len(&self) -> usize {
        self.entities.values().map(BTreeMap::len).sum()
    }

    /// No live entities and no ignored blobs.
    pub fn is_empty(&self) -> bool {
        self.len() == 0 && self.pending.is_empty()
    }

    /// Keep the blob of an entity that could not be loaded.
    pub fn add_pending(&mut self, kind: ReactiveEntityKind, uri: &Uri, blob: Vec<u8>) {
        self.pending.insert((kind, uri.clone()), blob);
    }

    pub fn is_pending(&self, kind: ReactiveEntityKind, uri: &Uri) -> bool {
        self.pending.contains_key(&(kind, uri.clone()))
    }

    pub fn pending(&self) -> impl Iterator<Item = (&EntityKey, &Vec<u8>)> {
        self.pending.iter()
    }

    pub fn pending_uris(&self, kind: ReactiveEntityKind) -> Vec<Uri> {
        self.pending
            .keys()
            .filter(|(pending_kind, _)| *pending_kind == kind)
            .map(|(_, uri)| uri.clone())
            .collect()
    }

    /// Forget an ignored blob; the store copy gets deleted.
    pub fn drop_pending(&mut self, kind: ReactiveEntityKind, uri: &Uri) -> bool {
        let key = (kind, uri.clone());
        let dropped = self.pending.remove(&key).is_some();
        if dropped {
            self.tombstones.insert(key);
        }
        dropped
    }

    /// Remember that the store copy of an entity must go.
    pub fn tombstone(&mut self, kind: ReactiveEntityKind, uri: &Uri) {
        self.tombstones.insert((kind, uri.clone()));
    }

    pub fn is_tombstoned(&self, kind: ReactiveEntityKind, uri: &Uri) -> bool {
        self.tombstones.contains(&(kind, uri.clone()))
    }

    pub fn take_tombstones(&mut self) -> BTreeSet<EntityKey> {
        std::mem::take(&mut self.tombstones)
    }

    /// Put back tombstones of a checkpoint that did not commit, unless
    /// the entity came back in the meantime.
    pub fn restore_tombstones(&mut self, tombstones: BTreeSet<EntityKey>) {
        for key in tombstones {
            if !self.contains(key.0, &key.1) {
                self.tombstones.insert(key);
            }
        }
    }

    pub fn fingerprint(&self, key: &EntityKey) -> Option<u64> {
        self.fingerprints.get(key).copied()
    }

    /// Record the fingerprint of a committed blob, if the entity is
    /// still around.
    pub fn set_fingerprint(&mut self, key: EntityKey, fingerprint: u64) {
        if self.contains(key.0, &key.1) {
            self.fingerprints.insert(key, fingerprint);
        }
    }

    /// Drop everything, handing back the live entities.
    pub fn clear(&mut self) -> Vec<ReactiveEntity> {
        self.tombstones.clear();
        self.pending.clear();
        self.fingerprints.clear();
        std::mem::take(&mut self.entities)
            .into_values()
            .flat_map(BTreeMap::into_values)
            .collect()
    }
}

impl ReactiveMetadata for Registry {
    fn definition(&self, kind: ReactiveEntityKind, uri: &Uri) -> Option<&Expr> {
        self.get(kind, uri, "uri")
            .ok()
            .map(|entity| &entity.record.expression)
    }

    fn stream(&self, uri: &Uri) -> Option<ArtifactHandle> {
        match &self.get(ReactiveEntityKind::Stream, uri, "uri").ok()?.runtime {
            EntityRuntime::Stream { handle, .. } => Some(*handle),
            _ => None,
        }
    }

    fn uris(&self, kind: ReactiveEntityKind) -> Vec<Uri> {
        self.iter(kind).map(|entity| entity.record.uri.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use chrono::Utc;

    use super::*;

    fn observable(uri: &str) -> ReactiveEntity {
        let at = Utc.timestamp_millis_opt(0).unwrap();
        ReactiveEntity::new(
            EntityRecord::new(Uri::new(uri), ReactiveEntityKind::Observable, Expr::Empty, at),
            EntityRuntime::None,
        )
    }

    #[test]
    fn uris_are_unique_per_kind() {
        let mut registry = Registry::new(Uri::new("qe://engine"));
        registry.add(observable("qe://a"), "observable_uri").unwrap();
        let err = registry.add(observable("qe://a"), "observable_uri").unwrap_err();
        match err {
            EngineError::EntityAlreadyExists {
                uri,
                kind,
                engine_uri,
                param,
            } => {
                assert_eq!(uri, Uri::new("qe://a"));
                assert_eq!(kind, ReactiveEntityKind::Observable);
                assert_eq!(engine_uri, Uri::new("qe://engine"));
                assert_eq!(param, "observable_uri");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(!registry.contains(ReactiveEntityKind::Observer, &Uri::new("qe://a")));
    }

    #[test]
    fn remove_leaves_a_tombstone() {
        let mut registry = Registry::new(Uri::new("qe://engine"));
        let uri = Uri::new("qe://a");
        assert!(matches!(
            registry.remove(ReactiveEntityKind::Observable, &uri, "observable_uri"),
            Err(EngineError::EntityNotFound { .. })
        ));
        registry.add(observable("qe://a"), "observable_uri").unwrap();
        registry.set_fingerprint((ReactiveEntityKind::Observable, uri.clone()), 7);
        registry
            .remove(ReactiveEntityKind::Observable, &uri, "observable_uri")
            .unwrap();
        assert!(registry.is_tombstoned(ReactiveEntityKind::Observable, &uri));
        assert_eq!(
            registry.fingerprint(&(ReactiveEntityKind::Observable, uri.clone())),
            None
        );

        registry.add(observable("qe://a"), "observable_uri").unwrap();
        assert!(registry.take_tombstones().is_empty());
    }

    #[test]
    fn pending_blobs_are_superseded_by_a_fresh_add() {
        let mut registry = Registry::new(Uri::new("qe://engine"));
        let uri = Uri::new("qe://a");
        registry.add_pending(ReactiveEntityKind::Observable, &uri, vec![1, 2]);
        assert!(!registry.is_empty());
        assert_eq!(registry.pending_uris(ReactiveEntityKind::Observable), vec![uri.clone()]);
        registry.add(observable("qe://a"), "observable_uri").unwrap();
        assert!(!registry.is_pending(ReactiveEntityKind::Observable, &uri));
        assert_eq!(registry.definition(ReactiveEntityKind::Observable, &uri), Some(&Expr::Empty));
        assert_eq!(registry.clear().len(), 1);
        assert!(registry.is_empty());
    }
}

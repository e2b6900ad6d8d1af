//! Restoring an engine from a checkpoint and the operation log.

use std::sync::Arc;

use super::checkpoint::read_log;
use super::registry::EntityKey;
use super::CheckpointingQueryEngine;
use super::LogEntry;
use crate::engine::entity::EntityRecord;
use crate::engine::entity::ReactiveEntityKind;
use crate::engine::entity::Uri;
use crate::engine::events::ReactiveEntityLoadFailedEventArgs;
use crate::engine::mitigation::mitigate_with_fallback;
use crate::engine::mitigation::Mitigation;
use crate::engine::mitigation::MitigationOutcome;
use crate::engine::mitigation::RecoveryFailure;
use crate::engine::mitigation::RecoveryFailureMitigator;
use crate::errors::EngineError;
use crate::errors::EngineResult;
use crate::errors::ResultExt;
use crate::errors::SharedError;
use crate::recovery::read_item;
use crate::recovery::StateReader;
use crate::with_timer;

/// Applies mitigations against the engine being recovered.
struct EngineMitigator<'a> {
    engine: &'a CheckpointingQueryEngine,
    /// The blob that failed to load, if it could be read at all.
    blob: Option<Vec<u8>>,
}

impl RecoveryFailureMitigator for EngineMitigator<'_> {
    fn ignore(&mut self, failure: &RecoveryFailure<'_>) -> Result<bool, MitigationOutcome> {
        if let Some(blob) = self.blob.clone() {
            self.engine
                .state()
                .registry
                .add_pending(failure.kind, failure.uri, blob);
        }
        Ok(true)
    }

    fn remove(&mut self, failure: &RecoveryFailure<'_>) -> Result<bool, MitigationOutcome> {
        self.engine
            .state()
            .registry
            .tombstone(failure.kind, failure.uri);
        Ok(true)
    }

    fn regenerate(&mut self, failure: &RecoveryFailure<'_>) -> Result<bool, MitigationOutcome> {
        let Some(blob) = &self.blob else {
            return Err(MitigationOutcome::Retry(Mitigation::Remove));
        };
        let record = match EntityRecord::decode_header(blob) {
            Ok(record) if record.kind == failure.kind && &record.uri == failure.uri => record,
            Ok(_) | Err(_) => {
                tracing::debug!(
                    "No usable definition to regenerate {} '{}' from",
                    failure.kind,
                    failure.uri
                );
                return Err(MitigationOutcome::Retry(Mitigation::Remove));
            }
        };
        match self.engine.instantiate(record, None) {
            Ok(()) => Ok(true),
            Err(err) => {
                tracing::debug!("Regenerating {} '{}' failed: {err}", failure.kind, failure.uri);
                Err(MitigationOutcome::Retry(Mitigation::Remove))
            }
        }
    }
}

impl CheckpointingQueryEngine {
    /// Load every entity of the checkpoint behind `reader`, then replay
    /// the operation log on top of it.
    ///
    /// Only valid on an engine without entities. Entities that fail to
    /// load raise the load failed event and are mitigated according to
    /// the mitigation the handlers settle on.
    #[tracing::instrument(name = "recover", skip_all, fields(engine = %self.uri))]
    pub async fn recover(&self, reader: &dyn StateReader) -> EngineResult<()> {
        self.ensure_loaded()?;
        if !self.state().registry.is_empty() {
            return Err(EngineError::InvalidOperation(format!(
                "engine '{}' already holds entities and cannot recover",
                self.uri
            )));
        }
        let labels = self.metrics.labels.clone();
        with_timer!(
            self.metrics.recovery_duration,
            labels,
            match self.load_checkpoint(reader) {
                Ok(()) => self.replay_log().await,
                Err(err) => Err(err),
            }
        )
    }

    fn load_checkpoint(&self, reader: &dyn StateReader) -> EngineResult<()> {
        for category in reader.categories().reraise("error listing checkpoint categories")? {
            if ReactiveEntityKind::from_category(&category).is_none() {
                tracing::warn!("Ignoring unknown checkpoint category '{category}'");
            }
        }
        let mut loaded = 0;
        for kind in ReactiveEntityKind::LOAD_ORDER {
            let Some(keys) = reader
                .item_keys(kind.category())
                .reraise_with(|| format!("error listing {kind} entities"))?
            else {
                continue;
            };
            for key in keys {
                let uri = Uri::new(key);
                let blob = match read_item(reader, kind.category(), uri.as_str()) {
                    Ok(Some(blob)) => blob,
                    Ok(None) => continue,
                    Err(err) => {
                        self.mitigate_load_failure(kind, &uri, err.into(), None)?;
                        continue;
                    }
                };
                match self.load_entity(kind, &uri, &blob) {
                    Ok(()) => loaded += 1,
                    Err(err) => self.mitigate_load_failure(kind, &uri, err, Some(blob))?,
                }
            }
        }
        tracing::info!("Loaded {loaded} entities from checkpoint");
        Ok(())
    }

    fn load_entity(&self, kind: ReactiveEntityKind, uri: &Uri, blob: &[u8]) -> EngineResult<()> {
        let (record, state) = EntityRecord::decode(blob)?;
        if record.kind != kind || &record.uri != uri {
            return Err(EngineError::StateCorrupted(format!(
                "blob stored as {kind} '{uri}' holds {} '{}'",
                record.kind, record.uri
            )));
        }
        self.instantiate(record, state)
    }

    fn mitigate_load_failure(
        &self,
        kind: ReactiveEntityKind,
        uri: &Uri,
        err: EngineError,
        blob: Option<Vec<u8>>,
    ) -> EngineResult<()> {
        let error: SharedError = Arc::new(err);
        self.metrics.load_failed(kind);
        let mut args = ReactiveEntityLoadFailedEventArgs::new(
            uri.clone(),
            kind,
            error.clone(),
            self.config.recovery.default_mitigation,
        );
        self.load_failed_handlers.invoke_safe(&mut args);

        let failure = RecoveryFailure {
            uri,
            kind,
            error: &error,
        };
        let mut mitigator = EngineMitigator { engine: self, blob };
        match mitigate_with_fallback(&mut mitigator, &failure, args.mitigation) {
            Ok(applied) => {
                tracing::warn!("Could not load {kind} '{uri}', applied {applied:?}: {error}");
                Ok(())
            }
            Err(source) if args.handled => {
                tracing::warn!("Could not load or mitigate {kind} '{uri}', handled: {source}");
                Ok(())
            }
            Err(source) => {
                tracing::error!("Could not load {kind} '{uri}': {source}");
                Err(EngineError::EntityLoadFailed {
                    uri: uri.clone(),
                    kind,
                    source,
                })
            }
        }
    }

    /// Re-apply logged defines, in load order, then undefines, in
    /// reverse load order.
    async fn replay_log(&self) -> EngineResult<()> {
        let Some(kv) = &self.kv else {
            return Ok(());
        };
        let entries = {
            let txn = kv.begin();
            let entries = read_log(txn.as_ref());
            txn.rollback();
            entries.reraise("error reading the operation log")?
        };

        let mut defines = Vec::new();
        let mut undefines: Vec<EntityKey> = Vec::new();
        for ((kind, uri), entry) in entries {
            match entry {
                Ok(LogEntry::Define { record }) => defines.push(record),
                Ok(LogEntry::Undefine) => undefines.push((kind, uri)),
                Err(err) => self.report_replay_failure(kind, &uri, err)?,
            }
        }
        let replayed = defines.len() + undefines.len();

        for record in defines {
            let (kind, uri) = (record.kind, record.uri.clone());
            if let Err(err) = self.replay_define(record) {
                self.report_replay_failure(kind, &uri, err)?;
            }
        }
        undefines.sort_by_key(|(kind, _)| {
            ReactiveEntityKind::LOAD_ORDER
                .iter()
                .position(|k| k == kind)
                .map(std::cmp::Reverse)
        });
        for (kind, uri) in undefines {
            let present = {
                let state = self.state();
                state.registry.contains(kind, &uri) || state.registry.is_pending(kind, &uri)
            };
            if present {
                if let Err(err) = self.drop_entity(kind, &uri) {
                    self.report_replay_failure(kind, &uri, err)?;
                }
            }
        }
        tracing::info!("Replayed {replayed} logged operations");
        Ok(())
    }

    fn replay_define(&self, record: EntityRecord) -> EngineResult<()> {
        let (kind, uri) = (record.kind, record.uri.clone());
        let current = {
            let state = self.state();
            if state.registry.is_pending(kind, &uri) || state.registry.is_tombstoned(kind, &uri) {
                return Ok(());
            }
            let current = state
                .registry
                .iter(kind)
                .find(|entity| entity.record.uri == uri)
                .map(|entity| entity.record == record);
            current
        };
        match current {
            Some(true) => Ok(()),
            Some(false) => {
                self.drop_entity(kind, &uri)?;
                self.instantiate(record, None)
            }
            None => self.instantiate(record, None),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use chrono::TimeZone;
    use chrono::Utc;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::engine::tests::config;
    use crate::engine::tests::engine;
    use crate::engine::tests::engine_with;
    use crate::expression::Expr;
    use crate::observer::Notification;
    use crate::recovery::kv::InMemKeyValueStore;
    use crate::recovery::kv::KeyValueStore;
    use crate::recovery::store::in_mem::InMemCheckpointStore;
    use crate::recovery::store::sqlite::SqliteCheckpointStore;
    use crate::recovery::CheckpointKind;

    fn nexts(range: std::ops::Range<i64>) -> Vec<Notification<serde_json::Value>> {
        range.map(|i| Notification::Next(json!(i))).collect()
    }

    async fn checkpoint_into(engine: &CheckpointingQueryEngine, store: &InMemCheckpointStore) {
        let mut writer = store.writer(CheckpointKind::Full);
        engine
            .checkpoint(&mut writer, CancellationToken::new(), None)
            .await
            .unwrap();
    }

    fn broken_subscription(store: &InMemCheckpointStore, uri: &str) {
        let record = EntityRecord::new(
            Uri::new(uri),
            ReactiveEntityKind::Subscription,
            Expr::subscribe(Expr::range(0, 2), Expr::collect("regen")),
            Utc.timestamp_millis_opt(5).unwrap(),
        );
        store.put("subscriptions", uri, record.encode(Some(&[1, 2, 3])).unwrap());
    }

    #[tokio::test]
    async fn range_resumes_where_it_was_saved() {
        let first = engine();
        first
            .create_subscription(
                "qe://sub/range",
                Expr::subscribe(Expr::range(0, 10), Expr::collect("out")),
            )
            .await
            .unwrap();
        first.scheduler().run_steps(1).unwrap();
        assert_eq!(first.received("out"), nexts(0..4));

        let store = InMemCheckpointStore::new();
        checkpoint_into(&first, &store).await;
        first.unload();

        let second = engine();
        second.recover(&store.reader()).await.unwrap();
        second.scheduler().run_until_idle().unwrap();
        let mut expected = nexts(4..10);
        expected.push(Notification::Completed);
        assert_eq!(second.received("out"), expected);
    }

    #[tokio::test]
    async fn subscription_outlives_the_definitions_it_used() {
        let first = engine();
        first
            .define_observable("qe://obs/xs", Expr::range(0, 10))
            .await
            .unwrap();
        first
            .define_observer("qe://obv/out", Expr::collect("out"))
            .await
            .unwrap();
        first
            .define_subscription_factory(
                "qe://factory/sub",
                Expr::subscribe(
                    Expr::reference("qe://obs/xs"),
                    Expr::reference("qe://obv/out"),
                ),
            )
            .await
            .unwrap();
        first
            .create_subscription("qe://sub/xs", Expr::reference("qe://factory/sub"))
            .await
            .unwrap();
        first.scheduler().run_steps(1).unwrap();
        assert_eq!(first.received("out"), nexts(0..4));

        first
            .undefine_subscription_factory("qe://factory/sub")
            .await
            .unwrap();
        first.undefine_observable("qe://obs/xs").await.unwrap();
        first.undefine_observer("qe://obv/out").await.unwrap();
        let record = first
            .get_entity(ReactiveEntityKind::Subscription, "qe://sub/xs")
            .unwrap()
            .record;
        assert!(record.expression.references().is_empty());

        let store = InMemCheckpointStore::new();
        checkpoint_into(&first, &store).await;
        first.unload();

        let second = engine();
        let failures = Arc::new(AtomicUsize::new(0));
        let counter = failures.clone();
        second.on_entity_load_failed(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        second.recover(&store.reader()).await.unwrap();
        assert_eq!(failures.load(Ordering::SeqCst), 0);
        second.scheduler().run_until_idle().unwrap();
        let mut expected = nexts(4..10);
        expected.push(Notification::Completed);
        assert_eq!(second.received("out"), expected);
    }

    #[tokio::test]
    async fn stream_outlives_its_factory() {
        let first = engine();
        first
            .define_stream_factory("qe://factory/subject", Expr::Subject)
            .await
            .unwrap();
        first
            .create_stream("qe://stream/s", "qe://factory/subject")
            .await
            .unwrap();
        first
            .undefine_stream_factory("qe://factory/subject")
            .await
            .unwrap();

        let store = InMemCheckpointStore::new();
        checkpoint_into(&first, &store).await;
        first.unload();

        let second = engine();
        second.recover(&store.reader()).await.unwrap();
        assert_eq!(second.entities(ReactiveEntityKind::Stream).unwrap().len(), 1);
        second
            .create_subscription(
                "qe://sub/read",
                Expr::subscribe(Expr::reference("qe://stream/s"), Expr::collect("read")),
            )
            .await
            .unwrap();
        second
            .create_subscription(
                "qe://sub/write",
                Expr::subscribe(Expr::ret(json!(7)), Expr::reference("qe://stream/s")),
            )
            .await
            .unwrap();
        second.scheduler().run_until_idle().unwrap();
        assert_eq!(
            second.received("read"),
            vec![Notification::Next(json!(7)), Notification::Completed]
        );
    }

    #[tokio::test]
    async fn completed_subscription_stays_completed() {
        let first = engine();
        first
            .create_subscription(
                "qe://sub/done",
                Expr::subscribe(Expr::range(0, 2), Expr::collect("out")),
            )
            .await
            .unwrap();
        first.scheduler().run_until_idle().unwrap();
        let store = InMemCheckpointStore::new();
        checkpoint_into(&first, &store).await;

        let second = engine();
        second.recover(&store.reader()).await.unwrap();
        second.scheduler().run_until_idle().unwrap();
        assert!(second.received("out").is_empty());
        assert!(
            second
                .get_entity(ReactiveEntityKind::Subscription, "qe://sub/done")
                .unwrap()
                .is_terminated
        );
    }

    #[tokio::test]
    async fn recover_needs_an_empty_engine() {
        let engine = engine();
        engine
            .define_observable("qe://obs/a", Expr::Empty)
            .await
            .unwrap();
        let err = engine
            .recover(&InMemCheckpointStore::new().reader())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidOperation(_)));
    }

    #[tokio::test]
    async fn ignored_blob_is_carried_into_the_next_checkpoint() {
        let store = InMemCheckpointStore::new();
        broken_subscription(&store, "qe://sub/broken");
        let original = store.get("subscriptions", "qe://sub/broken");

        let engine = engine();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        engine.on_entity_load_failed(move |args| {
            assert_eq!(args.mitigation, Mitigation::Ignore);
            counter.fetch_add(1, Ordering::SeqCst);
        });
        engine.recover(&store.reader()).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(
            engine
                .ignored_entities(ReactiveEntityKind::Subscription)
                .unwrap(),
            vec![Uri::new("qe://sub/broken")]
        );

        let next = InMemCheckpointStore::new();
        checkpoint_into(&engine, &next).await;
        assert_eq!(next.get("subscriptions", "qe://sub/broken"), original);

        // Deleting an ignored entity drops its blob.
        engine.delete_subscription("qe://sub/broken").await.unwrap();
        let mut writer = next.writer(CheckpointKind::Differential);
        engine
            .checkpoint(&mut writer, CancellationToken::new(), None)
            .await
            .unwrap();
        assert_eq!(next.get("subscriptions", "qe://sub/broken"), None);
    }

    #[tokio::test]
    async fn removed_entity_is_deleted_by_the_next_checkpoint() {
        let store = InMemCheckpointStore::new();
        broken_subscription(&store, "qe://sub/broken");

        let engine = engine();
        engine.on_entity_load_failed(|args| args.mitigation = Mitigation::Remove);
        engine.recover(&store.reader()).await.unwrap();
        assert!(engine
            .entities(ReactiveEntityKind::Subscription)
            .unwrap()
            .is_empty());

        let mut writer = store.writer(CheckpointKind::Differential);
        engine
            .checkpoint(&mut writer, CancellationToken::new(), None)
            .await
            .unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn regenerate_rebuilds_from_the_definition() {
        let store = InMemCheckpointStore::new();
        broken_subscription(&store, "qe://sub/broken");

        let engine = engine();
        engine.on_entity_load_failed(|args| args.mitigation = Mitigation::Regenerate);
        engine.recover(&store.reader()).await.unwrap();
        engine.scheduler().run_until_idle().unwrap();
        let mut expected = nexts(0..2);
        expected.push(Notification::Completed);
        assert_eq!(engine.received("regen"), expected);
    }

    #[tokio::test]
    async fn regenerate_without_a_header_falls_back_to_remove() {
        let store = InMemCheckpointStore::new();
        store.put("observables", "qe://obs/garbage", vec![0xff; 4]);

        let engine = engine();
        engine.on_entity_load_failed(|args| args.mitigation = Mitigation::Regenerate);
        engine.recover(&store.reader()).await.unwrap();
        assert!(engine
            .ignored_entities(ReactiveEntityKind::Observable)
            .unwrap()
            .is_empty());
        let mut writer = store.writer(CheckpointKind::Differential);
        engine
            .checkpoint(&mut writer, CancellationToken::new(), None)
            .await
            .unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn panicking_load_handler_is_swallowed() {
        let store = InMemCheckpointStore::new();
        broken_subscription(&store, "qe://sub/broken");

        let engine = engine();
        engine.on_entity_load_failed(|_| panic!("handler bug"));
        engine.recover(&store.reader()).await.unwrap();
        assert_eq!(
            engine
                .ignored_entities(ReactiveEntityKind::Subscription)
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn replay_restores_changes_made_after_the_checkpoint() {
        let kv = InMemKeyValueStore::new();
        let store = InMemCheckpointStore::new();
        let first = engine_with(config(), Some(kv.clone()));
        first
            .define_observable("qe://obs/kept", Expr::range(0, 1))
            .await
            .unwrap();
        first
            .define_observable("qe://obs/dropped", Expr::Empty)
            .await
            .unwrap();
        checkpoint_into(&first, &store).await;
        // Both defines are covered by the checkpoint now.
        assert!(kv.is_empty());

        first.undefine_observable("qe://obs/dropped").await.unwrap();
        first
            .define_observer("qe://obr/new", Expr::collect("late"))
            .await
            .unwrap();
        first
            .create_subscription(
                "qe://sub/late",
                Expr::subscribe(
                    Expr::reference("qe://obs/kept"),
                    Expr::reference("qe://obr/new"),
                ),
            )
            .await
            .unwrap();
        first.unload();

        let second = engine_with(config(), Some(kv.clone()));
        second.recover(&store.reader()).await.unwrap();
        let observables: Vec<_> = second
            .entities(ReactiveEntityKind::Observable)
            .unwrap()
            .into_iter()
            .map(|entity| entity.record.uri)
            .collect();
        assert_eq!(observables, vec![Uri::new("qe://obs/kept")]);
        assert!(second
            .get_entity(ReactiveEntityKind::Observer, "qe://obr/new")
            .is_ok());
        second.scheduler().run_until_idle().unwrap();
        assert_eq!(
            second.received("late"),
            vec![Notification::Next(json!(0)), Notification::Completed]
        );
    }

    #[tokio::test]
    async fn replay_failure_needs_a_handler() {
        let kv = InMemKeyValueStore::new();
        {
            let mut txn = kv.begin();
            txn.add("observables", "qe://obs/junk", b"not json".to_vec())
                .unwrap();
            txn.commit().await.unwrap();
        }
        let store = InMemCheckpointStore::new();

        let strict = engine_with(config(), Some(kv.clone()));
        let err = strict.recover(&store.reader()).await.unwrap_err();
        assert!(matches!(err, EngineError::EntityReplayFailed { .. }));

        let lenient = engine_with(config(), Some(kv.clone()));
        lenient.on_entity_replay_failed(|args| {
            assert_eq!(args.kind, ReactiveEntityKind::Observable);
            args.handled = true;
        });
        lenient.recover(&store.reader()).await.unwrap();
    }

    #[tokio::test]
    async fn sqlite_round_trip() {
        let db = SqliteCheckpointStore::open_in_memory().unwrap();
        let kv = db.key_value_store();
        let first = CheckpointingQueryEngine::new(
            config(),
            Arc::new(crate::clock::TestingClock::new(0, 1)),
            Some(Arc::new(kv.clone()) as Arc<dyn KeyValueStore>),
        )
        .unwrap();
        first
            .define_stream_factory("qe://factory/subject", Expr::Subject)
            .await
            .unwrap();
        first
            .create_stream("qe://stream/s", "qe://factory/subject")
            .await
            .unwrap();
        let mut writer = db.writer(CheckpointKind::Full);
        first
            .checkpoint(&mut writer, CancellationToken::new(), None)
            .await
            .unwrap();
        first.unload();

        let second = CheckpointingQueryEngine::new(
            config(),
            Arc::new(crate::clock::TestingClock::new(0, 1)),
            Some(Arc::new(kv) as Arc<dyn KeyValueStore>),
        )
        .unwrap();
        second.recover(&db.reader()).await.unwrap();
        assert_eq!(second.stream_ref_count("qe://stream/s").unwrap(), 0);
        assert_eq!(
            second
                .entities(ReactiveEntityKind::StreamFactory)
                .unwrap()
                .len(),
            1
        );
    }
}

//! Writing checkpoints.
//!
//! The scheduler is paused for the whole checkpoint so operator state
//! does not move while it is encoded. Blobs are planned under the
//! engine lock and written after it is released; store I/O and event
//! handlers never run under it.
//!
//! In a differential checkpoint only subscriptions whose tree changed
//! since the last commit and entities whose blob differs from the
//! committed one are written, and entities removed since are deleted.
//! A full checkpoint writes everything, including blobs of entities
//! that failed to load and were ignored.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::registry::EntityKey;
use super::registry::EntityRuntime;
use super::registry::Registry;
use super::CheckpointingQueryEngine;
use super::LogEntry;
use crate::engine::entity::EntityRecord;
use crate::engine::entity::ReactiveEntityKind;
use crate::engine::entity::Uri;
use crate::engine::events::ReactiveEntitySaveFailedEventArgs;
use crate::errors::EngineError;
use crate::errors::EngineResult;
use crate::errors::SharedError;
use crate::errors::StoreError;
use crate::observer::operator::tree_on_state_saved;
use crate::observer::operator::Operator;
use crate::recovery::kv::KeyValueStoreTransaction;
use crate::recovery::write_item;
use crate::recovery::CheckpointKind;
use crate::recovery::Progress;
use crate::recovery::StateWriter;
use crate::scheduler::Scheduler;
use crate::with_timer;

/// Pauses the scheduler until dropped, unless it already was.
struct PauseGuard<'a> {
    scheduler: &'a Scheduler,
    was_paused: bool,
}

impl<'a> PauseGuard<'a> {
    fn new(scheduler: &'a Scheduler) -> Self {
        let was_paused = scheduler.is_paused();
        if !was_paused {
            scheduler.pause();
        }
        Self {
            scheduler,
            was_paused,
        }
    }
}

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        if !self.was_paused {
            self.scheduler.resume();
        }
    }
}

enum PlannedBlob {
    Encoded(Vec<u8>),
    Failed(EngineError),
}

struct PlannedItem {
    key: EntityKey,
    blob: PlannedBlob,
    previous: Option<u64>,
    tree: Option<Arc<dyn Operator>>,
}

struct Plan {
    items: Vec<PlannedItem>,
    tombstones: BTreeSet<EntityKey>,
    unchanged: usize,
}

/// What a committed checkpoint needs to acknowledge.
struct Written {
    fingerprints: Vec<(EntityKey, u64)>,
    trees: Vec<Arc<dyn Operator>>,
    persisted: BTreeSet<EntityKey>,
}

impl CheckpointingQueryEngine {
    /// Write the state of every entity through `writer` and commit it.
    ///
    /// Entities that fail to encode or write raise the save failed
    /// event; unless a handler marks it handled, the checkpoint is
    /// rolled back and the failure returned. Cancelling `token` rolls
    /// the checkpoint back with [`EngineError::Cancelled`].
    #[tracing::instrument(name = "checkpoint", skip_all, fields(engine = %self.uri))]
    pub async fn checkpoint(
        &self,
        writer: &mut dyn StateWriter,
        token: CancellationToken,
        progress: Option<Progress<'_>>,
    ) -> EngineResult<()> {
        self.ensure_loaded()?;
        let labels = self.metrics.labels.clone();
        with_timer!(
            self.metrics.checkpoint_duration,
            labels,
            self.checkpoint_paused(writer, token, progress).await
        )
    }

    async fn checkpoint_paused(
        &self,
        writer: &mut dyn StateWriter,
        token: CancellationToken,
        progress: Option<Progress<'_>>,
    ) -> EngineResult<()> {
        if token.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let _paused = PauseGuard::new(&self.scheduler);
        let kind = writer.checkpoint_kind();
        let log = self.log_snapshot()?;

        let plan = self.plan_checkpoint(kind);
        tracing::debug!(
            "{kind:?} checkpoint: {} items, {} deletions, {} unchanged",
            plan.items.len(),
            plan.tombstones.len(),
            plan.unchanged
        );
        let tombstones = plan.tombstones.clone();

        let written = match self.write_plan(writer, kind, plan) {
            Ok(written) => written,
            Err(err) => {
                self.abort(writer, tombstones);
                return Err(err);
            }
        };

        let committed = tokio::select! {
            biased;
            _ = token.cancelled() => Err(EngineError::Cancelled),
            res = writer.commit(token.clone(), progress) => res.map_err(|err| match err {
                StoreError::Cancelled => EngineError::Cancelled,
                other => other.into(),
            }),
        };
        if let Err(err) = committed {
            tracing::warn!("Checkpoint not committed: {err}");
            self.abort(writer, tombstones);
            return Err(err);
        }

        {
            let mut state = self.state();
            for (key, fingerprint) in written.fingerprints {
                state.registry.set_fingerprint(key, fingerprint);
            }
        }
        for tree in &written.trees {
            tree_on_state_saved(tree);
        }
        self.metrics.checkpoint_committed();
        tracing::info!("Checkpoint committed");

        if let Err(err) = self.truncate_log(log, &written.persisted).await {
            tracing::warn!("Could not truncate the operation log: {err}");
        }
        Ok(())
    }

    fn abort(&self, writer: &mut dyn StateWriter, tombstones: BTreeSet<EntityKey>) {
        writer.rollback();
        self.state().registry.restore_tombstones(tombstones);
    }

    fn plan_checkpoint(&self, kind: CheckpointKind) -> Plan {
        let mut state = self.state();
        let registry = &mut state.registry;
        let mut items = Vec::new();
        let mut unchanged = 0;
        for entity_kind in ReactiveEntityKind::LOAD_ORDER {
            for entity in registry.iter(entity_kind) {
                let key = entity.key();
                let previous = registry.fingerprint(&key);
                let tree = match &entity.runtime {
                    EntityRuntime::Subscription(root) => Some(root.clone()),
                    _ => None,
                };
                if kind == CheckpointKind::Differential
                    && tree.is_some()
                    && previous.is_some()
                    && !entity.state_changed()
                {
                    unchanged += 1;
                    continue;
                }
                let blob = match entity.encode() {
                    Ok(blob) => PlannedBlob::Encoded(blob),
                    Err(err) => PlannedBlob::Failed(err),
                };
                items.push(PlannedItem {
                    key,
                    blob,
                    previous,
                    tree,
                });
            }
        }
        if kind == CheckpointKind::Full {
            for (key, blob) in registry.pending() {
                items.push(PlannedItem {
                    key: key.clone(),
                    blob: PlannedBlob::Encoded(blob.clone()),
                    previous: None,
                    tree: None,
                });
            }
        }
        let tombstones = registry.take_tombstones();
        Plan {
            items,
            tombstones,
            unchanged,
        }
    }

    fn write_plan(
        &self,
        writer: &mut dyn StateWriter,
        kind: CheckpointKind,
        plan: Plan,
    ) -> EngineResult<Written> {
        let mut written = Written {
            fingerprints: Vec::new(),
            trees: Vec::new(),
            persisted: BTreeSet::new(),
        };
        for item in plan.items {
            let (entity_kind, uri) = &item.key;
            let blob = match item.blob {
                PlannedBlob::Encoded(blob) => blob,
                PlannedBlob::Failed(err) => {
                    self.report_save_failure(&item.key, err)?;
                    continue;
                }
            };
            let fingerprint = seahash::hash(&blob);
            if kind == CheckpointKind::Differential && item.previous == Some(fingerprint) {
                written.trees.extend(item.tree);
                written.persisted.insert(item.key);
                continue;
            }
            if let Err(err) = write_item(writer, entity_kind.category(), uri.as_str(), &blob) {
                self.report_save_failure(&item.key, err.into())?;
                continue;
            }
            written.fingerprints.push((item.key.clone(), fingerprint));
            written.trees.extend(item.tree);
            written.persisted.insert(item.key);
        }
        if kind == CheckpointKind::Differential {
            for (entity_kind, uri) in &plan.tombstones {
                writer.delete_item(entity_kind.category(), uri.as_str())?;
            }
        }
        Ok(written)
    }

    fn report_save_failure(&self, key: &EntityKey, err: EngineError) -> EngineResult<()> {
        let (kind, uri) = key;
        let error: SharedError = Arc::new(err);
        self.metrics.save_failed(*kind);
        let mut args = ReactiveEntitySaveFailedEventArgs::new(uri.clone(), *kind, error.clone());
        self.save_failed_handlers.invoke_safe(&mut args);
        if args.handled {
            tracing::warn!("Skipping {kind} '{uri}' in checkpoint: {error}");
            Ok(())
        } else {
            tracing::error!("Could not checkpoint {kind} '{uri}': {error}");
            Err(EngineError::EntitySaveFailed {
                uri: uri.clone(),
                kind: *kind,
                source: error,
            })
        }
    }

    /// Every logged define and undefine, as of now.
    fn log_snapshot(&self) -> EngineResult<Vec<(EntityKey, LogEntry)>> {
        let Some(kv) = &self.kv else {
            return Ok(Vec::new());
        };
        let txn = kv.begin();
        let entries = read_log(txn.as_ref());
        txn.rollback();
        Ok(entries?
            .into_iter()
            .filter_map(|(key, entry)| entry.ok().map(|entry| (key, entry)))
            .collect())
    }

    /// Drop log entries a committed checkpoint made redundant: defines
    /// of entities persisted with the same record, and undefines of
    /// entities that are gone.
    async fn truncate_log(
        &self,
        snapshot: Vec<(EntityKey, LogEntry)>,
        persisted: &BTreeSet<EntityKey>,
    ) -> EngineResult<()> {
        let Some(kv) = &self.kv else {
            return Ok(());
        };
        let redundant: Vec<EntityKey> = {
            let state = self.state();
            snapshot
                .into_iter()
                .filter(|((kind, uri), entry)| match entry {
                    LogEntry::Define { record } => {
                        persisted.contains(&(*kind, uri.clone()))
                            && current_record(&state.registry, *kind, uri) == Some(record)
                    }
                    LogEntry::Undefine => {
                        !state.registry.contains(*kind, uri) && !state.registry.is_pending(*kind, uri)
                    }
                })
                .map(|(key, _)| key)
                .collect()
        };
        if redundant.is_empty() {
            return Ok(());
        }
        let mut txn = kv.begin();
        for (kind, uri) in &redundant {
            if let Err(err) = txn.remove(kind.category(), uri.as_str()) {
                txn.rollback();
                return Err(err.into());
            }
        }
        txn.commit().await?;
        tracing::debug!("Dropped {} operation log entries", redundant.len());
        Ok(())
    }
}

fn current_record<'a>(
    registry: &'a Registry,
    kind: ReactiveEntityKind,
    uri: &Uri,
) -> Option<&'a EntityRecord> {
    registry
        .iter(kind)
        .find(|entity| &entity.record.uri == uri)
        .map(|entity| &entity.record)
}

/// Parse the whole operation log, table by table in load order.
pub(super) fn read_log(
    txn: &dyn KeyValueStoreTransaction,
) -> EngineResult<Vec<(EntityKey, EngineResult<LogEntry>)>> {
    let mut entries = Vec::new();
    for kind in ReactiveEntityKind::LOAD_ORDER {
        for (key, value) in txn.iter(kind.category())? {
            let entry = serde_json::from_slice(&value).map_err(EngineError::from);
            entries.push(((kind, Uri::new(key)), entry));
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;

    use super::*;
    use crate::engine::tests::engine;
    use crate::expression::Expr;
    use crate::recovery::store::in_mem::InMemCheckpointStore;

    async fn populated() -> CheckpointingQueryEngine {
        let engine = engine();
        engine
            .define_observable("qe://obs/a", Expr::range(0, 3))
            .await
            .unwrap();
        engine
            .create_subscription(
                "qe://sub/idle",
                Expr::subscribe(Expr::Never, Expr::collect("idle")),
            )
            .await
            .unwrap();
        engine
    }

    #[tokio::test]
    async fn full_checkpoint_replaces_the_store() {
        let engine = populated().await;
        let store = InMemCheckpointStore::new();
        store.put("observables", "qe://obs/stale", b"old".to_vec());

        let reported = Mutex::new(Vec::new());
        let record_progress = |done: f64| reported.lock().unwrap().push(done);
        let progress: Progress<'_> = &record_progress;
        let mut writer = store.writer(CheckpointKind::Full);
        engine
            .checkpoint(&mut writer, CancellationToken::new(), Some(progress))
            .await
            .unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(store.get("observables", "qe://obs/stale"), None);
        let blob = store.get("subscriptions", "qe://sub/idle").unwrap();
        let (record, state) = EntityRecord::decode(&blob).unwrap();
        assert_eq!(record.uri, Uri::new("qe://sub/idle"));
        assert!(state.is_some());
        assert_eq!(reported.lock().unwrap().last(), Some(&1.0));
    }

    #[tokio::test]
    async fn differential_checkpoint_writes_only_changes() {
        let engine = populated().await;
        let store = InMemCheckpointStore::new();
        let mut writer = store.writer(CheckpointKind::Differential);
        engine
            .checkpoint(&mut writer, CancellationToken::new(), None)
            .await
            .unwrap();
        assert_eq!(store.len(), 2);

        // Nothing changed, so nothing is rewritten.
        store.put("observables", "qe://obs/a", b"sentinel".to_vec());
        store.put("subscriptions", "qe://sub/idle", b"sentinel".to_vec());
        let mut writer = store.writer(CheckpointKind::Differential);
        engine
            .checkpoint(&mut writer, CancellationToken::new(), None)
            .await
            .unwrap();
        assert_eq!(store.get("observables", "qe://obs/a"), Some(b"sentinel".to_vec()));
        assert_eq!(
            store.get("subscriptions", "qe://sub/idle"),
            Some(b"sentinel".to_vec())
        );

        engine.undefine_observable("qe://obs/a").await.unwrap();
        engine
            .define_observer("qe://obr/b", Expr::Nop)
            .await
            .unwrap();
        let mut writer = store.writer(CheckpointKind::Differential);
        engine
            .checkpoint(&mut writer, CancellationToken::new(), None)
            .await
            .unwrap();
        assert_eq!(store.get("observables", "qe://obs/a"), None);
        assert!(store.get("observers", "qe://obr/b").is_some());
    }

    #[tokio::test]
    async fn failed_commit_keeps_pending_deletions() {
        let engine = populated().await;
        let store = InMemCheckpointStore::new();
        let mut writer = store.writer(CheckpointKind::Differential);
        engine
            .checkpoint(&mut writer, CancellationToken::new(), None)
            .await
            .unwrap();

        engine.undefine_observable("qe://obs/a").await.unwrap();
        let mut failing = store.writer(CheckpointKind::Differential).failing_commit();
        let err = engine
            .checkpoint(&mut failing, CancellationToken::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err.root(), EngineError::Store(StoreError::Injected(_))));
        assert!(store.get("observables", "qe://obs/a").is_some());

        let mut writer = store.writer(CheckpointKind::Differential);
        engine
            .checkpoint(&mut writer, CancellationToken::new(), None)
            .await
            .unwrap();
        assert_eq!(store.get("observables", "qe://obs/a"), None);
    }

    #[tokio::test]
    async fn cancelled_checkpoint_commits_nothing() {
        let engine = populated().await;
        let store = InMemCheckpointStore::new();
        let token = CancellationToken::new();
        token.cancel();
        let mut writer = store.writer(CheckpointKind::Full);
        let err = engine.checkpoint(&mut writer, token, None).await.unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
        assert!(store.is_empty());
        assert_eq!(writer.staged_len(), 0);
        assert!(!engine.scheduler().is_paused());
    }

    #[tokio::test]
    async fn save_failure_is_fatal_unless_handled() {
        let engine = populated().await;
        let store = InMemCheckpointStore::new();

        let mut writer = store
            .writer(CheckpointKind::Full)
            .failing_on("observables", "qe://obs/a");
        let err = engine
            .checkpoint(&mut writer, CancellationToken::new(), None)
            .await
            .unwrap_err();
        match err {
            EngineError::EntitySaveFailed { uri, kind, .. } => {
                assert_eq!(uri, Uri::new("qe://obs/a"));
                assert_eq!(kind, ReactiveEntityKind::Observable);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(store.is_empty());

        let seen = std::sync::Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        engine.on_entity_save_failed(move |args| {
            counter.fetch_add(1, Ordering::SeqCst);
            args.handled = true;
        });
        let mut writer = store
            .writer(CheckpointKind::Full)
            .failing_on("observables", "qe://obs/a");
        engine
            .checkpoint(&mut writer, CancellationToken::new(), None)
            .await
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(store.get("observables", "qe://obs/a"), None);
        assert!(store.get("subscriptions", "qe://sub/idle").is_some());
    }

    #[tokio::test]
    async fn differential_checkpoints_keep_up_with_a_worker() {
        use serde_json::json;

        use crate::engine::tests::config;
        use crate::engine::tests::engine_with;
        use crate::observer::Notification;
        use crate::scheduler::worker::SchedulerWorker;

        let engine = engine();
        engine
            .create_subscription(
                "qe://sub/busy",
                Expr::subscribe(Expr::range(0, 1 << 40), Expr::collect("out")),
            )
            .await
            .unwrap();
        let mut worker =
            SchedulerWorker::spawn(engine.scheduler().clone(), "rxqe-checkpoint-worker").unwrap();
        let store = InMemCheckpointStore::new();
        for _ in 0..5 {
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
            let mut writer = store.writer(CheckpointKind::Differential);
            engine
                .checkpoint(&mut writer, CancellationToken::new(), None)
                .await
                .unwrap();
        }
        worker.stop();
        let mut writer = store.writer(CheckpointKind::Differential);
        engine
            .checkpoint(&mut writer, CancellationToken::new(), None)
            .await
            .unwrap();
        let delivered = engine.received("out").len() as i64;
        engine.unload();

        let restored = engine_with(config(), None);
        restored.recover(&store.reader()).await.unwrap();
        restored.scheduler().run_steps(1).unwrap();
        assert_eq!(
            restored.received("out").first(),
            Some(&Notification::Next(json!(delivered)))
        );
    }

    #[tokio::test]
    async fn checkpoint_pauses_the_scheduler() {
        let engine = populated().await;
        let pauses = std::sync::Arc::new(AtomicUsize::new(0));
        let counter = pauses.clone();
        engine.on_scheduler_pausing(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let store = InMemCheckpointStore::new();
        let mut writer = store.writer(CheckpointKind::Full);
        engine
            .checkpoint(&mut writer, CancellationToken::new(), None)
            .await
            .unwrap();
        assert_eq!(pauses.load(Ordering::SeqCst), 1);
        assert!(!engine.scheduler().is_paused());

        // A scheduler paused by the host stays paused.
        engine.scheduler().pause();
        let mut writer = store.writer(CheckpointKind::Full);
        engine
            .checkpoint(&mut writer, CancellationToken::new(), None)
            .await
            .unwrap();
        assert!(engine.scheduler().is_paused());
    }
}

//! The checkpointing query engine.
//!
//! A [`CheckpointingQueryEngine`] hosts reactive entities under URIs:
//! definitions of observables, observers, stream factories and
//! subscription factories, plus the streams and subscriptions created
//! from them. Subscriptions run on the engine's [`Scheduler`], which
//! the host drives (directly or through a
//! [`crate::scheduler::worker::SchedulerWorker`]).
//!
//! Durability comes from two places:
//!
//! - [`CheckpointingQueryEngine::checkpoint`] writes every entity,
//!   including operator state, through a [`crate::recovery::StateWriter`].
//!
//! - Every define and undefine is also logged in a
//!   [`KeyValueStore`] as it happens. [`CheckpointingQueryEngine::recover`]
//!   loads the last checkpoint and then replays that log, so nothing
//!   done between checkpoints is lost. Entries already covered by a
//!   committed checkpoint are dropped from the log.
//!
//! The engine state lock is only held for short synchronous sections.
//! Subscriptions are started and event handlers invoked after it is
//! released.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::clock::to_datetime;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::errors::EngineResult;
use crate::errors::ResultExt;
use crate::errors::SharedError;
use crate::errors::StoreError;
use crate::expression::Expr;
use crate::metrics::EngineMetrics;
use crate::observer::operator::load_tree;
use crate::observer::operator::OperatorExt;
use crate::observer::state::OperatorStateReader;
use crate::observer::Notification;
use crate::observer::Value;
use crate::operators::Collector;
use crate::operators::Collectors;
use crate::operators::Subject;
use crate::operators::SubjectArena;
use crate::recovery::kv::KeyValueStore;
use crate::recovery::kv::KeyValueStoreTransaction;
use crate::scheduler::Scheduler;

use self::binder::check_definition;
use self::binder::Binder;
use self::entity::EntityRecord;
use self::entity::ReactiveEntityKind;
use self::entity::ReactiveEntitySnapshot;
use self::entity::Uri;
use self::events::EventHandlers;
use self::events::HandlerId;
use self::events::ReactiveEntityLoadFailedEventArgs;
use self::events::ReactiveEntityReplayFailedEventArgs;
use self::events::ReactiveEntitySaveFailedEventArgs;
use self::events::SchedulerPausingEventArgs;
use self::metadata::ReactiveMetadata;
use self::registry::EntityRuntime;
use self::registry::ReactiveEntity;
use self::registry::Registry;

pub mod artifacts;
pub mod binder;
mod checkpoint;
pub mod entity;
pub mod events;
pub mod metadata;
pub mod mitigation;
mod recover;
pub mod registry;

/// What the key-value log records for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(crate) enum LogEntry {
    Define { record: EntityRecord },
    Undefine,
}

/// Name of the URI argument of operations on `kind`.
fn param(kind: ReactiveEntityKind) -> &'static str {
    match kind {
        ReactiveEntityKind::Observable => "observable_uri",
        ReactiveEntityKind::Observer => "observer_uri",
        ReactiveEntityKind::Stream => "stream_uri",
        ReactiveEntityKind::StreamFactory => "stream_factory_uri",
        ReactiveEntityKind::Subscription => "subscription_uri",
        ReactiveEntityKind::SubscriptionFactory => "subscription_factory_uri",
    }
}

fn upsert(
    txn: &mut dyn KeyValueStoreTransaction,
    table: &str,
    key: &str,
    value: Vec<u8>,
) -> Result<(), StoreError> {
    if txn.contains(table, key)? {
        txn.update(table, key, value)
    } else {
        txn.add(table, key, value)
    }
}

struct EngineState {
    registry: Registry,
    subjects: Arc<SubjectArena>,
}

pub struct CheckpointingQueryEngine {
    uri: Uri,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    kv: Option<Arc<dyn KeyValueStore>>,
    scheduler: Scheduler,
    state: Mutex<EngineState>,
    collectors: Arc<Collectors>,
    unloaded: AtomicBool,
    load_failed_handlers: EventHandlers<ReactiveEntityLoadFailedEventArgs>,
    save_failed_handlers: EventHandlers<ReactiveEntitySaveFailedEventArgs>,
    replay_failed_handlers: EventHandlers<ReactiveEntityReplayFailedEventArgs>,
    metrics: EngineMetrics,
}

impl CheckpointingQueryEngine {
    pub fn new(
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        kv: Option<Arc<dyn KeyValueStore>>,
    ) -> EngineResult<Self> {
        config.validate()?;
        let uri = config.uri.clone();
        tracing::info!(
            "Starting engine {uri}; key-value log {}",
            if kv.is_some() { "enabled" } else { "disabled" }
        );
        Ok(Self {
            scheduler: Scheduler::new(config.scheduler.clone()),
            state: Mutex::new(EngineState {
                registry: Registry::new(uri.clone()),
                subjects: Arc::new(SubjectArena::new()),
            }),
            collectors: Arc::new(Collectors::default()),
            unloaded: AtomicBool::new(false),
            load_failed_handlers: EventHandlers::new(),
            save_failed_handlers: EventHandlers::new(),
            replay_failed_handlers: EventHandlers::new(),
            metrics: EngineMetrics::new(&uri),
            uri,
            config,
            clock,
            kv,
        })
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// The named sink `Collect` observers deliver into.
    pub fn collector(&self, name: &str) -> Collector {
        self.collectors.get_or_create(name)
    }

    /// Everything the named sink received so far.
    pub fn received(&self, name: &str) -> Vec<Notification<Value>> {
        self.collectors.received(name)
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn ensure_loaded(&self) -> EngineResult<()> {
        if self.unloaded.load(Ordering::Acquire) {
            return Err(EngineError::unloaded());
        }
        Ok(())
    }

    fn now(&self) -> EngineResult<DateTime<Utc>> {
        to_datetime(self.clock.now()?)
    }

    pub fn is_unloaded(&self) -> bool {
        self.unloaded.load(Ordering::Acquire)
    }

    pub async fn define_observable(&self, uri: impl Into<Uri>, expr: Expr) -> EngineResult<()> {
        self.add_entity(ReactiveEntityKind::Observable, uri.into(), expr)
            .await
    }

    pub async fn undefine_observable(&self, uri: impl Into<Uri>) -> EngineResult<()> {
        self.remove_entity(ReactiveEntityKind::Observable, uri.into())
            .await
    }

    pub async fn define_observer(&self, uri: impl Into<Uri>, expr: Expr) -> EngineResult<()> {
        self.add_entity(ReactiveEntityKind::Observer, uri.into(), expr)
            .await
    }

    pub async fn undefine_observer(&self, uri: impl Into<Uri>) -> EngineResult<()> {
        self.remove_entity(ReactiveEntityKind::Observer, uri.into())
            .await
    }

    pub async fn define_stream_factory(&self, uri: impl Into<Uri>, expr: Expr) -> EngineResult<()> {
        self.add_entity(ReactiveEntityKind::StreamFactory, uri.into(), expr)
            .await
    }

    pub async fn undefine_stream_factory(&self, uri: impl Into<Uri>) -> EngineResult<()> {
        self.remove_entity(ReactiveEntityKind::StreamFactory, uri.into())
            .await
    }

    pub async fn define_subscription_factory(
        &self,
        uri: impl Into<Uri>,
        expr: Expr,
    ) -> EngineResult<()> {
        self.add_entity(ReactiveEntityKind::SubscriptionFactory, uri.into(), expr)
            .await
    }

    pub async fn undefine_subscription_factory(&self, uri: impl Into<Uri>) -> EngineResult<()> {
        self.remove_entity(ReactiveEntityKind::SubscriptionFactory, uri.into())
            .await
    }

    /// Create a stream from a stream factory. The stream keeps the
    /// factory's body, so it survives the factory being undefined.
    pub async fn create_stream(
        &self,
        uri: impl Into<Uri>,
        factory_uri: impl Into<Uri>,
    ) -> EngineResult<()> {
        let factory_uri = factory_uri.into();
        self.add_entity(
            ReactiveEntityKind::Stream,
            uri.into(),
            Expr::Ref { uri: factory_uri },
        )
        .await
    }

    /// Delete a stream. Fails while subscriptions still use it.
    pub async fn delete_stream(&self, uri: impl Into<Uri>) -> EngineResult<()> {
        self.remove_entity(ReactiveEntityKind::Stream, uri.into())
            .await
    }

    /// Bind, subscribe and start a subscription. `expr` is either a
    /// `Subscribe` expression or a reference to a subscription factory.
    /// The definitions it references are expanded into the recorded
    /// expression; references to streams are kept.
    pub async fn create_subscription(&self, uri: impl Into<Uri>, expr: Expr) -> EngineResult<()> {
        self.add_entity(ReactiveEntityKind::Subscription, uri.into(), expr)
            .await
    }

    pub async fn delete_subscription(&self, uri: impl Into<Uri>) -> EngineResult<()> {
        self.remove_entity(ReactiveEntityKind::Subscription, uri.into())
            .await
    }

    pub fn get_entity(
        &self,
        kind: ReactiveEntityKind,
        uri: impl Into<Uri>,
    ) -> EngineResult<ReactiveEntitySnapshot> {
        self.ensure_loaded()?;
        let uri = uri.into();
        let state = self.state();
        Ok(state.registry.get(kind, &uri, param(kind))?.snapshot())
    }

    pub fn entities(&self, kind: ReactiveEntityKind) -> EngineResult<Vec<ReactiveEntitySnapshot>> {
        self.ensure_loaded()?;
        Ok(self
            .state()
            .registry
            .iter(kind)
            .map(ReactiveEntity::snapshot)
            .collect())
    }

    /// Entities that failed to load and were ignored. Their checkpoint
    /// blobs are carried forward so a later recovery retries them.
    pub fn ignored_entities(&self, kind: ReactiveEntityKind) -> EngineResult<Vec<Uri>> {
        self.ensure_loaded()?;
        Ok(self.state().registry.pending_uris(kind))
    }

    /// Number of readers and writers attached to a stream.
    pub fn stream_ref_count(&self, uri: impl Into<Uri>) -> EngineResult<usize> {
        self.ensure_loaded()?;
        let uri = uri.into();
        let state = self.state();
        let handle = state.registry.stream(&uri).ok_or_else(|| EngineError::EntityNotFound {
            uri: uri.clone(),
            kind: ReactiveEntityKind::Stream,
            engine_uri: self.uri.clone(),
            param: param(ReactiveEntityKind::Stream),
        })?;
        state.subjects.ref_count(handle)
    }

    pub fn on_entity_load_failed(
        &self,
        handler: impl Fn(&mut ReactiveEntityLoadFailedEventArgs) + Send + Sync + 'static,
    ) -> HandlerId {
        self.load_failed_handlers.subscribe(handler)
    }

    pub fn on_entity_save_failed(
        &self,
        handler: impl Fn(&mut ReactiveEntitySaveFailedEventArgs) + Send + Sync + 'static,
    ) -> HandlerId {
        self.save_failed_handlers.subscribe(handler)
    }

    pub fn on_entity_replay_failed(
        &self,
        handler: impl Fn(&mut ReactiveEntityReplayFailedEventArgs) + Send + Sync + 'static,
    ) -> HandlerId {
        self.replay_failed_handlers.subscribe(handler)
    }

    pub fn on_scheduler_pausing(
        &self,
        handler: impl Fn(&mut SchedulerPausingEventArgs) + Send + Sync + 'static,
    ) -> HandlerId {
        self.scheduler.on_pausing(handler)
    }

    /// Dispose every subscription and drop all entities. Every later
    /// call fails with [`EngineError::EngineUnloaded`].
    pub fn unload(&self) {
        if self.unloaded.swap(true, Ordering::AcqRel) {
            return;
        }
        let (entities, subjects) = {
            let mut state = self.state();
            (state.registry.clear(), state.subjects.clone())
        };
        let count = entities.len();
        for entity in entities.iter() {
            entity.dispose();
        }
        drop(entities);
        subjects.clear();
        tracing::info!("Engine {} unloaded; dropped {count} entities", self.uri);
    }

    async fn add_entity(&self, kind: ReactiveEntityKind, uri: Uri, expr: Expr) -> EngineResult<()> {
        self.ensure_loaded()?;
        check_definition(kind, &expr)?;
        let expr = self.inline(kind, &expr)?;
        let record = EntityRecord::new(uri.clone(), kind, expr, self.now()?);
        let entry = LogEntry::Define {
            record: record.clone(),
        };
        self.instantiate(record, None)?;
        if let Err(err) = self.log(kind, &uri, &entry).await {
            tracing::warn!("Undoing {kind} '{uri}': {err}");
            self.discard(kind, &uri);
            return Err(err);
        }
        tracing::debug!("Added {kind} '{uri}'");
        Ok(())
    }

    async fn remove_entity(&self, kind: ReactiveEntityKind, uri: Uri) -> EngineResult<()> {
        self.ensure_loaded()?;
        self.check_removable(kind, &uri)?;
        self.log(kind, &uri, &LogEntry::Undefine).await?;
        self.drop_entity(kind, &uri)?;
        tracing::debug!("Removed {kind} '{uri}'");
        Ok(())
    }

    fn check_removable(&self, kind: ReactiveEntityKind, uri: &Uri) -> EngineResult<()> {
        let state = self.state();
        if state.registry.is_pending(kind, uri) {
            return Ok(());
        }
        let entity = state.registry.get(kind, uri, param(kind))?;
        if let EntityRuntime::Stream { handle, .. } = &entity.runtime {
            let refs = state.subjects.ref_count(*handle)?;
            if refs > 0 {
                return Err(EngineError::InvalidOperation(format!(
                    "stream '{uri}' is still used by {refs} subscriptions"
                )));
            }
        }
        Ok(())
    }

    /// Remove an entity (or its ignored blob) and stop it.
    pub(crate) fn drop_entity(&self, kind: ReactiveEntityKind, uri: &Uri) -> EngineResult<()> {
        let entity = {
            let mut state = self.state();
            if !state.registry.contains(kind, uri) && state.registry.drop_pending(kind, uri) {
                return Ok(());
            }
            if let Some(handle) = state.registry.stream(uri).filter(|_| kind == ReactiveEntityKind::Stream) {
                let refs = state.subjects.ref_count(handle)?;
                if refs > 0 {
                    return Err(EngineError::InvalidOperation(format!(
                        "stream '{uri}' is still used by {refs} subscriptions"
                    )));
                }
                state.subjects.remove(handle)?;
            }
            state.registry.remove(kind, uri, param(kind))?
        };
        entity.dispose();
        Ok(())
    }

    fn inline(&self, kind: ReactiveEntityKind, expr: &Expr) -> EngineResult<Expr> {
        let state = self.state();
        Binder::new(&state.registry, &state.subjects, &self.collectors, &self.scheduler)
            .inline(kind, expr)
    }

    /// Take back an entity that was added but must not stay.
    fn discard(&self, kind: ReactiveEntityKind, uri: &Uri) {
        let entity = {
            let mut state = self.state();
            let entity = state.registry.discard(kind, uri);
            if let Some(EntityRuntime::Stream { handle, .. }) = entity.as_ref().map(|e| &e.runtime) {
                if let Err(err) = state.subjects.remove(*handle) {
                    tracing::debug!("Stream '{uri}' was already gone: {err}");
                }
            }
            entity
        };
        if let Some(entity) = entity {
            entity.dispose();
        }
    }

    /// Build the runtime of an entity and register it. Subscriptions
    /// are started once registered.
    pub(crate) fn instantiate(&self, record: EntityRecord, state: Option<&[u8]>) -> EngineResult<()> {
        let kind = record.kind;
        let uri = record.uri.clone();
        check_definition(kind, &record.expression)?;

        let root = {
            let mut guard = self.state();
            // `unload` may have run since the caller checked.
            self.ensure_loaded()?;
            let EngineState { registry, subjects } = &mut *guard;
            registry.ensure_absent(kind, &uri, param(kind))?;
            let runtime = match kind {
                ReactiveEntityKind::Stream => {
                    // A record may still name its factory.
                    if let Expr::Ref { uri: factory_uri } = &record.expression {
                        if registry.definition(ReactiveEntityKind::StreamFactory, factory_uri)
                            != Some(&Expr::Subject)
                        {
                            return Err(EngineError::InvalidExpression(format!(
                                "'{factory_uri}' is not a known stream factory"
                            )));
                        }
                    }
                    let subject = Arc::new(Subject::new());
                    if let Some(bytes) = state {
                        subject
                            .load_state(&mut OperatorStateReader::new(bytes))
                            .reraise_with(|| format!("error restoring stream '{uri}'"))?;
                    }
                    let handle = subjects.insert(subject.clone());
                    EntityRuntime::Stream { handle, subject }
                }
                ReactiveEntityKind::Subscription => {
                    let binder = Binder::new(&*registry, &*subjects, &self.collectors, &self.scheduler);
                    let root = binder.bind_subscription(&record.expression)?;
                    root.subscribe()?;
                    if let Some(bytes) = state {
                        load_tree(&root, &mut OperatorStateReader::new(bytes))
                            .reraise_with(|| format!("error restoring subscription '{uri}'"))?;
                    }
                    EntityRuntime::Subscription(root)
                }
                _ => EntityRuntime::None,
            };
            let root = match &runtime {
                EntityRuntime::Subscription(root) => Some(root.clone()),
                _ => None,
            };
            registry.add(ReactiveEntity::new(record, runtime), param(kind))?;
            root
        };

        if let Some(root) = root {
            if let Err(err) = root.start() {
                self.discard(kind, &uri);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Record a change in the key-value log, if there is one.
    async fn log(&self, kind: ReactiveEntityKind, uri: &Uri, entry: &LogEntry) -> EngineResult<()> {
        let Some(kv) = &self.kv else {
            return Ok(());
        };
        let value = serde_json::to_vec(entry)?;
        let mut txn = kv.begin();
        if let Err(err) = upsert(txn.as_mut(), kind.category(), uri.as_str(), value) {
            txn.rollback();
            return Err(err.into());
        }
        txn.commit()
            .await
            .reraise_with(|| format!("error logging {kind} '{uri}'"))
    }

    fn report_replay_failure(
        &self,
        kind: ReactiveEntityKind,
        uri: &Uri,
        err: EngineError,
    ) -> EngineResult<()> {
        let error: SharedError = Arc::new(err);
        self.metrics.replay_failed(kind);
        let mut args = ReactiveEntityReplayFailedEventArgs::new(uri.clone(), kind, error.clone());
        self.replay_failed_handlers.invoke_safe(&mut args);
        if args.handled {
            tracing::warn!("Replay of {kind} '{uri}' failed and was handled: {error}");
            Ok(())
        } else {
            tracing::error!("Replay of {kind} '{uri}' failed: {error}");
            Err(EngineError::EntityReplayFailed {
                uri: uri.clone(),
                kind,
                source: error,
            })
        }
    }
}

impl Drop for CheckpointingQueryEngine {
    fn drop(&mut self) {
        self.unload();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::clock::TestingClock;
    use crate::errors::ENGINE_UNLOADED_MESSAGE;
    use crate::recovery::kv::InMemKeyValueStore;

    pub(crate) fn config() -> EngineConfig {
        let mut config = EngineConfig::default().with_uri("qe://engine/test");
        config.scheduler.batch_size = 4;
        config
    }

    pub(crate) fn engine_with(
        config: EngineConfig,
        kv: Option<InMemKeyValueStore>,
    ) -> CheckpointingQueryEngine {
        let clock = Arc::new(TestingClock::new(1_000, 10));
        CheckpointingQueryEngine::new(
            config,
            clock,
            kv.map(|kv| Arc::new(kv) as Arc<dyn KeyValueStore>),
        )
        .unwrap()
    }

    pub(crate) fn engine() -> CheckpointingQueryEngine {
        engine_with(config(), None)
    }

    #[tokio::test]
    async fn define_twice_is_already_exists() {
        let engine = engine();
        engine
            .define_observable("qe://obs/a", Expr::range(0, 3))
            .await
            .unwrap();
        let err = engine
            .define_observable("qe://obs/a", Expr::Empty)
            .await
            .unwrap_err();
        match err {
            EngineError::EntityAlreadyExists {
                uri,
                kind,
                engine_uri,
                param,
            } => {
                assert_eq!(uri, Uri::new("qe://obs/a"));
                assert_eq!(kind, ReactiveEntityKind::Observable);
                assert_eq!(engine_uri, Uri::new("qe://engine/test"));
                assert_eq!(param, "observable_uri");
            }
            other => panic!("unexpected error {other:?}"),
        }
        // Same URI, other kind.
        engine.define_observer("qe://obs/a", Expr::Nop).await.unwrap();
    }

    #[tokio::test]
    async fn missing_entities_are_not_found() {
        let engine = engine();
        for err in [
            engine.undefine_observer("qe://nope").await.unwrap_err(),
            engine
                .get_entity(ReactiveEntityKind::Subscription, "qe://nope")
                .unwrap_err(),
            engine.delete_stream("qe://nope").await.unwrap_err(),
        ] {
            match err {
                EngineError::EntityNotFound { uri, .. } => assert_eq!(uri, Uri::new("qe://nope")),
                other => panic!("unexpected error {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn subscriptions_run_on_the_scheduler() {
        let engine = engine();
        engine
            .define_observable("qe://obs/xs", Expr::range(1, 10))
            .await
            .unwrap();
        engine
            .create_subscription(
                "qe://sub/1",
                Expr::subscribe(
                    Expr::take(Expr::reference("qe://obs/xs"), 3),
                    Expr::collect("out"),
                ),
            )
            .await
            .unwrap();
        assert!(engine.received("out").is_empty());
        engine.scheduler().run_until_idle().unwrap();
        assert_eq!(
            engine.received("out"),
            vec![
                Notification::Next(json!(1)),
                Notification::Next(json!(2)),
                Notification::Next(json!(3)),
                Notification::Completed
            ]
        );
        let snapshot = engine
            .get_entity(ReactiveEntityKind::Subscription, "qe://sub/1")
            .unwrap();
        assert!(snapshot.is_terminated);
        assert_eq!(snapshot.record.lifetime.time().timestamp_millis(), 1_010);
    }

    #[tokio::test]
    async fn invalid_definitions_are_rejected() {
        let engine = engine();
        assert!(matches!(
            engine.define_observable("qe://obs/a", Expr::Nop).await,
            Err(EngineError::InvalidExpression(_))
        ));
        assert!(matches!(
            engine
                .create_subscription(
                    "qe://sub/a",
                    Expr::subscribe(Expr::reference("qe://obs/missing"), Expr::Nop)
                )
                .await,
            Err(EngineError::InvalidExpression(_))
        ));
        assert!(engine
            .entities(ReactiveEntityKind::Subscription)
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn streams_connect_subscriptions() {
        let engine = engine();
        engine
            .define_stream_factory("qe://factory/subject", Expr::Subject)
            .await
            .unwrap();
        engine
            .create_stream("qe://stream/s", "qe://factory/subject")
            .await
            .unwrap();
        engine
            .create_subscription(
                "qe://sub/read",
                Expr::subscribe(Expr::reference("qe://stream/s"), Expr::collect("read")),
            )
            .await
            .unwrap();
        engine
            .create_subscription(
                "qe://sub/write",
                Expr::subscribe(Expr::range(0, 2), Expr::reference("qe://stream/s")),
            )
            .await
            .unwrap();
        assert_eq!(engine.stream_ref_count("qe://stream/s").unwrap(), 2);

        engine.scheduler().run_until_idle().unwrap();
        assert_eq!(
            engine.received("read"),
            vec![
                Notification::Next(json!(0)),
                Notification::Next(json!(1)),
                Notification::Completed
            ]
        );
        assert!(
            engine
                .get_entity(ReactiveEntityKind::Stream, "qe://stream/s")
                .unwrap()
                .is_terminated
        );

        // The writer still holds the stream.
        assert!(matches!(
            engine.delete_stream("qe://stream/s").await,
            Err(EngineError::InvalidOperation(_))
        ));
        engine.delete_subscription("qe://sub/write").await.unwrap();
        engine.delete_subscription("qe://sub/read").await.unwrap();
        engine.delete_stream("qe://stream/s").await.unwrap();
    }

    #[tokio::test]
    async fn stream_needs_a_subject_factory() {
        let engine = engine();
        engine
            .define_observable("qe://obs/a", Expr::Empty)
            .await
            .unwrap();
        assert!(matches!(
            engine.create_stream("qe://stream/s", "qe://obs/a").await,
            Err(EngineError::InvalidExpression(_))
        ));
    }

    #[tokio::test]
    async fn defines_are_logged_and_rolled_back_on_log_failure() {
        let kv = InMemKeyValueStore::new();
        let engine = engine_with(config(), Some(kv.clone()));
        engine
            .define_observable("qe://obs/a", Expr::Empty)
            .await
            .unwrap();
        assert_eq!(kv.len(), 1);

        kv.set_failing(true);
        assert!(engine
            .define_observable("qe://obs/b", Expr::Empty)
            .await
            .is_err());
        assert!(engine
            .get_entity(ReactiveEntityKind::Observable, "qe://obs/b")
            .is_err());
        assert!(engine.undefine_observable("qe://obs/a").await.is_err());
        assert!(engine
            .get_entity(ReactiveEntityKind::Observable, "qe://obs/a")
            .is_ok());

        kv.set_failing(false);
        engine.undefine_observable("qe://obs/a").await.unwrap();
        let txn = kv.begin();
        let logged: LogEntry =
            serde_json::from_slice(&txn.get("observables", "qe://obs/a").unwrap().unwrap())
                .unwrap();
        assert_eq!(logged, LogEntry::Undefine);
    }

    #[tokio::test]
    async fn unloaded_engine_refuses_everything() {
        let engine = engine();
        engine
            .create_subscription(
                "qe://sub/never",
                Expr::subscribe(Expr::Never, Expr::collect("out")),
            )
            .await
            .unwrap();
        engine.unload();
        engine.unload();
        assert!(engine.is_unloaded());

        let err = engine
            .define_observable("qe://obs/a", Expr::Empty)
            .await
            .unwrap_err();
        assert!(err.is_invalid_operation());
        assert_eq!(err.to_string(), ENGINE_UNLOADED_MESSAGE);
        assert!(matches!(
            engine.entities(ReactiveEntityKind::Subscription),
            Err(EngineError::EngineUnloaded { .. })
        ));
        assert!(matches!(
            engine.delete_subscription("qe://sub/never").await,
            Err(EngineError::EngineUnloaded { .. })
        ));
    }

    #[tokio::test]
    async fn unload_between_check_and_registration_wins() {
        let engine = engine();
        let record = EntityRecord::new(
            Uri::new("qe://sub/late"),
            ReactiveEntityKind::Subscription,
            Expr::subscribe(Expr::range(0, 3), Expr::collect("late")),
            engine.now().unwrap(),
        );
        // As if `add_entity` had passed its check just before this.
        engine.unload();
        assert!(matches!(
            engine.instantiate(record, None),
            Err(EngineError::EngineUnloaded { .. })
        ));
        assert_eq!(engine.scheduler().run_until_idle().unwrap(), 0);
        assert!(engine.received("late").is_empty());
        assert!(engine.state().registry.iter(ReactiveEntityKind::Subscription).next().is_none());
    }
}

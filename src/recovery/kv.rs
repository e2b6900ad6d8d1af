//! Transactional key-value log.
//!
//! The engine records every define and undefine in a
//! [`KeyValueStore`] as it happens, so work done between checkpoints
//! is not lost. Each transaction reads through its own uncommitted
//! changes; nothing is visible to other transactions until
//! [`KeyValueStoreTransaction::commit`].

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use super::store::ItemKey;
use super::CommitFuture;
use crate::errors::StoreError;

pub trait KeyValueStore: Send + Sync {
    fn begin(&self) -> Box<dyn KeyValueStoreTransaction>;
}

pub trait KeyValueStoreTransaction: Send {
    /// Fails with [`StoreError::KeyExists`] if the key is present.
    fn add(&mut self, table: &str, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Fails with [`StoreError::KeyNotFound`] if the key is absent.
    fn update(&mut self, table: &str, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Fails with [`StoreError::KeyNotFound`] if the key is absent.
    fn remove(&mut self, table: &str, key: &str) -> Result<(), StoreError>;

    fn get(&self, table: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn contains(&self, table: &str, key: &str) -> Result<bool, StoreError> {
        Ok(self.get(table, key)?.is_some())
    }

    /// All entries of a table, ordered by key.
    fn iter(&self, table: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;

    fn commit(self: Box<Self>) -> CommitFuture<'static>;

    fn rollback(self: Box<Self>);
}

/// Committed storage under an [`OverlayTransaction`].
pub(crate) trait KvBackend: Send + Sync + 'static {
    fn get(&self, table: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn scan(&self, table: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;

    /// Atomically apply puts (`Some`) and deletes (`None`).
    fn apply(&self, changes: BTreeMap<ItemKey, Option<Vec<u8>>>) -> Result<(), StoreError>;
}

/// Buffers changes in memory on top of a backend.
pub(crate) struct OverlayTransaction<B> {
    backend: Arc<B>,
    overlay: BTreeMap<ItemKey, Option<Vec<u8>>>,
}

impl<B: KvBackend> OverlayTransaction<B> {
    pub(crate) fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            overlay: BTreeMap::new(),
        }
    }

    fn item(table: &str, key: &str) -> ItemKey {
        (table.to_owned(), key.to_owned())
    }
}

impl<B: KvBackend> KeyValueStoreTransaction for OverlayTransaction<B> {
    fn add(&mut self, table: &str, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        if self.contains(table, key)? {
            return Err(StoreError::KeyExists {
                table: table.to_owned(),
                key: key.to_owned(),
            });
        }
        self.overlay.insert(Self::item(table, key), Some(value));
        Ok(())
    }

    fn update(&mut self, table: &str, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        if !self.contains(table, key)? {
            return Err(StoreError::KeyNotFound {
                table: table.to_owned(),
                key: key.to_owned(),
            });
        }
        self.overlay.insert(Self::item(table, key), Some(value));
        Ok(())
    }

    fn remove(&mut self, table: &str, key: &str) -> Result<(), StoreError> {
        if !self.contains(table, key)? {
            return Err(StoreError::KeyNotFound {
                table: table.to_owned(),
                key: key.to_owned(),
            });
        }
        self.overlay.insert(Self::item(table, key), None);
        Ok(())
    }

    fn get(&self, table: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match self.overlay.get(&Self::item(table, key)) {
            Some(staged) => Ok(staged.clone()),
            None => self.backend.get(table, key),
        }
    }

    fn iter(&self, table: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let mut entries: BTreeMap<String, Vec<u8>> =
            self.backend.scan(table)?.into_iter().collect();
        for ((item_table, key), staged) in self.overlay.iter() {
            if item_table != table {
                continue;
            }
            match staged {
                Some(value) => entries.insert(key.clone(), value.clone()),
                None => entries.remove(key),
            };
        }
        Ok(entries.into_iter().collect())
    }

    fn commit(self: Box<Self>) -> CommitFuture<'static> {
        let Self { backend, overlay } = *self;
        Box::pin(async move {
            if overlay.is_empty() {
                return Ok(());
            }
            tracing::trace!("Committing {} key-value changes", overlay.len());
            backend.apply(overlay)
        })
    }

    fn rollback(self: Box<Self>) {
        tracing::trace!("Rolling back {} key-value changes", self.overlay.len());
    }
}

#[derive(Debug, Default)]
struct InMemKv {
    entries: Mutex<BTreeMap<ItemKey, Vec<u8>>>,
    fail_commits: AtomicBool,
}

impl InMemKv {
    fn entries(&self) -> std::sync::MutexGuard<'_, BTreeMap<ItemKey, Vec<u8>>> {
        self.entries.lock().unwrap_or_else(|err| err.into_inner())
    }
}

impl KvBackend for InMemKv {
    fn get(&self, table: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .entries()
            .get(&(table.to_owned(), key.to_owned()))
            .cloned())
    }

    fn scan(&self, table: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        Ok(self
            .entries()
            .iter()
            .filter(|((item_table, _), _)| item_table == table)
            .map(|((_, key), value)| (key.clone(), value.clone()))
            .collect())
    }

    fn apply(&self, changes: BTreeMap<ItemKey, Option<Vec<u8>>>) -> Result<(), StoreError> {
        if self.fail_commits.load(Ordering::Acquire) {
            return Err(StoreError::Injected(
                "injected key-value commit failure".to_owned(),
            ));
        }
        let mut entries = self.entries();
        for (item, change) in changes {
            match change {
                Some(value) => entries.insert(item, value),
                None => entries.remove(&item),
            };
        }
        Ok(())
    }
}

/// Key-value log kept in process memory. Clones share entries.
#[derive(Debug, Clone, Default)]
pub struct InMemKeyValueStore {
    backend: Arc<InMemKv>,
}

impl InMemKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following commit fail without applying anything.
    pub fn set_failing(&self, failing: bool) {
        self.backend.fail_commits.store(failing, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.backend.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for InMemKeyValueStore {
    fn begin(&self) -> Box<dyn KeyValueStoreTransaction> {
        Box::new(OverlayTransaction::new(self.backend.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transaction_reads_its_own_writes() {
        let store = InMemKeyValueStore::new();
        let mut txn = store.begin();
        txn.add("observables", "a", b"1".to_vec()).unwrap();
        assert_eq!(txn.get("observables", "a").unwrap(), Some(b"1".to_vec()));
        assert!(store.begin().get("observables", "a").unwrap().is_none());

        txn.commit().await.unwrap();
        let txn = store.begin();
        assert!(txn.contains("observables", "a").unwrap());
        assert!(!txn.contains("observers", "a").unwrap());
    }

    #[tokio::test]
    async fn add_update_remove_check_presence() {
        let store = InMemKeyValueStore::new();
        let mut txn = store.begin();
        assert!(matches!(
            txn.update("t", "k", vec![]),
            Err(StoreError::KeyNotFound { .. })
        ));
        assert!(matches!(
            txn.remove("t", "k"),
            Err(StoreError::KeyNotFound { .. })
        ));
        txn.add("t", "k", b"1".to_vec()).unwrap();
        assert!(matches!(
            txn.add("t", "k", vec![]),
            Err(StoreError::KeyExists { .. })
        ));
        txn.update("t", "k", b"2".to_vec()).unwrap();
        txn.add("t", "j", b"3".to_vec()).unwrap();
        txn.commit().await.unwrap();

        let mut txn = store.begin();
        txn.remove("t", "j").unwrap();
        txn.add("t", "l", b"4".to_vec()).unwrap();
        assert_eq!(
            txn.iter("t").unwrap(),
            vec![("k".to_owned(), b"2".to_vec()), ("l".to_owned(), b"4".to_vec())]
        );
        txn.rollback();
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn failing_commit_applies_nothing() {
        let store = InMemKeyValueStore::new();
        store.set_failing(true);
        let mut txn = store.begin();
        txn.add("t", "k", b"1".to_vec()).unwrap();
        assert!(txn.commit().await.is_err());
        assert!(store.is_empty());
    }
}

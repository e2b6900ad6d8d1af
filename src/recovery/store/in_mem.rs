//! In-memory checkpoint store.
//!
//! All writers and readers made from one [`InMemCheckpointStore`]
//! share its items. Readers work on a snapshot taken when they are
//! created. Writers can be told to fail on purpose, to exercise the
//! engine's failure handling.

use std::collections::BTreeMap;
use std::io::Read;
use std::io::Write;
use std::sync::Arc;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

use super::ItemKey;
use super::StagedChanges;
use crate::errors::StoreError;
use crate::recovery::CheckpointKind;
use crate::recovery::CommitFuture;
use crate::recovery::Progress;
use crate::recovery::StateReader;
use crate::recovery::StateWriter;

type Items = BTreeMap<ItemKey, Vec<u8>>;

#[derive(Debug, Clone, Default)]
pub struct InMemCheckpointStore {
    items: Arc<Mutex<Items>>,
}

impl InMemCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn items(&self) -> std::sync::MutexGuard<'_, Items> {
        self.items.lock().unwrap_or_else(|err| err.into_inner())
    }

    pub fn writer(&self, kind: CheckpointKind) -> InMemStateWriter {
        InMemStateWriter {
            store: self.clone(),
            kind,
            staged: StagedChanges::default(),
            fail_on: None,
            fail_commit: false,
        }
    }

    pub fn reader(&self) -> InMemStateReader {
        InMemStateReader {
            items: self.items().clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, category: &str, key: &str) -> Option<Vec<u8>> {
        self.items()
            .get(&(category.to_owned(), key.to_owned()))
            .cloned()
    }

    /// Overwrite an item outside of any checkpoint.
    pub fn put(&self, category: &str, key: &str, blob: Vec<u8>) {
        self.items()
            .insert((category.to_owned(), key.to_owned()), blob);
    }
}

pub struct InMemStateWriter {
    store: InMemCheckpointStore,
    kind: CheckpointKind,
    staged: StagedChanges,
    fail_on: Option<ItemKey>,
    fail_commit: bool,
}

impl InMemStateWriter {
    /// Make [`StateWriter::item_writer`] fail for one item.
    pub fn failing_on(mut self, category: &str, key: &str) -> Self {
        self.fail_on = Some((category.to_owned(), key.to_owned()));
        self
    }

    /// Make [`StateWriter::commit`] fail without applying anything.
    pub fn failing_commit(mut self) -> Self {
        self.fail_commit = true;
        self
    }

    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }
}

impl StateWriter for InMemStateWriter {
    fn checkpoint_kind(&self) -> CheckpointKind {
        self.kind
    }

    fn item_writer(
        &mut self,
        category: &str,
        key: &str,
    ) -> Result<Box<dyn Write + Send + '_>, StoreError> {
        if let Some((fail_category, fail_key)) = &self.fail_on {
            if fail_category == category && fail_key == key {
                return Err(StoreError::Injected(format!(
                    "injected failure writing {category}/{key}"
                )));
            }
        }
        Ok(Box::new(self.staged.stage_write(category, key)))
    }

    fn delete_item(&mut self, category: &str, key: &str) -> Result<(), StoreError> {
        self.staged.stage_delete(category, key);
        Ok(())
    }

    fn commit<'a>(
        &'a mut self,
        token: CancellationToken,
        progress: Option<Progress<'a>>,
    ) -> CommitFuture<'a> {
        Box::pin(async move {
            if token.is_cancelled() {
                return Err(StoreError::Cancelled);
            }
            let staged = self.staged.take();
            if self.fail_commit {
                return Err(StoreError::Injected("injected commit failure".to_owned()));
            }
            let mut items = self.store.items();
            match self.kind {
                CheckpointKind::Full => items.clear(),
                CheckpointKind::Differential => {
                    for item in staged.deletes.iter() {
                        items.remove(item);
                    }
                }
            }
            items.extend(staged.writes);
            tracing::trace!("Committed checkpoint; store holds {} items", items.len());
            if let Some(progress) = progress {
                progress(1.0);
            }
            Ok(())
        })
    }

    fn rollback(&mut self) {
        self.staged.take();
    }
}

/// Snapshot of an [`InMemCheckpointStore`].
#[derive(Debug, Clone)]
pub struct InMemStateReader {
    items: Items,
}

impl StateReader for InMemStateReader {
    fn categories(&self) -> Result<Vec<String>, StoreError> {
        let mut categories: Vec<String> = self
            .items
            .keys()
            .map(|(category, _)| category.clone())
            .collect();
        categories.dedup();
        Ok(categories)
    }

    fn item_keys(&self, category: &str) -> Result<Option<Vec<String>>, StoreError> {
        let keys: Vec<String> = self
            .items
            .keys()
            .filter(|(item_category, _)| item_category == category)
            .map(|(_, key)| key.clone())
            .collect();
        Ok(if keys.is_empty() { None } else { Some(keys) })
    }

    fn item_reader(
        &self,
        category: &str,
        key: &str,
    ) -> Result<Option<Box<dyn Read + '_>>, StoreError> {
        Ok(self
            .items
            .get(&(category.to_owned(), key.to_owned()))
            .map(|blob| Box::new(blob.as_slice()) as Box<dyn Read + '_>))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::read_item;
    use crate::recovery::write_item;

    #[tokio::test]
    async fn full_commit_replaces_everything() {
        let store = InMemCheckpointStore::new();
        store.put("old", "gone", b"x".to_vec());

        let mut writer = store.writer(CheckpointKind::Full);
        write_item(&mut writer, "subscriptions", "qe://s/1", b"blob").unwrap();
        assert!(store.get("subscriptions", "qe://s/1").is_none());
        writer.commit(CancellationToken::new(), None).await.unwrap();

        assert_eq!(store.len(), 1);
        let reader = store.reader();
        assert_eq!(reader.categories().unwrap(), vec!["subscriptions"]);
        assert_eq!(
            read_item(&reader, "subscriptions", "qe://s/1").unwrap(),
            Some(b"blob".to_vec())
        );
        assert_eq!(reader.item_keys("old").unwrap(), None);
    }

    #[tokio::test]
    async fn differential_commit_applies_deltas() {
        let store = InMemCheckpointStore::new();
        store.put("c", "keep", b"1".to_vec());
        store.put("c", "drop", b"2".to_vec());

        let mut writer = store.writer(CheckpointKind::Differential);
        writer.delete_item("c", "drop").unwrap();
        write_item(&mut writer, "c", "new", b"3").unwrap();
        writer.commit(CancellationToken::new(), None).await.unwrap();

        let keys = store.reader().item_keys("c").unwrap().unwrap();
        assert_eq!(keys, vec!["keep", "new"]);
    }

    #[tokio::test]
    async fn cancelled_or_rolled_back_commit_applies_nothing() {
        let store = InMemCheckpointStore::new();
        let mut writer = store.writer(CheckpointKind::Full);
        write_item(&mut writer, "c", "k", b"v").unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let err = writer.commit(token, None).await.unwrap_err();
        assert!(matches!(err, StoreError::Cancelled));
        assert!(store.is_empty());

        write_item(&mut writer, "c", "k", b"v").unwrap();
        writer.rollback();
        assert_eq!(writer.staged_len(), 0);
        writer.commit(CancellationToken::new(), None).await.unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn injected_write_failure() {
        let store = InMemCheckpointStore::new();
        let mut writer = store.writer(CheckpointKind::Full).failing_on("c", "bad");
        assert!(write_item(&mut writer, "c", "good", b"v").is_ok());
        assert!(matches!(
            write_item(&mut writer, "c", "bad", b"v"),
            Err(StoreError::Injected(_))
        ));
    }
}

//! Checkpoint store backends.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

pub mod in_mem;
pub mod sqlite;

pub use in_mem::InMemCheckpointStore;
pub use sqlite::SqliteCheckpointStore;

pub(crate) type ItemKey = (String, String);

/// Writes and deletes staged by a writer until commit.
#[derive(Debug, Default)]
pub(crate) struct StagedChanges {
    pub(crate) writes: BTreeMap<ItemKey, Vec<u8>>,
    pub(crate) deletes: BTreeSet<ItemKey>,
}

impl StagedChanges {
    /// Buffer for a fresh write of the item.
    pub(crate) fn stage_write(&mut self, category: &str, key: &str) -> &mut Vec<u8> {
        let item = (category.to_owned(), key.to_owned());
        self.deletes.remove(&item);
        let buf = self.writes.entry(item).or_default();
        buf.clear();
        buf
    }

    pub(crate) fn stage_delete(&mut self, category: &str, key: &str) {
        let item = (category.to_owned(), key.to_owned());
        self.writes.remove(&item);
        self.deletes.insert(item);
    }

    pub(crate) fn len(&self) -> usize {
        self.writes.len() + self.deletes.len()
    }

    pub(crate) fn take(&mut self) -> StagedChanges {
        std::mem::take(self)
    }
}

#[test]
fn later_stage_wins() {
    let mut staged = StagedChanges::default();
    staged.stage_write("c", "k").extend_from_slice(b"one");
    staged.stage_delete("c", "k");
    assert!(staged.writes.is_empty());
    staged.stage_write("c", "k").extend_from_slice(b"two");
    assert!(staged.deletes.is_empty());
    assert_eq!(staged.writes[&("c".to_owned(), "k".to_owned())], b"two");
    assert_eq!(staged.len(), 1);
}

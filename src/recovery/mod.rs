//! Checkpoint storage contracts.
//!
//! The engine writes one opaque blob per entity, addressed by a
//! `(category, key)` pair, through a [`StateWriter`] and reads it back
//! through a [`StateReader`]. Writers are transactional: nothing staged
//! is visible until [`StateWriter::commit`] completes, and
//! [`StateWriter::rollback`] drops everything staged.
//!
//! Define and undefine operations are additionally logged through a
//! [`kv::KeyValueStore`] so they survive between checkpoints.

use std::future::Future;
use std::io::Read;
use std::io::Write;
use std::pin::Pin;

use serde::Deserialize;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::errors::StoreError;

pub mod kv;
pub mod store;

/// What a committed checkpoint replaces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    /// The checkpoint is the entire state; anything not written is
    /// gone.
    #[default]
    Full,
    /// Only changes since the previous checkpoint are written; removed
    /// items are deleted explicitly.
    Differential,
}

pub type CommitFuture<'a> = Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>>;

/// Reports completion in `0.0..=1.0`.
pub type Progress<'a> = &'a (dyn Fn(f64) + Send + Sync);

pub trait StateReader: Send + Sync {
    fn categories(&self) -> Result<Vec<String>, StoreError>;

    /// `None` if the category does not exist.
    fn item_keys(&self, category: &str) -> Result<Option<Vec<String>>, StoreError>;

    /// `None` if the item does not exist.
    fn item_reader(
        &self,
        category: &str,
        key: &str,
    ) -> Result<Option<Box<dyn Read + '_>>, StoreError>;
}

pub trait StateWriter: Send {
    /// Chosen by the store, not the engine.
    fn checkpoint_kind(&self) -> CheckpointKind;

    /// Stage a new blob for the item, replacing any earlier one.
    fn item_writer(
        &mut self,
        category: &str,
        key: &str,
    ) -> Result<Box<dyn Write + Send + '_>, StoreError>;

    fn delete_item(&mut self, category: &str, key: &str) -> Result<(), StoreError>;

    /// Atomically apply everything staged. A cancelled commit applies
    /// nothing.
    fn commit<'a>(
        &'a mut self,
        token: CancellationToken,
        progress: Option<Progress<'a>>,
    ) -> CommitFuture<'a>;

    fn rollback(&mut self);
}

/// Read a whole item, if it exists.
pub fn read_item(
    reader: &dyn StateReader,
    category: &str,
    key: &str,
) -> Result<Option<Vec<u8>>, StoreError> {
    let Some(mut item) = reader.item_reader(category, key)? else {
        return Ok(None);
    };
    let mut buf = Vec::new();
    item.read_to_end(&mut buf)?;
    Ok(Some(buf))
}

/// Write a whole item.
pub fn write_item(
    writer: &mut dyn StateWriter,
    category: &str,
    key: &str,
    blob: &[u8],
) -> Result<(), StoreError> {
    let mut item = writer.item_writer(category, key)?;
    item.write_all(blob)?;
    item.flush()?;
    Ok(())
}

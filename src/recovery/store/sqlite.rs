//! SQLite-backed checkpoint store and key-value log.
//!
//! Both live in the same database file and share one connection:
//! checkpoint items in `items`, the key-value log in `kv`.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::OnceLock;

use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite_migration::Migrations;
use rusqlite_migration::M;
use tokio_util::sync::CancellationToken;

use super::ItemKey;
use super::StagedChanges;
use crate::config::RecoveryConfig;
use crate::errors::StoreError;
use crate::recovery::kv::KeyValueStore;
use crate::recovery::kv::KeyValueStoreTransaction;
use crate::recovery::kv::KvBackend;
use crate::recovery::kv::OverlayTransaction;
use crate::recovery::CheckpointKind;
use crate::recovery::CommitFuture;
use crate::recovery::Progress;
use crate::recovery::StateReader;
use crate::recovery::StateWriter;

// The `'static` lifetime within [`Migrations`] is saying that the
// [`str`]s composing the migrations are `'static`.
static MIGRATIONS: OnceLock<Migrations<'static>> = OnceLock::new();

fn get_migrations() -> &'static Migrations<'static> {
    MIGRATIONS.get_or_init(|| {
        Migrations::new(vec![
            M::up(
                "CREATE TABLE items ( \
                 updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP, \
                 category TEXT NOT NULL, \
                 item_key TEXT NOT NULL, \
                 item_value BLOB NOT NULL, \
                 PRIMARY KEY (category, item_key) \
                 ) STRICT",
            ),
            M::up(
                "CREATE TABLE kv ( \
                 kv_table TEXT NOT NULL, \
                 kv_key TEXT NOT NULL, \
                 kv_value BLOB NOT NULL, \
                 PRIMARY KEY (kv_table, kv_key) \
                 ) STRICT",
            ),
        ])
    })
}

#[test]
fn migrations_valid() -> rusqlite_migration::Result<()> {
    get_migrations().validate()
}

/// Setup our connection-level pragmas. Run this on each connection.
fn setup_conn(conn: &mut Connection) -> Result<(), StoreError> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    // These are recommended by Litestream.
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "busy_timeout", "5000")?;
    get_migrations().to_latest(conn)?;
    Ok(())
}

type SharedConn = Arc<Mutex<Connection>>;

fn lock(conn: &SharedConn) -> MutexGuard<'_, Connection> {
    conn.lock().unwrap_or_else(|err| err.into_inner())
}

#[derive(Clone)]
pub struct SqliteCheckpointStore {
    conn: SharedConn,
    /// Kind handed out by [`SqliteCheckpointStore::configured_writer`].
    kind: CheckpointKind,
}

impl SqliteCheckpointStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        tracing::info!("Opening checkpoint DB at {path:?}");
        Self::with_conn(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_conn(Connection::open_in_memory()?)
    }

    /// Open `db_path` from the config, or an in-memory DB if unset.
    /// Writers from [`SqliteCheckpointStore::configured_writer`] use the
    /// configured checkpoint kind.
    pub fn from_config(config: &RecoveryConfig) -> Result<Self, StoreError> {
        let store = match &config.db_path {
            Some(path) => Self::open(path)?,
            None => Self::open_in_memory()?,
        };
        Ok(Self {
            kind: config.checkpoint_kind,
            ..store
        })
    }

    fn with_conn(mut conn: Connection) -> Result<Self, StoreError> {
        setup_conn(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            kind: CheckpointKind::Full,
        })
    }

    pub fn configured_writer(&self) -> SqliteStateWriter {
        self.writer(self.kind)
    }

    pub fn writer(&self, kind: CheckpointKind) -> SqliteStateWriter {
        SqliteStateWriter {
            conn: self.conn.clone(),
            kind,
            staged: StagedChanges::default(),
        }
    }

    pub fn reader(&self) -> SqliteStateReader {
        SqliteStateReader {
            conn: self.conn.clone(),
        }
    }

    /// Key-value log stored in the same database.
    pub fn key_value_store(&self) -> SqliteKeyValueStore {
        SqliteKeyValueStore {
            backend: Arc::new(SqliteKv {
                conn: self.conn.clone(),
            }),
        }
    }
}

pub struct SqliteStateWriter {
    conn: SharedConn,
    kind: CheckpointKind,
    staged: StagedChanges,
}

impl StateWriter for SqliteStateWriter {
    fn checkpoint_kind(&self) -> CheckpointKind {
        self.kind
    }

    fn item_writer(
        &mut self,
        category: &str,
        key: &str,
    ) -> Result<Box<dyn Write + Send + '_>, StoreError> {
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
            let StagedChanges { writes, deletes } = self.staged.take();
            let total = (writes.len() + deletes.len()).max(1) as f64;
            let mut done = 0usize;

            let mut conn = lock(&self.conn);
            let txn = conn.transaction()?;
            match self.kind {
                CheckpointKind::Full => {
                    txn.execute("DELETE FROM items", ())?;
                }
                CheckpointKind::Differential => {
                    for (category, key) in deletes.iter() {
                        tracing::trace!("Deleting {category}/{key}");
                        txn.execute(
                            "DELETE FROM items \
                             WHERE category = ?1 AND item_key = ?2",
                            (category, key),
                        )?;
                        done += 1;
                    }
                }
            }
            for ((category, key), value) in writes.iter() {
                tracing::trace!("Writing {category}/{key}");
                txn.execute(
                    "INSERT INTO items (category, item_key, item_value) \
                     VALUES (?1, ?2, ?3) \
                     ON CONFLICT (category, item_key) DO UPDATE \
                     SET updated_at = CURRENT_TIMESTAMP, \
                     item_value = EXCLUDED.item_value",
                    (category, key, value),
                )?;
                done += 1;
                if let Some(progress) = progress {
                    progress(done as f64 / total);
                }
            }
            txn.commit()?;
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

pub struct SqliteStateReader {
    conn: SharedConn,
}

impl StateReader for SqliteStateReader {
    fn categories(&self) -> Result<Vec<String>, StoreError> {
        let conn = lock(&self.conn);
        let mut stmt = conn.prepare(
            "SELECT DISTINCT category \
             FROM items \
             ORDER BY category",
        )?;
        let categories = stmt
            .query_map((), |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(categories)
    }

    fn item_keys(&self, category: &str) -> Result<Option<Vec<String>>, StoreError> {
        let conn = lock(&self.conn);
        let mut stmt = conn.prepare(
            "SELECT item_key \
             FROM items \
             WHERE category = ?1 \
             ORDER BY item_key",
        )?;
        let keys = stmt
            .query_map((category,), |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(if keys.is_empty() { None } else { Some(keys) })
    }

    fn item_reader(
        &self,
        category: &str,
        key: &str,
    ) -> Result<Option<Box<dyn Read + '_>>, StoreError> {
        let blob: Option<Vec<u8>> = lock(&self.conn)
            .query_row(
                "SELECT item_value \
                 FROM items \
                 WHERE category = ?1 AND item_key = ?2",
                (category, key),
                |row| row.get(0),
            )
            .optional()?;
        Ok(blob.map(|blob| Box::new(Cursor::new(blob)) as Box<dyn Read + '_>))
    }
}

struct SqliteKv {
    conn: SharedConn,
}

impl KvBackend for SqliteKv {
    fn get(&self, table: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let value = lock(&self.conn)
            .query_row(
                "SELECT kv_value \
                 FROM kv \
                 WHERE kv_table = ?1 AND kv_key = ?2",
                (table, key),
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn scan(&self, table: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let conn = lock(&self.conn);
        let mut stmt = conn.prepare(
            "SELECT kv_key, kv_value \
             FROM kv \
             WHERE kv_table = ?1 \
             ORDER BY kv_key",
        )?;
        let entries = stmt
            .query_map((table,), |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<(String, Vec<u8>)>, _>>()?;
        Ok(entries)
    }

    fn apply(&self, changes: BTreeMap<ItemKey, Option<Vec<u8>>>) -> Result<(), StoreError> {
        let mut conn = lock(&self.conn);
        let txn = conn.transaction()?;
        for ((table, key), change) in changes.iter() {
            match change {
                Some(value) => {
                    txn.execute(
                        "INSERT INTO kv (kv_table, kv_key, kv_value) \
                         VALUES (?1, ?2, ?3) \
                         ON CONFLICT (kv_table, kv_key) DO UPDATE \
                         SET kv_value = EXCLUDED.kv_value",
                        (table, key, value),
                    )?;
                }
                None => {
                    txn.execute(
                        "DELETE FROM kv \
                         WHERE kv_table = ?1 AND kv_key = ?2",
                        (table, key),
                    )?;
                }
            }
        }
        txn.commit()?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct SqliteKeyValueStore {
    backend: Arc<SqliteKv>,
}

impl KeyValueStore for SqliteKeyValueStore {
    fn begin(&self) -> Box<dyn KeyValueStoreTransaction> {
        Box::new(OverlayTransaction::new(self.backend.clone()))
    }
}

//! Per-kind persistent key/value tables.
//!
//! Every entity kind is stored as opaque bincode blobs keyed by the entity id
//! rendered as text. One SQLite file holds all tables of a planet; the file is
//! opened read-write by at most one process.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fs, io,
    marker::PhantomData,
    path::Path,
    sync::{Arc, Mutex},
};

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// A record kind that can be persisted in an [`EntityStore`].
pub trait StoreRecord: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Table name of the kind.
    const KIND: &'static str;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreMode {
    ReadOnly,
    ReadWrite,
}

impl StoreMode {
    pub fn is_writable(self) -> bool {
        matches!(self, StoreMode::ReadWrite)
    }

    fn open_flags(self) -> OpenFlags {
        match self {
            StoreMode::ReadOnly => {
                OpenFlags::SQLITE_OPEN_READ_ONLY
                    | OpenFlags::SQLITE_OPEN_URI
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX
            }
            StoreMode::ReadWrite => OpenFlags::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("record codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("store io error: {0}")]
    Io(#[from] io::Error),
    #[error("{kind} store is read-only")]
    ReadOnly { kind: &'static str },
    #[error("{kind} store is closed")]
    Closed { kind: &'static str },
    #[error("{kind} store is unavailable")]
    Unavailable { kind: &'static str },
}

/// Persistence interface consumed by the write-behind cache.
pub trait EntityStore<T>: Send + Sync {
    fn all(&mut self) -> Result<Vec<T>, StoreError>;
    fn get(&mut self, key: &str) -> Result<Option<T>, StoreError>;
    fn set(&mut self, key: &str, entity: &T) -> Result<(), StoreError>;
    fn remove(&mut self, key: &str) -> Result<(), StoreError>;
    fn close(&mut self) -> Result<(), StoreError>;
    fn mode(&self) -> StoreMode;
}

/// One SQLite database shared by every table of a planet.
#[derive(Clone)]
pub struct SqliteDatabase {
    conn: Arc<Mutex<Connection>>,
    mode: StoreMode,
}

impl SqliteDatabase {
    pub fn open(path: &Path, mode: StoreMode) -> Result<Self, StoreError> {
        if mode.is_writable() {
            if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open_with_flags(path, mode.open_flags())?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            mode,
        })
    }

    /// Private in-memory database; `mode` only gates writes on our side.
    pub fn open_in_memory(mode: StoreMode) -> Result<Self, StoreError> {
        Ok(Self {
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
            mode,
        })
    }

    pub fn mode(&self) -> StoreMode {
        self.mode
    }

    pub fn store<T: StoreRecord>(&self) -> Result<SqliteStore<T>, StoreError> {
        if self.mode.is_writable() {
            let conn = self.conn.lock().expect("store connection mutex poisoned");
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {} (id TEXT PRIMARY KEY, payload BLOB NOT NULL)",
                T::KIND
            ))?;
        }
        Ok(SqliteStore {
            conn: Arc::clone(&self.conn),
            mode: self.mode,
            closed: false,
            _marker: PhantomData,
        })
    }
}

pub struct SqliteStore<T> {
    conn: Arc<Mutex<Connection>>,
    mode: StoreMode,
    closed: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T: StoreRecord> SqliteStore<T> {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed {
            return Err(StoreError::Closed { kind: T::KIND });
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<(), StoreError> {
        self.ensure_open()?;
        if !self.mode.is_writable() {
            return Err(StoreError::ReadOnly { kind: T::KIND });
        }
        Ok(())
    }

    fn table_exists(conn: &Connection) -> Result<bool, StoreError> {
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![T::KIND],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }
}

impl<T: StoreRecord> EntityStore<T> for SqliteStore<T> {
    fn all(&mut self) -> Result<Vec<T>, StoreError> {
        self.ensure_open()?;
        let conn = self.conn.lock().expect("store connection mutex poisoned");
        if !Self::table_exists(&conn)? {
            return Ok(Vec::new());
        }
        let mut statement = conn.prepare(&format!("SELECT payload FROM {} ORDER BY id", T::KIND))?;
        let payloads = statement
            .query_map([], |row| row.get::<_, Vec<u8>>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        payloads
            .iter()
            .map(|payload| bincode::deserialize(payload).map_err(StoreError::from))
            .collect()
    }

    fn get(&mut self, key: &str) -> Result<Option<T>, StoreError> {
        self.ensure_open()?;
        let conn = self.conn.lock().expect("store connection mutex poisoned");
        if !Self::table_exists(&conn)? {
            return Ok(None);
        }
        let payload: Option<Vec<u8>> = conn
            .query_row(
                &format!("SELECT payload FROM {} WHERE id = ?1", T::KIND),
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        payload
            .map(|payload| bincode::deserialize(&payload).map_err(StoreError::from))
            .transpose()
    }

    fn set(&mut self, key: &str, entity: &T) -> Result<(), StoreError> {
        self.ensure_writable()?;
        let payload = bincode::serialize(entity)?;
        let conn = self.conn.lock().expect("store connection mutex poisoned");
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {} (id, payload) VALUES (?1, ?2)",
                T::KIND
            ),
            params![key, payload],
        )?;
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        self.ensure_writable()?;
        let conn = self.conn.lock().expect("store connection mutex poisoned");
        conn.execute(
            &format!("DELETE FROM {} WHERE id = ?1", T::KIND),
            params![key],
        )?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), StoreError> {
        self.closed = true;
        Ok(())
    }

    fn mode(&self) -> StoreMode {
        self.mode
    }
}

#[derive(Default)]
struct MemoryTables {
    tables: HashMap<&'static str, BTreeMap<String, Vec<u8>>>,
    failing_loads: u32,
    failing_keys: HashSet<String>,
}

/// Shared in-memory backend with the same blob encoding as [`SqliteDatabase`].
///
/// Clones share tables, so a second model can load what the first persisted.
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    inner: Arc<Mutex<MemoryTables>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store<T: StoreRecord>(&self, mode: StoreMode) -> MemoryStore<T> {
        MemoryStore {
            inner: Arc::clone(&self.inner),
            mode,
            closed: false,
            _marker: PhantomData,
        }
    }

    /// Make the next `count` `all()` calls fail, whatever the table.
    pub fn fail_next_loads(&self, count: u32) {
        self.lock().failing_loads = count;
    }

    /// Make writes and deletes of `key` fail until cleared.
    pub fn fail_writes_for(&self, key: impl Into<String>) {
        self.lock().failing_keys.insert(key.into());
    }

    pub fn clear_faults(&self) {
        let mut inner = self.lock();
        inner.failing_loads = 0;
        inner.failing_keys.clear();
    }

    pub fn row_count(&self, kind: &str) -> usize {
        self.lock().tables.get(kind).map_or(0, BTreeMap::len)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryTables> {
        self.inner.lock().expect("memory store mutex poisoned")
    }
}

pub struct MemoryStore<T> {
    inner: Arc<Mutex<MemoryTables>>,
    mode: StoreMode,
    closed: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T: StoreRecord> MemoryStore<T> {
    fn check(&self, writing: bool) -> Result<(), StoreError> {
        if self.closed {
            return Err(StoreError::Closed { kind: T::KIND });
        }
        if writing && !self.mode.is_writable() {
            return Err(StoreError::ReadOnly { kind: T::KIND });
        }
        Ok(())
    }
}

impl<T: StoreRecord> EntityStore<T> for MemoryStore<T> {
    fn all(&mut self) -> Result<Vec<T>, StoreError> {
        self.check(false)?;
        let mut inner = self.inner.lock().expect("memory store mutex poisoned");
        if inner.failing_loads > 0 {
            inner.failing_loads -= 1;
            return Err(StoreError::Unavailable { kind: T::KIND });
        }
        inner
            .tables
            .get(T::KIND)
            .map(|table| {
                table
                    .values()
                    .map(|payload| bincode::deserialize(payload).map_err(StoreError::from))
                    .collect()
            })
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    fn get(&mut self, key: &str) -> Result<Option<T>, StoreError> {
        self.check(false)?;
        let inner = self.inner.lock().expect("memory store mutex poisoned");
        inner
            .tables
            .get(T::KIND)
            .and_then(|table| table.get(key))
            .map(|payload| bincode::deserialize(payload).map_err(StoreError::from))
            .transpose()
    }

    fn set(&mut self, key: &str, entity: &T) -> Result<(), StoreError> {
        self.check(true)?;
        let payload = bincode::serialize(entity)?;
        let mut inner = self.inner.lock().expect("memory store mutex poisoned");
        if inner.failing_keys.contains(key) {
            return Err(StoreError::Unavailable { kind: T::KIND });
        }
        inner
            .tables
            .entry(T::KIND)
            .or_default()
            .insert(key.to_string(), payload);
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        self.check(true)?;
        let mut inner = self.inner.lock().expect("memory store mutex poisoned");
        if inner.failing_keys.contains(key) {
            return Err(StoreError::Unavailable { kind: T::KIND });
        }
        if let Some(table) = inner.tables.get_mut(T::KIND) {
            table.remove(key);
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), StoreError> {
        self.closed = true;
        Ok(())
    }

    fn mode(&self) -> StoreMode {
        self.mode
    }
}

/// Where a planet model keeps its tables.
#[derive(Clone)]
pub enum StoreBackend {
    Sqlite(SqliteDatabase),
    Memory {
        database: MemoryDatabase,
        mode: StoreMode,
    },
}

impl StoreBackend {
    pub fn memory(database: MemoryDatabase, mode: StoreMode) -> Self {
        StoreBackend::Memory { database, mode }
    }

    pub fn mode(&self) -> StoreMode {
        match self {
            StoreBackend::Sqlite(database) => database.mode(),
            StoreBackend::Memory { mode, .. } => *mode,
        }
    }

    pub fn open<T: StoreRecord>(&self) -> Result<Box<dyn EntityStore<T>>, StoreError> {
        Ok(match self {
            StoreBackend::Sqlite(database) => Box::new(database.store::<T>()?),
            StoreBackend::Memory { database, mode } => Box::new(database.store::<T>(*mode)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Crate {
        label: String,
        weight: u32,
    }

    impl StoreRecord for Crate {
        const KIND: &'static str = "crates";
    }

    fn sample(label: &str, weight: u32) -> Crate {
        Crate {
            label: label.to_string(),
            weight,
        }
    }

    #[test]
    fn sqlite_store_round_trips_blobs() {
        let database = SqliteDatabase::open_in_memory(StoreMode::ReadWrite).unwrap();
        let mut store = database.store::<Crate>().unwrap();
        store.set("2", &sample("b", 20)).unwrap();
        store.set("1", &sample("a", 10)).unwrap();
        store.set("1", &sample("a", 11)).unwrap();

        assert_eq!(store.get("1").unwrap(), Some(sample("a", 11)));
        assert_eq!(store.all().unwrap().len(), 2);

        store.remove("1").unwrap();
        assert_eq!(store.get("1").unwrap(), None);
    }

    #[test]
    fn read_only_sqlite_rejects_writes_and_reads_missing_tables_as_empty() {
        let database = SqliteDatabase::open_in_memory(StoreMode::ReadOnly).unwrap();
        let mut store = database.store::<Crate>().unwrap();
        assert!(store.all().unwrap().is_empty());
        assert!(matches!(
            store.set("1", &sample("a", 1)),
            Err(StoreError::ReadOnly { kind: "crates" })
        ));
        assert!(matches!(
            store.remove("1"),
            Err(StoreError::ReadOnly { .. })
        ));
    }

    #[test]
    fn memory_store_injects_load_failures() {
        let database = MemoryDatabase::new();
        let mut store = database.store::<Crate>(StoreMode::ReadWrite);
        store.set("1", &sample("a", 1)).unwrap();
        database.fail_next_loads(1);
        assert!(matches!(store.all(), Err(StoreError::Unavailable { .. })));
        assert_eq!(store.all().unwrap(), vec![sample("a", 1)]);
    }

    #[test]
    fn closed_store_refuses_access() {
        let database = MemoryDatabase::new();
        let mut store = database.store::<Crate>(StoreMode::ReadWrite);
        store.close().unwrap();
        assert!(matches!(store.get("1"), Err(StoreError::Closed { .. })));
    }
}

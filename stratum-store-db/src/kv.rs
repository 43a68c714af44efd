//! The transactional table engine.
//!
//! The store keeps its metadata in named tables of `key → value` and
//! `key → [value]` pairs. Each table maps onto one SQLite table; list
//! values are stored packed under a single key so a table stays a plain
//! binary relation either way.
//!
//! Writes require a [`Txn`]. Reads also work directly on [`Db`], in which
//! case each call sees a fresh snapshot.

use std::path::Path;

use rusqlite::{params, Connection, OpenFlags, OptionalExtension as _};
use stratum_archive::wire::{pack_strings, unpack_strings};
use tracing::debug;

use crate::error::{Error, Result};

/// Handle to an open table, returned by [`Db::open_table`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableId(usize);

/// Delimiter of composite `(path, number)` keys. Not a legal store-name
/// character and cannot appear in a decimal number, so splitting at the
/// last occurrence is exact.
const KEY_DELIMITER: char = ':';

/// Build a composite key from a path and a decimal component.
pub fn merge_db_key(path: &str, number: u64) -> String {
    format!("{path}{KEY_DELIMITER}{number}")
}

/// Invert [`merge_db_key`].
pub fn split_db_key(key: &str) -> Result<(String, u64)> {
    let (path, number) = key
        .rsplit_once(KEY_DELIMITER)
        .ok_or_else(|| Error::Corrupt(format!("composite key without delimiter: `{key}`")))?;
    let number = number
        .parse()
        .map_err(|_| Error::Corrupt(format!("composite key with non-decimal suffix: `{key}`")))?;
    Ok((path.to_string(), number))
}

fn sql_name(table: &str) -> String {
    format!("kv_{table}")
}

/// An open database: one SQLite file plus the registry of opened tables.
pub struct Db {
    conn: Connection,
    tables: Vec<String>,
}

impl Db {
    /// Open or create the database file at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )
        .map_err(|e| Error::DatabaseOpen {
            path: path.to_owned(),
            source: e,
        })?;
        let db = Self::init(conn)?;
        debug!("opened database at {}", path.display());
        Ok(db)
    }

    /// Open an existing database without write access. Tables must
    /// already exist to be opened.
    pub fn open_read_only(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY).map_err(
            |e| Error::DatabaseOpen {
                path: path.to_owned(),
                source: e,
            },
        )?;
        debug!("opened database read-only at {}", path.display());
        Ok(Db {
            conn,
            tables: Vec::new(),
        })
    }

    /// In-memory database, for tests.
    pub fn open_memory() -> Result<Self> {
        let db = Self::init(Connection::open_in_memory()?)?;
        debug!("created in-memory database");
        Ok(db)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            "#,
        )?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY NOT NULL, value TEXT NOT NULL)",
        )?;
        Ok(Db {
            conn,
            tables: Vec::new(),
        })
    }

    /// Open (creating if necessary) a named table.
    pub fn open_table(&mut self, name: &str) -> Result<TableId> {
        if let Some(idx) = self.tables.iter().position(|t| t == name) {
            return Ok(TableId(idx));
        }
        if !self.table_exists(name)? {
            self.conn.execute_batch(&format!(
                "CREATE TABLE \"{}\" (key TEXT PRIMARY KEY NOT NULL, value BLOB NOT NULL)",
                sql_name(name)
            ))?;
        }
        self.tables.push(name.to_string());
        debug!(table = name, "opened table");
        Ok(TableId(self.tables.len() - 1))
    }

    /// Drop a table and its contents. The table need not be open.
    pub fn delete_table(&mut self, name: &str) -> Result<()> {
        self.conn
            .execute_batch(&format!("DROP TABLE IF EXISTS \"{}\"", sql_name(name)))?;
        if let Some(idx) = self.tables.iter().position(|t| t == name) {
            // keep indices of other tables stable
            self.tables[idx] = String::new();
        }
        debug!(table = name, "deleted table");
        Ok(())
    }

    /// Does a table with this name exist in the database file?
    pub fn table_exists(&self, name: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![sql_name(name)],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Begin a transaction. Dropping the returned guard without calling
    /// [`Txn::commit`] rolls every write back.
    pub fn transaction(&mut self) -> Result<Txn<'_>> {
        let Db { conn, tables } = self;
        let tx = conn.transaction()?;
        Ok(Txn { tx, tables })
    }
}

/// An open transaction.
pub struct Txn<'db> {
    tx: rusqlite::Transaction<'db>,
    tables: &'db [String],
}

impl Txn<'_> {
    pub fn commit(self) -> Result<()> {
        self.tx.commit()?;
        Ok(())
    }

    /// Roll back explicitly. Equivalent to dropping the guard.
    pub fn abort(self) -> Result<()> {
        self.tx.rollback()?;
        Ok(())
    }

    pub fn put(&self, table: TableId, key: &str, value: &[u8]) -> Result<()> {
        let mut stmt = self.tx.prepare_cached(&format!(
            "INSERT OR REPLACE INTO \"{}\" (key, value) VALUES (?1, ?2)",
            sql_name(&self.tables[table.0])
        ))?;
        stmt.execute(params![key, value])?;
        Ok(())
    }

    pub fn put_string(&self, table: TableId, key: &str, value: &str) -> Result<()> {
        self.put(table, key, value.as_bytes())
    }

    /// Store a string list packed under one key. The empty list is stored,
    /// not deleted; use [`Txn::delete`] to remove the pair.
    pub fn put_list<S: AsRef<str>>(&self, table: TableId, key: &str, values: &[S]) -> Result<()> {
        self.put(table, key, &pack_strings(values.iter().map(|s| s.as_ref())))
    }

    pub fn delete(&self, table: TableId, key: &str) -> Result<bool> {
        let mut stmt = self.tx.prepare_cached(&format!(
            "DELETE FROM \"{}\" WHERE key = ?1",
            sql_name(&self.tables[table.0])
        ))?;
        Ok(stmt.execute(params![key])? > 0)
    }

    /// Allocate a commit timestamp: strictly greater than every timestamp
    /// handed out before, seeded from wall-clock seconds.
    pub fn alloc_timestamp(&self) -> Result<u64> {
        let last: u64 = self
            .tx
            .query_row(
                "SELECT value FROM meta WHERE key = 'last-timestamp'",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .map(|s| {
                s.parse()
                    .map_err(|_| Error::Corrupt(format!("bad last-timestamp `{s}`")))
            })
            .transpose()?
            .unwrap_or(0);

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let ts = now.max(last + 1);

        self.tx.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES ('last-timestamp', ?1)",
            params![ts.to_string()],
        )?;
        Ok(ts)
    }
}

/// Read operations, available both inside a transaction and directly on
/// the database (fresh snapshot per call).
pub trait ReadTxn {
    #[doc(hidden)]
    fn conn(&self) -> &Connection;
    #[doc(hidden)]
    fn table_sql_name(&self, table: TableId) -> String;

    fn get(&self, table: TableId, key: &str) -> Result<Option<Vec<u8>>> {
        let mut stmt = self.conn().prepare_cached(&format!(
            "SELECT value FROM \"{}\" WHERE key = ?1",
            self.table_sql_name(table)
        ))?;
        Ok(stmt
            .query_row(params![key], |row| row.get::<_, Vec<u8>>(0))
            .optional()?)
    }

    fn get_string(&self, table: TableId, key: &str) -> Result<Option<String>> {
        match self.get(table, key)? {
            Some(bytes) => Ok(Some(String::from_utf8(bytes).map_err(|e| {
                Error::Corrupt(format!("non-UTF-8 value for `{key}`: {e}"))
            })?)),
            None => Ok(None),
        }
    }

    /// Read a packed string list. A missing key reads as the empty list.
    fn get_list(&self, table: TableId, key: &str) -> Result<Vec<String>> {
        match self.get(table, key)? {
            Some(bytes) => unpack_strings(&bytes)
                .map_err(|e| Error::Corrupt(format!("bad packed list for `{key}`: {e}"))),
            None => Ok(Vec::new()),
        }
    }

    fn contains(&self, table: TableId, key: &str) -> Result<bool> {
        Ok(self.get(table, key)?.is_some())
    }

    /// All keys of a table, lexicographically sorted.
    fn enumerate_keys(&self, table: TableId) -> Result<Vec<String>> {
        let mut stmt = self.conn().prepare_cached(&format!(
            "SELECT key FROM \"{}\" ORDER BY key",
            self.table_sql_name(table)
        ))?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    /// Keys starting with `prefix`, sorted. Used to walk the timestamped
    /// entries of one path without scanning the whole table.
    fn keys_with_prefix(&self, table: TableId, prefix: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn().prepare_cached(&format!(
            "SELECT key FROM \"{}\" WHERE key >= ?1 ORDER BY key",
            self.table_sql_name(table)
        ))?;
        let mut keys = Vec::new();
        let mut rows = stmt.query(params![prefix])?;
        while let Some(row) = rows.next()? {
            let key: String = row.get(0)?;
            if !key.starts_with(prefix) {
                break;
            }
            keys.push(key);
        }
        Ok(keys)
    }
}

impl ReadTxn for Db {
    fn conn(&self) -> &Connection {
        &self.conn
    }

    fn table_sql_name(&self, table: TableId) -> String {
        sql_name(&self.tables[table.0])
    }
}

impl ReadTxn for Txn<'_> {
    fn conn(&self) -> &Connection {
        &self.tx
    }

    fn table_sql_name(&self, table: TableId) -> String {
        sql_name(&self.tables[table.0])
    }
}

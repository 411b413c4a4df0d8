//! Transactional record store over SQLite.
//!
//! Every record kind lives in its own table with the same shape: `id`, an
//! integer `sort_key` (the record's ordering timestamp), an optional `scope`
//! used to group batch items by queue, and the record's JSON `body`. Each
//! public operation runs in a single transaction on the shared connection.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags, OptionalExtension, Transaction, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::config::StorageConfig;
use crate::error::{CoreError, CoreResult};
use crate::model::{BatchQueueItem, FormDraft, TemplateRecord, VersionRecord};

mod schema;

pub use schema::TARGET_SCHEMA_VERSION;

/// Fixed key of the singleton form draft.
pub const DRAFT_KEY: &str = "current";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Versions,
    Templates,
    BatchItems,
    FormDraft,
}

impl Table {
    pub const ALL: [Table; 4] = [
        Table::Versions,
        Table::Templates,
        Table::BatchItems,
        Table::FormDraft,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Versions => "versions",
            Self::Templates => "templates",
            Self::BatchItems => "batch_items",
            Self::FormDraft => "form_draft",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

impl SortOrder {
    fn sql(self) -> &'static str {
        match self {
            Self::Ascending => "ORDER BY sort_key ASC, id ASC",
            Self::Descending => "ORDER BY sort_key DESC, id ASC",
        }
    }
}

/// A value persisted in one of the store's tables.
pub trait Record: Serialize + DeserializeOwned {
    const TABLE: Table;

    fn id(&self) -> &str;

    fn sort_key(&self) -> i64;

    fn scope(&self) -> Option<&str> {
        None
    }
}

impl Record for VersionRecord {
    const TABLE: Table = Table::Versions;

    fn id(&self) -> &str {
        &self.id
    }

    fn sort_key(&self) -> i64 {
        self.timestamp
    }
}

impl Record for TemplateRecord {
    const TABLE: Table = Table::Templates;

    fn id(&self) -> &str {
        &self.id
    }

    fn sort_key(&self) -> i64 {
        self.created_at
    }
}

impl Record for BatchQueueItem {
    const TABLE: Table = Table::BatchItems;

    fn id(&self) -> &str {
        &self.id
    }

    fn sort_key(&self) -> i64 {
        self.created_at
    }

    fn scope(&self) -> Option<&str> {
        Some(&self.queue_id)
    }
}

impl Record for FormDraft {
    const TABLE: Table = Table::FormDraft;

    fn id(&self) -> &str {
        DRAFT_KEY
    }

    fn sort_key(&self) -> i64 {
        self.saved_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaReport {
    pub used_bytes: u64,
    pub quota_bytes: u64,
    pub warning_threshold: f64,
    pub warning: bool,
}

/// Shared handle to the record store. Cloning is cheap; clones share one
/// connection.
#[derive(Clone)]
pub struct Store {
    connection: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
    quota_bytes: u64,
    warning_fraction: f64,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.path)
            .field("quota_bytes", &self.quota_bytes)
            .finish()
    }
}

impl Store {
    /// Opens (creating if absent) the store at `path` and upgrades its schema.
    pub fn open(path: &Path, config: &StorageConfig) -> CoreResult<Self> {
        let connection = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|err| {
            CoreError::StorageUnavailable(format!("failed to open {}: {err}", path.display()))
        })?;
        connection
            .pragma_update(None, "journal_mode", "WAL")
            .map_err(CoreError::unavailable)?;
        connection
            .pragma_update(None, "synchronous", "NORMAL")
            .map_err(CoreError::unavailable)?;

        Self::from_connection(connection, Some(path.to_path_buf()), config)
    }

    pub fn open_in_memory(config: &StorageConfig) -> CoreResult<Self> {
        let connection = Connection::open_in_memory().map_err(CoreError::unavailable)?;
        Self::from_connection(connection, None, config)
    }

    fn from_connection(
        mut connection: Connection,
        path: Option<PathBuf>,
        config: &StorageConfig,
    ) -> CoreResult<Self> {
        connection
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms))
            .map_err(CoreError::unavailable)?;

        let page_size: i64 = connection
            .pragma_query_value(None, "page_size", |row| row.get(0))
            .map_err(CoreError::unavailable)?;
        let max_pages = i64::try_from(config.quota_bytes)
            .unwrap_or(i64::MAX)
            .checked_div(page_size.max(1))
            .unwrap_or(0)
            .max(1);
        let applied: i64 = connection
            .pragma_update_and_check(None, "max_page_count", max_pages, |row| row.get(0))
            .map_err(CoreError::unavailable)?;
        debug!(max_pages = applied, "store page cap set");

        let version = schema::run_upgrades(&mut connection)?;
        debug!(version, path = ?path, "store opened");

        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
            path,
            quota_bytes: config.quota_bytes,
            warning_fraction: config.warning_fraction,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> CoreResult<MutexGuard<'_, Connection>> {
        self.connection
            .lock()
            .map_err(|_| CoreError::StorageUnavailable("store mutex poisoned".to_string()))
    }

    pub fn schema_version(&self) -> CoreResult<i64> {
        let connection = self.lock()?;
        schema::read_schema_version(&connection)
    }

    /// Inserts or overwrites a record by id.
    pub fn put<R: Record>(&self, record: &R) -> CoreResult<()> {
        let mut connection = self.lock()?;
        let tx = connection.transaction().map_err(CoreError::write)?;
        write_record(&tx, record)?;
        tx.commit().map_err(CoreError::write)
    }

    /// Writes all records in one transaction; either all land or none do.
    pub fn put_all<R: Record>(&self, records: &[R]) -> CoreResult<usize> {
        let mut connection = self.lock()?;
        let tx = connection.transaction().map_err(CoreError::write)?;
        for record in records {
            write_record(&tx, record)?;
        }
        tx.commit().map_err(CoreError::write)?;
        Ok(records.len())
    }

    pub fn get<R: Record>(&self, id: &str) -> CoreResult<Option<R>> {
        let connection = self.lock()?;
        let sql = format!("SELECT body FROM {} WHERE id = ?1", R::TABLE.name());
        let body: Option<String> = connection
            .query_row(&sql, [id], |row| row.get(0))
            .optional()
            .map_err(CoreError::unavailable)?;

        body.map(|body| decode_body::<R>(&body, id)).transpose()
    }

    /// Returns whether a row was removed.
    pub fn delete(&self, table: Table, id: &str) -> CoreResult<bool> {
        let mut connection = self.lock()?;
        let tx = connection.transaction().map_err(CoreError::write)?;
        let sql = format!("DELETE FROM {} WHERE id = ?1", table.name());
        let removed = tx.execute(&sql, [id]).map_err(CoreError::write)?;
        tx.commit().map_err(CoreError::write)?;
        Ok(removed > 0)
    }

    /// Deletes every listed id in one transaction and returns how many rows went away.
    pub fn delete_all(&self, table: Table, ids: &[String]) -> CoreResult<usize> {
        let mut connection = self.lock()?;
        let tx = connection.transaction().map_err(CoreError::write)?;
        let mut removed = 0usize;
        {
            let sql = format!("DELETE FROM {} WHERE id = ?1", table.name());
            let mut statement = tx.prepare(&sql).map_err(CoreError::write)?;
            for id in ids {
                removed += statement.execute([id]).map_err(CoreError::write)?;
            }
        }
        tx.commit().map_err(CoreError::write)?;
        Ok(removed)
    }

    pub fn clear(&self, table: Table) -> CoreResult<usize> {
        let mut connection = self.lock()?;
        let tx = connection.transaction().map_err(CoreError::write)?;
        let sql = format!("DELETE FROM {}", table.name());
        let removed = tx.execute(&sql, []).map_err(CoreError::write)?;
        tx.commit().map_err(CoreError::write)?;
        Ok(removed)
    }

    /// Every record of a kind ordered by its timestamp. Rows whose body no
    /// longer decodes are logged and skipped.
    pub fn scan_all<R: Record>(&self, order: SortOrder) -> CoreResult<Vec<R>> {
        let sql = format!(
            "SELECT id, body FROM {} {}",
            R::TABLE.name(),
            order.sql()
        );
        self.scan(&sql, params![])
    }

    pub fn scan_scope<R: Record>(&self, scope: &str, order: SortOrder) -> CoreResult<Vec<R>> {
        let sql = format!(
            "SELECT id, body FROM {} WHERE scope = ?1 {}",
            R::TABLE.name(),
            order.sql()
        );
        self.scan(&sql, params![scope])
    }

    fn scan<R: Record>(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> CoreResult<Vec<R>> {
        let connection = self.lock()?;
        let mut statement = connection.prepare(sql).map_err(CoreError::unavailable)?;
        let mut rows = statement.query(args).map_err(CoreError::unavailable)?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(CoreError::unavailable)? {
            let id: String = row.get(0).map_err(CoreError::unavailable)?;
            let body: String = row.get(1).map_err(CoreError::unavailable)?;
            match decode_body::<R>(&body, &id) {
                Ok(record) => out.push(record),
                Err(err) => {
                    warn!(table = R::TABLE.name(), id = %id, error = %err, "skipping unreadable record")
                }
            }
        }
        Ok(out)
    }

    /// Ids of a table in timestamp order, without decoding bodies.
    pub fn scan_ids(&self, table: Table, order: SortOrder) -> CoreResult<Vec<String>> {
        let connection = self.lock()?;
        let sql = format!("SELECT id FROM {} {}", table.name(), order.sql());
        let mut statement = connection.prepare(&sql).map_err(CoreError::unavailable)?;
        let ids = statement
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(CoreError::unavailable)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(CoreError::unavailable)?;
        Ok(ids)
    }

    /// Distinct scopes present in a table.
    pub fn scopes(&self, table: Table) -> CoreResult<Vec<String>> {
        let connection = self.lock()?;
        let sql = format!(
            "SELECT scope FROM {} WHERE scope IS NOT NULL GROUP BY scope ORDER BY MIN(sort_key) ASC",
            table.name()
        );
        let mut statement = connection.prepare(&sql).map_err(CoreError::unavailable)?;
        let scopes = statement
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(CoreError::unavailable)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(CoreError::unavailable)?;
        Ok(scopes)
    }

    /// Read-modify-write of one record inside a single transaction.
    ///
    /// Fails with [`CoreError::ItemNotFound`] when the id is absent; an error
    /// returned by `apply` rolls the transaction back.
    pub fn update<R, F>(&self, id: &str, apply: F) -> CoreResult<R>
    where
        R: Record,
        F: FnOnce(&mut R) -> CoreResult<()>,
    {
        let mut connection = self.lock()?;
        let tx = connection.transaction().map_err(CoreError::write)?;

        let sql = format!("SELECT body FROM {} WHERE id = ?1", R::TABLE.name());
        let body: Option<String> = tx
            .query_row(&sql, [id], |row| row.get(0))
            .optional()
            .map_err(CoreError::write)?;
        let Some(body) = body else {
            return Err(CoreError::ItemNotFound {
                table: R::TABLE.name(),
                id: id.to_string(),
            });
        };

        let mut record = decode_body::<R>(&body, id)?;
        apply(&mut record)?;
        if record.id() != id {
            return Err(CoreError::Validation(format!(
                "update may not change record id ({id} -> {})",
                record.id()
            )));
        }

        write_record(&tx, &record)?;
        tx.commit().map_err(CoreError::write)?;
        Ok(record)
    }

    pub fn count(&self, table: Table) -> CoreResult<usize> {
        let connection = self.lock()?;
        let sql = format!("SELECT COUNT(*) FROM {}", table.name());
        let count: i64 = connection
            .query_row(&sql, [], |row| row.get(0))
            .map_err(CoreError::unavailable)?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Approximate space used by live pages against the configured quota.
    pub fn check_quota(&self) -> CoreResult<QuotaReport> {
        let connection = self.lock()?;
        let page_size: i64 = connection
            .pragma_query_value(None, "page_size", |row| row.get(0))
            .map_err(CoreError::unavailable)?;
        let page_count: i64 = connection
            .pragma_query_value(None, "page_count", |row| row.get(0))
            .map_err(CoreError::unavailable)?;
        let freelist: i64 = connection
            .pragma_query_value(None, "freelist_count", |row| row.get(0))
            .map_err(CoreError::unavailable)?;

        let used_pages = (page_count - freelist).max(0);
        let used_bytes = u64::try_from(used_pages.saturating_mul(page_size)).unwrap_or(0);
        let warning_threshold = self.warning_fraction;
        let warning = used_bytes as f64 > self.quota_bytes as f64 * warning_threshold;

        Ok(QuotaReport {
            used_bytes,
            quota_bytes: self.quota_bytes,
            warning_threshold,
            warning,
        })
    }
}

fn write_record<R: Record>(tx: &Transaction<'_>, record: &R) -> CoreResult<()> {
    let body = serde_json::to_string(record).map_err(|err| {
        CoreError::Validation(format!(
            "failed to serialize {} record {}: {err}",
            R::TABLE.name(),
            record.id()
        ))
    })?;
    let sql = format!(
        "
        INSERT INTO {}(id, sort_key, scope, body)
        VALUES(?1, ?2, ?3, ?4)
        ON CONFLICT(id) DO UPDATE SET
          sort_key=excluded.sort_key,
          scope=excluded.scope,
          body=excluded.body
        ",
        R::TABLE.name()
    );
    tx.execute(
        &sql,
        params![record.id(), record.sort_key(), record.scope(), body],
    )
    .map_err(CoreError::write)?;
    Ok(())
}

fn decode_body<R: Record>(body: &str, id: &str) -> CoreResult<R> {
    serde_json::from_str(body)
        .map_err(|err| CoreError::Corrupt(format!("{} record {id}: {err}", R::TABLE.name())))
}

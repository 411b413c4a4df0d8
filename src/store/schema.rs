use rusqlite::{Connection, OptionalExtension, params};
use tracing::info;

use crate::error::{CoreError, CoreResult};
use crate::util::now_utc_string;

/// Schema version this build writes and understands.
pub const TARGET_SCHEMA_VERSION: i64 = 3;

const SCHEMA_VERSION_KEY: &str = "db_schema_version";
const UPDATED_AT_KEY: &str = "db_updated_at";

struct UpgradeStep {
    version: i64,
    description: &'static str,
    sql: &'static str,
}

// Steps are additive and use IF NOT EXISTS so replaying one is harmless.
const UPGRADE_STEPS: &[UpgradeStep] = &[
    UpgradeStep {
        version: 1,
        description: "versions table with timestamp index",
        sql: "
        CREATE TABLE IF NOT EXISTS versions (
          id TEXT PRIMARY KEY,
          sort_key INTEGER NOT NULL,
          scope TEXT,
          body TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_versions_sort_key ON versions(sort_key);
        ",
    },
    UpgradeStep {
        version: 2,
        description: "templates, batch and draft tables",
        sql: "
        CREATE TABLE IF NOT EXISTS templates (
          id TEXT PRIMARY KEY,
          sort_key INTEGER NOT NULL,
          scope TEXT,
          body TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS batch_items (
          id TEXT PRIMARY KEY,
          sort_key INTEGER NOT NULL,
          scope TEXT,
          body TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS form_draft (
          id TEXT PRIMARY KEY,
          sort_key INTEGER NOT NULL,
          scope TEXT,
          body TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_templates_sort_key ON templates(sort_key);
        CREATE INDEX IF NOT EXISTS idx_batch_items_sort_key ON batch_items(sort_key);
        ",
    },
    UpgradeStep {
        version: 3,
        description: "batch item queue index",
        sql: "
        CREATE INDEX IF NOT EXISTS idx_batch_items_scope ON batch_items(scope, sort_key);
        ",
    },
];

fn ensure_metadata_table(connection: &Connection) -> CoreResult<()> {
    connection
        .execute_batch(
            "
            CREATE TABLE IF NOT EXISTS metadata (
              key TEXT PRIMARY KEY,
              value TEXT NOT NULL
            );
            ",
        )
        .map_err(CoreError::unavailable)
}

pub(crate) fn read_schema_version(connection: &Connection) -> CoreResult<i64> {
    let raw: Option<String> = connection
        .query_row(
            "SELECT value FROM metadata WHERE key = ?1",
            [SCHEMA_VERSION_KEY],
            |row| row.get(0),
        )
        .optional()
        .map_err(CoreError::unavailable)?;

    match raw {
        None => Ok(0),
        Some(value) => value.trim().parse::<i64>().map_err(|_| {
            CoreError::StorageUnavailable(format!("unreadable schema version marker: {value}"))
        }),
    }
}

/// Brings the schema up to [`TARGET_SCHEMA_VERSION`], one transaction per step.
pub(crate) fn run_upgrades(connection: &mut Connection) -> CoreResult<i64> {
    ensure_metadata_table(connection)?;

    let current = read_schema_version(connection)?;
    if current > TARGET_SCHEMA_VERSION {
        return Err(CoreError::StorageUnavailable(format!(
            "store schema version {current} is newer than supported version {TARGET_SCHEMA_VERSION}"
        )));
    }

    for step in UPGRADE_STEPS.iter().filter(|step| step.version > current) {
        let tx = connection.transaction().map_err(CoreError::unavailable)?;
        tx.execute_batch(step.sql).map_err(CoreError::unavailable)?;
        tx.execute(
            "INSERT INTO metadata(key, value) VALUES(?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![SCHEMA_VERSION_KEY, step.version.to_string()],
        )
        .map_err(CoreError::unavailable)?;
        tx.execute(
            "INSERT INTO metadata(key, value) VALUES(?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![UPDATED_AT_KEY, now_utc_string()],
        )
        .map_err(CoreError::unavailable)?;
        tx.commit().map_err(CoreError::unavailable)?;

        info!(version = step.version, step = step.description, "applied schema upgrade");
    }

    read_schema_version(connection)
}

//! One-shot import of records from the flat, one-blob-per-kind layout that
//! predates the record store.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::compress::Compressor;
use crate::evict::CapacityEvictor;
use crate::model::{BatchQueueItem, FormDraft, ItemStatus, TemplateRecord, VersionRecord};
use crate::store::{Record, Store, Table};
use crate::util::sha256_hex;

/// Flat key-value storage holding one serialized blob per record kind.
pub trait LegacySource: Send + Sync {
    fn read(&self, key: &str) -> io::Result<Option<String>>;

    fn remove(&self, key: &str) -> io::Result<()>;
}

/// Legacy blobs stored as `<key>.json` files in one directory.
#[derive(Debug, Clone)]
pub struct JsonDirSource {
    dir: PathBuf,
}

impl JsonDirSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl LegacySource for JsonDirSource {
    fn read(&self, key: &str) -> io::Result<Option<String>> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn remove(&self, key: &str) -> io::Result<()> {
        match fs::remove_file(self.path_for(key)) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyKind {
    Versions,
    Templates,
    BatchItems,
    FormDraft,
}

impl LegacyKind {
    pub fn key(self) -> &'static str {
        match self {
            Self::Versions => "versions",
            Self::Templates => "templates",
            Self::BatchItems => "batch_queue",
            Self::FormDraft => "form_draft",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    pub versions: usize,
    pub templates: usize,
    pub batch_items: usize,
    pub form_draft: usize,
}

impl MigrationReport {
    pub fn total(&self) -> usize {
        self.versions + self.templates + self.batch_items + self.form_draft
    }
}

pub struct LegacyMigrator {
    store: Store,
    source: Box<dyn LegacySource>,
    compressor: Compressor,
    max_versions: usize,
    attempted: Mutex<bool>,
}

impl std::fmt::Debug for LegacyMigrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LegacyMigrator")
            .field("store", &self.store)
            .field("max_versions", &self.max_versions)
            .finish()
    }
}

impl LegacyMigrator {
    pub fn new(
        store: Store,
        source: Box<dyn LegacySource>,
        compressor: Compressor,
        max_versions: usize,
    ) -> Self {
        Self {
            store,
            source,
            compressor,
            max_versions,
            attempted: Mutex::new(false),
        }
    }

    fn guard(&self) -> MutexGuard<'_, bool> {
        self.attempted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Runs [`Self::migrate_all`] the first time it is called in this
    /// process. Concurrent callers wait for that run to finish.
    pub fn ensure_migrated(&self) -> Option<MigrationReport> {
        let mut attempted = self.guard();
        if *attempted {
            return None;
        }
        let report = self.migrate_all();
        *attempted = true;
        Some(report)
    }

    pub fn has_run(&self) -> bool {
        *self.guard()
    }

    pub fn reset_guard(&self) {
        *self.guard() = false;
    }

    pub fn migrate_all(&self) -> MigrationReport {
        let report = MigrationReport {
            versions: self.migrate(LegacyKind::Versions),
            templates: self.migrate(LegacyKind::Templates),
            batch_items: self.migrate(LegacyKind::BatchItems),
            form_draft: self.migrate(LegacyKind::FormDraft),
        };
        if report.total() > 0 {
            info!(
                versions = report.versions,
                templates = report.templates,
                batch_items = report.batch_items,
                form_draft = report.form_draft,
                "legacy migration complete"
            );
        }
        report
    }

    /// Imports one kind and returns how many records landed. Missing or
    /// malformed blobs yield 0; the blob is removed only after at least one
    /// record was written.
    pub fn migrate(&self, kind: LegacyKind) -> usize {
        let raw = match self.source.read(kind.key()) {
            Ok(Some(raw)) => raw,
            Ok(None) => return 0,
            Err(err) => {
                warn!(key = kind.key(), error = %err, "failed to read legacy blob");
                return 0;
            }
        };

        let imported = match kind {
            LegacyKind::Versions => self.import_list::<VersionRecord>(&raw, |mut record| {
                record.result.image = self.compressor.compress(&record.result.image);
                record
            }),
            LegacyKind::Templates => self.import_list::<TemplateRecord>(&raw, |record| record),
            LegacyKind::BatchItems => self.import_list::<BatchQueueItem>(&raw, |mut item| {
                // no worker survives a restart
                if item.status == ItemStatus::Processing {
                    item.status = ItemStatus::Pending;
                }
                item
            }),
            LegacyKind::FormDraft => self.import_draft(&raw),
        };

        let migrated = match imported {
            Ok(count) => count,
            Err(err) => {
                warn!(key = kind.key(), error = %err, "legacy blob is malformed, leaving it in place");
                return 0;
            }
        };

        if migrated > 0 {
            if let Err(err) = self.source.remove(kind.key()) {
                warn!(key = kind.key(), error = %err, "failed to remove migrated legacy blob");
            }
            if kind == LegacyKind::Versions {
                CapacityEvictor::new(self.store.clone(), Table::Versions, self.max_versions)
                    .enforce_logged();
            }
        }

        migrated
    }

    fn import_list<R: Record>(
        &self,
        raw: &str,
        prepare: impl Fn(R) -> R,
    ) -> Result<usize, serde_json::Error> {
        let entries: Vec<Value> = serde_json::from_str(raw)?;
        let mut migrated = 0usize;

        for (index, mut entry) in entries.into_iter().enumerate() {
            assign_missing_id(&mut entry);
            let record = match serde_json::from_value::<R>(entry) {
                Ok(record) => prepare(record),
                Err(err) => {
                    warn!(table = R::TABLE.name(), index, error = %err, "skipping legacy record that failed to parse");
                    continue;
                }
            };

            match self.store.put(&record) {
                Ok(()) => migrated += 1,
                Err(err) => {
                    warn!(table = R::TABLE.name(), id = %record.id(), error = %err, "failed to migrate legacy record");
                }
            }
        }

        Ok(migrated)
    }

    fn import_draft(&self, raw: &str) -> Result<usize, serde_json::Error> {
        let draft: FormDraft = serde_json::from_str(raw)?;
        match self.store.put(&draft) {
            Ok(()) => Ok(1),
            Err(err) => {
                warn!(error = %err, "failed to migrate legacy form draft");
                Ok(0)
            }
        }
    }
}

/// Gives id-less legacy entries a content-derived id so an interrupted
/// migration can be re-run without duplicating them.
fn assign_missing_id(entry: &mut Value) {
    let Value::Object(fields) = entry else {
        return;
    };
    let has_id = fields
        .get("id")
        .and_then(Value::as_str)
        .is_some_and(|id| !id.trim().is_empty());
    if has_id {
        return;
    }

    fields.remove("id");
    let digest = sha256_hex(Value::Object(fields.clone()).to_string().as_bytes());
    fields.insert("id".to_string(), Value::String(format!("legacy-{}", &digest[..24])));
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use serde_json::json;

    use super::*;
    use crate::config::{CompressionConfig, StorageConfig};
    use crate::store::SortOrder;

    fn migrator(dir: &Path, store: &Store) -> LegacyMigrator {
        LegacyMigrator::new(
            store.clone(),
            Box::new(JsonDirSource::new(dir)),
            Compressor::new(CompressionConfig::default()),
            3,
        )
    }

    fn version_json(id: Option<&str>, timestamp: i64) -> Value {
        let mut value = json!({
            "timestamp": timestamp,
            "request": { "topic": format!("topic {timestamp}"), "size": "1K", "aspectRatio": "1:1" },
            "result": {
                "image": "data:image/png;base64,AAAA",
                "analysis": { "title": "t", "summary": "s", "keyPoints": [], "visualPlan": "p" }
            }
        });
        if let Some(id) = id {
            value["id"] = json!(id);
        }
        value
    }

    #[test]
    fn migrate_twice_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open_in_memory(&StorageConfig::default()).expect("store");
        let blob = json!([version_json(Some("a"), 1), version_json(Some("b"), 2)]);
        fs::write(dir.path().join("versions.json"), blob.to_string()).expect("write legacy");

        let migrator = migrator(dir.path(), &store);
        assert_eq!(migrator.migrate(LegacyKind::Versions), 2);
        assert!(!dir.path().join("versions.json").exists());
        assert_eq!(migrator.migrate(LegacyKind::Versions), 0);
        assert_eq!(store.count(Table::Versions).expect("count"), 2);
    }

    #[test]
    fn absent_blob_migrates_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open_in_memory(&StorageConfig::default()).expect("store");
        let migrator = migrator(dir.path(), &store);
        assert_eq!(migrator.migrate(LegacyKind::Versions), 0);
        assert_eq!(migrator.migrate(LegacyKind::Versions), 0);
        assert_eq!(store.count(Table::Versions).expect("count"), 0);
    }

    #[test]
    fn malformed_blob_is_left_in_place() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open_in_memory(&StorageConfig::default()).expect("store");
        let path = dir.path().join("templates.json");
        fs::write(&path, "{not json").expect("write legacy");

        let migrator = migrator(dir.path(), &store);
        assert_eq!(migrator.migrate(LegacyKind::Templates), 0);
        assert_eq!(fs::read_to_string(&path).expect("blob kept"), "{not json");
    }

    #[test]
    fn bad_entries_are_skipped_and_good_ones_counted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open_in_memory(&StorageConfig::default()).expect("store");
        let blob = json!([version_json(Some("good"), 5), { "id": "broken", "timestamp": "x" }]);
        fs::write(dir.path().join("versions.json"), blob.to_string()).expect("write legacy");

        let migrator = migrator(dir.path(), &store);
        assert_eq!(migrator.migrate(LegacyKind::Versions), 1);
        let stored: Option<VersionRecord> = store.get("good").expect("get");
        assert!(stored.is_some());
    }

    #[test]
    fn missing_ids_are_deterministic() {
        let mut first = version_json(None, 7);
        let mut second = version_json(None, 7);
        assign_missing_id(&mut first);
        assign_missing_id(&mut second);
        assert_eq!(first["id"], second["id"]);
        assert!(first["id"].as_str().is_some_and(|id| id.starts_with("legacy-")));
    }

    #[test]
    fn version_import_respects_capacity() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open_in_memory(&StorageConfig::default()).expect("store");
        let blob = Value::Array((0..6).map(|n| version_json(None, n)).collect());
        fs::write(dir.path().join("versions.json"), blob.to_string()).expect("write legacy");

        let migrator = migrator(dir.path(), &store);
        assert_eq!(migrator.migrate(LegacyKind::Versions), 6);

        let kept: Vec<VersionRecord> = store.scan_all(SortOrder::Descending).expect("scan");
        let timestamps: Vec<i64> = kept.iter().map(|record| record.timestamp).collect();
        assert_eq!(timestamps, vec![5, 4, 3]);
    }

    #[test]
    fn guard_runs_once_until_reset() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open_in_memory(&StorageConfig::default()).expect("store");
        fs::write(
            dir.path().join("form_draft.json"),
            json!({ "topic": "draft", "style": "flat", "palette": "mono" }).to_string(),
        )
        .expect("write legacy");
        fs::write(
            dir.path().join("batch_queue.json"),
            json!([{
                "id": "item-1", "topic": "x", "style": "s", "palette": "p",
                "status": "processing", "createdAt": 1
            }])
            .to_string(),
        )
        .expect("write legacy");

        let migrator = migrator(dir.path(), &store);
        let report = migrator.ensure_migrated().expect("first call migrates");
        assert_eq!(report.form_draft, 1);
        assert_eq!(report.batch_items, 1);
        assert!(migrator.has_run());
        assert!(migrator.ensure_migrated().is_none());

        let item: BatchQueueItem = store.get("item-1").expect("get").expect("item");
        assert_eq!(item.status, ItemStatus::Pending);
        assert_eq!(item.queue_id, crate::model::LEGACY_QUEUE_ID);

        migrator.reset_guard();
        assert_eq!(migrator.ensure_migrated(), Some(MigrationReport::default()));
    }
}

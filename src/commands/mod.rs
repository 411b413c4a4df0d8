pub mod batch;
pub mod draft;
pub mod migrate;
pub mod status;
pub mod templates;
pub mod versions;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use infographic_store::compress::Compressor;
use infographic_store::config::CoreConfig;
use infographic_store::history::VersionHistory;
use infographic_store::legacy::{JsonDirSource, LegacyMigrator};
use infographic_store::queue::BatchQueue;
use infographic_store::store::Store;
use infographic_store::util::ensure_directory;
use tracing::debug;

/// Everything a command needs: loaded config, the opened store and the
/// optional legacy migrator.
pub struct Context {
    pub config: CoreConfig,
    pub store: Store,
    pub migrator: Option<Arc<LegacyMigrator>>,
}

impl Context {
    pub fn open(config_path: Option<&Path>, db_path: &Path, legacy_dir: Option<&Path>) -> Result<Self> {
        let config = CoreConfig::load(config_path)?;
        if let Some(parent) = db_path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            ensure_directory(parent)?;
        }
        let store = Store::open(db_path, &config.storage)
            .with_context(|| format!("failed to open store at {}", db_path.display()))?;
        debug!(db_path = %db_path.display(), "store ready");

        let migrator = legacy_dir.map(|dir| {
            Arc::new(LegacyMigrator::new(
                store.clone(),
                Box::new(JsonDirSource::new(dir)),
                Compressor::new(config.compression.clone()),
                config.storage.max_versions,
            ))
        });

        Ok(Self {
            config,
            store,
            migrator,
        })
    }

    pub fn history(&self) -> VersionHistory {
        let history = VersionHistory::new(self.store.clone(), &self.config);
        match &self.migrator {
            Some(migrator) => history.with_migrator(Arc::clone(migrator)),
            None => history,
        }
    }

    pub fn queue(&self) -> BatchQueue {
        let queue = BatchQueue::new(self.store.clone(), self.config.batch.clone());
        match &self.migrator {
            Some(migrator) => queue.with_migrator(Arc::clone(migrator)),
            None => queue,
        }
    }
}

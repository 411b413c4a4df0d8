//! Keeps the version table within its retention cap.

use std::thread;

use tracing::{debug, info, warn};

use crate::error::CoreResult;
use crate::store::{SortOrder, Store, Table};

#[derive(Debug, Clone)]
pub struct CapacityEvictor {
    store: Store,
    table: Table,
    max_records: usize,
}

impl CapacityEvictor {
    pub fn new(store: Store, table: Table, max_records: usize) -> Self {
        Self {
            store,
            table,
            max_records,
        }
    }

    /// Deletes everything past the newest `max_records` rows and returns how
    /// many rows were removed.
    pub fn enforce(&self) -> CoreResult<usize> {
        let ids = self.store.scan_ids(self.table, SortOrder::Descending)?;
        if ids.len() <= self.max_records {
            return Ok(0);
        }

        let excess = &ids[self.max_records..];
        let removed = self.store.delete_all(self.table, excess)?;
        info!(
            table = self.table.name(),
            removed,
            kept = self.max_records,
            "evicted oldest records"
        );
        Ok(removed)
    }

    /// Runs [`Self::enforce`] on a detached thread. A failure is logged and
    /// left for the next write to retry.
    pub fn enforce_in_background(&self) -> thread::JoinHandle<usize> {
        let evictor = self.clone();
        thread::spawn(move || evictor.enforce_logged())
    }

    /// Runs [`Self::enforce`], logging instead of returning failures.
    pub fn enforce_logged(&self) -> usize {
        match self.enforce() {
            Ok(removed) => {
                debug!(table = self.table.name(), removed, "eviction pass finished");
                removed
            }
            Err(err) => {
                warn!(table = self.table.name(), error = %err, "eviction failed, will retry after next write");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::model::TemplateRecord;

    fn template(id: &str, created_at: i64) -> TemplateRecord {
        TemplateRecord {
            id: id.to_string(),
            name: format!("template {id}"),
            description: None,
            style: "flat".to_string(),
            palette: "mono".to_string(),
            size: Default::default(),
            aspect_ratio: Default::default(),
            tags: None,
            created_at,
            updated_at: created_at,
            created_by: "test".to_string(),
        }
    }

    #[test]
    fn enforce_keeps_newest_records() {
        let store = Store::open_in_memory(&StorageConfig::default()).expect("store");
        for n in 0..7 {
            store.put(&template(&format!("t{n}"), n)).expect("put");
        }

        let evictor = CapacityEvictor::new(store.clone(), Table::Templates, 4);
        assert_eq!(evictor.enforce().expect("enforce"), 3);

        let ids = store
            .scan_ids(Table::Templates, SortOrder::Descending)
            .expect("ids");
        assert_eq!(ids, vec!["t6", "t5", "t4", "t3"]);
        assert_eq!(evictor.enforce().expect("second pass"), 0);
    }

    #[test]
    fn background_pass_reports_removed_count() {
        let store = Store::open_in_memory(&StorageConfig::default()).expect("store");
        for n in 0..3 {
            store.put(&template(&format!("t{n}"), n)).expect("put");
        }

        let evictor = CapacityEvictor::new(store.clone(), Table::Templates, 1);
        let removed = evictor
            .enforce_in_background()
            .join()
            .expect("eviction thread");
        assert_eq!(removed, 2);
        assert_eq!(store.count(Table::Templates).expect("count"), 1);
    }
}

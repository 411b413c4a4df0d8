//! Version history: completed generations kept for comparison, capped at
//! `max_versions` records.

use std::sync::Arc;

use tracing::{debug, info};

use crate::compress::Compressor;
use crate::config::{CoreConfig, EvictionMode};
use crate::error::{CoreError, CoreResult};
use crate::evict::CapacityEvictor;
use crate::legacy::LegacyMigrator;
use crate::model::{Feedback, GenerationRequest, GenerationResult, VersionRecord};
use crate::store::{SortOrder, Store, Table};
use crate::util::{new_record_id, now_millis};

#[derive(Debug, Clone)]
pub struct VersionHistory {
    store: Store,
    compressor: Compressor,
    evictor: CapacityEvictor,
    eviction: EvictionMode,
    migrator: Option<Arc<LegacyMigrator>>,
}

impl VersionHistory {
    pub fn new(store: Store, config: &CoreConfig) -> Self {
        Self {
            evictor: CapacityEvictor::new(
                store.clone(),
                Table::Versions,
                config.storage.max_versions,
            ),
            store,
            compressor: Compressor::new(config.compression.clone()),
            eviction: config.storage.eviction,
            migrator: None,
        }
    }

    /// Runs the legacy import lazily before the first history operation.
    pub fn with_migrator(mut self, migrator: Arc<LegacyMigrator>) -> Self {
        self.migrator = Some(migrator);
        self
    }

    fn ensure_migrated(&self) {
        if let Some(migrator) = &self.migrator {
            migrator.ensure_migrated();
        }
    }

    /// Persists a finished generation and then trims the table back to its cap.
    pub fn save_version(
        &self,
        request: GenerationRequest,
        mut result: GenerationResult,
    ) -> CoreResult<VersionRecord> {
        self.ensure_migrated();

        result.image = self.compressor.compress(&result.image);
        let record = VersionRecord {
            id: new_record_id(),
            timestamp: now_millis(),
            request,
            result,
            feedback: None,
        };
        self.store.put(&record)?;
        debug!(id = %record.id, topic = %record.request.topic, "saved version");

        match self.eviction {
            EvictionMode::Inline => {
                self.evictor.enforce_logged();
            }
            EvictionMode::Background => {
                // detached; a failed pass is retried after the next save
                drop(self.evictor.enforce_in_background());
            }
        }

        Ok(record)
    }

    /// Newest first.
    pub fn list_versions(&self) -> CoreResult<Vec<VersionRecord>> {
        self.ensure_migrated();
        self.store.scan_all(SortOrder::Descending)
    }

    pub fn get_version(&self, id: &str) -> CoreResult<Option<VersionRecord>> {
        self.ensure_migrated();
        self.store.get(id)
    }

    pub fn attach_feedback(
        &self,
        id: &str,
        rating: u8,
        comment: Option<String>,
    ) -> CoreResult<VersionRecord> {
        if !(1..=5).contains(&rating) {
            return Err(CoreError::Validation(format!(
                "rating must be between 1 and 5, got {rating}"
            )));
        }
        self.ensure_migrated();

        let comment = comment
            .map(|comment| comment.trim().to_string())
            .filter(|comment| !comment.is_empty());
        self.store.update(id, |record: &mut VersionRecord| {
            record.feedback = Some(Feedback {
                rating,
                comment,
                timestamp: now_millis(),
            });
            Ok(())
        })
    }

    pub fn delete_version(&self, id: &str) -> CoreResult<bool> {
        self.ensure_migrated();
        self.store.delete(Table::Versions, id)
    }

    pub fn clear_versions(&self) -> CoreResult<usize> {
        self.ensure_migrated();
        let removed = self.store.clear(Table::Versions)?;
        info!(removed, "cleared version history");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Analysis, ImagePayload};

    fn history(max_versions: usize) -> VersionHistory {
        let mut config = CoreConfig::default();
        config.storage.max_versions = max_versions;
        config.storage.eviction = EvictionMode::Inline;
        let store = Store::open_in_memory(&config.storage).expect("store");
        VersionHistory::new(store, &config)
    }

    fn result(title: &str) -> GenerationResult {
        GenerationResult {
            image: ImagePayload::new("image/png", vec![7; 16]),
            analysis: Analysis {
                title: title.to_string(),
                summary: "summary".to_string(),
                key_points: vec!["one".to_string()],
                visual_plan: "plan".to_string(),
                citations: None,
            },
        }
    }

    fn request(topic: &str) -> GenerationRequest {
        GenerationRequest {
            topic: topic.to_string(),
            ..GenerationRequest::default()
        }
    }

    #[test]
    fn capacity_keeps_the_most_recent_saves() {
        let history = history(3);
        let mut saved = Vec::new();
        for n in 0..7 {
            let record = history
                .save_version(request(&format!("topic {n}")), result("r"))
                .expect("save");
            saved.push(record.id);
            std::thread::sleep(std::time::Duration::from_millis(2));
        }

        let kept: Vec<String> = history
            .list_versions()
            .expect("list")
            .into_iter()
            .map(|record| record.id)
            .collect();
        let newest: Vec<String> = saved.iter().rev().take(3).cloned().collect();
        assert_eq!(kept, newest);
    }

    #[test]
    fn feedback_is_validated_and_attached() {
        let history = history(10);
        let record = history
            .save_version(request("solar"), result("Solar"))
            .expect("save");

        let err = history
            .attach_feedback(&record.id, 6, None)
            .expect_err("rating out of range");
        assert!(matches!(err, CoreError::Validation(_)));

        let updated = history
            .attach_feedback(&record.id, 4, Some("  nice  ".to_string()))
            .expect("feedback");
        let feedback = updated.feedback.expect("feedback set");
        assert_eq!(feedback.rating, 4);
        assert_eq!(feedback.comment.as_deref(), Some("nice"));

        let missing = history
            .attach_feedback("nope", 3, None)
            .expect_err("missing version");
        assert!(matches!(missing, CoreError::ItemNotFound { .. }));
    }

    #[test]
    fn delete_and_clear_remove_records() {
        let history = history(10);
        let first = history.save_version(request("a"), result("a")).expect("save");
        history.save_version(request("b"), result("b")).expect("save");

        assert!(history.delete_version(&first.id).expect("delete"));
        assert!(!history.delete_version(&first.id).expect("delete again"));
        assert_eq!(history.clear_versions().expect("clear"), 1);
        assert!(history.list_versions().expect("list").is_empty());
    }
}

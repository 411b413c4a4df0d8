//! Saved style presets and their portable export bundle.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{CoreError, CoreResult};
use crate::model::TemplateRecord;
use crate::store::{SortOrder, Store, Table};
use crate::util::{new_record_id, now_millis, now_utc_string};

pub const BUNDLE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateBundle {
    pub format_version: u32,
    pub exported_at: String,
    pub templates: Vec<Value>,
}

#[derive(Debug, Clone)]
pub struct TemplateLibrary {
    store: Store,
}

impl TemplateLibrary {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Inserts a new template, or overwrites an existing one keeping its
    /// original `created_at`.
    pub fn save_template(&self, mut template: TemplateRecord) -> CoreResult<TemplateRecord> {
        if template.name.trim().is_empty() {
            return Err(CoreError::Validation("template name must not be empty".to_string()));
        }

        let now = now_millis();
        if template.id.trim().is_empty() {
            template.id = new_record_id();
            template.created_at = now;
        } else if let Some(existing) = self.store.get::<TemplateRecord>(&template.id)? {
            template.created_at = existing.created_at;
        } else if template.created_at == 0 {
            template.created_at = now;
        }
        template.updated_at = now;

        self.store.put(&template)?;
        Ok(template)
    }

    pub fn get_template(&self, id: &str) -> CoreResult<Option<TemplateRecord>> {
        self.store.get(id)
    }

    /// Newest first.
    pub fn list_templates(&self) -> CoreResult<Vec<TemplateRecord>> {
        self.store.scan_all(SortOrder::Descending)
    }

    pub fn delete_template(&self, id: &str) -> CoreResult<bool> {
        self.store.delete(Table::Templates, id)
    }

    pub fn export_templates(&self) -> CoreResult<TemplateBundle> {
        let templates = self
            .list_templates()?
            .iter()
            .map(|template| {
                serde_json::to_value(template)
                    .map_err(|err| CoreError::Validation(format!("failed to export template: {err}")))
            })
            .collect::<CoreResult<Vec<_>>>()?;

        Ok(TemplateBundle {
            format_version: BUNDLE_FORMAT_VERSION,
            exported_at: now_utc_string(),
            templates,
        })
    }

    /// Upserts every well-formed entry by id and returns how many landed.
    pub fn import_templates(&self, bundle: TemplateBundle) -> CoreResult<usize> {
        if bundle.format_version > BUNDLE_FORMAT_VERSION {
            return Err(CoreError::Validation(format!(
                "template bundle format {} is newer than supported {}",
                bundle.format_version, BUNDLE_FORMAT_VERSION
            )));
        }

        let mut parsed = Vec::with_capacity(bundle.templates.len());
        for (index, entry) in bundle.templates.into_iter().enumerate() {
            match serde_json::from_value::<TemplateRecord>(entry) {
                Ok(template) if !template.id.trim().is_empty() => parsed.push(template),
                Ok(_) => warn!(index, "skipping imported template without id"),
                Err(err) => warn!(index, error = %err, "skipping malformed imported template"),
            }
        }

        let imported = self.store.put_all(&parsed)?;
        info!(imported, "imported templates");
        Ok(imported)
    }
}

//! The single in-progress form draft.

use crate::error::CoreResult;
use crate::model::FormDraft;
use crate::store::{DRAFT_KEY, Store, Table};
use crate::util::now_millis;

#[derive(Debug, Clone)]
pub struct DraftStore {
    store: Store,
}

impl DraftStore {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn save_draft(&self, mut draft: FormDraft) -> CoreResult<FormDraft> {
        draft.saved_at = now_millis();
        self.store.put(&draft)?;
        Ok(draft)
    }

    pub fn load_draft(&self) -> CoreResult<Option<FormDraft>> {
        self.store.get(DRAFT_KEY)
    }

    pub fn clear_draft(&self) -> CoreResult<bool> {
        self.store.delete(Table::FormDraft, DRAFT_KEY)
    }
}

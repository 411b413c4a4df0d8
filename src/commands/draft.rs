use anyhow::Result;
use infographic_store::draft::DraftStore;
use infographic_store::util::write_json_stdout;
use serde_json::json;

use super::Context;
use crate::cli::DraftCommand;

pub fn run(context: &Context, command: DraftCommand) -> Result<()> {
    let drafts = DraftStore::new(context.store.clone());

    match command {
        DraftCommand::Show => write_json_stdout(&drafts.load_draft()?),
        DraftCommand::Clear => {
            let cleared = drafts.clear_draft()?;
            write_json_stdout(&json!({ "cleared": cleared }))
        }
    }
}

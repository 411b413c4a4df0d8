use std::fs;

use anyhow::{Context as _, Result};
use infographic_store::templates::{TemplateBundle, TemplateLibrary};
use infographic_store::util::{write_json_pretty, write_json_stdout};
use serde_json::json;
use tracing::info;

use super::Context;
use crate::cli::TemplatesCommand;

pub fn run(context: &Context, command: TemplatesCommand) -> Result<()> {
    let library = TemplateLibrary::new(context.store.clone());

    match command {
        TemplatesCommand::List => write_json_stdout(&library.list_templates()?),
        TemplatesCommand::Export { path } => {
            let bundle = library.export_templates()?;
            write_json_pretty(&path, &bundle)?;
            info!(path = %path.display(), templates = bundle.templates.len(), "exported templates");
            write_json_stdout(&json!({ "path": path, "exported": bundle.templates.len() }))
        }
        TemplatesCommand::Import { path } => {
            let raw = fs::read(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let bundle: TemplateBundle = serde_json::from_slice(&raw)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            let imported = library.import_templates(bundle)?;
            write_json_stdout(&json!({ "path": path, "imported": imported }))
        }
        TemplatesCommand::Delete { id } => {
            let deleted = library.delete_template(&id)?;
            write_json_stdout(&json!({ "id": id, "deleted": deleted }))
        }
    }
}

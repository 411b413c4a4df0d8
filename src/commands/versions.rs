use anyhow::{Result, bail};
use infographic_store::util::write_json_stdout;
use serde_json::json;
use tracing::info;

use super::Context;
use crate::cli::VersionsCommand;

pub fn run(context: &Context, command: VersionsCommand) -> Result<()> {
    let history = context.history();

    match command {
        VersionsCommand::List => {
            let versions = history.list_versions()?;
            info!(count = versions.len(), "listed versions");
            write_json_stdout(&versions)
        }
        VersionsCommand::Show { id } => match history.get_version(&id)? {
            Some(version) => write_json_stdout(&version),
            None => bail!("version not found: {id}"),
        },
        VersionsCommand::Delete { id } => {
            let deleted = history.delete_version(&id)?;
            write_json_stdout(&json!({ "id": id, "deleted": deleted }))
        }
        VersionsCommand::Clear => {
            let removed = history.clear_versions()?;
            write_json_stdout(&json!({ "removed": removed }))
        }
        VersionsCommand::Feedback(args) => {
            let version = history.attach_feedback(&args.id, args.rating, args.comment)?;
            write_json_stdout(&version.feedback)
        }
    }
}

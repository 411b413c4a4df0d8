use anyhow::{Result, bail};
use infographic_store::util::write_json_stdout;
use tracing::info;

use super::Context;

pub fn run(context: &Context) -> Result<()> {
    let Some(migrator) = &context.migrator else {
        bail!("migrate requires --legacy-dir");
    };

    let report = migrator.migrate_all();
    info!(total = report.total(), "migration finished");
    write_json_stdout(&report)
}

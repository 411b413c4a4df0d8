use std::collections::BTreeMap;

use anyhow::Result;
use infographic_store::store::{QuotaReport, Table};
use infographic_store::util::write_json_stdout;
use serde::Serialize;
use tracing::{info, warn};

use super::Context;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusReport {
    db_path: Option<String>,
    schema_version: i64,
    counts: BTreeMap<&'static str, usize>,
    quota: QuotaReport,
}

pub fn run(context: &Context) -> Result<()> {
    let mut counts = BTreeMap::new();
    for table in Table::ALL {
        counts.insert(table.name(), context.store.count(table)?);
    }

    let report = StatusReport {
        db_path: context.store.path().map(|path| path.display().to_string()),
        schema_version: context.store.schema_version()?,
        counts,
        quota: context.store.check_quota()?,
    };

    info!(
        schema_version = report.schema_version,
        used_bytes = report.quota.used_bytes,
        quota_bytes = report.quota.quota_bytes,
        "store status"
    );
    if report.quota.warning {
        warn!(
            used_bytes = report.quota.used_bytes,
            quota_bytes = report.quota.quota_bytes,
            "storage is nearly full; delete old versions to free space"
        );
    }

    write_json_stdout(&report)
}

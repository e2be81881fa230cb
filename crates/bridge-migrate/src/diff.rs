//! Record diffing between a source table and a destination view.

use std::collections::HashSet;
use tracing::{info, warn};

use crate::error::Result;
use crate::query::{QueryTemplate, RECORD_ID_COLUMN};
use crate::services::common::cell_to_string;
use crate::services::{QueryResult, QueryService};

/// Keys of `source` rows with no matching key in `target`, in source order.
///
/// Duplicate source keys are reported once (first occurrence). Rows with a
/// null key are skipped.
pub fn anti_join(source: &QueryResult, target: &QueryResult, key: &str) -> Result<Vec<String>> {
    let source_idx = source.require_column(key)?;
    let target_idx = target.require_column(key)?;

    let existing: HashSet<String> = target
        .rows
        .iter()
        .filter_map(|row| row.get(target_idx))
        .filter(|cell| !cell.is_null())
        .map(cell_to_string)
        .collect();

    let mut seen = HashSet::new();
    let mut missing = Vec::new();
    let mut nulls = 0usize;
    let mut duplicates = 0usize;

    for row in &source.rows {
        let Some(cell) = row.get(source_idx).filter(|c| !c.is_null()) else {
            nulls += 1;
            continue;
        };
        let value = cell_to_string(cell);
        if !seen.insert(value.clone()) {
            duplicates += 1;
            continue;
        }
        if !existing.contains(&value) {
            missing.push(value);
        }
    }

    if nulls > 0 {
        warn!("Skipped {} rows of {} with a null {}", nulls, source.table_id, key);
    }
    if duplicates > 0 {
        warn!(
            "Ignored {} duplicate {} values in {}",
            duplicates, key, source.table_id
        );
    }
    Ok(missing)
}

/// Record ids present in `source_table` but not yet in `data_view`.
pub async fn get_record_diff(
    service: &dyn QueryService,
    source_table: &str,
    data_view: &str,
    template: &QueryTemplate,
) -> Result<Vec<String>> {
    let source = service.query(&template.render(source_table)).await?;
    let target = service.query(&format!("SELECT * FROM {}", data_view)).await?;
    let missing = anti_join(&source, &target, RECORD_ID_COLUMN)?;
    info!(
        "{} of {} records in {} are not in {}",
        missing.len(),
        source.len(),
        source_table,
        data_view
    );
    Ok(missing)
}

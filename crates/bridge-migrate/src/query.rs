//! Query templates and file-handle resolution.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::services::common::{cell_to_string, quote_literal};
use crate::services::{QueryResult, QueryService, Record};

/// Placeholder substituted with the table id.
pub const SOURCE_TABLE_PLACEHOLDER: &str = "{source_table}";

/// Column identifying a record.
pub const RECORD_ID_COLUMN: &str = "recordId";

/// A query with a `{source_table}` placeholder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryTemplate(String);

impl Default for QueryTemplate {
    fn default() -> Self {
        Self(format!("SELECT * FROM {}", SOURCE_TABLE_PLACEHOLDER))
    }
}

impl QueryTemplate {
    /// Wraps a template string.
    pub fn new(template: impl Into<String>) -> Self {
        Self(template.into())
    }

    /// Raw template text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Checks that the template references the table.
    pub fn validate(&self) -> Result<()> {
        if self.0.contains(SOURCE_TABLE_PLACEHOLDER) {
            Ok(())
        } else {
            Err(Error::Config(format!(
                "query template '{}' must contain {}",
                self.0, SOURCE_TABLE_PLACEHOLDER
            )))
        }
    }

    /// Substitutes every placeholder with `table_id`.
    #[must_use]
    pub fn render(&self, table_id: &str) -> String {
        self.0.replace(SOURCE_TABLE_PLACEHOLDER, table_id)
    }
}

/// Query selecting the given record ids, or `None` when there are none.
#[must_use]
pub fn record_id_query(table_id: &str, ids: &[String], limit: Option<usize>) -> Option<String> {
    if ids.is_empty() {
        return None;
    }
    let list = ids
        .iter()
        .map(|id| quote_literal(id))
        .collect::<Vec<_>>()
        .join(",");
    let mut sql = format!(
        "SELECT * FROM {} WHERE {} IN ({})",
        table_id, RECORD_ID_COLUMN, list
    );
    if let Some(limit) = limit {
        sql.push_str(&format!(" LIMIT {}", limit));
    }
    Some(sql)
}

/// A query result whose file-handle column has been downloaded.
///
/// Every row is guaranteed to have a local path.
#[derive(Debug, Clone)]
pub struct ResolvedTable {
    /// Rows as returned by the query service.
    pub result: QueryResult,
    file_handle_field: String,
    paths: HashMap<String, PathBuf>,
}

impl ResolvedTable {
    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.result.len()
    }

    /// Whether the query returned no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.result.is_empty()
    }

    /// Rows paired with their downloaded files, in query order.
    pub fn records(&self) -> impl Iterator<Item = ResolvedRecord<'_>> + '_ {
        self.result.records().filter_map(move |record| {
            let reference = record.get(&self.file_handle_field).map(cell_to_string)?;
            let path = self.paths.get(&reference)?;
            Some(ResolvedRecord { record, path })
        })
    }
}

/// One row and the local path of its archive.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedRecord<'a> {
    /// The source row.
    pub record: Record<'a>,
    /// Downloaded archive.
    pub path: &'a Path,
}

/// Runs queries and materializes their file-handle column.
pub struct QueryResolver<'a> {
    service: &'a dyn QueryService,
    file_handle_field: &'a str,
}

impl<'a> QueryResolver<'a> {
    /// Creates a resolver downloading `file_handle_field`.
    pub fn new(service: &'a dyn QueryService, file_handle_field: &'a str) -> Self {
        Self {
            service,
            file_handle_field,
        }
    }

    /// Renders `template` for `table_id` and resolves it.
    pub async fn resolve(&self, table_id: &str, template: &QueryTemplate) -> Result<ResolvedTable> {
        self.resolve_sql(&template.render(table_id)).await
    }

    /// Runs `sql` and downloads the file-handle column of every row.
    pub async fn resolve_sql(&self, sql: &str) -> Result<ResolvedTable> {
        debug!("Running query: {}", sql);
        let result = self.service.query(sql).await?;
        let idx = result.require_column(self.file_handle_field)?;

        let paths = if result.is_empty() {
            HashMap::new()
        } else {
            self.service
                .download_column(&result, self.file_handle_field)
                .await?
        };

        for (row_idx, row) in result.rows.iter().enumerate() {
            let cell = row.get(idx).filter(|c| !c.is_null()).ok_or_else(|| {
                Error::Download(format!(
                    "Row {} of {} has no {} value",
                    row_idx, result.table_id, self.file_handle_field
                ))
            })?;
            let reference = cell_to_string(cell);
            if !paths.contains_key(&reference) {
                return Err(Error::Download(format!(
                    "File handle {} in row {} of {} was not downloaded",
                    reference, row_idx, result.table_id
                )));
            }
        }

        info!(
            "Resolved {} rows ({} files) from {}",
            result.len(),
            paths.len(),
            result.table_id
        );
        Ok(ResolvedTable {
            result,
            file_handle_field: self.file_handle_field.to_string(),
            paths,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::local::{LocalBackend, LocalConfig, TableFile};
    use serde_json::json;
    use tempfile::TempDir;

    fn backend_with_rows(rows: Vec<Vec<serde_json::Value>>) -> (TempDir, LocalBackend) {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(LocalConfig {
            root: dir.path().to_path_buf(),
        });
        backend
            .seed_table(
                "proj",
                "syn1",
                &TableFile {
                    headers: vec!["recordId".to_string(), "rawData".to_string()],
                    rows,
                    ..Default::default()
                },
            )
            .unwrap();
        (dir, backend)
    }

    #[test]
    fn test_template_render_replaces_all() {
        let template = QueryTemplate::new("SELECT * FROM {source_table} WHERE x IN (SELECT y FROM {source_table})");
        assert_eq!(
            template.render("syn9"),
            "SELECT * FROM syn9 WHERE x IN (SELECT y FROM syn9)"
        );
        assert_eq!(QueryTemplate::default().render("syn1"), "SELECT * FROM syn1");
    }

    #[test]
    fn test_template_validate() {
        assert!(QueryTemplate::default().validate().is_ok());
        assert!(matches!(
            QueryTemplate::new("SELECT * FROM syn1").validate(),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_record_id_query() {
        let ids = vec!["a".to_string(), "o'b".to_string()];
        assert_eq!(
            record_id_query("syn1", &ids, Some(10)).unwrap(),
            "SELECT * FROM syn1 WHERE recordId IN ('a','o''b') LIMIT 10"
        );
        assert_eq!(
            record_id_query("syn1", &ids[..1], None).unwrap(),
            "SELECT * FROM syn1 WHERE recordId IN ('a')"
        );
        assert_eq!(record_id_query("syn1", &[], Some(10)), None);
    }

    #[tokio::test]
    async fn test_resolve_pairs_rows_with_paths() {
        let (_dir, backend) = backend_with_rows(vec![
            vec![json!("r1"), json!(101)],
            vec![json!("r2"), json!("102")],
        ]);
        backend.seed_blob("101", b"one").unwrap();
        backend.seed_blob("102", b"two").unwrap();

        let resolver = QueryResolver::new(&backend, "rawData");
        let table = resolver.resolve("syn1", &QueryTemplate::default()).await.unwrap();

        let records: Vec<_> = table.records().collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].record.get("recordId"), Some(&json!("r1")));
        assert!(records[0].path.ends_with("101"));
        assert!(records[1].path.ends_with("102"));
    }

    #[tokio::test]
    async fn test_resolve_missing_column() {
        let (_dir, backend) = backend_with_rows(vec![]);
        let resolver = QueryResolver::new(&backend, "archive");

        let err = resolver
            .resolve("syn1", &QueryTemplate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingColumn { .. }));
    }

    #[tokio::test]
    async fn test_resolve_rejects_null_handle() {
        let (_dir, backend) = backend_with_rows(vec![vec![json!("r1"), json!(null)]]);
        let resolver = QueryResolver::new(&backend, "rawData");

        let err = resolver
            .resolve("syn1", &QueryTemplate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Download(_)));
    }

    #[tokio::test]
    async fn test_resolve_empty_table() {
        let (_dir, backend) = backend_with_rows(vec![]);
        let resolver = QueryResolver::new(&backend, "rawData");

        let table = resolver.resolve("syn1", &QueryTemplate::default()).await.unwrap();
        assert!(table.is_empty());
        assert_eq!(table.records().count(), 0);
    }
}

//! Collaborator services consumed by the migration pipeline.
//!
//! The pipeline never talks to a concrete backend directly. It goes through
//! three traits:
//!
//! - [`QueryService`]: enumerates tables, runs table queries and materializes
//!   file-handle columns locally.
//! - [`DestinationStore`]: creates folders and stores files with annotations.
//! - [`ObjectStore`]: replaces the native metadata of a stored object.
//!
//! Backends live in the submodules: [`synapse`] (REST), [`s3`] (object store)
//! and [`local`] (filesystem, all three traits).

pub mod common;
pub mod local;
#[cfg(feature = "s3")]
pub mod s3;
pub mod synapse;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{MigrationConfig, ObjectStoreConfig, ServiceConfig};
use crate::error::{Error, Result};

/// Flat string metadata attached to stored files and objects.
pub type Metadata = BTreeMap<String, String>;

/// A child entity of a source project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    /// Entity identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Entity type as reported by the service.
    #[serde(rename = "type")]
    pub entity_type: String,
}

impl TableInfo {
    /// Whether this entity is table-typed and therefore eligible for migration.
    #[must_use]
    pub fn is_table(&self) -> bool {
        self.entity_type == "table" || self.entity_type.ends_with(".TableEntity")
    }
}

/// Tabular result of a query: named columns over row-major cells.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Table the query selected from.
    pub table_id: String,
    /// Column names, in select order.
    pub headers: Vec<String>,
    /// Row cells, each row aligned with `headers`.
    pub rows: Vec<Vec<serde_json::Value>>,
}

impl QueryResult {
    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the result has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Position of a column, if present.
    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    /// Position of a column, or a schema error naming this result's table.
    pub fn require_column(&self, name: &str) -> Result<usize> {
        self.column_index(name)
            .ok_or_else(|| Error::missing_column(name, self.table_id.clone()))
    }

    /// Iterates the rows as immutable records.
    ///
    /// Calling this again restarts from the first row.
    #[must_use]
    pub fn records(&self) -> Records<'_> {
        Records {
            result: self,
            next: 0,
        }
    }
}

/// Borrowed view over one row of a [`QueryResult`].
#[derive(Debug, Clone, Copy)]
pub struct Record<'a> {
    index: usize,
    headers: &'a [String],
    values: &'a [serde_json::Value],
}

impl<'a> Record<'a> {
    /// Zero-based row index within the result.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Cell for `column`, if the column exists.
    #[must_use]
    pub fn get(&self, column: &str) -> Option<&'a serde_json::Value> {
        self.headers
            .iter()
            .position(|h| h == column)
            .and_then(|i| self.values.get(i))
    }

    /// Cell for `column`, or a schema error.
    pub fn require(&self, column: &str) -> Result<&'a serde_json::Value> {
        self.get(column)
            .ok_or_else(|| Error::missing_column(column, format!("row {}", self.index)))
    }
}

/// Iterator over the records of a [`QueryResult`].
#[derive(Debug, Clone)]
pub struct Records<'a> {
    result: &'a QueryResult,
    next: usize,
}

impl<'a> Iterator for Records<'a> {
    type Item = Record<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let values = self.result.rows.get(self.next)?;
        let record = Record {
            index: self.next,
            headers: &self.result.headers,
            values,
        };
        self.next += 1;
        Some(record)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.result.rows.len().saturating_sub(self.next);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Records<'_> {}

/// A destination folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folder {
    /// Folder identifier.
    pub id: String,
    /// Folder name.
    pub name: String,
}

/// Descriptor of a file stored in the destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEntity {
    /// Destination entity identifier.
    pub id: String,
    /// File handle backing the entity.
    pub file_handle_id: String,
    /// Object-store bucket holding the bytes.
    pub bucket: String,
    /// Object-store key holding the bytes.
    pub key: String,
}

/// Query side of the legacy store.
#[async_trait]
pub trait QueryService: Send + Sync {
    /// Backend name, for logging.
    fn service_type(&self) -> &'static str;

    /// Lists the table-typed children of a project.
    async fn list_tables(&self, project_id: &str) -> Result<Vec<TableInfo>>;

    /// Runs a query of the form `SELECT ... FROM <table> [WHERE ...] [LIMIT n]`.
    async fn query(&self, sql: &str) -> Result<QueryResult>;

    /// Downloads every file handle referenced in `column`.
    ///
    /// Returns a map from the stringified reference to its local path.
    async fn download_column(
        &self,
        result: &QueryResult,
        column: &str,
    ) -> Result<HashMap<String, PathBuf>>;
}

/// Destination folder store.
#[async_trait]
pub trait DestinationStore: Send + Sync {
    /// Creates a folder named `name` under `parent_id`.
    async fn create_folder(&self, parent_id: &str, name: &str) -> Result<Folder>;

    /// Looks up a child folder of `parent_id` by name.
    async fn find_folder(&self, parent_id: &str, name: &str) -> Result<Option<Folder>>;

    /// Stores a local file under `parent_id` with `annotations` attached.
    async fn store_file(
        &self,
        path: &Path,
        parent_id: &str,
        annotations: &Metadata,
    ) -> Result<StoredEntity>;
}

/// Object store holding the bytes behind stored entities.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Copies `bucket/key` onto itself, replacing its metadata with `metadata`.
    async fn replace_metadata(&self, bucket: &str, key: &str, metadata: &Metadata) -> Result<()>;
}

/// The collaborators of one migration run, created once and shared.
#[derive(Clone)]
pub struct Services {
    /// Query service.
    pub query: Arc<dyn QueryService>,
    /// Destination store.
    pub destination: Arc<dyn DestinationStore>,
    /// Object store.
    pub objects: Arc<dyn ObjectStore>,
}

/// Build the collaborators described by `config`.
pub async fn create_services(config: &MigrationConfig) -> Result<Services> {
    let (query, destination): (Arc<dyn QueryService>, Arc<dyn DestinationStore>) =
        match &config.service {
            ServiceConfig::Synapse(cfg) => {
                let client = Arc::new(synapse::SynapseClient::new(cfg.clone())?);
                (
                    client.clone() as Arc<dyn QueryService>,
                    client as Arc<dyn DestinationStore>,
                )
            }
            ServiceConfig::Local(cfg) => {
                let backend = Arc::new(local::LocalBackend::new(cfg.clone()));
                (
                    backend.clone() as Arc<dyn QueryService>,
                    backend as Arc<dyn DestinationStore>,
                )
            }
        };

    let objects: Arc<dyn ObjectStore> = match &config.object_store {
        #[cfg(feature = "s3")]
        ObjectStoreConfig::S3(cfg) => Arc::new(s3::S3ObjectStore::from_config(cfg).await),
        #[cfg(not(feature = "s3"))]
        ObjectStoreConfig::S3(_) => {
            return Err(Error::Config(
                "S3 object store requires the 's3' feature".to_string(),
            ))
        }
        ObjectStoreConfig::Local(cfg) => Arc::new(local::LocalObjectStore::new(cfg.root.clone())),
    };

    Ok(Services {
        query,
        destination,
        objects,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> QueryResult {
        QueryResult {
            table_id: "syn1".to_string(),
            headers: vec!["recordId".to_string(), "rawData".to_string()],
            rows: vec![vec![json!("a"), json!(1)], vec![json!("b"), json!(2)]],
        }
    }

    #[test]
    fn test_table_info_is_table() {
        let table = TableInfo {
            id: "syn1".to_string(),
            name: "t".to_string(),
            entity_type: "org.sagebionetworks.repo.model.table.TableEntity".to_string(),
        };
        let folder = TableInfo {
            entity_type: "org.sagebionetworks.repo.model.Folder".to_string(),
            ..table.clone()
        };
        assert!(table.is_table());
        assert!(!folder.is_table());
    }

    #[test]
    fn test_records_are_restartable() {
        let result = sample();
        let first: Vec<_> = result.records().map(|r| r.index()).collect();
        let second: Vec<_> = result.records().map(|r| r.index()).collect();
        assert_eq!(first, vec![0, 1]);
        assert_eq!(first, second);
        assert_eq!(result.records().len(), 2);
    }

    #[test]
    fn test_record_lookup() {
        let result = sample();
        let record = result.records().nth(1).unwrap();
        assert_eq!(record.get("recordId"), Some(&json!("b")));
        assert!(record.get("missing").is_none());
        assert!(matches!(
            record.require("missing"),
            Err(Error::MissingColumn { .. })
        ));
    }

    #[test]
    fn test_require_column_names_table() {
        let err = sample().require_column("healthCode").unwrap_err();
        assert_eq!(err.to_string(), "Column 'healthCode' not found in syn1");
    }
}

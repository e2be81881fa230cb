//! Configuration types for bridge-migrate.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::annotations::AnnotationSchema;
use crate::partition::PARTITION_SIZE;
use crate::query::QueryTemplate;
use crate::services::local::LocalConfig;
use crate::services::synapse::SynapseConfig;

/// Main migration configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Query service and destination store.
    #[serde(default)]
    pub service: ServiceConfig,
    /// Object store holding the bytes behind stored files.
    #[serde(default)]
    pub object_store: ObjectStoreConfig,
    /// Migration options.
    #[serde(default)]
    pub options: MigrationOptions,
}

/// Backend providing table queries and the destination store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServiceConfig {
    /// Synapse REST API.
    #[serde(rename = "synapse")]
    Synapse(SynapseConfig),
    /// Local directory tree.
    #[serde(rename = "local")]
    Local(LocalConfig),
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::Synapse(SynapseConfig::default())
    }
}

/// Backend for object metadata replacement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ObjectStoreConfig {
    /// AWS S3 (or a compatible endpoint).
    #[serde(rename = "s3")]
    S3(S3Config),
    /// Local directory tree.
    #[serde(rename = "local")]
    Local(LocalConfig),
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self::S3(S3Config::default())
    }
}

/// S3 settings. Credentials always come from the default AWS provider chain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct S3Config {
    /// Region override.
    #[serde(default)]
    pub region: Option<String>,
    /// Custom endpoint (e.g. a local S3-compatible server).
    #[serde(default)]
    pub endpoint_url: Option<String>,
    /// Use path-style addressing.
    #[serde(default)]
    pub force_path_style: bool,
}

/// Migration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationOptions {
    /// Dry run mode (no store writes, no object copies).
    #[serde(default)]
    pub dry_run: bool,
    /// Column holding file-handle references.
    #[serde(default = "default_file_handle_field")]
    pub file_handle_field: String,
    /// Query template with a `{source_table}` placeholder.
    #[serde(default)]
    pub query_str: QueryTemplate,
    /// Table ids skipped during a full migration.
    #[serde(default)]
    pub exclude_tables: BTreeSet<String>,
    /// Annotation keys attached to every stored file.
    #[serde(default)]
    pub annotation_schema: AnnotationSchema,
    /// Records per partition folder.
    #[serde(default = "default_partition_size")]
    pub partition_size: usize,
    /// Reuse a partition folder that already exists instead of creating one.
    #[serde(default)]
    pub reuse_partitions: bool,
    /// Upper bound on records copied by an incremental submission.
    #[serde(default)]
    pub limit: Option<usize>,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            file_handle_field: default_file_handle_field(),
            query_str: QueryTemplate::default(),
            exclude_tables: BTreeSet::new(),
            annotation_schema: AnnotationSchema::default(),
            partition_size: default_partition_size(),
            reuse_partitions: false,
            limit: None,
        }
    }
}

fn default_file_handle_field() -> String {
    "rawData".to_string()
}

fn default_partition_size() -> usize {
    PARTITION_SIZE
}

impl MigrationConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.options.partition_size == 0 {
            return Err(crate::error::Error::Config(
                "partition_size must be greater than 0".to_string(),
            ));
        }
        if self.options.file_handle_field.trim().is_empty() {
            return Err(crate::error::Error::Config(
                "file_handle_field cannot be empty".to_string(),
            ));
        }
        if self.options.limit == Some(0) {
            return Err(crate::error::Error::Config(
                "limit must be greater than 0 when set".to_string(),
            ));
        }
        self.options.query_str.validate()?;
        if let ServiceConfig::Synapse(cfg) = &self.service {
            crate::services::common::validate_url(&cfg.endpoint)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_config_defaults() {
        let options = MigrationOptions::default();
        assert_eq!(options.file_handle_field, "rawData");
        assert_eq!(options.partition_size, 9999);
        assert_eq!(options.annotation_schema, AnnotationSchema::Minimal);
        assert!(options.exclude_tables.is_empty());
        assert!(!options.dry_run);
        assert!(!options.reuse_partitions);
        assert!(matches!(MigrationConfig::default().service, ServiceConfig::Synapse(_)));
    }

    #[test]
    fn test_config_validate_partition_size() {
        let mut config = MigrationConfig::default();
        config.options.partition_size = 0;

        let result = config.validate();
        assert!(result.is_err());
    }

    #[test]
    fn test_config_validate_query_template() {
        let mut config = MigrationConfig::default();
        config.options.query_str = QueryTemplate::new("SELECT * FROM syn1");

        assert!(config.validate().is_err());
        config.options.query_str = QueryTemplate::new("SELECT * FROM {source_table} LIMIT 5");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validate_zero_limit() {
        let mut config = MigrationConfig::default();
        config.options.limit = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_yaml_parse() {
        let yaml = r#"
service:
  type: local
  root: ./fixture
object_store:
  type: local
  root: ./fixture
options:
  dry_run: true
  annotation_schema: extended
  exclude_tables: [syn3, syn4]
  query_str: "SELECT * FROM {source_table} WHERE dataGroups = 'test'"
"#;
        let config: MigrationConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(
            &config.service,
            ServiceConfig::Local(cfg) if cfg.root == PathBuf::from("./fixture")
        ));
        assert!(matches!(config.object_store, ObjectStoreConfig::Local(_)));
        assert!(config.options.dry_run);
        assert_eq!(config.options.annotation_schema, AnnotationSchema::Extended);
        assert!(config.options.exclude_tables.contains("syn4"));
        assert_eq!(
            config.options.query_str.as_str(),
            "SELECT * FROM {source_table} WHERE dataGroups = 'test'"
        );
        assert_eq!(
            config.options.query_str.render("syn1"),
            "SELECT * FROM syn1 WHERE dataGroups = 'test'"
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_yaml_synapse_defaults() {
        let yaml = r#"
service:
  type: synapse
  storage_location_id: 42
object_store:
  type: s3
  region: us-east-1
"#;
        let config: MigrationConfig = serde_yaml::from_str(yaml).unwrap();
        let ServiceConfig::Synapse(synapse) = &config.service else {
            panic!("expected synapse service");
        };
        assert_eq!(synapse.endpoint, "https://repo-prod.prod.sagebase.org");
        assert_eq!(synapse.storage_location_id, Some(42));
        let ObjectStoreConfig::S3(s3) = &config.object_store else {
            panic!("expected s3 object store");
        };
        assert_eq!(s3.region.as_deref(), Some("us-east-1"));
        assert!(!s3.force_path_style);
    }
}

// Migration tool - pedantic lints relaxed for CLI ergonomics
#![allow(clippy::pedantic)]

//! # Bridge Migration Tool
//!
//! `bridge-migrate` copies raw-data archives referenced by rows of legacy
//! Bridge exporter tables into a file-centric layout. Each row becomes a
//! stored file annotated with the row's identifying fields, and the same
//! annotations are written as user metadata on the backing S3 object.
//!
//! ## Modes
//!
//! | Mode | Command | Layout |
//! |------|---------|--------|
//! | Full migration | `copy` | every table of a project, `partition_N` folders of 9999 records |
//! | Incremental submission | `submit` | records of one table missing from a view, single folder |
//!
//! ## Quick Start
//!
//! ```bash
//! # Copy a whole project
//! bridge-migrate copy --source-project syn111 --data-folder syn222
//!
//! # Preview only
//! bridge-migrate copy --source-project syn111 --data-folder syn222 --dry-run
//!
//! # Submit records the view does not list yet
//! bridge-migrate submit --source-table syn333 --data-folder syn222 --data-view syn444 --limit 100
//! ```
//!
//! ## Configuration Example
//!
//! ```yaml
//! service:
//!   type: synapse
//!   endpoint: https://repo-prod.prod.sagebase.org
//!
//! object_store:
//!   type: s3
//!   region: us-east-1
//!
//! options:
//!   file_handle_field: rawData
//!   annotation_schema: minimal
//!   exclude_tables: [syn555]
//! ```

#![warn(missing_docs)]

pub mod annotations;
pub mod config;
pub mod copier;
pub mod diff;
pub mod error;
pub mod partition;
pub mod pipeline;
pub mod poll;
pub mod query;
pub mod services;

pub use annotations::{AnnotationSchema, Annotations};
pub use config::{MigrationConfig, MigrationOptions, ObjectStoreConfig, ServiceConfig};
pub use error::{Error, Result};
pub use pipeline::{FullMigration, IncrementalSubmission, MigrationReport, MigrationStats, Pipeline};
pub use services::{
    create_services, DestinationStore, ObjectStore, QueryResult, QueryService, Services,
};

//! End-to-end tests for bridge-migrate against the local filesystem backend.
//!
//! Run with: `cargo test --test integration_test`

#![allow(clippy::pedantic)]

use bridge_migrate::config::{MigrationConfig, MigrationOptions, ObjectStoreConfig, ServiceConfig};
use bridge_migrate::services::local::{LocalBackend, LocalConfig, LocalObjectStore, TableFile};
use bridge_migrate::{
    create_services, AnnotationSchema, FullMigration, IncrementalSubmission, Pipeline,
    QueryService,
};
use serde_json::json;
use tempfile::TempDir;

const HEADERS: [&str; 12] = [
    "recordId",
    "healthCode",
    "createdOn",
    "metadata.taskIdentifier",
    "substudyMemberships",
    "phoneInfo",
    "appVersion",
    "createdOnTimeZone",
    "dayInStudy",
    "dataType",
    "dataGroups",
    "rawData",
];

struct Fixture {
    dir: TempDir,
}

impl Fixture {
    /// Project `proj` with tables syn1 (3 rows), syn2 (2 rows) and syn3 (4 rows),
    /// destination folders `data` and `incoming`, views over both.
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let fixture = Self { dir };
        let backend = fixture.backend();

        for (table, rows) in [("syn1", 3), ("syn2", 2), ("syn3", 4)] {
            backend
                .seed_table("proj", table, &table_file(table, rows))
                .unwrap();
            for i in 0..rows {
                backend
                    .seed_blob(&format!("{}{}", table, i), format!("archive {} {}", table, i).as_bytes())
                    .unwrap();
            }
        }
        backend.seed_folder("data", "Data").unwrap();
        backend.seed_folder("incoming", "Incoming").unwrap();
        backend.seed_view("dataview", &["data"], &["recordId"]).unwrap();
        backend.seed_view("incomingview", &["incoming"], &["recordId"]).unwrap();
        fixture
    }

    fn config(&self, options: MigrationOptions) -> MigrationConfig {
        let local = LocalConfig {
            root: self.dir.path().to_path_buf(),
        };
        MigrationConfig {
            service: ServiceConfig::Local(local.clone()),
            object_store: ObjectStoreConfig::Local(local),
            options,
        }
    }

    async fn pipeline(&self, options: MigrationOptions) -> Pipeline {
        let config = self.config(options);
        config.validate().unwrap();
        let services = create_services(&config).await.unwrap();
        Pipeline::new(services, config.options)
    }

    fn backend(&self) -> LocalBackend {
        LocalBackend::new(LocalConfig {
            root: self.dir.path().to_path_buf(),
        })
    }

    fn objects(&self) -> LocalObjectStore {
        LocalObjectStore::new(self.dir.path().to_path_buf())
    }
}

fn table_file(table: &str, rows: usize) -> TableFile {
    TableFile {
        name: format!("Table {}", table),
        headers: HEADERS.iter().map(|h| (*h).to_string()).collect(),
        rows: (0..rows)
            .map(|i| {
                vec![
                    json!(format!("{}-rec{}", table, i)),
                    json!(format!("hc-{}", i)),
                    json!(1609459200000_i64 + (i as i64) * 1000),
                    json!("Tapping"),
                    json!("|study-a|"),
                    json!("iPhone"),
                    json!("1.0"),
                    json!("+0000"),
                    json!(i),
                    json!("tapping"),
                    json!(["test_user"]),
                    json!(format!("{}{}", table, i)),
                ]
            })
            .collect(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_full_migration_places_every_record_once() {
    let fixture = Fixture::new();
    let pipeline = fixture.pipeline(MigrationOptions::default()).await;

    let report = pipeline
        .copy_data(&FullMigration::new("proj", "data").exclude(["syn2"]))
        .await
        .unwrap();

    assert_eq!(report.stats.tables_processed, 2);
    assert_eq!(report.stats.tables_skipped, 1);
    assert_eq!(report.stats.copied, 7);

    let backend = fixture.backend();
    let partitions = backend.child_folders("data").unwrap();
    // one partition_0 per table
    assert_eq!(partitions.len(), 2);
    assert!(partitions.iter().all(|p| p.name == "partition_0"));

    let mut entities = Vec::new();
    for partition in &partitions {
        entities.extend(backend.entities_in(&partition.id).unwrap());
    }
    assert_eq!(entities.len(), 7);

    let objects = fixture.objects();
    for entity in &entities {
        assert_eq!(entity.annotations.len(), 5);
        let metadata = objects
            .read_metadata(&entity.bucket, &entity.key)
            .unwrap()
            .unwrap();
        assert_eq!(metadata, entity.annotations);
    }
    assert!(!entities
        .iter()
        .any(|e| e.annotations["recordId"].starts_with("syn2")));
}

#[tokio::test]
async fn test_dry_run_leaves_destination_untouched() {
    let fixture = Fixture::new();
    let options = MigrationOptions {
        dry_run: true,
        ..Default::default()
    };
    let pipeline = fixture.pipeline(options).await;

    let report = pipeline
        .copy_data(&FullMigration::new("proj", "data"))
        .await
        .unwrap();

    assert_eq!(report.stats.records, 9);
    assert_eq!(report.stats.copied, 0);
    assert_eq!(report.records.len(), 9);
    assert!(fixture.backend().child_folders("data").unwrap().is_empty());
    assert!(!fixture.dir.path().join("buckets").exists());
}

#[tokio::test]
async fn test_extended_schema_reaches_object_metadata() {
    let fixture = Fixture::new();
    let options = MigrationOptions {
        annotation_schema: AnnotationSchema::Extended,
        ..Default::default()
    };
    let pipeline = fixture.pipeline(options).await;

    let report = pipeline
        .copy_data(&FullMigration::new("proj", "data").exclude(["syn2", "syn3"]))
        .await
        .unwrap();

    let first = report.records[0].entity.clone().unwrap();
    let metadata = fixture
        .objects()
        .read_metadata(&first.bucket, &first.key)
        .unwrap()
        .unwrap();
    assert_eq!(metadata.len(), 14);
    assert_eq!(metadata["uploadedOn"], "2021-01-01T00:00:00.000Z");
    assert_eq!(metadata["assessmentId"], "Tapping");
    assert_eq!(metadata["dataGroups"], r#"["test_user"]"#);
}

#[tokio::test]
async fn test_incremental_submission_is_idempotent() {
    let fixture = Fixture::new();
    let pipeline = fixture.pipeline(MigrationOptions::default()).await;
    let job = IncrementalSubmission {
        source_table: "syn3".to_string(),
        data_folder: "incoming".to_string(),
        data_view: "incomingview".to_string(),
        limit: None,
    };

    let first = pipeline.submit_new_data(&job).await.unwrap();
    assert_eq!(first.stats.copied, 4);
    assert!(first.records.iter().all(|r| r.partition.is_none()));

    let second = pipeline.submit_new_data(&job).await.unwrap();
    assert_eq!(second.stats.copied, 0);
    assert_eq!(fixture.backend().entities_in("incoming").unwrap().len(), 4);
}

#[tokio::test]
async fn test_incremental_submission_respects_limit() {
    let fixture = Fixture::new();
    let pipeline = fixture.pipeline(MigrationOptions::default()).await;
    let job = IncrementalSubmission {
        source_table: "syn3".to_string(),
        data_folder: "incoming".to_string(),
        data_view: "incomingview".to_string(),
        limit: Some(3),
    };

    let copied: Vec<u64> = {
        let mut copied = Vec::new();
        for _ in 0..3 {
            copied.push(pipeline.submit_new_data(&job).await.unwrap().stats.copied);
        }
        copied
    };

    assert_eq!(copied, vec![3, 1, 0]);
    let record_ids: Vec<String> = fixture
        .backend()
        .entities_in("incoming")
        .unwrap()
        .into_iter()
        .map(|e| e.annotations["recordId"].clone())
        .collect();
    assert_eq!(record_ids.len(), 4);
}

#[tokio::test]
async fn test_reuse_partitions_on_rerun() {
    let fixture = Fixture::new();
    let options = MigrationOptions {
        reuse_partitions: true,
        ..Default::default()
    };
    let pipeline = fixture.pipeline(options).await;
    let job = FullMigration::new("proj", "data").exclude(["syn2", "syn3"]);

    pipeline.copy_data(&job).await.unwrap();
    pipeline.copy_data(&job).await.unwrap();

    let backend = fixture.backend();
    let partitions = backend.child_folders("data").unwrap();
    assert_eq!(partitions.len(), 1);
    // same file names overwrite as new versions
    assert_eq!(backend.entities_in(&partitions[0].id).unwrap().len(), 3);
}

#[tokio::test]
async fn test_missing_file_handle_column_aborts() {
    let fixture = Fixture::new();
    let options = MigrationOptions {
        file_handle_field: "archive".to_string(),
        ..Default::default()
    };
    let pipeline = fixture.pipeline(options).await;

    let err = pipeline
        .copy_data(&FullMigration::new("proj", "data"))
        .await
        .unwrap_err();

    assert!(matches!(err, bridge_migrate::Error::MissingColumn { .. }));
    assert!(fixture.backend().child_folders("data").unwrap().is_empty());
}

#[test]
fn test_config_file_round_trip() {
    let fixture = Fixture::new();
    let path = fixture.dir.path().join("migration.yaml");
    let yaml = serde_yaml::to_string(&fixture.config(MigrationOptions::default())).unwrap();
    std::fs::write(&path, yaml).unwrap();

    let config = MigrationConfig::from_file(&path).unwrap();
    config.validate().unwrap();

    let services = tokio_test::block_on(create_services(&config)).unwrap();
    assert_eq!(services.query.service_type(), "local");
}

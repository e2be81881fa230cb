//! Tests for the local filesystem backend.

use super::*;
use serde_json::json;
use tempfile::TempDir;

fn backend() -> (TempDir, LocalBackend) {
    let dir = TempDir::new().unwrap();
    let backend = LocalBackend::new(LocalConfig {
        root: dir.path().to_path_buf(),
    });
    (dir, backend)
}

fn sample_table() -> TableFile {
    TableFile {
        name: "Tapping".to_string(),
        entity_type: "table".to_string(),
        headers: vec!["recordId".to_string(), "rawData".to_string()],
        rows: vec![
            vec![json!("r1"), json!(101)],
            vec![json!("r2"), json!(102)],
            vec![json!("o'neil"), json!(null)],
        ],
    }
}

#[test]
fn test_parse_select_star() {
    let q = LocalQuery::parse("SELECT * FROM syn1").unwrap();
    assert_eq!(q.columns, None);
    assert_eq!(q.table, "syn1");
    assert_eq!(q.filter, None);
    assert_eq!(q.limit, None);
}

#[test]
fn test_parse_in_list_and_limit() {
    let q = LocalQuery::parse("select recordId FROM syn1 WHERE recordId IN ('a', 'b''c', 3) LIMIT 10;")
        .unwrap();
    assert_eq!(q.columns, Some(vec!["recordId".to_string()]));
    assert_eq!(
        q.filter,
        Some((
            "recordId".to_string(),
            vec!["a".to_string(), "b'c".to_string(), "3".to_string()]
        ))
    );
    assert_eq!(q.limit, Some(10));
}

#[test]
fn test_parse_equality() {
    let q = LocalQuery::parse("SELECT * FROM v1 WHERE parentId = 'folder-1'").unwrap();
    assert_eq!(
        q.filter,
        Some(("parentId".to_string(), vec!["folder-1".to_string()]))
    );
}

#[test]
fn test_parse_rejects_unsupported() {
    assert!(LocalQuery::parse("DELETE FROM syn1").is_err());
    assert!(LocalQuery::parse("SELECT * FROM syn1 ORDER BY x").is_err());
    assert!(LocalQuery::parse("SELECT * FROM syn1 WHERE a > 1").is_err());
    assert!(LocalQuery::parse("SELECT * FROM syn1 WHERE a IN ('x'").is_err());
}

#[test]
fn test_parse_non_ascii_condition_is_an_error() {
    assert!(matches!(
        LocalQuery::parse("SELECT * FROM syn1 WHERE a x\u{f1}"),
        Err(Error::Query(_))
    ));
    assert!(matches!(
        LocalQuery::parse("SELECT * FROM syn1 WHERE a \u{f1}"),
        Err(Error::Query(_))
    ));

    let q = LocalQuery::parse("SELECT * FROM syn1 WHERE name = 'pe\u{f1}a'").unwrap();
    assert_eq!(
        q.filter,
        Some(("name".to_string(), vec!["pe\u{f1}a".to_string()]))
    );
}

#[tokio::test]
async fn test_list_tables_and_query() {
    let (_dir, backend) = backend();
    backend.seed_table("proj", "syn1", &sample_table()).unwrap();

    let tables = backend.list_tables("proj").await.unwrap();
    assert_eq!(tables.len(), 1);
    assert_eq!(tables[0].id, "syn1");
    assert!(tables[0].is_table());

    let all = backend.query("SELECT * FROM syn1").await.unwrap();
    assert_eq!(all.len(), 3);

    let some = backend
        .query("SELECT * FROM syn1 WHERE recordId IN ('r2', 'o''neil')")
        .await
        .unwrap();
    assert_eq!(some.len(), 2);
    assert_eq!(some.rows[0][0], json!("r2"));

    let limited = backend.query("SELECT recordId FROM syn1 LIMIT 1").await.unwrap();
    assert_eq!(limited.headers, vec!["recordId"]);
    assert_eq!(limited.rows, vec![vec![json!("r1")]]);
}

#[tokio::test]
async fn test_query_unknown_table_and_column() {
    let (_dir, backend) = backend();
    backend.seed_table("proj", "syn1", &sample_table()).unwrap();

    assert!(matches!(
        backend.query("SELECT * FROM syn404").await,
        Err(Error::Query(_))
    ));
    assert!(matches!(
        backend.query("SELECT nope FROM syn1").await,
        Err(Error::Query(_))
    ));
    assert!(backend.list_tables("missing").await.is_err());
}

#[tokio::test]
async fn test_download_column() {
    let (_dir, backend) = backend();
    backend.seed_table("proj", "syn1", &sample_table()).unwrap();
    backend.seed_blob("101", b"zip-1").unwrap();
    backend.seed_blob("102", b"zip-2").unwrap();

    let result = backend.query("SELECT * FROM syn1").await.unwrap();
    let paths = backend.download_column(&result, "rawData").await.unwrap();

    assert_eq!(paths.len(), 2);
    assert_eq!(std::fs::read(&paths["101"]).unwrap(), b"zip-1");
    assert!(backend.download_column(&result, "missing").await.is_err());
}

#[tokio::test]
async fn test_download_missing_blob() {
    let (_dir, backend) = backend();
    backend.seed_table("proj", "syn1", &sample_table()).unwrap();
    backend.seed_blob("101", b"zip-1").unwrap();

    let result = backend.query("SELECT * FROM syn1").await.unwrap();
    assert!(matches!(
        backend.download_column(&result, "rawData").await,
        Err(Error::Download(_))
    ));
}

#[tokio::test]
async fn test_folders() {
    let (_dir, backend) = backend();
    backend.seed_folder("data", "Data").unwrap();

    let created = backend.create_folder("data", "partition_0").await.unwrap();
    assert_eq!(created.name, "partition_0");

    let found = backend.find_folder("data", "partition_0").await.unwrap();
    assert_eq!(found, Some(created));
    assert_eq!(backend.find_folder("data", "partition_1").await.unwrap(), None);

    assert!(matches!(
        backend.create_folder("nowhere", "partition_0").await,
        Err(Error::Store(_))
    ));
}

#[tokio::test]
async fn test_store_file_and_view() {
    let (dir, backend) = backend();
    backend.seed_folder("data", "Data").unwrap();
    backend.seed_view("view1", &["data"], &["recordId"]).unwrap();
    let partition = backend.create_folder("data", "partition_0").await.unwrap();

    let blob = backend.seed_blob("101", b"zip-1").unwrap();
    let mut annotations = Metadata::new();
    annotations.insert("recordId".to_string(), "r1".to_string());

    let stored = backend.store_file(&blob, &partition.id, &annotations).await.unwrap();
    assert_eq!(stored.bucket, LOCAL_BUCKET);
    assert_eq!(stored.key, format!("{}/101", partition.id));
    assert!(dir.path().join("buckets/local").join(&stored.key).exists());

    let again = backend.store_file(&blob, &partition.id, &annotations).await.unwrap();
    assert_eq!(again.id, stored.id);

    let view = backend.query("SELECT * FROM view1").await.unwrap();
    assert_eq!(view.len(), 1);
    let idx = view.column_index("recordId").unwrap();
    assert_eq!(view.rows[0][idx], json!("r1"));
    assert_eq!(backend.entities_in(&partition.id).unwrap().len(), 1);
}

#[tokio::test]
async fn test_object_store_replace_metadata() {
    let (dir, backend) = backend();
    backend.seed_folder("data", "Data").unwrap();
    let blob = backend.seed_blob("101", b"zip-1").unwrap();
    let stored = backend.store_file(&blob, "data", &Metadata::new()).await.unwrap();

    let objects = LocalObjectStore::new(dir.path().to_path_buf());
    let mut metadata = Metadata::new();
    metadata.insert("recordId".to_string(), "r1".to_string());

    objects
        .replace_metadata(&stored.bucket, &stored.key, &metadata)
        .await
        .unwrap();
    assert_eq!(
        objects.read_metadata(&stored.bucket, &stored.key).unwrap(),
        Some(metadata.clone())
    );

    assert!(matches!(
        objects.replace_metadata("local", "missing/key", &metadata).await,
        Err(Error::ObjectStore(_))
    ));
}

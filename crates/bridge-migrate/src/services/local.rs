//! Local filesystem backend.
//!
//! Implements every collaborator trait against a directory tree, so a whole
//! migration can be rehearsed offline:
//!
//! ```text
//! <root>/projects/<project>/<table>.json   source tables
//! <root>/views/<view>.json                 {"scope": [folder ids], "columns": [...]}
//! <root>/blobs/<fileHandleId>              raw archives
//! <root>/folders/<folderId>/folder.json    destination folders
//! <root>/folders/<folderId>/<name>.entity.json
//! <root>/buckets/<bucket>/<key>[.metadata.json]
//! ```
//!
//! Queries support `SELECT <cols|*> FROM <id> [WHERE <col> IN (...) | <col> = '...'] [LIMIT n]`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Error, Result};
use crate::services::common::{cell_to_string, table_ref_from_sql};
use crate::services::{
    DestinationStore, Folder, Metadata, ObjectStore, QueryResult, QueryService, StoredEntity,
    TableInfo,
};

/// Bucket name used for files stored by the local backend.
pub const LOCAL_BUCKET: &str = "local";

/// Configuration for the local backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Root directory of the backend.
    pub root: PathBuf,
}

/// A table file under `projects/<project>/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableFile {
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Entity type.
    #[serde(rename = "type", default = "default_entity_type")]
    pub entity_type: String,
    /// Column names.
    pub headers: Vec<String>,
    /// Row cells.
    #[serde(default)]
    pub rows: Vec<Vec<serde_json::Value>>,
}

impl Default for TableFile {
    fn default() -> Self {
        Self {
            name: String::new(),
            entity_type: default_entity_type(),
            headers: Vec::new(),
            rows: Vec::new(),
        }
    }
}

fn default_entity_type() -> String {
    "table".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ViewFile {
    scope: Vec<String>,
    #[serde(default)]
    columns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FolderFile {
    id: String,
    name: String,
    parent_id: Option<String>,
}

/// A file entity stored by the local backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalEntity {
    /// Entity identifier.
    pub id: String,
    /// File name.
    pub name: String,
    /// Containing folder.
    pub parent_id: String,
    /// Backing file handle.
    pub file_handle_id: String,
    /// Backing bucket.
    pub bucket: String,
    /// Backing key.
    pub key: String,
    /// Annotations attached at store time.
    pub annotations: Metadata,
}

/// Filesystem implementation of [`QueryService`] and [`DestinationStore`].
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Creates a backend rooted at `config.root`.
    #[must_use]
    pub fn new(config: LocalConfig) -> Self {
        Self { root: config.root }
    }

    fn folder_dir(&self, id: &str) -> PathBuf {
        self.root.join("folders").join(id)
    }

    /// Writes a source table into a project.
    pub fn seed_table(&self, project_id: &str, table_id: &str, table: &TableFile) -> Result<()> {
        let dir = self.root.join("projects").join(project_id);
        fs::create_dir_all(&dir)?;
        write_json(&dir.join(format!("{}.json", table_id)), table)
    }

    /// Writes a view scoped to the given folders, declaring annotation `columns`.
    pub fn seed_view(&self, view_id: &str, scope: &[&str], columns: &[&str]) -> Result<()> {
        let dir = self.root.join("views");
        fs::create_dir_all(&dir)?;
        let view = ViewFile {
            scope: scope.iter().map(|s| (*s).to_string()).collect(),
            columns: columns.iter().map(|c| (*c).to_string()).collect(),
        };
        write_json(&dir.join(format!("{}.json", view_id)), &view)
    }

    /// Writes a raw archive for a file handle.
    pub fn seed_blob(&self, file_handle_id: &str, bytes: &[u8]) -> Result<PathBuf> {
        let dir = self.root.join("blobs");
        fs::create_dir_all(&dir)?;
        let path = dir.join(file_handle_id);
        fs::write(&path, bytes)?;
        Ok(path)
    }

    /// Creates a top-level destination folder with a fixed id.
    pub fn seed_folder(&self, folder_id: &str, name: &str) -> Result<()> {
        self.write_folder(&FolderFile {
            id: folder_id.to_string(),
            name: name.to_string(),
            parent_id: None,
        })
    }

    fn write_folder(&self, folder: &FolderFile) -> Result<()> {
        let dir = self.folder_dir(&folder.id);
        fs::create_dir_all(&dir)?;
        write_json(&dir.join("folder.json"), folder)
    }

    fn folders(&self) -> Result<Vec<FolderFile>> {
        let dir = self.root.join("folders");
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut folders = Vec::new();
        for entry in sorted_entries(&dir)? {
            let meta = entry.join("folder.json");
            if meta.exists() {
                folders.push(read_json(&meta)?);
            }
        }
        Ok(folders)
    }

    /// Child folders of `parent_id`, sorted by name.
    pub fn child_folders(&self, parent_id: &str) -> Result<Vec<Folder>> {
        let mut children: Vec<Folder> = self
            .folders()?
            .into_iter()
            .filter(|f| f.parent_id.as_deref() == Some(parent_id))
            .map(|f| Folder {
                id: f.id,
                name: f.name,
            })
            .collect();
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(children)
    }

    /// File entities stored directly in `folder_id`, sorted by name.
    pub fn entities_in(&self, folder_id: &str) -> Result<Vec<LocalEntity>> {
        let dir = self.folder_dir(folder_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut entities = Vec::new();
        for path in sorted_entries(&dir)? {
            let is_entity = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(".entity.json"));
            if is_entity {
                entities.push(read_json(&path)?);
            }
        }
        Ok(entities)
    }

    /// Folder ids in `scope` plus all of their descendants.
    fn expand_scope(&self, scope: &[String]) -> Result<Vec<String>> {
        let folders = self.folders()?;
        let mut in_scope: BTreeSet<String> = scope.iter().cloned().collect();
        loop {
            let before = in_scope.len();
            for folder in &folders {
                if let Some(parent) = &folder.parent_id {
                    if in_scope.contains(parent) {
                        in_scope.insert(folder.id.clone());
                    }
                }
            }
            if in_scope.len() == before {
                break;
            }
        }
        Ok(in_scope.into_iter().collect())
    }

    fn load_source(&self, id: &str) -> Result<QueryResult> {
        let view_path = self.root.join("views").join(format!("{}.json", id));
        if view_path.exists() {
            let view: ViewFile = read_json(&view_path)?;
            return self.view_rows(id, &view);
        }

        let projects = self.root.join("projects");
        if projects.exists() {
            for project in sorted_entries(&projects)? {
                let path = project.join(format!("{}.json", id));
                if path.exists() {
                    let table: TableFile = read_json(&path)?;
                    return Ok(QueryResult {
                        table_id: id.to_string(),
                        headers: table.headers,
                        rows: table.rows,
                    });
                }
            }
        }
        Err(Error::Query(format!("Table or view '{}' does not exist", id)))
    }

    fn view_rows(&self, view_id: &str, view: &ViewFile) -> Result<QueryResult> {
        let mut entities = Vec::new();
        for folder in self.expand_scope(&view.scope)? {
            entities.extend(self.entities_in(&folder)?);
        }

        let mut keys: Vec<&str> = view.columns.iter().map(String::as_str).collect();
        let extra: BTreeSet<&str> = entities
            .iter()
            .flat_map(|e| e.annotations.keys().map(String::as_str))
            .filter(|k| !keys.contains(k))
            .collect();
        keys.extend(extra);
        let mut headers = vec!["id".to_string(), "name".to_string(), "parentId".to_string()];
        headers.extend(keys.iter().map(|k| (*k).to_string()));

        let rows = entities
            .iter()
            .map(|e| {
                let mut row = vec![
                    serde_json::Value::String(e.id.clone()),
                    serde_json::Value::String(e.name.clone()),
                    serde_json::Value::String(e.parent_id.clone()),
                ];
                row.extend(keys.iter().map(|k| {
                    e.annotations
                        .get(*k)
                        .map_or(serde_json::Value::Null, |v| serde_json::Value::String(v.clone()))
                }));
                row
            })
            .collect();

        Ok(QueryResult {
            table_id: view_id.to_string(),
            headers,
            rows,
        })
    }
}

#[async_trait]
impl QueryService for LocalBackend {
    fn service_type(&self) -> &'static str {
        "local"
    }

    async fn list_tables(&self, project_id: &str) -> Result<Vec<TableInfo>> {
        let dir = self.root.join("projects").join(project_id);
        if !dir.exists() {
            return Err(Error::Query(format!("Project '{}' does not exist", project_id)));
        }
        let mut tables = Vec::new();
        for path in sorted_entries(&dir)? {
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let table: TableFile = read_json(&path)?;
            tables.push(TableInfo {
                id: id.to_string(),
                name: table.name,
                entity_type: table.entity_type,
            });
        }
        Ok(tables)
    }

    async fn query(&self, sql: &str) -> Result<QueryResult> {
        let parsed = LocalQuery::parse(sql)?;
        let source = self.load_source(&parsed.table)?;
        parsed.apply(source)
    }

    async fn download_column(
        &self,
        result: &QueryResult,
        column: &str,
    ) -> Result<HashMap<String, PathBuf>> {
        let idx = result.require_column(column)?;
        let mut paths = HashMap::new();
        for row in &result.rows {
            let Some(cell) = row.get(idx).filter(|c| !c.is_null()) else {
                continue;
            };
            let reference = cell_to_string(cell);
            let path = self.root.join("blobs").join(&reference);
            if !path.exists() {
                return Err(Error::Download(format!(
                    "File handle {} has no blob at {}",
                    reference,
                    path.display()
                )));
            }
            paths.insert(reference, path);
        }
        Ok(paths)
    }
}

#[async_trait]
impl DestinationStore for LocalBackend {
    async fn create_folder(&self, parent_id: &str, name: &str) -> Result<Folder> {
        if !self.folder_dir(parent_id).exists() {
            return Err(Error::Store(format!("Parent folder '{}' not found", parent_id)));
        }
        let folder = FolderFile {
            id: format!("folder-{}", uuid::Uuid::new_v4().simple()),
            name: name.to_string(),
            parent_id: Some(parent_id.to_string()),
        };
        self.write_folder(&folder)?;
        debug!("Created local folder {} ({})", folder.name, folder.id);
        Ok(Folder {
            id: folder.id,
            name: folder.name,
        })
    }

    async fn find_folder(&self, parent_id: &str, name: &str) -> Result<Option<Folder>> {
        Ok(self
            .child_folders(parent_id)?
            .into_iter()
            .find(|f| f.name == name))
    }

    async fn store_file(
        &self,
        path: &Path,
        parent_id: &str,
        annotations: &Metadata,
    ) -> Result<StoredEntity> {
        let dir = self.folder_dir(parent_id);
        if !dir.exists() {
            return Err(Error::Store(format!("Parent folder '{}' not found", parent_id)));
        }
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Store(format!("No file name in {}", path.display())))?
            .to_string();

        let entity_path = dir.join(format!("{}.entity.json", name));
        let id = if entity_path.exists() {
            read_json::<LocalEntity>(&entity_path)?.id
        } else {
            format!("file-{}", uuid::Uuid::new_v4().simple())
        };

        let key = format!("{}/{}", parent_id, name);
        let object_path = self.root.join("buckets").join(LOCAL_BUCKET).join(&key);
        if let Some(parent) = object_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(path, &object_path)
            .map_err(|e| Error::Store(format!("Copying {}: {}", path.display(), e)))?;

        let entity = LocalEntity {
            id,
            name,
            parent_id: parent_id.to_string(),
            file_handle_id: uuid::Uuid::new_v4().simple().to_string(),
            bucket: LOCAL_BUCKET.to_string(),
            key,
            annotations: annotations.clone(),
        };
        write_json(&entity_path, &entity)?;

        Ok(StoredEntity {
            id: entity.id,
            file_handle_id: entity.file_handle_id,
            bucket: entity.bucket,
            key: entity.key,
        })
    }
}

/// Filesystem implementation of [`ObjectStore`].
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    /// Creates an object store rooted at `root`.
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.root.join("buckets").join(bucket).join(key)
    }

    fn metadata_path(&self, bucket: &str, key: &str) -> PathBuf {
        let mut name: OsString = self.object_path(bucket, key).into_os_string();
        name.push(".metadata.json");
        PathBuf::from(name)
    }

    /// Reads the metadata last written for an object.
    pub fn read_metadata(&self, bucket: &str, key: &str) -> Result<Option<Metadata>> {
        let path = self.metadata_path(bucket, key);
        if !path.exists() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn replace_metadata(&self, bucket: &str, key: &str, metadata: &Metadata) -> Result<()> {
        if !self.object_path(bucket, key).exists() {
            return Err(Error::ObjectStore(format!(
                "NoSuchKey: s3://{}/{}",
                bucket, key
            )));
        }
        write_json(&self.metadata_path(bucket, key), metadata)
            .map_err(|e| Error::ObjectStore(e.to_string()))
    }
}

/// The subset of SQL the local backend understands.
#[derive(Debug, Clone, PartialEq, Eq)]
struct LocalQuery {
    columns: Option<Vec<String>>,
    table: String,
    filter: Option<(String, Vec<String>)>,
    limit: Option<usize>,
}

impl LocalQuery {
    fn parse(sql: &str) -> Result<Self> {
        let text = sql.trim().trim_end_matches(';').trim();
        let upper = text.to_ascii_uppercase();
        if !upper.starts_with("SELECT ") {
            return Err(unsupported(sql, "expected SELECT"));
        }
        let from = upper
            .find(" FROM ")
            .ok_or_else(|| unsupported(sql, "expected FROM"))?;
        let select = text[6..from].trim();
        let columns = if select == "*" {
            None
        } else {
            Some(select.split(',').map(|c| c.trim().to_string()).collect())
        };

        let table = table_ref_from_sql(text)?;
        let after_from = text[from + 6..].trim_start();
        let mut rest = after_from[after_from.find(char::is_whitespace).unwrap_or(after_from.len())..]
            .trim()
            .to_string();

        let mut limit = None;
        let rest_upper = rest.to_ascii_uppercase();
        if let Some(pos) = rest_upper.rfind("LIMIT") {
            let at_boundary = pos == 0 || rest[..pos].ends_with(char::is_whitespace);
            if let (true, Ok(n)) = (at_boundary, rest[pos + 5..].trim().parse::<usize>()) {
                limit = Some(n);
                rest = rest[..pos].trim().to_string();
            }
        }

        let filter = if rest.is_empty() {
            None
        } else if rest.to_ascii_uppercase().starts_with("WHERE ") {
            Some(parse_condition(rest[6..].trim(), sql)?)
        } else {
            return Err(unsupported(sql, "expected WHERE or LIMIT"));
        };

        Ok(Self {
            columns,
            table,
            filter,
            limit,
        })
    }

    fn apply(&self, source: QueryResult) -> Result<QueryResult> {
        let mut rows = source.rows;

        if let Some((column, values)) = &self.filter {
            let idx = source
                .headers
                .iter()
                .position(|h| h == column)
                .ok_or_else(|| Error::Query(format!("Unknown column '{}'", column)))?;
            let wanted: HashSet<&str> = values.iter().map(String::as_str).collect();
            rows.retain(|row| {
                row.get(idx)
                    .is_some_and(|cell| !cell.is_null() && wanted.contains(cell_to_string(cell).as_str()))
            });
        }
        if let Some(limit) = self.limit {
            rows.truncate(limit);
        }

        let Some(columns) = &self.columns else {
            return Ok(QueryResult {
                table_id: source.table_id,
                headers: source.headers,
                rows,
            });
        };
        let indexes = columns
            .iter()
            .map(|c| {
                source
                    .headers
                    .iter()
                    .position(|h| h == c)
                    .ok_or_else(|| Error::Query(format!("Unknown column '{}'", c)))
            })
            .collect::<Result<Vec<_>>>()?;
        let rows = rows
            .into_iter()
            .map(|row| {
                indexes
                    .iter()
                    .map(|&i| row.get(i).cloned().unwrap_or(serde_json::Value::Null))
                    .collect()
            })
            .collect();
        Ok(QueryResult {
            table_id: source.table_id,
            headers: columns.clone(),
            rows,
        })
    }
}

/// Parses `<col> IN (<lit>, ...)` or `<col> = <lit>`.
fn parse_condition(cond: &str, sql: &str) -> Result<(String, Vec<String>)> {
    let split = cond
        .find(|c: char| c.is_whitespace() || c == '=')
        .ok_or_else(|| unsupported(sql, "incomplete WHERE"))?;
    let column = cond[..split].trim().to_string();
    let rest = cond[split..].trim_start();

    if let Some(value) = rest.strip_prefix('=') {
        let literals = parse_literals(value.trim(), sql)?;
        if literals.len() != 1 {
            return Err(unsupported(sql, "expected one literal after '='"));
        }
        return Ok((column, literals));
    }
    if rest.get(..2).is_some_and(|p| p.eq_ignore_ascii_case("IN")) {
        let list = rest[2..].trim();
        let inner = list
            .strip_prefix('(')
            .and_then(|l| l.strip_suffix(')'))
            .ok_or_else(|| unsupported(sql, "expected parenthesized IN list"))?;
        return Ok((column, parse_literals(inner, sql)?));
    }
    Err(unsupported(sql, "only IN and = conditions are supported"))
}

/// Parses a comma separated list of quoted or bare literals.
fn parse_literals(list: &str, sql: &str) -> Result<Vec<String>> {
    let mut literals = Vec::new();
    let mut chars = list.chars().peekable();
    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        let Some(&first) = chars.peek() else {
            break;
        };
        let mut literal = String::new();
        if first == '\'' {
            chars.next();
            loop {
                match chars.next() {
                    Some('\'') if chars.peek() == Some(&'\'') => {
                        chars.next();
                        literal.push('\'');
                    }
                    Some('\'') => break,
                    Some(c) => literal.push(c),
                    None => return Err(unsupported(sql, "unterminated string literal")),
                }
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c == ',' || c.is_whitespace() {
                    break;
                }
                literal.push(c);
                chars.next();
            }
        }
        literals.push(literal);

        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        match chars.next() {
            Some(',') => continue,
            None => break,
            Some(_) => return Err(unsupported(sql, "expected ',' between literals")),
        }
    }
    Ok(literals)
}

fn unsupported(sql: &str, reason: &str) -> Error {
    Error::Query(format!("Unsupported query '{}': {}", sql, reason))
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir)?
        .map(|e| e.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort();
    Ok(entries)
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}

#[cfg(test)]
#[path = "local_tests.rs"]
mod tests;

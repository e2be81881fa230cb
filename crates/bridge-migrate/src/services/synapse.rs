//! Synapse REST client.
//!
//! Implements [`QueryService`] and [`DestinationStore`] on top of the Synapse
//! repository and file services. Authentication is a personal access token
//! sent as a bearer token; this client never creates or refreshes tokens.

use async_trait::async_trait;
use futures::StreamExt;
use md5::{Digest, Md5};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::poll::{poll_until_ready, PollConfig};
use crate::services::common::{
    cell_to_string, create_http_client, handle_http_error, table_ref_from_sql, validate_url,
};
use crate::services::{
    DestinationStore, Folder, Metadata, QueryResult, QueryService, StoredEntity, TableInfo,
};

/// Environment variable consulted when no token is configured.
pub const AUTH_TOKEN_ENV: &str = "SYNAPSE_AUTH_TOKEN";

const TABLE_ENTITY_TYPE: &str = "table";
const FOLDER_CONCRETE_TYPE: &str = "org.sagebionetworks.repo.model.Folder";
const FILE_CONCRETE_TYPE: &str = "org.sagebionetworks.repo.model.FileEntity";
const QUERY_BUNDLE_CONCRETE_TYPE: &str = "org.sagebionetworks.repo.model.table.QueryBundleRequest";
const MULTIPART_CONCRETE_TYPE: &str = "org.sagebionetworks.repo.model.file.MultipartUploadRequest";

/// Query results (0x1) plus select columns (0x4).
const QUERY_PART_MASK: u64 = 0x1 | 0x4;
/// Maximum file handles per batch request.
const FILE_HANDLE_BATCH_SIZE: usize = 100;
/// Minimum multipart part size accepted by the file service.
const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;
/// Largest file uploaded as a single part.
const MAX_SINGLE_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Synapse connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynapseConfig {
    /// Repository endpoint.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Personal access token (falls back to `SYNAPSE_AUTH_TOKEN`).
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Directory where downloaded file handles are cached.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Storage location for uploads (default storage when unset).
    #[serde(default)]
    pub storage_location_id: Option<u64>,
}

impl Default for SynapseConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            auth_token: None,
            cache_dir: default_cache_dir(),
            storage_location_id: None,
        }
    }
}

fn default_endpoint() -> String {
    "https://repo-prod.prod.sagebase.org".to_string()
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".bridge-migrate/cache")
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChildrenPage {
    #[serde(default)]
    page: Vec<TableInfo>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AsyncJobToken {
    token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryBundle {
    query_result: PagedQueryResult,
    #[serde(default)]
    select_columns: Vec<SelectColumn>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PagedQueryResult {
    query_results: RowSet,
    next_page_token: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RowSet {
    #[serde(default)]
    headers: Vec<SelectColumn>,
    #[serde(default)]
    rows: Vec<Row>,
}

#[derive(Debug, Deserialize)]
struct SelectColumn {
    name: String,
}

#[derive(Debug, Deserialize)]
struct Row {
    #[serde(default)]
    values: Vec<Option<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileHandleBatch {
    #[serde(default)]
    requested_files: Vec<FileResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileResult {
    file_handle_id: String,
    #[serde(rename = "preSignedURL")]
    pre_signed_url: Option<String>,
    file_handle: Option<FileHandle>,
    failure_code: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileHandle {
    id: String,
    file_name: Option<String>,
    bucket_name: Option<String>,
    key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MultipartStatus {
    upload_id: String,
    state: String,
    result_file_handle_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PresignedUrlBatch {
    part_presigned_urls: Vec<PartPresignedUrl>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartPresignedUrl {
    upload_presigned_url: String,
    #[serde(default)]
    signed_headers: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddPartResponse {
    add_part_state: String,
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EntityId {
    id: String,
}

#[derive(Debug, Deserialize)]
struct EntityAnnotations {
    id: String,
    etag: String,
}

/// Synapse REST client.
pub struct SynapseClient {
    config: SynapseConfig,
    client: Client,
    auth_token: Option<String>,
    poll: PollConfig,
}

impl SynapseClient {
    /// Creates a client; the token is resolved from config, then environment.
    pub fn new(config: SynapseConfig) -> Result<Self> {
        validate_url(&config.endpoint)?;
        let auth_token = config
            .auth_token
            .clone()
            .or_else(|| std::env::var(AUTH_TOKEN_ENV).ok())
            .filter(|t| !t.is_empty());

        Ok(Self {
            config,
            client: create_http_client(),
            auth_token,
            poll: PollConfig::default(),
        })
    }

    /// Overrides the async job polling schedule.
    #[must_use]
    pub fn with_poll_config(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    fn repo_url(&self, path: &str) -> String {
        format!(
            "{}/repo/v1{}",
            self.config.endpoint.trim_end_matches('/'),
            path
        )
    }

    fn file_url(&self, path: &str) -> String {
        format!(
            "{}/file/v1{}",
            self.config.endpoint.trim_end_matches('/'),
            path
        )
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Sends a request and decodes a JSON response body.
    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = self.authorize(request).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(handle_http_error(status.as_u16(), &body, "Synapse"));
        }
        Ok(response.json().await?)
    }

    /// Polls an async job endpoint: 202 means pending, 200 carries the result.
    async fn poll_job<T: DeserializeOwned>(&self, url: String, name: &str) -> Result<T> {
        poll_until_ready(&self.poll, name, || {
            let request = self.authorize(self.client.get(&url));
            async move {
                let response = request.send().await?;
                let status = response.status();
                if status == StatusCode::ACCEPTED {
                    return Ok(None);
                }
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(Error::Query(format!("Synapse error {}: {}", status, body)));
                }
                Ok(Some(response.json::<T>().await?))
            }
        })
        .await
    }

    async fn start_job(&self, url: String, body: serde_json::Value) -> Result<String> {
        let token: AsyncJobToken = self
            .send_json(self.client.post(url).json(&body))
            .await
            .map_err(into_query_error)?;
        Ok(token.token)
    }

    async fn file_handle(&self, id: &str) -> Result<FileHandle> {
        self.send_json(self.client.get(self.file_url(&format!("/fileHandle/{}", id))))
            .await
    }

    async fn download_to_cache(&self, file: &FileResult) -> Result<PathBuf> {
        let url = file.pre_signed_url.as_deref().ok_or_else(|| {
            Error::Download(format!(
                "No pre-signed URL for file handle {}: {}",
                file.file_handle_id,
                file.failure_code.as_deref().unwrap_or("unknown failure")
            ))
        })?;
        let file_name = file
            .file_handle
            .as_ref()
            .and_then(|h| h.file_name.clone())
            .unwrap_or_else(|| file.file_handle_id.clone());
        let dir = self.config.cache_dir.join(&file.file_handle_id);
        let path = dir.join(&file_name);
        if tokio::fs::try_exists(&path).await? {
            debug!("Cache hit for file handle {}", file.file_handle_id);
            return Ok(path);
        }

        // Pre-signed URLs carry their own credentials.
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(Error::Download(format!(
                "GET file handle {} returned {}",
                file.file_handle_id,
                response.status()
            )));
        }
        tokio::fs::create_dir_all(&dir).await?;
        let partial = dir.join(format!("{}.part", file_name));
        let mut out = tokio::fs::File::create(&partial).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            out.write_all(&chunk?).await?;
        }
        out.flush().await?;
        tokio::fs::rename(&partial, &path).await?;
        Ok(path)
    }

    /// Uploads a file as a single multipart part and returns the file handle id.
    async fn upload(&self, path: &Path) -> Result<String> {
        let bytes = tokio::fs::read(path).await?;
        let size = bytes.len() as u64;
        if size > MAX_SINGLE_PART_SIZE {
            return Err(Error::Store(format!(
                "{} is larger than a single upload part",
                path.display()
            )));
        }
        let md5_hex = hex_md5(&bytes);
        let file_name = file_name_of(path)?;

        let mut request = json!({
            "concreteType": MULTIPART_CONCRETE_TYPE,
            "contentMD5Hex": md5_hex,
            "fileName": file_name,
            "contentType": "application/octet-stream",
            "fileSizeBytes": size,
            "partSizeBytes": size.max(MIN_PART_SIZE),
            "generatePreview": false,
        });
        if let Some(location) = self.config.storage_location_id {
            request["storageLocationId"] = json!(location);
        }

        let status: MultipartStatus = self
            .send_json(self.client.post(self.file_url("/file/multipart")).json(&request))
            .await?;
        if status.state == "COMPLETED" {
            if let Some(id) = status.result_file_handle_id {
                return Ok(id);
            }
        }

        let upload_id = status.upload_id;
        let batch: PresignedUrlBatch = self
            .send_json(
                self.client
                    .post(self.file_url(&format!(
                        "/file/multipart/{}/presigned/url/batch",
                        upload_id
                    )))
                    .json(&json!({ "uploadId": upload_id, "partNumbers": [1] })),
            )
            .await?;
        let part = batch
            .part_presigned_urls
            .into_iter()
            .next()
            .ok_or_else(|| Error::Store("No pre-signed URL for upload part".to_string()))?;

        let mut put = self.client.put(&part.upload_presigned_url).body(bytes);
        for (name, value) in &part.signed_headers {
            put = put.header(name, value);
        }
        let response = put.send().await?;
        if !response.status().is_success() {
            return Err(Error::Store(format!(
                "Part upload for {} returned {}",
                file_name,
                response.status()
            )));
        }

        let added: AddPartResponse = self
            .send_json(self.client.put(self.file_url(&format!(
                "/file/multipart/{}/add/1?partMD5Hex={}",
                upload_id, md5_hex
            ))))
            .await?;
        if added.add_part_state != "ADD_SUCCESS" {
            return Err(Error::Store(format!(
                "Adding part to upload {} failed: {}",
                upload_id,
                added.error_message.unwrap_or(added.add_part_state)
            )));
        }

        let completed: MultipartStatus = self
            .send_json(
                self.client
                    .put(self.file_url(&format!("/file/multipart/{}/complete", upload_id))),
            )
            .await?;
        completed
            .result_file_handle_id
            .ok_or_else(|| Error::Store(format!("Upload {} did not complete", upload_id)))
    }

    /// Creates a file entity, or points an existing same-named one at the new handle.
    async fn create_or_update_file(
        &self,
        parent_id: &str,
        name: &str,
        file_handle_id: &str,
    ) -> Result<String> {
        let body = json!({
            "concreteType": FILE_CONCRETE_TYPE,
            "name": name,
            "parentId": parent_id,
            "dataFileHandleId": file_handle_id,
        });
        let response = self
            .authorize(self.client.post(self.repo_url("/entity")).json(&body))
            .send()
            .await?;
        let status = response.status();

        if status == StatusCode::CONFLICT {
            let existing = self.child_id(parent_id, name).await?.ok_or_else(|| {
                Error::Store(format!("Name conflict for '{}' but no child found", name))
            })?;
            debug!("Updating existing file entity {} with a new version", existing);
            let mut entity: serde_json::Value = self
                .send_json(self.client.get(self.repo_url(&format!("/entity/{}", existing))))
                .await?;
            entity["dataFileHandleId"] = json!(file_handle_id);
            let updated: EntityId = self
                .send_json(
                    self.client
                        .put(self.repo_url(&format!("/entity/{}?newVersion=true", existing)))
                        .json(&entity),
                )
                .await?;
            return Ok(updated.id);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(handle_http_error(status.as_u16(), &body, "Synapse"));
        }
        let created: EntityId = response.json().await?;
        Ok(created.id)
    }

    async fn set_annotations(&self, entity_id: &str, annotations: &Metadata) -> Result<()> {
        let url = self.repo_url(&format!("/entity/{}/annotations2", entity_id));
        let current: EntityAnnotations = self.send_json(self.client.get(&url)).await?;
        let values: BTreeMap<&str, serde_json::Value> = annotations
            .iter()
            .map(|(k, v)| (k.as_str(), json!({ "type": "STRING", "value": [v] })))
            .collect();
        let body = json!({
            "id": current.id,
            "etag": current.etag,
            "annotations": values,
        });
        let _: serde_json::Value = self.send_json(self.client.put(&url).json(&body)).await?;
        Ok(())
    }

    async fn child_id(&self, parent_id: &str, name: &str) -> Result<Option<String>> {
        let response = self
            .authorize(
                self.client
                    .post(self.repo_url("/entity/child"))
                    .json(&json!({ "parentId": parent_id, "entityName": name })),
            )
            .send()
            .await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(handle_http_error(status.as_u16(), &body, "Synapse"));
        }
        let entity: EntityId = response.json().await?;
        Ok(Some(entity.id))
    }
}

#[async_trait]
impl QueryService for SynapseClient {
    fn service_type(&self) -> &'static str {
        "synapse"
    }

    async fn list_tables(&self, project_id: &str) -> Result<Vec<TableInfo>> {
        let mut tables = Vec::new();
        let mut next_page_token: Option<String> = None;
        loop {
            let body = json!({
                "parentId": project_id,
                "includeTypes": [TABLE_ENTITY_TYPE],
                "nextPageToken": next_page_token,
            });
            let page: ChildrenPage = self
                .send_json(self.client.post(self.repo_url("/entity/children")).json(&body))
                .await?;
            tables.extend(page.page);
            match page.next_page_token {
                Some(token) => next_page_token = Some(token),
                None => break,
            }
        }
        Ok(tables)
    }

    async fn query(&self, sql: &str) -> Result<QueryResult> {
        let table_id = table_ref_from_sql(sql)?;
        let start_url = self.repo_url(&format!("/entity/{}/table/query/async/start", table_id));
        let token = self
            .start_job(
                start_url,
                json!({
                    "concreteType": QUERY_BUNDLE_CONCRETE_TYPE,
                    "entityId": table_id,
                    "query": { "sql": sql },
                    "partMask": QUERY_PART_MASK,
                }),
            )
            .await?;
        let bundle: QueryBundle = self
            .poll_job(
                self.repo_url(&format!(
                    "/entity/{}/table/query/async/get/{}",
                    table_id, token
                )),
                "table query",
            )
            .await?;

        let mut headers: Vec<String> = bundle
            .query_result
            .query_results
            .headers
            .into_iter()
            .map(|c| c.name)
            .collect();
        if headers.is_empty() {
            headers = bundle.select_columns.into_iter().map(|c| c.name).collect();
        }
        let mut rows: Vec<Vec<serde_json::Value>> = bundle
            .query_result
            .query_results
            .rows
            .into_iter()
            .map(row_values)
            .collect();

        let mut next = bundle.query_result.next_page_token;
        while let Some(page_token) = next.take() {
            let token = self
                .start_job(
                    self.repo_url(&format!("/entity/{}/table/query/nextPage/async/start", table_id)),
                    page_token,
                )
                .await?;
            let page: PagedQueryResult = self
                .poll_job(
                    self.repo_url(&format!(
                        "/entity/{}/table/query/nextPage/async/get/{}",
                        table_id, token
                    )),
                    "table query page",
                )
                .await?;
            rows.extend(page.query_results.rows.into_iter().map(row_values));
            next = page.next_page_token;
        }

        debug!("Query on {} returned {} rows", table_id, rows.len());
        Ok(QueryResult {
            table_id,
            headers,
            rows,
        })
    }

    async fn download_column(
        &self,
        result: &QueryResult,
        column: &str,
    ) -> Result<HashMap<String, PathBuf>> {
        let idx = result.require_column(column)?;
        let mut handle_ids: Vec<String> = result
            .rows
            .iter()
            .filter_map(|row| row.get(idx))
            .filter(|v| !v.is_null())
            .map(cell_to_string)
            .collect();
        handle_ids.sort();
        handle_ids.dedup();

        info!(
            "Downloading {} file handles from column '{}'",
            handle_ids.len(),
            column
        );
        let mut paths = HashMap::with_capacity(handle_ids.len());
        for chunk in handle_ids.chunks(FILE_HANDLE_BATCH_SIZE) {
            let requested: Vec<serde_json::Value> = chunk
                .iter()
                .map(|id| {
                    json!({
                        "fileHandleId": id,
                        "associateObjectId": result.table_id,
                        "associateObjectType": "TableEntity",
                    })
                })
                .collect();
            let batch: FileHandleBatch = self
                .send_json(self.client.post(self.file_url("/fileHandle/batch")).json(&json!({
                    "requestedFiles": requested,
                    "includeFileHandles": true,
                    "includePreSignedURLs": true,
                    "includePreviewPreSignedURLs": false,
                })))
                .await
                .map_err(|e| Error::Download(e.to_string()))?;
            for file in &batch.requested_files {
                let path = self.download_to_cache(file).await?;
                paths.insert(file.file_handle_id.clone(), path);
            }
        }
        Ok(paths)
    }
}

#[async_trait]
impl DestinationStore for SynapseClient {
    async fn create_folder(&self, parent_id: &str, name: &str) -> Result<Folder> {
        let created: EntityId = self
            .send_json(self.client.post(self.repo_url("/entity")).json(&json!({
                "concreteType": FOLDER_CONCRETE_TYPE,
                "name": name,
                "parentId": parent_id,
            })))
            .await
            .map_err(|e| Error::Store(format!("Creating folder '{}': {}", name, e)))?;
        Ok(Folder {
            id: created.id,
            name: name.to_string(),
        })
    }

    async fn find_folder(&self, parent_id: &str, name: &str) -> Result<Option<Folder>> {
        Ok(self.child_id(parent_id, name).await?.map(|id| Folder {
            id,
            name: name.to_string(),
        }))
    }

    async fn store_file(
        &self,
        path: &Path,
        parent_id: &str,
        annotations: &Metadata,
    ) -> Result<StoredEntity> {
        let file_name = file_name_of(path)?;
        let file_handle_id = self.upload(path).await?;
        let entity_id = self
            .create_or_update_file(parent_id, &file_name, &file_handle_id)
            .await?;
        self.set_annotations(&entity_id, annotations).await?;

        let handle = self.file_handle(&file_handle_id).await?;
        match (handle.bucket_name, handle.key) {
            (Some(bucket), Some(key)) => Ok(StoredEntity {
                id: entity_id,
                file_handle_id: handle.id,
                bucket,
                key,
            }),
            _ => Err(Error::Store(format!(
                "File handle {} is not backed by an S3 bucket",
                file_handle_id
            ))),
        }
    }
}

fn row_values(row: Row) -> Vec<serde_json::Value> {
    row.values
        .into_iter()
        .map(|v| v.map_or(serde_json::Value::Null, serde_json::Value::String))
        .collect()
}

fn into_query_error(err: Error) -> Error {
    match err {
        Error::Remote(msg) => Error::Query(msg),
        other => other,
    }
}

fn file_name_of(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| Error::Store(format!("No file name in {}", path.display())))
}

fn hex_md5(bytes: &[u8]) -> String {
    Md5::digest(bytes)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[cfg(test)]
#[path = "synapse_tests.rs"]
mod tests;

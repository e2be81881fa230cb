//! S3 object store.
//!
//! User metadata on an S3 object can only be changed by copying the object
//! onto itself with `MetadataDirective=REPLACE`.

use async_trait::async_trait;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::types::MetadataDirective;
use aws_sdk_s3::Client;
use std::collections::HashMap;
use tracing::debug;

use crate::config::S3Config;
use crate::error::{Error, Result};
use crate::services::{Metadata, ObjectStore};

/// [`ObjectStore`] backed by the AWS SDK.
pub struct S3ObjectStore {
    client: Client,
}

impl S3ObjectStore {
    /// Builds a client from the default credential chain and `config`.
    pub async fn from_config(config: &S3Config) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        let shared = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = &config.endpoint_url {
            builder = builder.endpoint_url(endpoint);
        }
        builder = builder.force_path_style(config.force_path_style);

        Self::with_client(Client::from_conf(builder.build()))
    }

    /// Wraps an existing client.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

/// `CopySource` value for an object copied onto itself.
pub(crate) fn copy_source(bucket: &str, key: &str) -> String {
    format!("{}/{}", bucket, urlencoding::encode(key).replace("%2F", "/"))
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn replace_metadata(&self, bucket: &str, key: &str, metadata: &Metadata) -> Result<()> {
        let metadata: HashMap<String, String> = metadata
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        self.client
            .copy_object()
            .bucket(bucket)
            .key(key)
            .copy_source(copy_source(bucket, key))
            .set_metadata(Some(metadata))
            .metadata_directive(MetadataDirective::Replace)
            .send()
            .await
            .map_err(|e| {
                Error::ObjectStore(format!(
                    "S3 copy_object failed for s3://{}/{}: {}",
                    bucket,
                    key,
                    DisplayErrorContext(&e)
                ))
            })?;

        debug!("Replaced metadata on s3://{}/{}", bucket, key);
        Ok(())
    }
}

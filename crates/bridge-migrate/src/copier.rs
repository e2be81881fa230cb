//! Stores one record and synchronizes its object metadata.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::services::{DestinationStore, Metadata, ObjectStore, StoredEntity};

/// Result of copying one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CopyOutcome {
    /// Nothing was written.
    DryRun,
    /// The file was stored and its object metadata replaced.
    Copied(StoredEntity),
}

impl CopyOutcome {
    /// The stored entity, if any.
    #[must_use]
    pub fn entity(&self) -> Option<&StoredEntity> {
        match self {
            Self::DryRun => None,
            Self::Copied(entity) => Some(entity),
        }
    }
}

/// Stores files and mirrors their annotations onto the backing object.
pub struct RecordCopier<'a> {
    store: &'a dyn DestinationStore,
    objects: &'a dyn ObjectStore,
    dry_run: bool,
}

impl<'a> RecordCopier<'a> {
    /// Creates a copier.
    pub fn new(store: &'a dyn DestinationStore, objects: &'a dyn ObjectStore, dry_run: bool) -> Self {
        Self {
            store,
            objects,
            dry_run,
        }
    }

    /// Stores `path` under `parent_id` and replaces the object's metadata
    /// with `annotations`.
    ///
    /// The two steps are not atomic: when the metadata copy fails the stored
    /// entity remains and [`Error::MetadataSync`] is returned.
    pub async fn copy(
        &self,
        path: &Path,
        parent_id: Option<&str>,
        annotations: &Metadata,
    ) -> Result<CopyOutcome> {
        if self.dry_run {
            debug!("Dry run: skipping store of {}", path.display());
            return Ok(CopyOutcome::DryRun);
        }
        let parent_id = parent_id.ok_or_else(|| {
            Error::Store(format!("No destination folder for {}", path.display()))
        })?;

        let entity = self.store.store_file(path, parent_id, annotations).await?;
        debug!(
            "Stored {} as {} (s3://{}/{})",
            path.display(),
            entity.id,
            entity.bucket,
            entity.key
        );

        if let Err(e) = self
            .objects
            .replace_metadata(&entity.bucket, &entity.key, annotations)
            .await
        {
            warn!(
                "Entity {} stored but metadata of s3://{}/{} not replaced: {}",
                entity.id, entity.bucket, entity.key, e
            );
            return Err(Error::MetadataSync {
                entity_id: entity.id,
                bucket: entity.bucket,
                key: entity.key,
                message: e.to_string(),
            });
        }

        Ok(CopyOutcome::Copied(entity))
    }
}

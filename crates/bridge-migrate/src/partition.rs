//! Partition folder allocation.
//!
//! Records of one table are spread across sibling folders named
//! `partition_0`, `partition_1`, ... with at most [`PARTITION_SIZE`] records
//! each. A new folder is opened when the zero-based record index is a
//! multiple of the partition size.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::services::DestinationStore;

/// Default number of records per partition.
pub const PARTITION_SIZE: usize = 9999;

/// Whether record `index` opens a new partition.
#[must_use]
pub fn should_rollover(index: usize, partition_size: usize) -> bool {
    index % partition_size == 0
}

/// Folder name of partition `number`.
#[must_use]
pub fn partition_name(number: usize) -> String {
    format!("partition_{}", number)
}

/// A partition folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    /// Zero-based partition number.
    pub number: usize,
    /// Folder name.
    pub name: String,
    /// Destination folder id, `None` when only planned (dry run).
    pub folder_id: Option<String>,
}

/// Opens partition folders as records are processed.
///
/// Owns the `(processed_count, active_partition)` state for one table.
#[derive(Debug)]
pub struct PartitionAllocator {
    parent_id: String,
    partition_size: usize,
    reuse_existing: bool,
    processed: usize,
    opened: usize,
    active: Option<Partition>,
}

impl PartitionAllocator {
    /// Allocator creating partitions under `parent_id`.
    pub fn new(parent_id: impl Into<String>, partition_size: usize) -> Self {
        Self {
            parent_id: parent_id.into(),
            partition_size: partition_size.max(1),
            reuse_existing: false,
            processed: 0,
            opened: 0,
            active: None,
        }
    }

    /// Look up a folder with the partition name before creating one.
    #[must_use]
    pub fn reuse_existing(mut self, reuse: bool) -> Self {
        self.reuse_existing = reuse;
        self
    }

    /// Records assigned so far.
    #[must_use]
    pub fn processed(&self) -> usize {
        self.processed
    }

    /// Partitions opened so far.
    #[must_use]
    pub fn opened(&self) -> usize {
        self.opened
    }

    /// Assigns the next record to a partition.
    ///
    /// Without a store (dry run) partitions are named but not created.
    pub async fn assign(&mut self, store: Option<&dyn DestinationStore>) -> Result<&Partition> {
        let index = self.processed;
        if should_rollover(index, self.partition_size) {
            let number = index / self.partition_size;
            let partition = self.open(number, store).await?;
            self.active = Some(partition);
            self.opened += 1;
        }
        self.processed += 1;
        self.active
            .as_ref()
            .ok_or_else(|| Error::Store(format!("No active partition for record {}", index)))
    }

    async fn open(&self, number: usize, store: Option<&dyn DestinationStore>) -> Result<Partition> {
        let name = partition_name(number);
        let Some(store) = store else {
            debug!("Planned {} under {} (dry run)", name, self.parent_id);
            return Ok(Partition {
                number,
                name,
                folder_id: None,
            });
        };

        if self.reuse_existing {
            if let Some(folder) = store.find_folder(&self.parent_id, &name).await? {
                info!("Reusing {} ({})", name, folder.id);
                return Ok(Partition {
                    number,
                    name,
                    folder_id: Some(folder.id),
                });
            }
        }

        let folder = store.create_folder(&self.parent_id, &name).await?;
        info!("Created {} ({}) under {}", name, folder.id, self.parent_id);
        Ok(Partition {
            number,
            name,
            folder_id: Some(folder.id),
        })
    }
}

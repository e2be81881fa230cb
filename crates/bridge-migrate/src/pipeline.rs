//! Migration pipeline orchestration.

use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info};

use crate::annotations::Annotations;
use crate::config::MigrationOptions;
use crate::copier::{CopyOutcome, RecordCopier};
use crate::diff::get_record_diff;
use crate::error::Result;
use crate::partition::PartitionAllocator;
use crate::query::{record_id_query, QueryResolver, ResolvedTable};
use crate::services::{DestinationStore, Metadata, Services, StoredEntity};

/// Migration statistics.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct MigrationStats {
    /// Tables queried and copied.
    pub tables_processed: u64,
    /// Tables skipped through the exclusion set.
    pub tables_skipped: u64,
    /// Records read from the source.
    pub records: u64,
    /// Records stored in the destination.
    pub copied: u64,
    /// Partition folders opened (planned only, in a dry run).
    pub partitions: u64,
    /// Whether this was a dry run.
    pub dry_run: bool,
    /// Duration in seconds.
    pub duration_secs: f64,
}

impl MigrationStats {
    /// Calculate throughput (records per second).
    #[must_use]
    pub fn throughput(&self) -> f64 {
        if self.duration_secs > 0.0 {
            self.records as f64 / self.duration_secs
        } else {
            0.0
        }
    }
}

/// One processed record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopiedRecord {
    /// Source table.
    pub table_id: String,
    /// Record id.
    pub record_id: String,
    /// Partition folder name, if partitioned.
    pub partition: Option<String>,
    /// Annotations computed for the record.
    pub annotations: Metadata,
    /// Stored entity, `None` in a dry run.
    pub entity: Option<StoredEntity>,
}

/// Outcome of a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MigrationReport {
    /// Counters.
    pub stats: MigrationStats,
    /// Processed records in order.
    pub records: Vec<CopiedRecord>,
}

/// Copy every table of a project into partitioned folders.
#[derive(Debug, Clone)]
pub struct FullMigration {
    /// Project whose tables are copied.
    pub source_project: String,
    /// Folder receiving the partitions.
    pub data_folder: String,
    /// Table ids to skip.
    pub exclude_tables: BTreeSet<String>,
}

impl FullMigration {
    /// Full migration with an empty exclusion set.
    pub fn new(source_project: impl Into<String>, data_folder: impl Into<String>) -> Self {
        Self {
            source_project: source_project.into(),
            data_folder: data_folder.into(),
            exclude_tables: BTreeSet::new(),
        }
    }

    /// Adds table ids to the exclusion set.
    #[must_use]
    pub fn exclude<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_tables.extend(tables.into_iter().map(Into::into));
        self
    }
}

/// Copy records of one table that a view does not list yet.
#[derive(Debug, Clone)]
pub struct IncrementalSubmission {
    /// Source table.
    pub source_table: String,
    /// Folder receiving the files.
    pub data_folder: String,
    /// View scoped to the data folder.
    pub data_view: String,
    /// Maximum records to copy.
    pub limit: Option<usize>,
}

/// Migration pipeline.
pub struct Pipeline {
    services: Services,
    options: MigrationOptions,
}

impl Pipeline {
    /// Create a new migration pipeline.
    pub fn new(services: Services, options: MigrationOptions) -> Self {
        Self { services, options }
    }

    fn copier(&self) -> RecordCopier<'_> {
        RecordCopier::new(
            self.services.destination.as_ref(),
            self.services.objects.as_ref(),
            self.options.dry_run,
        )
    }

    fn resolver(&self) -> QueryResolver<'_> {
        QueryResolver::new(
            self.services.query.as_ref(),
            &self.options.file_handle_field,
        )
    }

    /// Store used for folder creation, `None` in a dry run.
    fn mutating_store(&self) -> Option<&dyn DestinationStore> {
        if self.options.dry_run {
            None
        } else {
            Some(self.services.destination.as_ref())
        }
    }

    /// Copy every table of the source project.
    ///
    /// # Errors
    ///
    /// Stops at the first failure. Records copied before it stay copied.
    pub async fn copy_data(&self, job: &FullMigration) -> Result<MigrationReport> {
        let start = std::time::Instant::now();
        let mut report = MigrationReport::default();
        report.stats.dry_run = self.options.dry_run;

        info!(
            "Starting full migration of {} into {} via {}",
            job.source_project,
            job.data_folder,
            self.services.query.service_type()
        );
        if self.options.dry_run {
            info!("Dry run mode - not writing to destination");
        }

        let tables = self.services.query.list_tables(&job.source_project).await?;
        for table in tables.iter().filter(|t| t.is_table()) {
            if job.exclude_tables.contains(&table.id) {
                info!("Skipping excluded table {} ({})", table.id, table.name);
                report.stats.tables_skipped += 1;
                continue;
            }
            self.copy_table(&table.id, &job.data_folder, &mut report)
                .await?;
            report.stats.tables_processed += 1;
        }

        report.stats.duration_secs = start.elapsed().as_secs_f64();
        log_summary(&report.stats);
        Ok(report)
    }

    async fn copy_table(
        &self,
        table_id: &str,
        data_folder: &str,
        report: &mut MigrationReport,
    ) -> Result<()> {
        info!("Copying table {}", table_id);
        let table = self.resolver().resolve(table_id, &self.options.query_str).await?;

        let store = self.mutating_store();
        let copier = self.copier();
        let mut allocator = PartitionAllocator::new(data_folder, self.options.partition_size)
            .reuse_existing(self.options.reuse_partitions);
        let progress = create_progress_bar(table.len() as u64);

        for resolved in table.records() {
            let partition = allocator.assign(store).await?.clone();
            let annotations =
                Annotations::from_record(&resolved.record, self.options.annotation_schema)?;
            let metadata = annotations.to_metadata();
            debug!(
                "Record {} -> {}: {:?}",
                annotations.record_id(),
                partition.name,
                metadata
            );

            let outcome = copier
                .copy(resolved.path, partition.folder_id.as_deref(), &metadata)
                .await?;
            push_record(report, table_id, &annotations, Some(partition.name), metadata, outcome);
            progress.inc(1);
        }

        report.stats.partitions += allocator.opened() as u64;
        progress.finish_with_message(format!("{} done", table_id));
        info!(
            "Table {}: {} records in {} partitions",
            table_id,
            allocator.processed(),
            allocator.opened()
        );
        Ok(())
    }

    /// Copy records of `job.source_table` missing from `job.data_view`.
    ///
    /// Records land directly in the data folder without partitioning.
    ///
    /// # Errors
    ///
    /// Stops at the first failure. Records copied before it stay copied.
    pub async fn submit_new_data(&self, job: &IncrementalSubmission) -> Result<MigrationReport> {
        let start = std::time::Instant::now();
        let mut report = MigrationReport::default();
        report.stats.dry_run = self.options.dry_run;

        info!(
            "Submitting new records of {} into {} (view {})",
            job.source_table, job.data_folder, job.data_view
        );
        let ids = get_record_diff(
            self.services.query.as_ref(),
            &job.source_table,
            &job.data_view,
            &self.options.query_str,
        )
        .await?;

        if let Some(sql) = record_id_query(&job.source_table, &ids, job.limit) {
            let table = self.resolver().resolve_sql(&sql).await?;
            self.copy_unpartitioned(&job.source_table, &job.data_folder, &table, &mut report)
                .await?;
        } else {
            info!("No new records in {}", job.source_table);
        }
        report.stats.tables_processed = 1;

        report.stats.duration_secs = start.elapsed().as_secs_f64();
        log_summary(&report.stats);
        Ok(report)
    }

    async fn copy_unpartitioned(
        &self,
        table_id: &str,
        data_folder: &str,
        table: &ResolvedTable,
        report: &mut MigrationReport,
    ) -> Result<()> {
        let copier = self.copier();
        let progress = create_progress_bar(table.len() as u64);

        for resolved in table.records() {
            let annotations =
                Annotations::from_record(&resolved.record, self.options.annotation_schema)?;
            let metadata = annotations.to_metadata();
            debug!("Record {}: {:?}", annotations.record_id(), metadata);

            let outcome = copier
                .copy(resolved.path, Some(data_folder), &metadata)
                .await?;
            push_record(report, table_id, &annotations, None, metadata, outcome);
            progress.inc(1);
        }

        progress.finish_with_message(format!("{} done", table_id));
        Ok(())
    }
}

fn push_record(
    report: &mut MigrationReport,
    table_id: &str,
    annotations: &Annotations,
    partition: Option<String>,
    metadata: Metadata,
    outcome: CopyOutcome,
) {
    report.stats.records += 1;
    let entity = match outcome {
        CopyOutcome::Copied(entity) => {
            report.stats.copied += 1;
            Some(entity)
        }
        CopyOutcome::DryRun => None,
    };
    report.records.push(CopiedRecord {
        table_id: table_id.to_string(),
        record_id: annotations.record_id().to_string(),
        partition,
        annotations: metadata,
        entity,
    });
}

fn log_summary(stats: &MigrationStats) {
    info!(
        "Migration complete: {} tables, {} skipped, {} records, {} copied, {} partitions in {:.2}s ({:.0} records/sec)",
        stats.tables_processed,
        stats.tables_skipped,
        stats.records,
        stats.copied,
        stats.partitions,
        stats.duration_secs,
        stats.throughput()
    );
}

fn create_progress_bar(total: u64) -> ProgressBar {
    let pb = if total > 0 {
        ProgressBar::new(total)
    } else {
        ProgressBar::new_spinner()
    };

    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );

    pb
}

#[cfg(test)]
#[path = "pipeline_tests.rs"]
mod tests;

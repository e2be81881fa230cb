//! Bridge Migration CLI
//!
//! Copies Bridge exporter table records into annotated files.
//! Pedantic lints relaxed for CLI ergonomics.

// CLI tool - relax pedantic lints for ergonomics
#![allow(clippy::pedantic)]

use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use bridge_migrate::{
    create_services, FullMigration, IncrementalSubmission, MigrationConfig, MigrationReport,
    Pipeline,
};

#[derive(Parser)]
#[command(name = "bridge-migrate")]
#[command(version)]
#[command(about = "Copy Bridge exporter table records into annotated files", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, value_name = "FILE", global = true, env = "BRIDGE_MIGRATE_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Flags shared by both copy modes.
#[derive(clap::Args)]
struct CopyArgs {
    /// Folder receiving the files
    #[arg(long)]
    data_folder: String,

    /// Query template, use {source_table} in the FROM clause
    #[arg(long)]
    query_str: Option<String>,

    /// Column holding the raw data archive
    #[arg(long)]
    file_handle_field: Option<String>,

    /// Dry run mode (compute annotations, write nothing)
    #[arg(long)]
    dry_run: bool,

    /// Write a JSON report of processed records
    #[arg(long, value_name = "FILE")]
    report: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy every table of a project into partition folders
    Copy {
        /// Project whose tables are copied
        #[arg(long)]
        source_project: String,

        /// Table ids to skip
        #[arg(long, num_args = 1..)]
        exclude_tables: Vec<String>,

        #[command(flatten)]
        args: CopyArgs,
    },

    /// Copy records of one table that the data view does not list yet
    Submit {
        /// Source table
        #[arg(long)]
        source_table: String,

        /// View scoped to the data folder
        #[arg(long)]
        data_view: String,

        /// Maximum number of records to copy
        #[arg(long)]
        limit: Option<usize>,

        #[command(flatten)]
        args: CopyArgs,
    },

    /// Validate configuration file
    Validate {
        /// Configuration file path
        #[arg(short = 'f', long = "file", value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate example configuration
    Init {
        /// Backend to configure
        #[arg(short, long, value_enum, default_value_t = Backend::Synapse)]
        backend: Backend,

        /// Output file path
        #[arg(short, long, default_value = "migration.yaml")]
        output: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Backend {
    Synapse,
    Local,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Copy {
            source_project,
            exclude_tables,
            args,
        } => {
            let mut config = load_config(cli.config.as_deref())?;
            apply_copy_args(&mut config, &args);
            let job = FullMigration::new(source_project, &args.data_folder)
                .exclude(config.options.exclude_tables.iter().cloned())
                .exclude(exclude_tables);

            let pipeline = build_pipeline(config).await?;
            let report = pipeline.copy_data(&job).await?;
            finish(&report, args.report.as_deref())?;
        }
        Commands::Submit {
            source_table,
            data_view,
            limit,
            args,
        } => {
            let mut config = load_config(cli.config.as_deref())?;
            apply_copy_args(&mut config, &args);
            let job = IncrementalSubmission {
                source_table,
                data_folder: args.data_folder.clone(),
                data_view,
                limit: limit.or(config.options.limit),
            };

            let pipeline = build_pipeline(config).await?;
            let report = pipeline.submit_new_data(&job).await?;
            finish(&report, args.report.as_deref())?;
        }
        Commands::Validate { file } => {
            let path = file
                .or(cli.config)
                .ok_or_else(|| anyhow::anyhow!("validate requires --file or --config"))?;
            validate_config(&path)?;
        }
        Commands::Init { backend, output } => {
            generate_config(backend, &output)?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<MigrationConfig> {
    match path {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            Ok(MigrationConfig::from_file(path)?)
        }
        None => Ok(MigrationConfig::default()),
    }
}

fn apply_copy_args(config: &mut MigrationConfig, args: &CopyArgs) {
    if args.dry_run {
        config.options.dry_run = true;
    }
    if let Some(query) = &args.query_str {
        config.options.query_str = bridge_migrate::query::QueryTemplate::new(query.clone());
    }
    if let Some(field) = &args.file_handle_field {
        config.options.file_handle_field = field.clone();
    }
}

async fn build_pipeline(config: MigrationConfig) -> anyhow::Result<Pipeline> {
    config.validate()?;
    let services = create_services(&config).await?;
    Ok(Pipeline::new(services, config.options))
}

fn finish(report: &MigrationReport, report_path: Option<&Path>) -> anyhow::Result<()> {
    let stats = &report.stats;
    if stats.dry_run {
        println!("\nDry run complete (nothing was written)");
    } else {
        println!("\nMigration complete");
    }
    println!("   Tables:     {} ({} skipped)", stats.tables_processed, stats.tables_skipped);
    println!("   Records:    {}", stats.records);
    println!("   Copied:     {}", stats.copied);
    println!("   Partitions: {}", stats.partitions);
    println!("   Duration:   {:.2}s", stats.duration_secs);
    println!("   Throughput: {:.0} records/sec", stats.throughput());

    if let Some(path) = report_path {
        std::fs::write(path, serde_json::to_string_pretty(report)?)?;
        println!("   Report:     {:?}", path);
    }
    Ok(())
}

fn validate_config(config_path: &Path) -> anyhow::Result<()> {
    info!("Validating configuration from {:?}", config_path);

    let config = MigrationConfig::from_file(config_path)?;
    config.validate()?;

    let service = match &config.service {
        bridge_migrate::ServiceConfig::Synapse(cfg) => format!("synapse ({})", cfg.endpoint),
        bridge_migrate::ServiceConfig::Local(cfg) => format!("local ({:?})", cfg.root),
    };
    let objects = match &config.object_store {
        bridge_migrate::ObjectStoreConfig::S3(_) => "s3".to_string(),
        bridge_migrate::ObjectStoreConfig::Local(cfg) => format!("local ({:?})", cfg.root),
    };

    println!("Configuration is valid");
    println!("   Service:      {}", service);
    println!("   Object store: {}", objects);
    println!("   Schema:       {:?}", config.options.annotation_schema);
    println!("   Query:        {}", config.options.query_str.as_str());
    println!("   Partition:    {} records", config.options.partition_size);
    println!("   Dry run:      {}", config.options.dry_run);

    Ok(())
}

fn generate_config(backend: Backend, output: &Path) -> anyhow::Result<()> {
    let template = match backend {
        Backend::Synapse => SYNAPSE_TEMPLATE,
        Backend::Local => LOCAL_TEMPLATE,
    };

    std::fs::write(output, template)?;
    println!("Generated configuration: {:?}", output);
    println!(
        "   Edit the file and run: bridge-migrate --config {:?} copy --source-project <ID> --data-folder <ID>",
        output
    );

    Ok(())
}

const SYNAPSE_TEMPLATE: &str = r#"# Bridge migration: Synapse tables to annotated files
service:
  type: synapse
  endpoint: https://repo-prod.prod.sagebase.org
  # auth_token: falls back to SYNAPSE_AUTH_TOKEN
  cache_dir: .bridge-migrate/cache

object_store:
  type: s3
  # region: us-east-1

options:
  file_handle_field: rawData
  query_str: "SELECT * FROM {source_table}"
  annotation_schema: minimal   # or: extended
  exclude_tables: []
  partition_size: 9999
  reuse_partitions: false
  dry_run: false
"#;

const LOCAL_TEMPLATE: &str = r#"# Bridge migration rehearsal against a local directory tree
service:
  type: local
  root: ./bridge-fixture

object_store:
  type: local
  root: ./bridge-fixture

options:
  file_handle_field: rawData
  annotation_schema: minimal
  dry_run: true
"#;

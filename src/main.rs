use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use sea_orm_migration::MigratorTrait;
use tracing::info;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use placemap::config::ImportPlan;
use placemap::data_loader::RecordFormat;
use placemap::database::migrations::Migrator;
use placemap::database::{establish_connection, get_database_url};
use placemap::mappings;
use placemap::services::{ImportRequest, ImportService};

#[derive(Parser)]
#[clap(author, version, about)]
struct Cli {
    #[clap(short, long, global = true)]
    log_level: Option<String>,
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import one file through a named mapping
    Import {
        /// Rows to import (csv, tsv or json)
        file: PathBuf,
        /// Override the format picked from the file extension
        #[clap(short, long)]
        format: Option<String>,
        #[clap(short, long)]
        mapping: String,
        /// Source name recorded against every row; defaults to the file name
        #[clap(short, long)]
        source: Option<String>,
        #[clap(short, long, default_value = "placemap.db")]
        database: String,
        #[clap(long, default_value = "50")]
        batch_size: usize,
        /// Leave rows previously imported from this source untouched
        #[clap(long)]
        no_update: bool,
        /// Resolve and report without writing anything
        #[clap(long)]
        dry_run: bool,
    },
    /// Run every profile of a YAML import plan
    Plan {
        plan: PathBuf,
        #[clap(short, long, default_value = "placemap.db")]
        database: String,
        #[clap(long)]
        dry_run: bool,
    },
    /// List the built-in mappings
    Mappings,
    Db {
        #[clap(subcommand)]
        command: DbCommands,
    },
}

#[derive(Subcommand, Debug)]
enum DbCommands {
    Init {
        #[clap(short, long, default_value = "placemap.db")]
        database: String,
    },
    Migrate {
        #[clap(subcommand)]
        direction: MigrateDirection,
        #[clap(short, long, default_value = "placemap.db")]
        database: String,
    },
}

#[derive(Subcommand, Debug)]
enum MigrateDirection {
    Up,
    Down,
    Fresh,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    setup_logging(&args.log_level);

    match args.command {
        Commands::Import {
            file,
            format,
            mapping,
            source,
            database,
            batch_size,
            no_update,
            dry_run,
        } => {
            let format = match &format {
                Some(name) => Some(RecordFormat::from_name(name).ok_or_else(|| {
                    anyhow!("unknown format {:?}; expected csv, tsv or json", name)
                })?),
                None => None,
            };
            let db = connect(&database).await?;
            let source = source.unwrap_or_else(|| file_name_of(&file));
            let request = ImportRequest {
                file,
                format,
                mapping,
                source,
                batch_size,
                allow_update: !no_update,
                dry_run,
            };
            let summary = ImportService::new(db).run(&request).await?;
            println!("{}", summary);
        }
        Commands::Plan {
            plan,
            database,
            dry_run,
        } => {
            let db = connect(&database).await?;
            let base_dir = plan.parent().unwrap_or(Path::new(".")).to_path_buf();
            let plan = ImportPlan::from_file(&plan)?;
            let service = ImportService::new(db);
            for (filename, summary) in service.run_plan(&plan, &base_dir, dry_run).await? {
                println!("{}: {}", filename, summary);
            }
        }
        Commands::Mappings => {
            for name in mappings::mapping_names() {
                println!("{}", name);
            }
        }
        Commands::Db { command } => match command {
            DbCommands::Init { database } => {
                info!("Initializing database: {}", database);
                migrate_database(&database, MigrateDirection::Up).await?;
            }
            DbCommands::Migrate {
                direction,
                database,
            } => {
                info!("Running database migration: {:?}", direction);
                migrate_database(&database, direction).await?;
            }
        },
    }

    Ok(())
}

async fn connect(database_path: &str) -> Result<sea_orm::DatabaseConnection> {
    let database_url = get_database_url(Some(database_path));
    let db = establish_connection(&database_url).await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

async fn migrate_database(database_path: &str, direction: MigrateDirection) -> Result<()> {
    let database_url = get_database_url(Some(database_path));
    let db = establish_connection(&database_url).await?;

    match direction {
        MigrateDirection::Up => {
            info!("Running migrations up");
            Migrator::up(&db, None).await?;
        }
        MigrateDirection::Down => {
            info!("Running migrations down");
            Migrator::down(&db, None).await?;
        }
        MigrateDirection::Fresh => {
            info!("Running fresh migrations (down then up)");
            Migrator::down(&db, None).await?;
            Migrator::up(&db, None).await?;
        }
    }

    info!("Database migration completed");
    Ok(())
}

fn file_name_of(file: &Path) -> String {
    file.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| file.display().to_string())
}

fn setup_logging(log_level: &Option<String>) {
    let log_level = match log_level
        .as_ref()
        .unwrap_or(&"info".to_string())
        .to_lowercase()
        .as_str()
    {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(format!("sqlx=warn,{}", log_level)))
        .without_time()
        .init();
}

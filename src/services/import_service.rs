use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use sea_orm::DatabaseConnection;
use tracing::info;

use crate::config::ImportPlan;
use crate::data_loader::{self, RecordFormat};
use crate::database::SqlEntityStore;
use crate::ingest::{IngestSummary, Ingester};
use crate::mappings;

pub struct ImportService {
    db: DatabaseConnection,
}

#[derive(Debug, Clone)]
pub struct ImportRequest {
    /// Rows to import (csv, tsv or json).
    pub file: PathBuf,
    /// Overrides the format picked from the file extension.
    pub format: Option<RecordFormat>,
    /// Name of a built-in mapping.
    pub mapping: String,
    /// Source name recorded against every imported row.
    pub source: String,
    pub batch_size: usize,
    pub allow_update: bool,
    /// Resolve and count without writing anything.
    pub dry_run: bool,
}

impl ImportService {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Runs one file through a named mapping.
    pub async fn run(&self, request: &ImportRequest) -> Result<IngestSummary> {
        let schema = mappings::mapping_for(&request.mapping).ok_or_else(|| {
            anyhow!(
                "unknown mapping {:?}; `placemap mappings` lists the built-ins",
                request.mapping
            )
        })?;
        let records = match request.format {
            Some(format) => data_loader::load_records_as(&request.file, format)?,
            None => data_loader::load_records(&request.file)?,
        };
        info!(
            "importing {} rows from {} with mapping {} (dry_run={})",
            records.len(),
            request.file.display(),
            request.mapping,
            request.dry_run
        );

        let store = if request.dry_run {
            SqlEntityStore::init_dry(self.db.clone()).await?
        } else {
            SqlEntityStore::init(self.db.clone()).await?
        };
        let mut ingester = Ingester::new(&store, &schema, request.dry_run);
        let summary = ingester
            .bulk_ingest(
                records,
                &request.source,
                request.batch_size,
                request.allow_update,
            )
            .await?;
        Ok(summary)
    }

    /// Runs every profile of an import plan. File names in the plan are
    /// resolved against `base_dir`.
    pub async fn run_plan(
        &self,
        plan: &ImportPlan,
        base_dir: &Path,
        dry_run: bool,
    ) -> Result<Vec<(String, IngestSummary)>> {
        let mut results = Vec::new();
        for profile in &plan.profiles {
            let request = ImportRequest {
                file: base_dir.join(&profile.filename),
                format: None,
                mapping: profile.mapping.clone(),
                source: profile.source_name().to_string(),
                batch_size: profile.batch_size,
                allow_update: profile.allow_update,
                dry_run,
            };
            let summary = self.run(&request).await?;
            results.push((profile.filename.clone(), summary));
        }
        Ok(results)
    }
}

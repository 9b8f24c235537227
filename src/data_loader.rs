use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::{anyhow, bail, Result};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::ingest::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordFormat {
    Csv,
    Tsv,
    Json,
}

impl RecordFormat {
    pub fn from_path(path: &Path) -> Option<RecordFormat> {
        let extension = path.extension()?.to_str()?.to_lowercase();
        RecordFormat::from_name(&extension)
    }

    pub fn from_name(name: &str) -> Option<RecordFormat> {
        match name.to_lowercase().as_str() {
            "csv" => Some(RecordFormat::Csv),
            "tsv" | "tab" => Some(RecordFormat::Tsv),
            "json" => Some(RecordFormat::Json),
            _ => None,
        }
    }

    fn delimiter(&self) -> u8 {
        match self {
            RecordFormat::Csv => b',',
            RecordFormat::Tsv => b'\t',
            RecordFormat::Json => unreachable!("json has no delimiter"),
        }
    }
}

/// Loads input rows from a csv, tsv or json file, picking the format from
/// the file extension.
pub fn load_records(path: &Path) -> Result<Vec<Record>> {
    let format = RecordFormat::from_path(path).ok_or_else(|| {
        anyhow!(
            "cannot tell the format of {} from its extension",
            path.display()
        )
    })?;
    load_records_as(path, format)
}

/// Loads input rows with an explicitly chosen format, for files whose
/// extension does not match their content.
pub fn load_records_as(path: &Path, format: RecordFormat) -> Result<Vec<Record>> {
    let records = match format {
        RecordFormat::Json => load_json(path)?,
        delimited => load_delimited(path, delimited.delimiter())?,
    };
    debug!("loaded {} records from {}", records.len(), path.display());
    Ok(records)
}

fn load_delimited(path: &Path, delimiter: u8) -> Result<Vec<Record>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;

    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|name| name.trim().to_string())
        .collect();

    let mut records = Vec::new();
    for result in reader.records() {
        let row = result?;
        let mut record = Record::new();
        for (i, header) in headers.iter().enumerate() {
            let value = row.get(i).unwrap_or("");
            record.insert(header.clone(), JsonValue::String(value.to_string()));
        }
        records.push(record);
    }
    Ok(records)
}

fn load_json(path: &Path) -> Result<Vec<Record>> {
    let file = File::open(path)?;
    let value: JsonValue = serde_json::from_reader(BufReader::new(file))?;
    let rows = match value {
        JsonValue::Array(rows) => rows,
        _ => bail!("{} must contain a JSON array of objects", path.display()),
    };
    rows.into_iter()
        .map(|row| match row {
            JsonValue::Object(map) => Ok(map.into_iter().collect()),
            other => bail!("expected a JSON object per row, found {}", other),
        })
        .collect()
}

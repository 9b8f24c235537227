//! Mapping-engine error types
//!
//! Configuration problems (a schema naming a relationship that does not
//! exist) are fatal and surface before anything is written. Row errors carry
//! enough context to reprocess the failed batch by hand.
//!
//! # Examples
//!
//! ```rust
//! use placemap::ingest::{EntityKind, IngestError};
//!
//! let err = IngestError::UnknownChildRelation {
//!     kind: EntityKind::Place,
//!     field: "words".to_string(),
//! };
//! assert!(err.to_string().contains("words"));
//! ```

use serde_json::Value as JsonValue;
use thiserror::Error;

use super::store::EntityKind;

/// Errors raised by the graph builder and batch driver.
#[derive(Error, Debug)]
pub enum IngestError {
    /// Schema names a reverse relationship the entity kind does not declare
    #[error("no child relationship '{field}' on {kind}")]
    UnknownChildRelation {
        /// Kind the relation was declared on
        kind: EntityKind,
        /// Output field naming the missing relationship
        field: String,
    },

    /// Schema names a forward relationship the entity kind does not declare
    #[error("no parent relationship '{field}' on {kind}")]
    UnknownParentRelation {
        /// Kind the relation was declared on
        kind: EntityKind,
        /// Output field naming the missing relationship
        field: String,
    },

    /// A row failed mid-run. Rows before `committed` are in the database;
    /// the batch containing `row_index` was rolled back.
    #[error("row {row_index} failed after {committed} rows were committed: {source}; row was {record}")]
    Row {
        /// 0-based index of the failing row
        row_index: usize,
        /// Rows committed by earlier batches
        committed: usize,
        /// The failing row as read, for reprocessing by hand
        record: JsonValue,
        #[source]
        source: anyhow::Error,
    },

    /// Backend failure outside any row context
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

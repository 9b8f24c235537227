//! Declarative row-to-graph mapping.
//!
//! A [`RelationSchema`] describes how flat records become an entity graph:
//! field resolvers pull values out of the record, relation nodes nest child
//! and parent entities, and the [`Ingester`] walks the schema per row,
//! resolving each candidate against existing data before writing.

pub mod engine;
pub mod error;
pub mod geometry;
pub mod identity;
pub mod record;
pub mod resolve;
pub mod schema;
pub mod store;

pub use engine::{IngestSummary, Ingester};
pub use error::IngestError;
pub use record::Record;
pub use resolve::{FieldResolver, LocationSpec, Resolved};
pub use schema::{LookupKind, Mapping, RelationMode, RelationNode, RelationSchema};
pub use store::{AttrValue, EntityKind, EntityStore, StoredEntity};

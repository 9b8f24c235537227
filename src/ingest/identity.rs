use anyhow::Result;
use indexmap::IndexMap;
use tracing::{debug, warn};

use super::schema::{LookupKind, RelationMode};
use super::store::{AttrValue, EntityKind, EntityStore, StoredEntity};

/// What the graph builder should do with a candidate attribute set.
#[derive(Debug)]
pub enum IdentityOutcome {
    /// No existing row; build a fresh entity.
    Create,
    /// One existing row, reused without modification.
    Keep(StoredEntity),
    /// One existing row, to be overwritten field by field.
    Update(StoredEntity),
    /// Multiple existing rows; archive and delete them all, then build a
    /// fresh entity carrying their snapshots.
    Replace(Vec<StoredEntity>),
}

/// Matches candidate rows against the store. Strictly read-only; every write
/// that follows from an outcome is issued by the graph builder.
pub struct IdentityResolver<'a> {
    store: &'a dyn EntityStore,
}

impl<'a> IdentityResolver<'a> {
    pub fn new(store: &'a dyn EntityStore) -> Self {
        Self { store }
    }

    pub async fn resolve(
        &self,
        kind: EntityKind,
        mode: RelationMode,
        lookup: LookupKind,
        unique_fields: &[String],
        attrs: &IndexMap<String, AttrValue>,
        allow_update: bool,
    ) -> Result<IdentityOutcome> {
        match lookup {
            LookupKind::FuzzyName => self.resolve_fuzzy(kind, attrs).await,
            LookupKind::Exact => {
                self.resolve_exact(kind, mode, unique_fields, attrs, allow_update)
                    .await
            }
        }
    }

    async fn resolve_exact(
        &self,
        kind: EntityKind,
        mode: RelationMode,
        unique_fields: &[String],
        attrs: &IndexMap<String, AttrValue>,
        allow_update: bool,
    ) -> Result<IdentityOutcome> {
        let filters = match mode {
            RelationMode::SourceUpdate => {
                match (attrs.get("source"), attrs.get("source_ref")) {
                    (Some(source), Some(source_ref)) => {
                        let mut filters = IndexMap::new();
                        filters.insert("source".to_string(), source.clone());
                        filters.insert("source_ref".to_string(), source_ref.clone());
                        filters
                    }
                    // without an identity key there is nothing to match
                    _ => return Ok(IdentityOutcome::Create),
                }
            }
            RelationMode::FindExisting => {
                // unique-flagged fields absent from this row are skipped
                let filters: IndexMap<String, AttrValue> = unique_fields
                    .iter()
                    .filter_map(|field| attrs.get(field).map(|v| (field.clone(), v.clone())))
                    .collect();
                if filters.is_empty() {
                    return Ok(IdentityOutcome::Create);
                }
                filters
            }
        };

        let matches = self.store.query_by_exact(kind, &filters).await?;
        debug!(
            "{} identity lookup on {:?} found {} rows",
            kind,
            filters.keys().collect::<Vec<_>>(),
            matches.len()
        );

        Ok(match matches.len() {
            0 => IdentityOutcome::Create,
            1 => {
                let found = matches.into_iter().next().unwrap();
                if allow_update && mode == RelationMode::SourceUpdate {
                    IdentityOutcome::Update(found)
                } else {
                    IdentityOutcome::Keep(found)
                }
            }
            _ => IdentityOutcome::Replace(matches),
        })
    }

    async fn resolve_fuzzy(
        &self,
        kind: EntityKind,
        attrs: &IndexMap<String, AttrValue>,
    ) -> Result<IdentityOutcome> {
        let name = attrs
            .get("name")
            .and_then(AttrValue::as_text)
            .map(str::trim)
            .filter(|name| !name.is_empty());
        let Some(name) = name else {
            return Ok(IdentityOutcome::Keep(self.store.sentinel(kind).await?));
        };

        // names shorter than three characters are noise in the source data
        if name.chars().count() < 3 {
            return Ok(IdentityOutcome::Keep(self.store.sentinel(kind).await?));
        }

        let matches = self.store.query_by_fuzzy_name(kind, name).await?;
        match matches.len() {
            0 => Ok(IdentityOutcome::Keep(self.store.sentinel(kind).await?)),
            1 => Ok(IdentityOutcome::Keep(matches.into_iter().next().unwrap())),
            count => {
                warn!(
                    "{} rows match {} name {:?}; keeping the first",
                    count, kind, name
                );
                Ok(IdentityOutcome::Keep(matches.into_iter().next().unwrap()))
            }
        }
    }
}

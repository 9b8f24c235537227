use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

use indexmap::IndexMap;
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use super::error::IngestError;
use super::identity::{IdentityOutcome, IdentityResolver};
use super::record::Record;
use super::resolve::Resolved;
use super::schema::{Mapping, RelationNode, RelationSchema};
use super::store::{AttrValue, EntityKind, EntityStore, StoredEntity};

/// Per-kind created/updated counts, the driver's primary success signal.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestSummary {
    /// Rows consumed over the driver's lifetime.
    pub rows: usize,
    pub new: IndexMap<EntityKind, usize>,
    pub updated: IndexMap<EntityKind, usize>,
    /// Duplicate rows archived and deleted during identity resolution.
    pub collapsed: usize,
}

impl fmt::Display for IngestSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn counts(map: &IndexMap<EntityKind, usize>) -> String {
            map.iter()
                .map(|(kind, count)| format!("{} ({})", kind, count))
                .collect::<Vec<_>>()
                .join(", ")
        }
        write!(
            f,
            "{} rows: new=[{}], updated=[{}]",
            self.rows,
            counts(&self.new),
            counts(&self.updated)
        )?;
        if self.collapsed > 0 {
            write!(f, ", collapsed {} duplicates", self.collapsed)?;
        }
        Ok(())
    }
}

/// Entities tracked for one bucket, deduplicated by backend id. Dry-run
/// creates have no id yet and are counted as they come; dry-run stubs
/// dedupe by name so the counts agree with a real run.
#[derive(Debug, Default)]
struct Bucket {
    ids: HashSet<i32>,
    stubs: HashSet<String>,
    fresh: usize,
}

impl Bucket {
    fn track(&mut self, entity: &StoredEntity) {
        match entity.id {
            Some(id) => {
                self.ids.insert(id);
            }
            None => self.fresh += 1,
        }
    }

    /// Keep/update outcomes only. An unsaved entity here is a shared stub
    /// (a dry run resolves the same sentinel for every miss), so repeats
    /// must collapse to one count.
    fn track_existing(&mut self, entity: &StoredEntity) {
        match entity.id {
            Some(id) => {
                self.ids.insert(id);
            }
            None => {
                let name = entity.attr_text("name").unwrap_or_default().to_string();
                self.stubs.insert(name);
            }
        }
    }

    fn count(&self) -> usize {
        self.ids.len() + self.stubs.len() + self.fresh
    }
}

#[derive(Debug, Default)]
struct IngestState {
    rows: usize,
    new: IndexMap<EntityKind, Bucket>,
    updated: IndexMap<EntityKind, Bucket>,
    relationships: IndexMap<String, usize>,
    collapsed: usize,
}

impl IngestState {
    fn track_new(&mut self, entity: &StoredEntity) {
        self.new.entry(entity.kind).or_default().track(entity);
    }

    fn track_updated(&mut self, entity: &StoredEntity) {
        self.updated.entry(entity.kind).or_default().track_existing(entity);
    }
}

/// Builds the i-th attribute record out of the resolved values. A list of
/// exactly `fan_out` length contributes its i-th element; any other list
/// degrades to one comma-joined string rather than failing the row.
fn assemble(
    values: &IndexMap<String, Resolved>,
    index: usize,
    fan_out: usize,
) -> IndexMap<String, AttrValue> {
    let mut attrs = IndexMap::new();
    for (field, value) in values {
        let attr = match value {
            Resolved::One(v) => v.clone(),
            Resolved::Many(list) if list.len() == fan_out => list[index].clone(),
            Resolved::Many(list) => AttrValue::Text(
                list.iter()
                    .map(AttrValue::render)
                    .collect::<Vec<_>>()
                    .join(", "),
            ),
        };
        attrs.insert(field.clone(), attr);
    }
    attrs
}

/// Keeps fanned-out records distinguishable: with more than one record per
/// input row, each one gets its own reference key.
fn apply_ref_suffix(attrs: &mut IndexMap<String, AttrValue>, index: usize, fan_out: usize) {
    if fan_out <= 1 {
        return;
    }
    if let Some(AttrValue::Text(reference)) = attrs.get("source_ref") {
        let suffixed = format!("{}_{}", reference, index);
        attrs.insert("source_ref".to_string(), AttrValue::Text(suffixed));
    }
}

fn merged_preview(found: &StoredEntity, attrs: IndexMap<String, AttrValue>) -> StoredEntity {
    let mut merged = found.clone();
    for (field, value) in attrs {
        merged.attrs.insert(field, value);
    }
    merged
}

/// The graph builder and batch ingest driver.
///
/// One ingester accumulates its new/updated buckets across every row and
/// every `bulk_ingest` call, deduplicated by entity identity: re-ingesting
/// the same rows moves entities into the updated bucket once, and a further
/// identical run changes no counts.
pub struct Ingester<'a> {
    store: &'a dyn EntityStore,
    schema: &'a RelationSchema,
    dry_run: bool,
    state: IngestState,
}

impl<'a> Ingester<'a> {
    pub fn new(store: &'a dyn EntityStore, schema: &'a RelationSchema, dry_run: bool) -> Self {
        Self {
            store,
            schema,
            dry_run,
            state: IngestState::default(),
        }
    }

    pub fn summary(&self) -> IngestSummary {
        IngestSummary {
            rows: self.state.rows,
            new: self
                .state
                .new
                .iter()
                .map(|(kind, bucket)| (*kind, bucket.count()))
                .collect(),
            updated: self
                .state
                .updated
                .iter()
                .map(|(kind, bucket)| (*kind, bucket.count()))
                .collect(),
            collapsed: self.state.collapsed,
        }
    }

    /// Child links recorded so far, keyed `kind.field`. Filled in dry runs
    /// too, where nothing is written.
    pub fn relationship_counts(&self) -> &IndexMap<String, usize> {
        &self.state.relationships
    }

    /// Maps one record onto the schema's entity graph.
    pub async fn ingest_row(
        &mut self,
        record: &mut Record,
        row_index: usize,
        source: &StoredEntity,
        allow_update: bool,
    ) -> Result<(), IngestError> {
        // the base reference key is resolved up front so nested levels
        // without their own key inherit it
        let top_ref = match &self.schema.node.ref_field {
            Some(resolver) => resolver.resolve(record, row_index),
            None => None,
        };

        build_level(
            self.store,
            self.dry_run,
            &mut self.state,
            self.schema.kind,
            &self.schema.node,
            record,
            row_index,
            source,
            top_ref.as_ref(),
            allow_update,
        )
        .await?;

        self.state.rows += 1;
        Ok(())
    }

    /// Runs the whole record sequence in transactional batches.
    ///
    /// A failing row aborts and rolls back its own batch; earlier batches
    /// stay committed, and the returned error reports both positions.
    pub async fn bulk_ingest<I>(
        &mut self,
        records: I,
        source_name: &str,
        batch_size: usize,
        allow_update: bool,
    ) -> Result<IngestSummary, IngestError>
    where
        I: IntoIterator<Item = Record>,
    {
        self.schema.validate()?;
        let batch_size = batch_size.max(1);

        let (source, created) = self.resolve_source(source_name).await?;
        // a just-created provenance row has no prior rows to update
        let allow_update = allow_update && !created;
        debug!(
            "ingesting into {} (created={}, allow_update={}, dry_run={})",
            source, created, allow_update, self.dry_run
        );

        let mut iter = records.into_iter();
        let mut row_index = 0usize;
        let mut committed = 0usize;

        loop {
            if !self.dry_run {
                self.store.begin_batch().await?;
            }

            let mut batch_rows = 0usize;
            let mut exhausted = false;
            let mut failure = None;
            while batch_rows < batch_size {
                let Some(mut record) = iter.next() else {
                    exhausted = true;
                    break;
                };
                // resolvers consume fields, so the error snapshot has to be
                // taken before the row is mapped
                let raw = record.to_json();
                match self
                    .ingest_row(&mut record, row_index, &source, allow_update)
                    .await
                {
                    Ok(()) => {
                        row_index += 1;
                        batch_rows += 1;
                    }
                    Err(err) => {
                        failure = Some((err, raw));
                        break;
                    }
                }
            }

            match failure {
                Some((err, record)) => {
                    if !self.dry_run {
                        if let Err(rollback_err) = self.store.rollback_batch().await {
                            warn!("rollback after row failure also failed: {}", rollback_err);
                        }
                    }
                    return Err(IngestError::Row {
                        row_index,
                        committed,
                        record,
                        source: err.into(),
                    });
                }
                None => {
                    if !self.dry_run {
                        self.store.commit_batch().await?;
                    }
                    committed = row_index;
                    if exhausted {
                        break;
                    }
                }
            }
        }

        let summary = self.summary();
        info!("imported {}", summary);
        Ok(summary)
    }

    async fn resolve_source(&self, name: &str) -> Result<(StoredEntity, bool), IngestError> {
        if self.dry_run {
            // find only; a dry run must not even create the provenance row
            let mut filters = IndexMap::new();
            filters.insert("name".to_string(), AttrValue::text(name));
            let found = self
                .store
                .query_by_exact(EntityKind::Source, &filters)
                .await?;
            return Ok(match found.into_iter().next() {
                Some(source) => (source, false),
                None => {
                    let mut source = StoredEntity::new(EntityKind::Source);
                    source.attrs.insert("name".to_string(), AttrValue::text(name));
                    (source, true)
                }
            });
        }
        Ok(self.store.find_or_create_source(name).await?)
    }
}

/// One recursion step: resolve this node's fields against the record, build
/// nested relations, fan out, resolve identity and persist.
#[allow(clippy::too_many_arguments)]
fn build_level<'r>(
    store: &'r dyn EntityStore,
    dry_run: bool,
    state: &'r mut IngestState,
    kind: EntityKind,
    node: &'r RelationNode,
    record: &'r mut Record,
    row_index: usize,
    source: &'r StoredEntity,
    top_ref: Option<&'r Resolved>,
    allow_update: bool,
) -> Pin<Box<dyn Future<Output = Result<Vec<StoredEntity>, IngestError>> + Send + 'r>> {
    Box::pin(async move {
        let mut fan_out = 1usize;
        let mut values: IndexMap<String, Resolved> = IndexMap::new();
        let mut unique_fields: Vec<String> = Vec::new();
        let mut dependents: IndexMap<String, Vec<StoredEntity>> = IndexMap::new();

        for (field, mapping) in &node.fields {
            match mapping {
                Mapping::Field { resolver, unique } => {
                    if let Some(resolved) = resolver.resolve(record, row_index) {
                        if let Some(len) = resolved.list_len() {
                            fan_out = fan_out.max(len);
                        }
                        values.insert(field.clone(), resolved);
                    }
                    if *unique {
                        unique_fields.push(field.clone());
                    }
                }
                Mapping::Child(child_node) => {
                    let child_kind = kind.child_relation(field).ok_or_else(|| {
                        IngestError::UnknownChildRelation {
                            kind,
                            field: field.clone(),
                        }
                    })?;
                    // children are built now but linked only after this
                    // level's entity is persisted
                    let children = build_level(
                        store,
                        dry_run,
                        state,
                        child_kind,
                        child_node,
                        record,
                        row_index,
                        source,
                        top_ref,
                        allow_update,
                    )
                    .await?;
                    dependents.insert(field.clone(), children);
                }
                Mapping::Parent(parent_node) => {
                    let parent_kind = kind.parent_relation(field).ok_or_else(|| {
                        IngestError::UnknownParentRelation {
                            kind,
                            field: field.clone(),
                        }
                    })?;
                    let parents = build_level(
                        store,
                        dry_run,
                        state,
                        parent_kind,
                        parent_node,
                        record,
                        row_index,
                        source,
                        top_ref,
                        allow_update,
                    )
                    .await?;
                    let resolved = if parents.len() == 1 {
                        Resolved::One(AttrValue::Entity(Box::new(
                            parents.into_iter().next().unwrap(),
                        )))
                    } else {
                        fan_out = fan_out.max(parents.len());
                        Resolved::Many(
                            parents
                                .into_iter()
                                .map(|p| AttrValue::Entity(Box::new(p)))
                                .collect(),
                        )
                    };
                    values.insert(field.clone(), resolved);
                }
            }
        }

        if let Some(resolver) = &node.ref_field {
            if let Some(resolved) = resolver.resolve(record, row_index) {
                if let Some(len) = resolved.list_len() {
                    fan_out = fan_out.max(len);
                }
                values.insert("source_ref".to_string(), resolved);
            }
            unique_fields.push("source_ref".to_string());
        }

        if kind.tracks_provenance() {
            values
                .entry("source".to_string())
                .or_insert_with(|| Resolved::One(AttrValue::Entity(Box::new(source.clone()))));
            if let Some(top_ref) = top_ref {
                values
                    .entry("source_ref".to_string())
                    .or_insert_with(|| top_ref.clone());
            }
        }

        let resolver = IdentityResolver::new(store);
        let mut results = Vec::with_capacity(fan_out);
        for i in 0..fan_out {
            let mut attrs = assemble(&values, i, fan_out);
            apply_ref_suffix(&mut attrs, i, fan_out);
            debug!(
                "{} candidate {}/{} unique={:?}",
                kind,
                i + 1,
                fan_out,
                unique_fields
            );

            let outcome = resolver
                .resolve(
                    kind,
                    node.mode,
                    node.lookup,
                    &unique_fields,
                    &attrs,
                    allow_update,
                )
                .await?;

            let entity = match outcome {
                IdentityOutcome::Keep(found) => {
                    state.track_updated(&found);
                    found
                }
                IdentityOutcome::Update(found) => {
                    let updated = if dry_run {
                        merged_preview(&found, attrs)
                    } else {
                        store.update_in_place(&found, attrs).await?
                    };
                    state.track_updated(&updated);
                    updated
                }
                IdentityOutcome::Create => {
                    let entity = if dry_run {
                        StoredEntity::with_attrs(kind, attrs)
                    } else {
                        store.create(kind, attrs).await?
                    };
                    debug!("new {}", entity);
                    state.track_new(&entity);
                    entity
                }
                IdentityOutcome::Replace(found) => {
                    warn!(
                        "{} existing {} rows match one candidate; archiving and replacing",
                        found.len(),
                        kind
                    );
                    let snapshots: Vec<JsonValue> =
                        found.iter().map(StoredEntity::snapshot).collect();
                    for stale in &found {
                        if !dry_run {
                            store.delete(stale).await?;
                        }
                    }
                    state.collapsed += found.len();
                    attrs.insert(
                        "old_rows".to_string(),
                        AttrValue::Json(JsonValue::Array(snapshots)),
                    );
                    let entity = if dry_run {
                        StoredEntity::with_attrs(kind, attrs)
                    } else {
                        store.create(kind, attrs).await?
                    };
                    state.track_new(&entity);
                    entity
                }
            };

            for (field, children) in &dependents {
                if !dry_run {
                    store.relate(&entity, field, children).await?;
                }
                *state
                    .relationships
                    .entry(format!("{}.{}", kind, field))
                    .or_insert(0) += children.len();
            }

            results.push(entity);
        }

        Ok(results)
    })
}

//! sea-orm backed implementation of the ingest [`EntityStore`].
//!
//! Batch boundaries map to database transactions: between `begin_batch` and
//! `commit_batch` every operation runs on the open transaction, so a failed
//! batch rolls back without touching earlier commits.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use indexmap::IndexMap;
use sea_orm::sea_query::{Expr, Func, SimpleExpr};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DatabaseTransaction,
    EntityTrait, QueryFilter, Set, TransactionTrait,
};
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use wkt::ToWkt;

use super::entities::{languages, places, sources, words};
use crate::ingest::{geometry, AttrValue, EntityKind, EntityStore, StoredEntity};

/// Provenance row that hand-entered and fallback data hangs off.
pub const MANUAL_SOURCE: &str = "Manual";
/// Fallback language for rows whose language cannot be resolved.
pub const UNKNOWN_LANGUAGE: &str = "Unknown";

const SOURCE_FIELDS: &[&str] = &["name", "description", "metadata", "old_rows"];
const LANGUAGE_FIELDS: &[&str] = &[
    "name",
    "url",
    "alt_names",
    "metadata",
    "old_rows",
    "source",
    "source_ref",
];
const PLACE_FIELDS: &[&str] = &[
    "category",
    "location",
    "location_desc",
    "description",
    "is_public",
    "metadata",
    "old_rows",
    "source",
    "source_ref",
];
const WORD_FIELDS: &[&str] = &[
    "place",
    "name",
    "description",
    "language",
    "metadata",
    "old_rows",
    "source",
    "source_ref",
];

pub struct SqlEntityStore {
    db: DatabaseConnection,
    txn: Mutex<Option<DatabaseTransaction>>,
    manual_source: StoredEntity,
    unknown_language: StoredEntity,
    manual_source_id: i32,
    unknown_language_id: i32,
}

impl SqlEntityStore {
    /// Wraps a connection, creating the sentinel rows when missing.
    pub async fn init(db: DatabaseConnection) -> Result<Self> {
        Self::init_inner(db, true).await
    }

    /// Read-only variant for dry runs: missing sentinel rows become unsaved
    /// stubs instead of being created.
    pub async fn init_dry(db: DatabaseConnection) -> Result<Self> {
        Self::init_inner(db, false).await
    }

    async fn init_inner(db: DatabaseConnection, create_missing: bool) -> Result<Self> {
        let now = chrono::Utc::now();

        let manual_source = match find_source_by_name(&db, MANUAL_SOURCE).await? {
            Some(model) => source_to_entity(model),
            None if create_missing => {
                let model = sources::ActiveModel {
                    name: Set(MANUAL_SOURCE.to_string()),
                    created_at: Set(now),
                    updated_at: Set(now),
                    ..Default::default()
                }
                .insert(&db)
                .await?;
                info!("created sentinel source {:?}", MANUAL_SOURCE);
                source_to_entity(model)
            }
            None => named_stub(EntityKind::Source, MANUAL_SOURCE),
        };

        let found = languages::Entity::find()
            .filter(ci_eq(languages::Column::Name, UNKNOWN_LANGUAGE))
            .one(&db)
            .await?;
        let unknown_language = match found {
            Some(model) => language_to_entity(model),
            None if create_missing => {
                let manual_source_id = manual_source
                    .id
                    .ok_or_else(|| anyhow!("sentinel source has no id"))?;
                let model = languages::ActiveModel {
                    name: Set(UNKNOWN_LANGUAGE.to_string()),
                    source_id: Set(manual_source_id),
                    created_at: Set(now),
                    updated_at: Set(now),
                    ..Default::default()
                }
                .insert(&db)
                .await?;
                info!("created sentinel language {:?}", UNKNOWN_LANGUAGE);
                language_to_entity(model)
            }
            None => named_stub(EntityKind::Language, UNKNOWN_LANGUAGE),
        };

        // a dry store never writes, so stub ids only back query filters,
        // where an unsaved entity matches nothing
        let manual_source_id = manual_source.id.unwrap_or_default();
        let unknown_language_id = unknown_language.id.unwrap_or_default();

        Ok(Self {
            db,
            txn: Mutex::new(None),
            manual_source,
            unknown_language,
            manual_source_id,
            unknown_language_id,
        })
    }

    async fn create_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        kind: EntityKind,
        attrs: IndexMap<String, AttrValue>,
    ) -> Result<StoredEntity> {
        let now = chrono::Utc::now();
        let entity = match kind {
            EntityKind::Source => {
                warn_unmapped(kind, &attrs, SOURCE_FIELDS);
                let mut active = source_active(&attrs)?;
                active.created_at = Set(now);
                source_to_entity(active.insert(conn).await?)
            }
            EntityKind::Language => {
                warn_unmapped(kind, &attrs, LANGUAGE_FIELDS);
                let mut active = language_active(&attrs, self.manual_source_id)?;
                active.created_at = Set(now);
                language_to_entity(active.insert(conn).await?)
            }
            EntityKind::Place => {
                warn_unmapped(kind, &attrs, PLACE_FIELDS);
                let mut active = place_active(&attrs, self.manual_source_id)?;
                active.created_at = Set(now);
                place_to_entity(active.insert(conn).await?)
            }
            EntityKind::Word => {
                warn_unmapped(kind, &attrs, WORD_FIELDS);
                let mut active =
                    word_active(&attrs, self.manual_source_id, self.unknown_language_id)?;
                active.created_at = Set(now);
                word_to_entity(active.insert(conn).await?)
            }
        };
        debug!("created {}", entity);
        Ok(entity)
    }

    async fn update_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        entity: &StoredEntity,
        attrs: IndexMap<String, AttrValue>,
    ) -> Result<StoredEntity> {
        let id = entity
            .id
            .ok_or_else(|| anyhow!("cannot update unsaved {}", entity))?;

        let mut metadata = object_attr(entity.attr("metadata"));
        let original_metadata = metadata.clone();
        let mut merged = entity.attrs.clone();
        let mut changed = JsonMap::new();

        for (field, value) in attrs {
            if field == "metadata" {
                // metadata merges key by key so earlier audit entries survive
                for (key, entry) in object_attr(Some(&value)) {
                    metadata.insert(key, entry);
                }
                continue;
            }
            if field == "old_rows" {
                metadata.insert("old_rows".to_string(), value.to_json());
                continue;
            }
            match merged.get(&field) {
                Some(old) if attr_equivalent(old, &value) => {}
                old => {
                    changed.insert(
                        field.clone(),
                        old.map(AttrValue::to_json).unwrap_or(JsonValue::Null),
                    );
                }
            }
            merged.insert(field, value);
        }

        if changed.is_empty() && metadata == original_metadata {
            debug!("{} unchanged, skipping write", entity);
            return Ok(entity.clone());
        }

        if !changed.is_empty() {
            // prior values of every overwritten field stay in the audit trail
            let revision = json!({
                "at": chrono::Utc::now().to_rfc3339(),
                "fields": changed,
            });
            match metadata
                .entry("revisions".to_string())
                .or_insert_with(|| json!([]))
            {
                JsonValue::Array(revisions) => revisions.push(revision),
                other => *other = json!([revision]),
            }
        }
        merged.insert(
            "metadata".to_string(),
            AttrValue::Json(JsonValue::Object(metadata)),
        );

        let updated = match entity.kind {
            EntityKind::Source => {
                let mut active = source_active(&merged)?;
                active.id = Set(id);
                source_to_entity(active.update(conn).await?)
            }
            EntityKind::Language => {
                let mut active = language_active(&merged, self.manual_source_id)?;
                active.id = Set(id);
                language_to_entity(active.update(conn).await?)
            }
            EntityKind::Place => {
                let mut active = place_active(&merged, self.manual_source_id)?;
                active.id = Set(id);
                place_to_entity(active.update(conn).await?)
            }
            EntityKind::Word => {
                let mut active =
                    word_active(&merged, self.manual_source_id, self.unknown_language_id)?;
                active.id = Set(id);
                word_to_entity(active.update(conn).await?)
            }
        };
        debug!("updated {}", updated);
        Ok(updated)
    }
}

#[async_trait]
impl EntityStore for SqlEntityStore {
    async fn query_by_exact(
        &self,
        kind: EntityKind,
        filters: &IndexMap<String, AttrValue>,
    ) -> Result<Vec<StoredEntity>> {
        let guard = self.txn.lock().await;
        match guard.as_ref() {
            Some(txn) => query_exact(txn, kind, filters).await,
            None => query_exact(&self.db, kind, filters).await,
        }
    }

    async fn query_by_fuzzy_name(&self, kind: EntityKind, name: &str) -> Result<Vec<StoredEntity>> {
        if kind != EntityKind::Language {
            bail!("no fuzzy name lookup for {}", kind);
        }
        let guard = self.txn.lock().await;
        match guard.as_ref() {
            Some(txn) => fuzzy_languages(txn, name).await,
            None => fuzzy_languages(&self.db, name).await,
        }
    }

    async fn create(
        &self,
        kind: EntityKind,
        attrs: IndexMap<String, AttrValue>,
    ) -> Result<StoredEntity> {
        let guard = self.txn.lock().await;
        match guard.as_ref() {
            Some(txn) => self.create_in(txn, kind, attrs).await,
            None => self.create_in(&self.db, kind, attrs).await,
        }
    }

    async fn update_in_place(
        &self,
        entity: &StoredEntity,
        attrs: IndexMap<String, AttrValue>,
    ) -> Result<StoredEntity> {
        let guard = self.txn.lock().await;
        match guard.as_ref() {
            Some(txn) => self.update_in(txn, entity, attrs).await,
            None => self.update_in(&self.db, entity, attrs).await,
        }
    }

    async fn delete(&self, entity: &StoredEntity) -> Result<()> {
        let guard = self.txn.lock().await;
        match guard.as_ref() {
            Some(txn) => delete_entity(txn, entity).await,
            None => delete_entity(&self.db, entity).await,
        }
    }

    async fn relate(
        &self,
        parent: &StoredEntity,
        field: &str,
        children: &[StoredEntity],
    ) -> Result<()> {
        let guard = self.txn.lock().await;
        match guard.as_ref() {
            Some(txn) => relate_children(txn, parent, field, children).await,
            None => relate_children(&self.db, parent, field, children).await,
        }
    }

    async fn find_or_create_source(&self, name: &str) -> Result<(StoredEntity, bool)> {
        let guard = self.txn.lock().await;
        match guard.as_ref() {
            Some(txn) => find_or_create_source(txn, name).await,
            None => find_or_create_source(&self.db, name).await,
        }
    }

    async fn sentinel(&self, kind: EntityKind) -> Result<StoredEntity> {
        match kind {
            EntityKind::Source => Ok(self.manual_source.clone()),
            EntityKind::Language => Ok(self.unknown_language.clone()),
            kind => bail!("no sentinel row for {}", kind),
        }
    }

    async fn begin_batch(&self) -> Result<()> {
        let mut guard = self.txn.lock().await;
        if guard.is_some() {
            bail!("a batch is already open");
        }
        *guard = Some(self.db.begin().await?);
        Ok(())
    }

    async fn commit_batch(&self) -> Result<()> {
        let mut guard = self.txn.lock().await;
        match guard.take() {
            Some(txn) => Ok(txn.commit().await?),
            None => bail!("no batch to commit"),
        }
    }

    async fn rollback_batch(&self) -> Result<()> {
        let mut guard = self.txn.lock().await;
        match guard.take() {
            Some(txn) => Ok(txn.rollback().await?),
            None => bail!("no batch to roll back"),
        }
    }
}

async fn query_exact<C: ConnectionTrait>(
    conn: &C,
    kind: EntityKind,
    filters: &IndexMap<String, AttrValue>,
) -> Result<Vec<StoredEntity>> {
    match kind {
        EntityKind::Source => query_sources(conn, filters).await,
        EntityKind::Language => query_languages(conn, filters).await,
        EntityKind::Place => query_places(conn, filters).await,
        EntityKind::Word => query_words(conn, filters).await,
    }
}

enum FilterValue {
    Text(String),
    Id(i32),
    /// Filter against an entity that was never saved; matches nothing.
    Unsaved,
}

fn filter_value(value: &AttrValue) -> FilterValue {
    match value {
        AttrValue::Entity(e) => match e.id {
            Some(id) => FilterValue::Id(id),
            None => FilterValue::Unsaved,
        },
        AttrValue::Text(s) => FilterValue::Text(s.clone()),
        AttrValue::Json(v) => FilterValue::Text(v.to_string()),
        AttrValue::Point(p) => FilterValue::Text(p.wkt_string()),
    }
}

/// Case-insensitive equality, for the columns the previous system kept
/// case-insensitive at the database level.
fn ci_eq<C: ColumnTrait>(column: C, value: &str) -> SimpleExpr {
    Expr::expr(Func::lower(Expr::col(column))).eq(value.to_lowercase())
}

async fn query_sources<C: ConnectionTrait>(
    conn: &C,
    filters: &IndexMap<String, AttrValue>,
) -> Result<Vec<StoredEntity>> {
    let mut query = sources::Entity::find();
    for (field, value) in filters {
        query = match (field.as_str(), filter_value(value)) {
            (_, FilterValue::Unsaved) => return Ok(Vec::new()),
            ("name", FilterValue::Text(s)) => query.filter(ci_eq(sources::Column::Name, &s)),
            ("description", FilterValue::Text(s)) => {
                query.filter(sources::Column::Description.eq(s))
            }
            (field, _) => bail!("cannot filter sources by {:?}", field),
        };
    }
    Ok(query
        .all(conn)
        .await?
        .into_iter()
        .map(source_to_entity)
        .collect())
}

async fn query_languages<C: ConnectionTrait>(
    conn: &C,
    filters: &IndexMap<String, AttrValue>,
) -> Result<Vec<StoredEntity>> {
    let mut query = languages::Entity::find();
    for (field, value) in filters {
        query = match (field.as_str(), filter_value(value)) {
            (_, FilterValue::Unsaved) => return Ok(Vec::new()),
            ("name", FilterValue::Text(s)) => query.filter(ci_eq(languages::Column::Name, &s)),
            ("url", FilterValue::Text(s)) => query.filter(languages::Column::Url.eq(s)),
            ("source_ref", FilterValue::Text(s)) => {
                query.filter(languages::Column::SourceRef.eq(s))
            }
            ("source", FilterValue::Id(id)) => query.filter(languages::Column::SourceId.eq(id)),
            (field, _) => bail!("cannot filter languages by {:?}", field),
        };
    }
    Ok(query
        .all(conn)
        .await?
        .into_iter()
        .map(language_to_entity)
        .collect())
}

async fn query_places<C: ConnectionTrait>(
    conn: &C,
    filters: &IndexMap<String, AttrValue>,
) -> Result<Vec<StoredEntity>> {
    let mut query = places::Entity::find();
    for (field, value) in filters {
        query = match (field.as_str(), filter_value(value)) {
            (_, FilterValue::Unsaved) => return Ok(Vec::new()),
            ("category", FilterValue::Text(s)) => query.filter(ci_eq(places::Column::Category, &s)),
            ("location_desc", FilterValue::Text(s)) => {
                query.filter(places::Column::LocationDesc.eq(s))
            }
            ("description", FilterValue::Text(s)) => {
                query.filter(places::Column::Description.eq(s))
            }
            ("source_ref", FilterValue::Text(s)) => query.filter(places::Column::SourceRef.eq(s)),
            ("source", FilterValue::Id(id)) => query.filter(places::Column::SourceId.eq(id)),
            (field, _) => bail!("cannot filter places by {:?}", field),
        };
    }
    Ok(query
        .all(conn)
        .await?
        .into_iter()
        .map(place_to_entity)
        .collect())
}

async fn query_words<C: ConnectionTrait>(
    conn: &C,
    filters: &IndexMap<String, AttrValue>,
) -> Result<Vec<StoredEntity>> {
    let mut query = words::Entity::find();
    for (field, value) in filters {
        query = match (field.as_str(), filter_value(value)) {
            (_, FilterValue::Unsaved) => return Ok(Vec::new()),
            ("name", FilterValue::Text(s)) => query.filter(ci_eq(words::Column::Name, &s)),
            ("description", FilterValue::Text(s)) => {
                query.filter(words::Column::Description.eq(s))
            }
            ("source_ref", FilterValue::Text(s)) => query.filter(words::Column::SourceRef.eq(s)),
            ("source", FilterValue::Id(id)) => query.filter(words::Column::SourceId.eq(id)),
            ("language", FilterValue::Id(id)) => query.filter(words::Column::LanguageId.eq(id)),
            ("place", FilterValue::Id(id)) => query.filter(words::Column::PlaceId.eq(id)),
            (field, _) => bail!("cannot filter words by {:?}", field),
        };
    }
    Ok(query
        .all(conn)
        .await?
        .into_iter()
        .map(word_to_entity)
        .collect())
}

async fn fuzzy_languages<C: ConnectionTrait>(conn: &C, name: &str) -> Result<Vec<StoredEntity>> {
    let exact = languages::Entity::find()
        .filter(ci_eq(languages::Column::Name, name))
        .all(conn)
        .await?;
    if !exact.is_empty() {
        return Ok(exact.into_iter().map(language_to_entity).collect());
    }

    // alias lists are stored as JSON text; quoting the needle keeps the
    // match to whole elements, so "Martu" cannot claim an alias like
    // "Martu Wangka"
    let pattern = format!("%\"{}\"%", name.to_lowercase());
    let by_alias = languages::Entity::find()
        .filter(Expr::expr(Func::lower(Expr::col(languages::Column::AltNames))).like(pattern))
        .all(conn)
        .await?;
    Ok(by_alias.into_iter().map(language_to_entity).collect())
}

async fn delete_entity<C: ConnectionTrait>(conn: &C, entity: &StoredEntity) -> Result<()> {
    let id = entity
        .id
        .ok_or_else(|| anyhow!("cannot delete unsaved {}", entity))?;
    let result = match entity.kind {
        EntityKind::Source => sources::Entity::delete_by_id(id).exec(conn).await?,
        EntityKind::Language => languages::Entity::delete_by_id(id).exec(conn).await?,
        EntityKind::Place => places::Entity::delete_by_id(id).exec(conn).await?,
        EntityKind::Word => words::Entity::delete_by_id(id).exec(conn).await?,
    };
    if result.rows_affected == 0 {
        warn!("{} was already gone", entity);
    }
    Ok(())
}

async fn relate_children<C: ConnectionTrait>(
    conn: &C,
    parent: &StoredEntity,
    field: &str,
    children: &[StoredEntity],
) -> Result<()> {
    match (parent.kind, field) {
        (EntityKind::Place, "names") => {
            let place_id = parent
                .id
                .ok_or_else(|| anyhow!("cannot attach names to unsaved {}", parent))?;
            for child in children {
                let word_id = child
                    .id
                    .ok_or_else(|| anyhow!("cannot attach unsaved {} to {}", child, parent))?;
                let active = words::ActiveModel {
                    id: Set(word_id),
                    place_id: Set(Some(place_id)),
                    updated_at: Set(chrono::Utc::now()),
                    ..Default::default()
                };
                active.update(conn).await?;
            }
            Ok(())
        }
        (kind, field) => bail!("no {:?} relationship on {}", field, kind),
    }
}

async fn find_or_create_source<C: ConnectionTrait>(
    conn: &C,
    name: &str,
) -> Result<(StoredEntity, bool)> {
    if let Some(model) = find_source_by_name(conn, name).await? {
        return Ok((source_to_entity(model), false));
    }
    let now = chrono::Utc::now();
    let model = sources::ActiveModel {
        name: Set(name.to_string()),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(conn)
    .await?;
    info!("created source {:?}", name);
    Ok((source_to_entity(model), true))
}

async fn find_source_by_name<C: ConnectionTrait>(
    conn: &C,
    name: &str,
) -> Result<Option<sources::Model>> {
    Ok(sources::Entity::find()
        .filter(ci_eq(sources::Column::Name, name))
        .one(conn)
        .await?)
}

fn source_to_entity(model: sources::Model) -> StoredEntity {
    let mut attrs = IndexMap::new();
    attrs.insert("name".to_string(), AttrValue::Text(model.name));
    if let Some(description) = model.description {
        attrs.insert("description".to_string(), AttrValue::Text(description));
    }
    if let Some(metadata) = model.metadata {
        attrs.insert("metadata".to_string(), AttrValue::Json(parse_json(&metadata)));
    }
    StoredEntity {
        kind: EntityKind::Source,
        id: Some(model.id),
        attrs,
    }
}

fn language_to_entity(model: languages::Model) -> StoredEntity {
    let mut attrs = IndexMap::new();
    attrs.insert("name".to_string(), AttrValue::Text(model.name));
    if let Some(url) = model.url {
        attrs.insert("url".to_string(), AttrValue::Text(url));
    }
    if let Some(alt_names) = model.alt_names {
        attrs.insert("alt_names".to_string(), AttrValue::Json(parse_json(&alt_names)));
    }
    if let Some(metadata) = model.metadata {
        attrs.insert("metadata".to_string(), AttrValue::Json(parse_json(&metadata)));
    }
    attrs.insert(
        "source".to_string(),
        entity_ref(EntityKind::Source, model.source_id),
    );
    if let Some(source_ref) = model.source_ref {
        attrs.insert("source_ref".to_string(), AttrValue::Text(source_ref));
    }
    StoredEntity {
        kind: EntityKind::Language,
        id: Some(model.id),
        attrs,
    }
}

fn place_to_entity(model: places::Model) -> StoredEntity {
    let mut attrs = IndexMap::new();
    attrs.insert("category".to_string(), AttrValue::Text(model.category));
    if let Some(location) = model.location {
        // rows predating the WKT convention keep their raw text
        let value = match geometry::parse_wkt(&location, geometry::WGS84_SRID) {
            Some(point) => AttrValue::Point(point),
            None => AttrValue::Text(location),
        };
        attrs.insert("location".to_string(), value);
    }
    if let Some(location_desc) = model.location_desc {
        attrs.insert("location_desc".to_string(), AttrValue::Text(location_desc));
    }
    if let Some(description) = model.description {
        attrs.insert("description".to_string(), AttrValue::Text(description));
    }
    attrs.insert(
        "is_public".to_string(),
        AttrValue::Json(json!(model.is_public)),
    );
    if let Some(metadata) = model.metadata {
        attrs.insert("metadata".to_string(), AttrValue::Json(parse_json(&metadata)));
    }
    attrs.insert(
        "source".to_string(),
        entity_ref(EntityKind::Source, model.source_id),
    );
    if let Some(source_ref) = model.source_ref {
        attrs.insert("source_ref".to_string(), AttrValue::Text(source_ref));
    }
    StoredEntity {
        kind: EntityKind::Place,
        id: Some(model.id),
        attrs,
    }
}

fn word_to_entity(model: words::Model) -> StoredEntity {
    let mut attrs = IndexMap::new();
    if let Some(place_id) = model.place_id {
        attrs.insert("place".to_string(), entity_ref(EntityKind::Place, place_id));
    }
    attrs.insert("name".to_string(), AttrValue::Text(model.name));
    if let Some(description) = model.description {
        attrs.insert("description".to_string(), AttrValue::Text(description));
    }
    attrs.insert(
        "language".to_string(),
        entity_ref(EntityKind::Language, model.language_id),
    );
    if let Some(metadata) = model.metadata {
        attrs.insert("metadata".to_string(), AttrValue::Json(parse_json(&metadata)));
    }
    attrs.insert(
        "source".to_string(),
        entity_ref(EntityKind::Source, model.source_id),
    );
    if let Some(source_ref) = model.source_ref {
        attrs.insert("source_ref".to_string(), AttrValue::Text(source_ref));
    }
    StoredEntity {
        kind: EntityKind::Word,
        id: Some(model.id),
        attrs,
    }
}

fn entity_ref(kind: EntityKind, id: i32) -> AttrValue {
    let mut stub = StoredEntity::new(kind);
    stub.id = Some(id);
    AttrValue::Entity(Box::new(stub))
}

fn named_stub(kind: EntityKind, name: &str) -> StoredEntity {
    let mut stub = StoredEntity::new(kind);
    stub.attrs.insert("name".to_string(), AttrValue::text(name));
    stub
}

fn parse_json(raw: &str) -> JsonValue {
    serde_json::from_str(raw).unwrap_or_else(|_| JsonValue::String(raw.to_string()))
}

fn source_active(attrs: &IndexMap<String, AttrValue>) -> Result<sources::ActiveModel> {
    Ok(sources::ActiveModel {
        name: Set(text_attr(attrs, "name").ok_or_else(|| anyhow!("source row needs a name"))?),
        description: Set(text_attr(attrs, "description")),
        metadata: Set(metadata_attr(attrs)),
        updated_at: Set(chrono::Utc::now()),
        ..Default::default()
    })
}

fn language_active(
    attrs: &IndexMap<String, AttrValue>,
    fallback_source: i32,
) -> Result<languages::ActiveModel> {
    Ok(languages::ActiveModel {
        name: Set(text_attr(attrs, "name").ok_or_else(|| anyhow!("language row needs a name"))?),
        url: Set(text_attr(attrs, "url")),
        alt_names: Set(json_attr(attrs, "alt_names").map(|v| v.to_string())),
        metadata: Set(metadata_attr(attrs)),
        source_id: Set(entity_attr(attrs, "source").unwrap_or(fallback_source)),
        source_ref: Set(text_attr(attrs, "source_ref")),
        updated_at: Set(chrono::Utc::now()),
        ..Default::default()
    })
}

fn place_active(
    attrs: &IndexMap<String, AttrValue>,
    fallback_source: i32,
) -> Result<places::ActiveModel> {
    Ok(places::ActiveModel {
        category: Set(text_attr(attrs, "category").unwrap_or_else(|| "unknown".to_string())),
        location: Set(location_attr(attrs)),
        location_desc: Set(text_attr(attrs, "location_desc")),
        description: Set(text_attr(attrs, "description")),
        is_public: Set(bool_attr(attrs, "is_public").unwrap_or(true)),
        metadata: Set(metadata_attr(attrs)),
        source_id: Set(entity_attr(attrs, "source").unwrap_or(fallback_source)),
        source_ref: Set(text_attr(attrs, "source_ref")),
        updated_at: Set(chrono::Utc::now()),
        ..Default::default()
    })
}

fn word_active(
    attrs: &IndexMap<String, AttrValue>,
    fallback_source: i32,
    fallback_language: i32,
) -> Result<words::ActiveModel> {
    Ok(words::ActiveModel {
        place_id: Set(entity_attr(attrs, "place")),
        name: Set(text_attr(attrs, "name").ok_or_else(|| anyhow!("word row needs a name"))?),
        description: Set(text_attr(attrs, "description")),
        language_id: Set(entity_attr(attrs, "language").unwrap_or(fallback_language)),
        metadata: Set(metadata_attr(attrs)),
        source_id: Set(entity_attr(attrs, "source").unwrap_or(fallback_source)),
        source_ref: Set(text_attr(attrs, "source_ref")),
        updated_at: Set(chrono::Utc::now()),
        ..Default::default()
    })
}

fn text_attr(attrs: &IndexMap<String, AttrValue>, field: &str) -> Option<String> {
    attrs.get(field).map(AttrValue::render)
}

fn entity_attr(attrs: &IndexMap<String, AttrValue>, field: &str) -> Option<i32> {
    attrs.get(field).and_then(AttrValue::entity_id)
}

fn json_attr(attrs: &IndexMap<String, AttrValue>, field: &str) -> Option<JsonValue> {
    attrs.get(field).map(AttrValue::to_json)
}

fn bool_attr(attrs: &IndexMap<String, AttrValue>, field: &str) -> Option<bool> {
    match attrs.get(field)? {
        AttrValue::Json(JsonValue::Bool(b)) => Some(*b),
        AttrValue::Text(s) => Some(!matches!(
            s.to_lowercase().as_str(),
            "" | "false" | "0" | "no"
        )),
        _ => None,
    }
}

fn location_attr(attrs: &IndexMap<String, AttrValue>) -> Option<String> {
    match attrs.get("location")? {
        AttrValue::Point(p) => Some(p.wkt_string()),
        AttrValue::Text(s) => Some(s.clone()),
        _ => None,
    }
}

fn metadata_attr(attrs: &IndexMap<String, AttrValue>) -> Option<String> {
    let mut metadata = object_attr(attrs.get("metadata"));
    if let Some(old_rows) = attrs.get("old_rows") {
        metadata.insert("old_rows".to_string(), old_rows.to_json());
    }
    if metadata.is_empty() {
        None
    } else {
        Some(JsonValue::Object(metadata).to_string())
    }
}

fn object_attr(value: Option<&AttrValue>) -> JsonMap<String, JsonValue> {
    match value {
        Some(AttrValue::Json(JsonValue::Object(map))) => map.clone(),
        Some(other) => {
            let mut map = JsonMap::new();
            map.insert("value".to_string(), other.to_json());
            map
        }
        None => JsonMap::new(),
    }
}

fn attr_equivalent(a: &AttrValue, b: &AttrValue) -> bool {
    match (a, b) {
        (AttrValue::Entity(x), AttrValue::Entity(y)) => x.id == y.id,
        (AttrValue::Text(s), AttrValue::Point(p)) | (AttrValue::Point(p), AttrValue::Text(s)) => {
            *s == p.wkt_string()
        }
        _ => a == b,
    }
}

fn warn_unmapped(kind: EntityKind, attrs: &IndexMap<String, AttrValue>, known: &[&str]) {
    for field in attrs.keys() {
        if !known.contains(&field.as_str()) {
            warn!("ignoring unmapped {} attribute {:?}", kind, field);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_attr_folds_old_rows_in() {
        let mut attrs = IndexMap::new();
        attrs.insert(
            "metadata".to_string(),
            AttrValue::Json(json!({"zone": "50"})),
        );
        attrs.insert(
            "old_rows".to_string(),
            AttrValue::Json(json!([{"category": "well"}])),
        );
        let raw = metadata_attr(&attrs).unwrap();
        let parsed: JsonValue = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["zone"], json!("50"));
        assert_eq!(parsed["old_rows"][0]["category"], json!("well"));
    }

    #[test]
    fn test_metadata_attr_empty_stays_null() {
        let attrs = IndexMap::new();
        assert_eq!(metadata_attr(&attrs), None);
    }

    #[test]
    fn test_attr_equivalent_compares_entities_by_id() {
        let mut a = StoredEntity::new(EntityKind::Source);
        a.id = Some(3);
        let mut b = StoredEntity::new(EntityKind::Source);
        b.id = Some(3);
        b.attrs.insert("name".to_string(), AttrValue::text("Geonoma"));
        assert!(attr_equivalent(
            &AttrValue::Entity(Box::new(a)),
            &AttrValue::Entity(Box::new(b)),
        ));
    }

    #[test]
    fn test_bool_attr_reads_text_forms() {
        let mut attrs = IndexMap::new();
        attrs.insert("is_public".to_string(), AttrValue::text("no"));
        assert_eq!(bool_attr(&attrs, "is_public"), Some(false));
        attrs.insert("is_public".to_string(), AttrValue::text("yes"));
        assert_eq!(bool_attr(&attrs, "is_public"), Some(true));
    }

    #[test]
    fn test_object_attr_wraps_scalars() {
        let value = AttrValue::text("loose");
        let map = object_attr(Some(&value));
        assert_eq!(map.get("value"), Some(&json!("loose")));
    }
}

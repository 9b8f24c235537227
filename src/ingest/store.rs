use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use geo_types::Point;
use indexmap::IndexMap;
use serde_json::{json, Value as JsonValue};
use wkt::ToWkt;

/// The entity kinds a relation schema can produce.
///
/// Acts as the entity-kind descriptor: provenance tracking and the declared
/// relationships between kinds are resolved from here when a schema is
/// compiled, not probed at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    Source,
    Language,
    Place,
    Word,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Source => "source",
            EntityKind::Language => "language",
            EntityKind::Place => "place",
            EntityKind::Word => "word",
        }
    }

    /// Whether rows of this kind carry a `(source, source_ref)` pair.
    pub fn tracks_provenance(&self) -> bool {
        !matches!(self, EntityKind::Source)
    }

    /// Target kind of a reverse one-to-many relationship, e.g. the `names`
    /// attached to a place.
    pub fn child_relation(&self, field: &str) -> Option<EntityKind> {
        match (self, field) {
            (EntityKind::Place, "names") => Some(EntityKind::Word),
            _ => None,
        }
    }

    /// Target kind of a forward many-to-one relationship, e.g. the `language`
    /// a word belongs to.
    pub fn parent_relation(&self, field: &str) -> Option<EntityKind> {
        match (self, field) {
            (EntityKind::Word, "language") => Some(EntityKind::Language),
            (EntityKind::Word, "place") => Some(EntityKind::Place),
            _ => None,
        }
    }

    /// Kinds that have a well-known fallback row.
    pub fn has_sentinel(&self) -> bool {
        matches!(self, EntityKind::Source | EntityKind::Language)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attribute value on a persisted or about-to-be-persisted entity.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Text(String),
    /// Free-form JSON, used for metadata blobs and alias lists.
    Json(JsonValue),
    /// A WGS84 point.
    Point(Point<f64>),
    /// Reference to another entity (a foreign key once persisted).
    Entity(Box<StoredEntity>),
}

impl AttrValue {
    pub fn text(value: impl Into<String>) -> Self {
        AttrValue::Text(value.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttrValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn entity_id(&self) -> Option<i32> {
        match self {
            AttrValue::Entity(e) => e.id,
            _ => None,
        }
    }

    /// Display form, used when a multi-value field has to degrade to a single
    /// joined string.
    pub fn render(&self) -> String {
        match self {
            AttrValue::Text(s) => s.clone(),
            AttrValue::Json(v) => v.to_string(),
            AttrValue::Point(p) => p.wkt_string(),
            AttrValue::Entity(e) => match (e.attr_text("name"), e.id) {
                (Some(name), _) => name.to_string(),
                (None, Some(id)) => format!("{}:{}", e.kind, id),
                (None, None) => e.kind.to_string(),
            },
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            AttrValue::Text(s) => json!(s),
            AttrValue::Json(v) => v.clone(),
            AttrValue::Point(p) => json!(p.wkt_string()),
            AttrValue::Entity(e) => match e.id {
                Some(id) => json!(id),
                None => JsonValue::Null,
            },
        }
    }
}

/// A persisted entity as the engine sees it: kind, backend id once saved, and
/// a flat attribute map. `id` stays `None` for entities built during a dry
/// run.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntity {
    pub kind: EntityKind,
    pub id: Option<i32>,
    pub attrs: IndexMap<String, AttrValue>,
}

impl StoredEntity {
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            id: None,
            attrs: IndexMap::new(),
        }
    }

    pub fn with_attrs(kind: EntityKind, attrs: IndexMap<String, AttrValue>) -> Self {
        Self {
            kind,
            id: None,
            attrs,
        }
    }

    pub fn attr(&self, name: &str) -> Option<&AttrValue> {
        self.attrs.get(name)
    }

    pub fn attr_text(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).and_then(AttrValue::as_text)
    }

    /// Flattened attribute snapshot, the shape archived under `old_rows` when
    /// duplicate rows are collapsed.
    pub fn snapshot(&self) -> JsonValue {
        let map: serde_json::Map<String, JsonValue> = self
            .attrs
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        JsonValue::Object(map)
    }
}

impl fmt::Display for StoredEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id {
            Some(id) => write!(f, "{}:{}", self.kind, id),
            None => write!(f, "{}:unsaved", self.kind),
        }
    }
}

/// Persistence backend the mapping engine runs against.
///
/// The engine is the only writer; identity resolution uses the query methods
/// and never mutates. Batch boundaries wrap a group of rows in one
/// transaction; a batch that fails is rolled back without touching earlier
/// commits.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Exact-match lookup. `Entity` filter values match on the referenced
    /// row's id; a filter referencing an unsaved entity matches nothing.
    async fn query_by_exact(
        &self,
        kind: EntityKind,
        filters: &IndexMap<String, AttrValue>,
    ) -> Result<Vec<StoredEntity>>;

    /// Name lookup for shared lookup kinds: case-insensitive exact match on
    /// the canonical name first, then a case-insensitive contains search
    /// against the alias list.
    async fn query_by_fuzzy_name(&self, kind: EntityKind, name: &str) -> Result<Vec<StoredEntity>>;

    async fn create(&self, kind: EntityKind, attrs: IndexMap<String, AttrValue>)
        -> Result<StoredEntity>;

    /// Field-by-field overwrite. Prior values of changed fields are archived
    /// as an audit entry in the row's metadata; an update that changes
    /// nothing writes nothing.
    async fn update_in_place(
        &self,
        entity: &StoredEntity,
        attrs: IndexMap<String, AttrValue>,
    ) -> Result<StoredEntity>;

    async fn delete(&self, entity: &StoredEntity) -> Result<()>;

    /// Attaches child entities to `parent` through the named reverse
    /// relationship.
    async fn relate(
        &self,
        parent: &StoredEntity,
        field: &str,
        children: &[StoredEntity],
    ) -> Result<()>;

    /// Returns the provenance row for `name`, creating it when missing. The
    /// flag reports whether a row was created.
    async fn find_or_create_source(&self, name: &str) -> Result<(StoredEntity, bool)>;

    /// The well-known fallback row for a lookup kind.
    async fn sentinel(&self, kind: EntityKind) -> Result<StoredEntity>;

    async fn begin_batch(&self) -> Result<()>;
    async fn commit_batch(&self) -> Result<()>;
    async fn rollback_batch(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_relationships() {
        assert_eq!(
            EntityKind::Place.child_relation("names"),
            Some(EntityKind::Word)
        );
        assert_eq!(EntityKind::Place.child_relation("words"), None);
        assert_eq!(
            EntityKind::Word.parent_relation("language"),
            Some(EntityKind::Language)
        );
        assert_eq!(EntityKind::Language.parent_relation("language"), None);
    }

    #[test]
    fn test_provenance_capability() {
        assert!(!EntityKind::Source.tracks_provenance());
        assert!(EntityKind::Place.tracks_provenance());
        assert!(EntityKind::Word.tracks_provenance());
    }

    #[test]
    fn test_snapshot_flattens_attrs() {
        let mut entity = StoredEntity::new(EntityKind::Place);
        entity.attrs.insert("category".into(), AttrValue::text("river"));
        let mut language = StoredEntity::new(EntityKind::Language);
        language.id = Some(7);
        entity
            .attrs
            .insert("language".into(), AttrValue::Entity(Box::new(language)));

        let snap = entity.snapshot();
        assert_eq!(snap["category"], json!("river"));
        assert_eq!(snap["language"], json!(7));
    }

    #[test]
    fn test_render_joins_entities_by_name() {
        let mut language = StoredEntity::new(EntityKind::Language);
        language.attrs.insert("name".into(), AttrValue::text("Martu Wangka"));
        let value = AttrValue::Entity(Box::new(language));
        assert_eq!(value.render(), "Martu Wangka");
    }
}

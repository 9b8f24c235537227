use indexmap::IndexMap;
use tracing::warn;

use super::error::IngestError;
use super::resolve::FieldResolver;
use super::store::EntityKind;

/// How identity resolution treats existing rows for one relation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationMode {
    /// Reuse rows matched on unique-flagged fields; never overwrite them.
    FindExisting,
    /// Match on `(source, source_ref)`; overwrite in place when updates are
    /// allowed for the run.
    SourceUpdate,
}

/// How existing rows are searched for one relation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupKind {
    /// Exact equality on the mode's filter fields.
    Exact,
    /// Canonical-name lookup with an alias fallback. Misses resolve to the
    /// kind's sentinel row; fuzzy levels never create rows.
    FuzzyName,
}

/// One entry of a relation node.
#[derive(Debug, Clone)]
pub enum Mapping {
    /// Output field bound to a resolver. Unique-flagged fields participate
    /// in identity lookups.
    Field {
        resolver: FieldResolver,
        unique: bool,
    },
    /// One-to-many: the field names a reverse relationship on this level's
    /// kind. Children are built from the same record and linked once the
    /// parent is persisted.
    Child(RelationNode),
    /// Many-to-one: the field names a forward relationship; the built entity
    /// becomes the field's value.
    Parent(RelationNode),
}

/// One level of a relation schema: output fields in declaration order plus
/// the identity settings for entities built at this level.
#[derive(Debug, Clone)]
pub struct RelationNode {
    pub mode: RelationMode,
    pub lookup: LookupKind,
    pub fields: IndexMap<String, Mapping>,
    /// Resolver for the per-source reference key. Implicitly unique; its
    /// value lands in `source_ref`, evaluated after the declared fields.
    pub ref_field: Option<FieldResolver>,
}

impl RelationNode {
    pub fn new(mode: RelationMode) -> Self {
        Self {
            mode,
            lookup: LookupKind::Exact,
            fields: IndexMap::new(),
            ref_field: None,
        }
    }

    pub fn field(mut self, name: impl Into<String>, resolver: FieldResolver) -> Self {
        self.fields.insert(
            name.into(),
            Mapping::Field {
                resolver,
                unique: false,
            },
        );
        self
    }

    pub fn unique_field(mut self, name: impl Into<String>, resolver: FieldResolver) -> Self {
        self.fields.insert(
            name.into(),
            Mapping::Field {
                resolver,
                unique: true,
            },
        );
        self
    }

    pub fn child(mut self, name: impl Into<String>, node: RelationNode) -> Self {
        self.fields.insert(name.into(), Mapping::Child(node));
        self
    }

    pub fn parent(mut self, name: impl Into<String>, node: RelationNode) -> Self {
        self.fields.insert(name.into(), Mapping::Parent(node));
        self
    }

    pub fn with_ref_field(mut self, resolver: FieldResolver) -> Self {
        self.ref_field = Some(resolver);
        self
    }

    pub fn with_fuzzy_lookup(mut self) -> Self {
        self.lookup = LookupKind::FuzzyName;
        self
    }
}

/// A compiled relation schema: the base entity kind plus the mapping tree
/// applied to every input record.
#[derive(Debug, Clone)]
pub struct RelationSchema {
    pub kind: EntityKind,
    pub node: RelationNode,
}

impl RelationSchema {
    /// Base maps always carry a reference key; without a natural row id the
    /// row number stands in.
    pub fn new(kind: EntityKind, node: RelationNode) -> Self {
        let node = if node.ref_field.is_none() {
            node.with_ref_field(FieldResolver::row_index())
        } else {
            node
        };
        Self { kind, node }
    }

    /// Checks every relation in the tree against the relationships the
    /// entity kinds declare. Runs before anything touches the database.
    pub fn validate(&self) -> Result<(), IngestError> {
        validate_node(self.kind, &self.node)
    }
}

fn validate_node(kind: EntityKind, node: &RelationNode) -> Result<(), IngestError> {
    let mut locations = 0;
    for (field, mapping) in &node.fields {
        match mapping {
            Mapping::Field {
                resolver: FieldResolver::Location(_),
                ..
            } => locations += 1,
            Mapping::Field { .. } => {}
            Mapping::Child(child) => {
                let child_kind =
                    kind.child_relation(field)
                        .ok_or_else(|| IngestError::UnknownChildRelation {
                            kind,
                            field: field.clone(),
                        })?;
                validate_node(child_kind, child)?;
            }
            Mapping::Parent(parent) => {
                let parent_kind =
                    kind.parent_relation(field)
                        .ok_or_else(|| IngestError::UnknownParentRelation {
                            kind,
                            field: field.clone(),
                        })?;
                validate_node(parent_kind, parent)?;
            }
        }
    }
    if locations > 1 {
        warn!(
            "{} level declares {} location fields, expected at most one",
            kind, locations
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names_child() -> RelationNode {
        RelationNode::new(RelationMode::FindExisting)
            .unique_field("name", FieldResolver::lookup("name"))
            .parent(
                "language",
                RelationNode::new(RelationMode::FindExisting)
                    .with_fuzzy_lookup()
                    .unique_field("name", FieldResolver::lookup("country")),
            )
    }

    #[test]
    fn test_valid_schema_passes() {
        let schema = RelationSchema::new(
            EntityKind::Place,
            RelationNode::new(RelationMode::SourceUpdate)
                .field("category", FieldResolver::lookup("type"))
                .child("names", names_child()),
        );
        assert!(schema.validate().is_ok());
    }

    #[test]
    fn test_unknown_child_relation_is_fatal() {
        let schema = RelationSchema::new(
            EntityKind::Place,
            RelationNode::new(RelationMode::SourceUpdate).child("words", names_child()),
        );
        let err = schema.validate().unwrap_err();
        assert!(matches!(
            err,
            IngestError::UnknownChildRelation { kind: EntityKind::Place, ref field } if field == "words"
        ));
    }

    #[test]
    fn test_unknown_parent_relation_is_fatal() {
        let schema = RelationSchema::new(
            EntityKind::Place,
            RelationNode::new(RelationMode::SourceUpdate).child(
                "names",
                RelationNode::new(RelationMode::FindExisting).parent(
                    "dialect",
                    RelationNode::new(RelationMode::FindExisting),
                ),
            ),
        );
        let err = schema.validate().unwrap_err();
        assert!(matches!(
            err,
            IngestError::UnknownParentRelation { kind: EntityKind::Word, ref field } if field == "dialect"
        ));
    }

    #[test]
    fn test_base_schema_defaults_ref_field_to_row_index() {
        let schema = RelationSchema::new(
            EntityKind::Place,
            RelationNode::new(RelationMode::SourceUpdate),
        );
        assert_eq!(schema.node.ref_field, Some(FieldResolver::row_index()));
    }
}

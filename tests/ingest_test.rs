//! End-to-end mapping engine tests
//!
//! Each test runs one of the row-to-graph schemas against a migrated
//! database and checks what landed in it.

use anyhow::Result;
use indexmap::IndexMap;
use placemap::database::entities::{languages, places, sources, words};
use placemap::database::migrations::Migrator;
use placemap::database::SqlEntityStore;
use placemap::ingest::{
    geometry, AttrValue, EntityKind, EntityStore, FieldResolver, IngestError, Ingester, Record,
    RelationMode, RelationNode, RelationSchema,
};
use placemap::mappings;
use sea_orm::{Database, DatabaseConnection, EntityTrait};
use sea_orm_migration::MigratorTrait;
use serde_json::Value as JsonValue;
use tempfile::NamedTempFile;

async fn setup_test_db() -> Result<(DatabaseConnection, NamedTempFile)> {
    let temp_file = NamedTempFile::new()?;
    let db_url = format!("sqlite://{}?mode=rwc", temp_file.path().display());

    let db = Database::connect(&db_url).await?;
    Migrator::up(&db, None).await?;

    Ok((db, temp_file))
}

async fn setup_store() -> Result<(SqlEntityStore, DatabaseConnection, NamedTempFile)> {
    let (db, temp_file) = setup_test_db().await?;
    let store = SqlEntityStore::init(db.clone()).await?;
    Ok((store, db, temp_file))
}

fn record(pairs: &[(&str, &str)]) -> Record {
    pairs
        .iter()
        .map(|(name, value)| ((*name).to_string(), JsonValue::String((*value).to_string())))
        .collect()
}

fn attrs(pairs: Vec<(&str, AttrValue)>) -> IndexMap<String, AttrValue> {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

async fn create_language(store: &SqlEntityStore, name: &str) -> Result<()> {
    store
        .create(
            EntityKind::Language,
            attrs(vec![("name", AttrValue::text(name))]),
        )
        .await?;
    Ok(())
}

/// A row in the shape of the Pilbara placenames spreadsheet: a river known
/// under the same name in two languages.
fn pilbara_row() -> Record {
    record(&[
        ("ID", "42"),
        ("type", "river"),
        ("north", "500000"),
        ("east", "7500000"),
        ("comments", "runs through the Karlamilyi national park"),
        ("name", "Karlamilyi"),
        ("english name", "Rudall River"),
        ("country", "Martu Wangka, Warnman"),
        ("WA 250k map ref", "SF51-10"),
        ("source", "pg 7"),
    ])
}

/// The smallest useful schema: one place per row, keyed on an ID column.
fn place_only_schema() -> RelationSchema {
    RelationSchema::new(
        EntityKind::Place,
        RelationNode::new(RelationMode::SourceUpdate)
            .field("category", FieldResolver::lookup("type"))
            .with_ref_field(FieldResolver::lookup("ID")),
    )
}

#[tokio::test]
async fn test_pilbara_row_builds_the_whole_graph() -> Result<()> {
    let (store, db, _temp_file) = setup_store().await?;
    create_language(&store, "Martu Wangka").await?;
    create_language(&store, "Warnman").await?;

    let schema = mappings::mapping_for("pilbara-placenames-csv").expect("built-in mapping");
    let mut ingester = Ingester::new(&store, &schema, false);
    let summary = ingester
        .bulk_ingest(vec![pilbara_row()], "placenames pg5-12", 50, true)
        .await?;

    assert_eq!(summary.rows, 1);
    assert_eq!(summary.new.get(&EntityKind::Place), Some(&1));
    assert_eq!(summary.new.get(&EntityKind::Word), Some(&2));
    assert_eq!(summary.updated.get(&EntityKind::Language), Some(&2));
    assert_eq!(ingester.relationship_counts().get("place.names"), Some(&2));

    let place_models = places::Entity::find().all(&db).await?;
    assert_eq!(place_models.len(), 1);
    let place = &place_models[0];
    assert_eq!(place.category, "river");
    assert_eq!(place.source_ref.as_deref(), Some("42"));
    assert_eq!(
        place.description.as_deref(),
        Some("runs through the Karlamilyi national park")
    );

    // MGA zone 50 coordinates come out as a WGS84 point
    let location = place.location.as_deref().expect("reprojected location");
    let point = geometry::parse_wkt(location, geometry::WGS84_SRID).expect("stored WKT parses");
    assert!((point.x() - 117.0).abs() < 1e-3, "lon was {}", point.x());
    assert!(point.y() > -23.0 && point.y() < -22.0, "lat was {}", point.y());

    let metadata: JsonValue = serde_json::from_str(place.metadata.as_deref().expect("metadata"))?;
    assert_eq!(metadata["WA 250k map ref"], "SF51-10");
    assert_eq!(metadata["country"], "Martu Wangka, Warnman");

    // the two-language cell fans the name out into one word per language
    let mut word_models = words::Entity::find().all(&db).await?;
    word_models.sort_by_key(|word| word.source_ref.clone());
    assert_eq!(word_models.len(), 2);
    assert_eq!(word_models[0].source_ref.as_deref(), Some("42_0"));
    assert_eq!(word_models[1].source_ref.as_deref(), Some("42_1"));
    assert!(word_models.iter().all(|word| word.name == "Karlamilyi"));
    assert!(word_models.iter().all(|word| word.place_id == Some(place.id)));
    assert!(word_models
        .iter()
        .all(|word| word.description.as_deref() == Some("Rudall River")));

    // the i-th copy carries the i-th language of the cell
    let language_names: Vec<Option<String>> = {
        let models = languages::Entity::find().all(&db).await?;
        word_models
            .iter()
            .map(|word| {
                models
                    .iter()
                    .find(|language| language.id == word.language_id)
                    .map(|language| language.name.clone())
            })
            .collect()
    };
    assert_eq!(
        language_names,
        [
            Some("Martu Wangka".to_string()),
            Some("Warnman".to_string())
        ]
    );

    let source_names: Vec<String> = sources::Entity::find()
        .all(&db)
        .await?
        .into_iter()
        .map(|source| source.name)
        .collect();
    assert!(source_names.contains(&"placenames pg5-12".to_string()));

    Ok(())
}

#[tokio::test]
async fn test_reingesting_identical_rows_changes_nothing() -> Result<()> {
    let (store, db, _temp_file) = setup_store().await?;
    create_language(&store, "Martu Wangka").await?;
    create_language(&store, "Warnman").await?;

    let schema = mappings::mapping_for("pilbara-placenames-csv").expect("built-in mapping");
    let mut first = Ingester::new(&store, &schema, false);
    first
        .bulk_ingest(vec![pilbara_row()], "pilbara survey", 50, true)
        .await?;

    for _ in 0..2 {
        let mut again = Ingester::new(&store, &schema, false);
        let summary = again
            .bulk_ingest(vec![pilbara_row()], "pilbara survey", 50, true)
            .await?;

        assert!(summary.new.is_empty(), "re-ingest created rows: {}", summary);
        assert_eq!(summary.updated.get(&EntityKind::Place), Some(&1));
        assert_eq!(summary.updated.get(&EntityKind::Word), Some(&2));
        assert_eq!(places::Entity::find().all(&db).await?.len(), 1);
        assert_eq!(words::Entity::find().all(&db).await?.len(), 2);
        // Unknown sentinel plus the two created above; lookups never add
        assert_eq!(languages::Entity::find().all(&db).await?.len(), 3);
    }

    // an overwrite with identical values leaves no audit entry behind
    let place = &places::Entity::find().all(&db).await?[0];
    let metadata: JsonValue = serde_json::from_str(place.metadata.as_deref().expect("metadata"))?;
    assert!(metadata.get("revisions").is_none());

    Ok(())
}

#[tokio::test]
async fn test_fan_out_takes_ith_elements_and_joins_the_rest() -> Result<()> {
    let (store, db, _temp_file) = setup_store().await?;

    let schema = RelationSchema::new(
        EntityKind::Place,
        RelationNode::new(RelationMode::SourceUpdate)
            .field("category", FieldResolver::lookup("type"))
            .child(
                "names",
                RelationNode::new(RelationMode::SourceUpdate)
                    .unique_field("name", FieldResolver::lookup_split("recorded names", "/"))
                    .field("description", FieldResolver::lookup_split("glosses", "/")),
            )
            .with_ref_field(FieldResolver::lookup("ID")),
    );

    let row = record(&[
        ("ID", "5"),
        ("type", "camp"),
        ("recorded names", "Jila / Tjila / Djila"),
        ("glosses", "living water / spring"),
    ]);
    let mut ingester = Ingester::new(&store, &schema, false);
    let summary = ingester.bulk_ingest(vec![row], "fieldwork.csv", 50, true).await?;
    assert_eq!(summary.new.get(&EntityKind::Word), Some(&3));

    let mut word_models = words::Entity::find().all(&db).await?;
    word_models.sort_by_key(|word| word.source_ref.clone());

    let names: Vec<&str> = word_models.iter().map(|word| word.name.as_str()).collect();
    assert_eq!(names, ["Jila", "Tjila", "Djila"]);
    let refs: Vec<Option<&str>> = word_models
        .iter()
        .map(|word| word.source_ref.as_deref())
        .collect();
    assert_eq!(refs, [Some("5_0"), Some("5_1"), Some("5_2")]);

    // the two glosses cannot line up with three names, so every copy gets
    // the joined string
    assert!(word_models
        .iter()
        .all(|word| word.description.as_deref() == Some("living water, spring")));

    // the place itself keeps the unsuffixed reference
    let place_models = places::Entity::find().all(&db).await?;
    assert_eq!(place_models[0].source_ref.as_deref(), Some("5"));

    Ok(())
}

#[tokio::test]
async fn test_matching_rows_collapse_into_old_rows() -> Result<()> {
    let (store, db, _temp_file) = setup_store().await?;

    let (source, created) = store.find_or_create_source("dups.csv").await?;
    assert!(created);
    for category in ["well", "spring"] {
        store
            .create(
                EntityKind::Place,
                attrs(vec![
                    ("category", AttrValue::text(category)),
                    ("source", AttrValue::Entity(Box::new(source.clone()))),
                    ("source_ref", AttrValue::text("9")),
                ]),
            )
            .await?;
    }

    let schema = place_only_schema();
    let mut ingester = Ingester::new(&store, &schema, false);
    let summary = ingester
        .bulk_ingest(
            vec![record(&[("ID", "9"), ("type", "soak")])],
            "dups.csv",
            50,
            true,
        )
        .await?;

    assert_eq!(summary.collapsed, 2);
    assert_eq!(summary.new.get(&EntityKind::Place), Some(&1));

    let place_models = places::Entity::find().all(&db).await?;
    assert_eq!(place_models.len(), 1, "duplicates must be deleted");
    assert_eq!(place_models[0].category, "soak");

    let metadata: JsonValue =
        serde_json::from_str(place_models[0].metadata.as_deref().expect("metadata"))?;
    let old_rows = metadata["old_rows"].as_array().expect("archived rows");
    assert_eq!(old_rows.len(), 2);
    let mut categories: Vec<&str> = old_rows
        .iter()
        .filter_map(|row| row["category"].as_str())
        .collect();
    categories.sort_unstable();
    assert_eq!(categories, ["spring", "well"]);

    Ok(())
}

#[tokio::test]
async fn test_dry_run_reports_without_writing() -> Result<()> {
    let (db, _temp_file) = setup_test_db().await?;
    let store = SqlEntityStore::init_dry(db.clone()).await?;

    let schema = mappings::mapping_for("pilbara-placenames-csv").expect("built-in mapping");
    let mut ingester = Ingester::new(&store, &schema, true);
    let summary = ingester
        .bulk_ingest(vec![pilbara_row()], "dry.csv", 50, true)
        .await?;

    assert_eq!(summary.rows, 1);
    assert_eq!(summary.new.get(&EntityKind::Place), Some(&1));
    assert_eq!(summary.new.get(&EntityKind::Word), Some(&2));
    // both language cells miss and share the one unknown-language stub
    assert_eq!(summary.updated.get(&EntityKind::Language), Some(&1));
    assert_eq!(ingester.relationship_counts().get("place.names"), Some(&2));

    // not even the provenance row or the sentinels may hit the database
    assert!(sources::Entity::find().all(&db).await?.is_empty());
    assert!(languages::Entity::find().all(&db).await?.is_empty());
    assert!(places::Entity::find().all(&db).await?.is_empty());
    assert!(words::Entity::find().all(&db).await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_dry_run_counts_match_a_real_run() -> Result<()> {
    let second_row = || {
        let mut row = pilbara_row();
        row.insert("ID", JsonValue::String("43".to_string()));
        row.insert("name", JsonValue::String("Yimiri".to_string()));
        row
    };
    let schema = mappings::mapping_for("pilbara-placenames-csv").expect("built-in mapping");

    let (store, _db, _wet_file) = setup_store().await?;
    let mut wet = Ingester::new(&store, &schema, false);
    let wet_summary = wet
        .bulk_ingest(vec![pilbara_row(), second_row()], "survey.csv", 50, true)
        .await?;

    let (dry_db, _dry_file) = setup_test_db().await?;
    let dry_store = SqlEntityStore::init_dry(dry_db.clone()).await?;
    let mut dry = Ingester::new(&dry_store, &schema, true);
    let dry_summary = dry
        .bulk_ingest(vec![pilbara_row(), second_row()], "survey.csv", 50, true)
        .await?;

    assert_eq!(dry_summary, wet_summary);
    // every language cell missed, and all four misses share one sentinel
    assert_eq!(dry_summary.updated.get(&EntityKind::Language), Some(&1));
    assert_eq!(dry_summary.new.get(&EntityKind::Place), Some(&2));
    assert_eq!(dry_summary.new.get(&EntityKind::Word), Some(&4));

    Ok(())
}

#[tokio::test]
async fn test_updates_disabled_keeps_existing_rows() -> Result<()> {
    let (store, db, _temp_file) = setup_store().await?;
    let schema = place_only_schema();

    let mut seed = Ingester::new(&store, &schema, false);
    seed.bulk_ingest(
        vec![record(&[("ID", "7"), ("type", "well")])],
        "survey.csv",
        50,
        true,
    )
    .await?;

    let mut frozen = Ingester::new(&store, &schema, false);
    let summary = frozen
        .bulk_ingest(
            vec![record(&[("ID", "7"), ("type", "river")])],
            "survey.csv",
            50,
            false,
        )
        .await?;
    assert!(summary.new.is_empty());
    assert_eq!(summary.updated.get(&EntityKind::Place), Some(&1));
    assert_eq!(places::Entity::find().all(&db).await?[0].category, "well");

    let mut allowed = Ingester::new(&store, &schema, false);
    allowed
        .bulk_ingest(
            vec![record(&[("ID", "7"), ("type", "river")])],
            "survey.csv",
            50,
            true,
        )
        .await?;

    let place = &places::Entity::find().all(&db).await?[0];
    assert_eq!(place.category, "river");
    let metadata: JsonValue = serde_json::from_str(place.metadata.as_deref().expect("metadata"))?;
    let revisions = metadata["revisions"].as_array().expect("audit trail");
    assert_eq!(revisions.len(), 1);
    assert_eq!(revisions[0]["fields"]["category"], "well");

    Ok(())
}

#[tokio::test]
async fn test_row_failure_rolls_back_its_batch() -> Result<()> {
    let (store, db, _temp_file) = setup_store().await?;
    let schema = mappings::mapping_for("pilbara-placenames-csv").expect("built-in mapping");

    let rows = vec![
        record(&[("ID", "60"), ("type", "soak"), ("name", "Jila")]),
        // no name column; the word cannot be built
        record(&[("ID", "61"), ("type", "soak")]),
        record(&[("ID", "62"), ("type", "soak"), ("name", "Yinta")]),
    ];

    let mut ingester = Ingester::new(&store, &schema, false);
    let result = ingester.bulk_ingest(rows, "rollback.csv", 10, true).await;
    match result {
        Err(IngestError::Row {
            row_index,
            committed,
            record,
            ..
        }) => {
            assert_eq!(row_index, 1);
            assert_eq!(committed, 0);
            // the failing row comes back as read, ready for reprocessing
            assert_eq!(record["ID"], "61");
            assert_eq!(record["type"], "soak");
        }
        other => panic!("expected a row failure, got {:?}", other),
    }

    // the good first row sat in the same batch and must be gone too
    assert!(places::Entity::find().all(&db).await?.is_empty());
    assert!(words::Entity::find().all(&db).await?.is_empty());

    // the provenance row was created before the batch opened and survives
    let source_names: Vec<String> = sources::Entity::find()
        .all(&db)
        .await?
        .into_iter()
        .map(|source| source.name)
        .collect();
    assert!(source_names.contains(&"rollback.csv".to_string()));

    Ok(())
}

#[tokio::test]
async fn test_committed_batches_survive_a_later_failure() -> Result<()> {
    let (store, db, _temp_file) = setup_store().await?;
    let schema = mappings::mapping_for("pilbara-placenames-csv").expect("built-in mapping");

    let rows = vec![
        record(&[("ID", "70"), ("type", "soak"), ("name", "Jila")]),
        record(&[("ID", "71"), ("type", "soak")]),
        record(&[("ID", "72"), ("type", "soak"), ("name", "Yinta")]),
    ];

    let mut ingester = Ingester::new(&store, &schema, false);
    let result = ingester.bulk_ingest(rows, "batches.csv", 1, true).await;
    match result {
        Err(IngestError::Row {
            row_index,
            committed,
            ..
        }) => {
            assert_eq!(row_index, 1);
            assert_eq!(committed, 1, "the first single-row batch was committed");
        }
        other => panic!("expected a row failure, got {:?}", other),
    }

    let place_models = places::Entity::find().all(&db).await?;
    assert_eq!(place_models.len(), 1);
    assert_eq!(place_models[0].source_ref.as_deref(), Some("70"));
    assert_eq!(words::Entity::find().all(&db).await?.len(), 1);

    Ok(())
}

#[tokio::test]
async fn test_bad_coordinates_cost_only_the_location() -> Result<()> {
    let (store, db, _temp_file) = setup_store().await?;
    let schema = mappings::mapping_for("pilbara-placenames-csv").expect("built-in mapping");

    let row = record(&[
        ("ID", "80"),
        ("type", "hill"),
        ("north", "not a number"),
        ("east", "also wrong"),
        ("name", "Puntawarri"),
    ]);
    let mut ingester = Ingester::new(&store, &schema, false);
    let summary = ingester
        .bulk_ingest(vec![row], "mangled.csv", 50, true)
        .await?;
    assert_eq!(summary.new.get(&EntityKind::Place), Some(&1));

    let place_models = places::Entity::find().all(&db).await?;
    assert_eq!(place_models.len(), 1);
    assert_eq!(place_models[0].location, None);
    assert_eq!(place_models[0].category, "hill");
    assert_eq!(words::Entity::find().all(&db).await?.len(), 1);

    Ok(())
}

#[tokio::test]
async fn test_unmatched_language_falls_back_to_the_sentinel() -> Result<()> {
    let (store, db, _temp_file) = setup_store().await?;

    let schema = mappings::mapping_for("nyiyaparli-placenames").expect("built-in mapping");
    let row = record(&[
        ("WKT", "POINT (120.25 -22.75)"),
        ("type", "waterhole"),
        ("name", "Yimiri"),
        ("fid", "31"),
    ]);
    let mut ingester = Ingester::new(&store, &schema, false);
    let summary = ingester
        .bulk_ingest(vec![row], "nyiyaparli.csv", 50, true)
        .await?;
    assert_eq!(summary.updated.get(&EntityKind::Language), Some(&1));

    let unknown = store.sentinel(EntityKind::Language).await?;
    let word_models = words::Entity::find().all(&db).await?;
    assert_eq!(word_models.len(), 1);
    assert_eq!(word_models[0].name, "Yimiri");
    assert_eq!(word_models[0].language_id, unknown.id.expect("sentinel id"));

    let place = &places::Entity::find().all(&db).await?[0];
    let location = place.location.as_deref().expect("location");
    let point = geometry::parse_wkt(location, geometry::WGS84_SRID).expect("stored WKT parses");
    assert!((point.x() - 120.25).abs() < 1e-9);
    assert!((point.y() + 22.75).abs() < 1e-9);

    Ok(())
}

#[tokio::test]
async fn test_literal_language_matches_when_present() -> Result<()> {
    let (store, db, _temp_file) = setup_store().await?;
    create_language(&store, "Nyiyaparli").await?;

    let schema = mappings::mapping_for("nyiyaparli-placenames").expect("built-in mapping");
    let row = record(&[
        ("WKT", "POINT (120.25 -22.75)"),
        ("type", "waterhole"),
        ("name", "Yimiri"),
        ("fid", "31"),
    ]);
    let mut ingester = Ingester::new(&store, &schema, false);
    ingester
        .bulk_ingest(vec![row], "nyiyaparli.csv", 50, true)
        .await?;

    let nyiyaparli = store
        .query_by_fuzzy_name(EntityKind::Language, "Nyiyaparli")
        .await?;
    let word_models = words::Entity::find().all(&db).await?;
    assert_eq!(word_models.len(), 1);
    assert_eq!(
        Some(word_models[0].language_id),
        nyiyaparli[0].id,
        "the word must attach to the named language, not the sentinel"
    );

    Ok(())
}

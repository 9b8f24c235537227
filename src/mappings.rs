//! The built-in column mappings: each one describes how to build a set of
//! related entities out of the named fields of one input row. Which
//! relationship shapes are legal is decided by the entity kinds; see
//! [`crate::ingest::schema`].

use crate::ingest::{EntityKind, FieldResolver, RelationMode, RelationNode, RelationSchema};

/// Pilbara placenames spreadsheet, pages 5-12 of archive item 10781.
fn pilbara_placenames_csv() -> RelationSchema {
    RelationSchema::new(
        EntityKind::Place,
        RelationNode::new(RelationMode::SourceUpdate)
            .field("category", FieldResolver::lookup("type"))
            .field(
                "location",
                FieldResolver::north_east_location("north", "east", 28350),
            )
            .field("description", FieldResolver::lookup("comments"))
            .child(
                "names",
                RelationNode::new(RelationMode::SourceUpdate)
                    .unique_field("name", FieldResolver::lookup("name"))
                    .field("description", FieldResolver::lookup("english name"))
                    .parent(
                        "language",
                        RelationNode::new(RelationMode::FindExisting)
                            .with_fuzzy_lookup()
                            // a multi-language cell fans the word out, one
                            // copy per language
                            .unique_field("name", FieldResolver::lookup_split("country", ",")),
                    ),
            )
            .field(
                "metadata",
                FieldResolver::passthrough([
                    "WA 250k map ref",
                    "contacts",
                    "source",
                    "registered site",
                    "country",
                ]),
            )
            .with_ref_field(FieldResolver::lookup("ID")),
    )
}

/// Ngarla map layer from page 4 of archive item 10781.
fn pilbara_ngarla_map() -> RelationSchema {
    RelationSchema::new(
        EntityKind::Place,
        RelationNode::new(RelationMode::SourceUpdate)
            .field("category", FieldResolver::lookup("type"))
            .field("description", FieldResolver::lookup("name_eng"))
            .field("location", FieldResolver::lat_lng_location("Y", "X"))
            .child(
                "names",
                RelationNode::new(RelationMode::SourceUpdate)
                    .field("name", FieldResolver::lookup("name"))
                    .parent(
                        "language",
                        RelationNode::new(RelationMode::FindExisting)
                            .with_fuzzy_lookup()
                            .unique_field("name", FieldResolver::lookup("lang")),
                    ),
            )
            .with_ref_field(FieldResolver::lookup("fid")),
    )
}

/// Nyiyaparli placenames map, archive item 13831.
fn nyiyaparli_placenames() -> RelationSchema {
    RelationSchema::new(
        EntityKind::Place,
        RelationNode::new(RelationMode::SourceUpdate)
            .field("category", FieldResolver::lookup("type"))
            .field("location", FieldResolver::wkt_location("WKT"))
            .child(
                "names",
                RelationNode::new(RelationMode::SourceUpdate)
                    .unique_field("name", FieldResolver::lookup("name"))
                    .parent(
                        "language",
                        RelationNode::new(RelationMode::FindExisting)
                            .with_fuzzy_lookup()
                            .unique_field("name", FieldResolver::literal("Nyiyaparli")),
                    ),
            )
            .with_ref_field(FieldResolver::lookup("fid")),
    )
}

/// Free GEONOMA geographic names extract, from
/// <https://catalogue.data.wa.gov.au/dataset/geographic-names-geonoma>.
fn geonoma_extract() -> RelationSchema {
    RelationSchema::new(
        EntityKind::Place,
        RelationNode::new(RelationMode::SourceUpdate)
            .field("category", FieldResolver::lookup("feature_class_description"))
            .field("location", FieldResolver::wkt_location("geometry"))
            .child(
                "names",
                RelationNode::new(RelationMode::SourceUpdate)
                    .unique_field("name", FieldResolver::lookup("geographic_name"))
                    .parent(
                        "language",
                        RelationNode::new(RelationMode::FindExisting)
                            .with_fuzzy_lookup()
                            .unique_field("name", FieldResolver::literal("English")),
                    ),
            )
            .field(
                "metadata",
                FieldResolver::passthrough([
                    "zone",
                    "feature_class",
                    "northing",
                    "easting",
                    "longitude",
                    "latitude",
                ]),
            )
            .with_ref_field(FieldResolver::lookup("feature_number")),
    )
}

/// Full Landgate GEONOMA extract (the premium dataset).
fn geonoma_full() -> RelationSchema {
    RelationSchema::new(
        EntityKind::Place,
        RelationNode::new(RelationMode::SourceUpdate)
            .field("category", FieldResolver::lookup("FEATURE_CLASS"))
            // SRID 28350 is GDA94 / MGA zone 50
            .field(
                "location",
                FieldResolver::north_east_location("NORTHING", "EASTING", 28350),
            )
            .child(
                "names",
                RelationNode::new(RelationMode::SourceUpdate)
                    .unique_field("name", FieldResolver::lookup("GEOGRAPHIC_NAME"))
                    .field("description", FieldResolver::lookup("DERIVATION"))
                    .parent(
                        "language",
                        RelationNode::new(RelationMode::FindExisting)
                            .with_fuzzy_lookup()
                            .unique_field("name", FieldResolver::literal("English")),
                    ),
            )
            .field(
                "metadata",
                FieldResolver::passthrough([
                    "DERIVATION",
                    "NAME_TYPE",
                    "NAME_APPROVED",
                    "FEATURE_STATUS",
                    "FEATURE_SIZE",
                    "UNITS", // for FEATURE_SIZE
                    "POSTCODE",
                    "NEAREST_TOWN",
                    "PERTH_ROAD_DISTANCE",
                    "PERTH_RADIAL_DISTANCE",
                    "POPULATION",
                    "DATE_OF_CENSUS",
                    "MAP_NUMBER",
                    "ABS_LGA_NUMBER",
                    "LGA_NAME",
                    "LOCALITY_NAME",
                    "LATITUDE",
                    "LONGITUDE",
                    "EASTING",
                    "NORTHING",
                    "ZONE",
                    "PRIORITY",
                ]),
            )
            .with_ref_field(FieldResolver::lookup("FEATURE_NUMBER")),
    )
}

/// Places export from the discovery database.
fn places_export() -> RelationSchema {
    RelationSchema::new(
        EntityKind::Place,
        RelationNode::new(RelationMode::SourceUpdate)
            .child(
                "names",
                RelationNode::new(RelationMode::SourceUpdate)
                    .field("name", FieldResolver::lookup("descriptiveName"))
                    .field("description", FieldResolver::lookup("description"))
                    .parent(
                        "language",
                        RelationNode::new(RelationMode::FindExisting)
                            .with_fuzzy_lookup()
                            .unique_field("name", FieldResolver::literal("Not Specified")),
                    ),
            )
            .field("category", FieldResolver::lookup("type"))
            .field(
                "location_desc",
                FieldResolver::concat(vec![(Some("City"), "city"), (Some("State"), "state")]),
            )
            .field(
                "location",
                FieldResolver::lat_lng_location("latitude", "longitude"),
            )
            .field(
                "metadata",
                FieldResolver::passthrough([
                    "createdAt",
                    "createdBy",
                    "g_foundCount",
                    "latitude",
                    "longitude",
                    "modifiedAt",
                    "modifiedBy",
                    "name",
                    "nameDisplay",
                    "uuid",
                ]),
            )
            .with_ref_field(FieldResolver::lookup("g_foundCount")),
    )
}

pub fn mapping_names() -> Vec<&'static str> {
    vec![
        "pilbara-placenames-csv",
        "pilbara-ngarla-map",
        "nyiyaparli-placenames",
        "geonoma-extract",
        "geonoma-full",
        "places-export",
    ]
}

pub fn mapping_for(name: &str) -> Option<RelationSchema> {
    match name {
        "pilbara-placenames-csv" => Some(pilbara_placenames_csv()),
        "pilbara-ngarla-map" => Some(pilbara_ngarla_map()),
        "nyiyaparli-placenames" => Some(nyiyaparli_placenames()),
        "geonoma-extract" => Some(geonoma_extract()),
        "geonoma-full" => Some(geonoma_full()),
        "places-export" => Some(places_export()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{LookupKind, Mapping};

    #[test]
    fn test_every_builtin_mapping_validates() {
        for name in mapping_names() {
            let schema = mapping_for(name).unwrap();
            assert!(schema.validate().is_ok(), "{} failed validation", name);
        }
    }

    #[test]
    fn test_unknown_mapping_is_none() {
        assert!(mapping_for("martian-placenames").is_none());
    }

    #[test]
    fn test_builtin_mappings_keep_their_ref_fields() {
        let schema = mapping_for("geonoma-extract").unwrap();
        assert_eq!(
            schema.node.ref_field,
            Some(FieldResolver::lookup("feature_number"))
        );
    }

    // fuzzy levels only ever look rows up, so their mode must not be one
    // that could write through an accidental exact match
    #[test]
    fn test_fuzzy_levels_stay_find_existing() {
        fn check(name: &str, node: &RelationNode) {
            if node.lookup == LookupKind::FuzzyName {
                assert_eq!(
                    node.mode,
                    RelationMode::FindExisting,
                    "{} declares a fuzzy level that could write",
                    name
                );
            }
            for mapping in node.fields.values() {
                match mapping {
                    Mapping::Child(node) | Mapping::Parent(node) => check(name, node),
                    Mapping::Field { .. } => {}
                }
            }
        }
        for name in mapping_names() {
            check(name, &mapping_for(name).unwrap().node);
        }
    }
}

use serde_json::{Map, Value as JsonValue};

use super::geometry;
use super::record::Record;
use super::store::AttrValue;

/// Value produced by one field resolver: a single attribute value, or a list
/// of values that triggers fan-out in the graph builder.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    One(AttrValue),
    Many(Vec<AttrValue>),
}

impl Resolved {
    /// Length of a list value; scalars report `None`.
    pub fn list_len(&self) -> Option<usize> {
        match self {
            Resolved::One(_) => None,
            Resolved::Many(values) => Some(values.len()),
        }
    }
}

/// Coordinate input shapes for the location resolver.
#[derive(Debug, Clone, PartialEq)]
pub enum LocationSpec {
    /// One field already holding WKT.
    Wkt { field: String, srid: u32 },
    /// Separate latitude and longitude fields, WGS84.
    LatLng { lat_field: String, lng_field: String },
    /// Projected coordinates with a declared reference system.
    NorthEast {
        north_field: String,
        east_field: String,
        srid: u32,
    },
}

/// Computes one output value from a record.
///
/// Resolvers either read fields in place or, for the location variant,
/// consume them so that a later passthrough over "remaining" fields does not
/// pick the coordinates up again. Evaluation order within a schema node
/// therefore matters and follows declaration order.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldResolver {
    /// Fixed value, independent of the record.
    Literal { value: String },
    /// Direct lookup of a raw field. `default` applies when the field is
    /// absent or blank; `separator` splits the value into a fan-out list.
    Lookup {
        field: String,
        default: Option<String>,
        separator: Option<String>,
    },
    /// 0-based position of the record in the run, the fallback reference key
    /// for sources without a natural row id.
    RowIndex,
    /// Point geometry from coordinate fields. Failure resolves to nothing;
    /// a bad coordinate never aborts the row.
    Location(LocationSpec),
    /// Remaining raw values of the named fields, collected verbatim into one
    /// JSON object.
    Passthrough { fields: Vec<String> },
    /// Joins labelled raw fields into one display string.
    Concat {
        parts: Vec<(Option<String>, String)>,
        separator: String,
        label_suffix: String,
    },
}

impl FieldResolver {
    pub fn literal(value: impl Into<String>) -> Self {
        FieldResolver::Literal {
            value: value.into(),
        }
    }

    pub fn lookup(field: impl Into<String>) -> Self {
        FieldResolver::Lookup {
            field: field.into(),
            default: None,
            separator: None,
        }
    }

    pub fn lookup_or(field: impl Into<String>, default: impl Into<String>) -> Self {
        FieldResolver::Lookup {
            field: field.into(),
            default: Some(default.into()),
            separator: None,
        }
    }

    pub fn lookup_split(field: impl Into<String>, separator: impl Into<String>) -> Self {
        FieldResolver::Lookup {
            field: field.into(),
            default: None,
            separator: Some(separator.into()),
        }
    }

    pub fn row_index() -> Self {
        FieldResolver::RowIndex
    }

    pub fn wkt_location(field: impl Into<String>) -> Self {
        FieldResolver::Location(LocationSpec::Wkt {
            field: field.into(),
            srid: geometry::WGS84_SRID,
        })
    }

    pub fn lat_lng_location(lat_field: impl Into<String>, lng_field: impl Into<String>) -> Self {
        FieldResolver::Location(LocationSpec::LatLng {
            lat_field: lat_field.into(),
            lng_field: lng_field.into(),
        })
    }

    pub fn north_east_location(
        north_field: impl Into<String>,
        east_field: impl Into<String>,
        srid: u32,
    ) -> Self {
        FieldResolver::Location(LocationSpec::NorthEast {
            north_field: north_field.into(),
            east_field: east_field.into(),
            srid,
        })
    }

    pub fn passthrough<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        FieldResolver::Passthrough {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn concat(parts: Vec<(Option<&str>, &str)>) -> Self {
        FieldResolver::Concat {
            parts: parts
                .into_iter()
                .map(|(label, field)| (label.map(str::to_string), field.to_string()))
                .collect(),
            separator: ", ".to_string(),
            label_suffix: ": ".to_string(),
        }
    }

    /// Resolves this mapping against `record`. `None` means the output field
    /// is omitted entirely.
    pub fn resolve(&self, record: &mut Record, row_index: usize) -> Option<Resolved> {
        match self {
            FieldResolver::Literal { value } => {
                Some(Resolved::One(AttrValue::Text(value.clone())))
            }

            FieldResolver::Lookup {
                field,
                default,
                separator,
            } => {
                if let Some(JsonValue::Array(items)) = record.get(field) {
                    // the source already produced a list; no splitting
                    let list: Vec<AttrValue> = items
                        .iter()
                        .filter_map(raw_text)
                        .map(AttrValue::Text)
                        .collect();
                    return match list.len() {
                        0 => default.clone().map(|d| Resolved::One(AttrValue::Text(d))),
                        1 => Some(Resolved::One(list.into_iter().next().unwrap())),
                        _ => Some(Resolved::Many(list)),
                    };
                }

                let raw = record
                    .get(field)
                    .and_then(raw_text)
                    .filter(|s| !s.is_empty());
                let value = raw.or_else(|| default.clone())?;

                match separator {
                    Some(sep) => {
                        let pieces: Vec<String> = value
                            .split(sep.as_str())
                            .map(|piece| piece.trim().to_string())
                            .collect();
                        match pieces.len() {
                            0 => Some(Resolved::One(AttrValue::Text(String::new()))),
                            1 => Some(Resolved::One(AttrValue::Text(
                                pieces.into_iter().next().unwrap(),
                            ))),
                            _ => Some(Resolved::Many(
                                pieces.into_iter().map(AttrValue::Text).collect(),
                            )),
                        }
                    }
                    None => Some(Resolved::One(AttrValue::Text(value))),
                }
            }

            FieldResolver::RowIndex => {
                Some(Resolved::One(AttrValue::Text(row_index.to_string())))
            }

            FieldResolver::Location(spec) => resolve_location(spec, record)
                .map(|point| Resolved::One(AttrValue::Point(point))),

            FieldResolver::Passthrough { fields } => {
                let mut map = Map::new();
                for field in fields {
                    if let Some(value) = record.get(field) {
                        map.insert(field.clone(), value.clone());
                    }
                }
                Some(Resolved::One(AttrValue::Json(JsonValue::Object(map))))
            }

            FieldResolver::Concat {
                parts,
                separator,
                label_suffix,
            } => {
                let mut rendered = Vec::new();
                for (label, field) in parts {
                    let value = record
                        .get(field)
                        .and_then(raw_text)
                        .filter(|s| !s.is_empty());
                    if let Some(value) = value {
                        match label {
                            Some(label) => {
                                rendered.push(format!("{}{}{}", label, label_suffix, value))
                            }
                            None => rendered.push(value),
                        }
                    }
                }
                Some(Resolved::One(AttrValue::Text(rendered.join(separator))))
            }
        }
    }
}

fn resolve_location(spec: &LocationSpec, record: &mut Record) -> Option<geo_types::Point<f64>> {
    match spec {
        LocationSpec::Wkt { field, srid } => {
            let raw = record.pop(field)?;
            raw_text(&raw).and_then(|text| geometry::parse_wkt(&text, *srid))
        }
        LocationSpec::LatLng {
            lat_field,
            lng_field,
        } => {
            if !(record.contains(lat_field) && record.contains(lng_field)) {
                return None;
            }
            let lng = record.pop(lng_field)?;
            let lat = record.pop(lat_field)?;
            match (raw_text(&lng), raw_text(&lat)) {
                (Some(x), Some(y)) => geometry::point_from_coords(&x, &y, geometry::WGS84_SRID),
                _ => None,
            }
        }
        LocationSpec::NorthEast {
            north_field,
            east_field,
            srid,
        } => {
            if !(record.contains(north_field) && record.contains(east_field)) {
                return None;
            }
            // x is read from the north column; the source layouts put it there
            let north = record.pop(north_field)?;
            let east = record.pop(east_field)?;
            match (raw_text(&north), raw_text(&east)) {
                (Some(x), Some(y)) => geometry::point_from_coords(&x, &y, *srid),
                _ => None,
            }
        }
    }
}

fn raw_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

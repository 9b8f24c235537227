//! Point parsing and reprojection for the location resolver.
//!
//! Every function here degrades to `None` instead of failing: a bad
//! coordinate must cost one field, never a whole import batch.

use geo_types::Point;
use proj4rs::proj::Proj;
use proj4rs::transform::transform;
use tracing::debug;
use wkt::TryFromWkt;

pub const WGS84_SRID: u32 = 4326;

/// Proj definition for the reference systems the source datasets use: WGS84
/// and the GDA94 / MGA zones (EPSG:28349-28356, zone = srid - 28300).
fn proj_definition(srid: u32) -> Option<String> {
    match srid {
        WGS84_SRID => Some("+proj=longlat +ellps=WGS84 +datum=WGS84 +no_defs".to_string()),
        28349..=28356 => Some(format!(
            "+proj=utm +zone={} +south +ellps=GRS80 +towgs84=0,0,0,0,0,0,0 +units=m +no_defs",
            srid - 28300
        )),
        _ => None,
    }
}

fn parse_coord(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn valid_wgs84(point: &Point<f64>) -> bool {
    point.x().is_finite() && point.y().is_finite() && point.y().abs() <= 90.0
}

/// Parses a WKT point and brings it into WGS84.
pub fn parse_wkt(text: &str, srid: u32) -> Option<Point<f64>> {
    let point = match Point::try_from_wkt_str(text.trim()) {
        Ok(p) => p,
        Err(err) => {
            debug!("unparseable WKT {:?}: {}", text, err);
            return None;
        }
    };
    reproject(point, srid)
}

/// Builds a point from two raw coordinate strings and brings it into WGS84.
pub fn point_from_coords(x: &str, y: &str, srid: u32) -> Option<Point<f64>> {
    let point = Point::new(parse_coord(x)?, parse_coord(y)?);
    reproject(point, srid)
}

/// Reprojects `point` from `srid` to WGS84. Returns `None` for unsupported
/// reference systems and for transforms that leave the WGS84 domain.
pub fn reproject(point: Point<f64>, srid: u32) -> Option<Point<f64>> {
    if srid == WGS84_SRID {
        return Some(point).filter(valid_wgs84);
    }

    let from = Proj::from_proj_string(&proj_definition(srid)?).ok()?;
    let to = Proj::from_proj_string(&proj_definition(WGS84_SRID)?).ok()?;

    let mut coords = (point.x(), point.y(), 0.0);
    if let Err(err) = transform(&from, &to, &mut coords) {
        debug!("reprojection from srid {} failed: {}", srid, err);
        return None;
    }

    // longlat output is in radians
    let result = Point::new(coords.0.to_degrees(), coords.1.to_degrees());
    if !valid_wgs84(&result) {
        debug!(
            "reprojection from srid {} produced out-of-range point {:?}",
            srid, result
        );
        return None;
    }
    debug!(
        "transformed srid {} ({}, {}) to ({}, {})",
        srid,
        point.x(),
        point.y(),
        result.x(),
        result.y()
    );
    Some(result)
}

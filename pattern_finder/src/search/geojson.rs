//! GeoJSON for a matched pattern.

use glam::DVec2;
use serde_json::{json, Value};

/// FeatureCollection with the matched polyline (`pattern-line`) and the same
/// ring closed into a polygon (`pattern-polygon`). `None` for fewer than two
/// coordinates.
pub fn match_feature_collection(lonlat: &[DVec2], score: f64) -> Option<Value> {
    if lonlat.len() < 2 {
        return None;
    }

    let line: Vec<[f64; 2]> = lonlat.iter().map(|p| [p.x, p.y]).collect();
    let mut ring = line.clone();
    ring.push(line[0]);

    Some(json!({
        "type": "FeatureCollection",
        "features": [
            {
                "type": "Feature",
                "properties": { "kind": "pattern-line", "score": score },
                "geometry": { "type": "LineString", "coordinates": line },
            },
            {
                "type": "Feature",
                "properties": { "kind": "pattern-polygon", "score": score },
                "geometry": { "type": "Polygon", "coordinates": [ring] },
            },
        ],
    }))
}

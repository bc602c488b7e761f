// Railway line layer built from OpenStreetMap data
// Source: Overpass API (https://overpass-api.de/api/interpreter)
//
// Only proper train lines are kept: metro, tram, light rail, abandoned and
// disused ways are excluded in the query, industrial and service tracks in
// classification.

use crate::cpm_client::CPMClient;
use crate::cpm_colors::{assign_line_colors, line_style};
use crate::cpm_models::{CPMError, Gauge, LineType, RailwayLine, Result};
use geojson::{Feature, FeatureCollection, Geometry, JsonObject, Value};
use lazy_static::lazy_static;
use log::{debug, info};
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};

pub const OVERPASS_QUERY: &str = r#"[out:json][timeout:60];
(
  way["railway"="rail"]["railway"!="abandoned"]["railway"!="disused"]
     ["usage"!="industrial"]["service"!="siding"]["service"!="yard"]
     (36.0,-10.0,42.5,-6.0);
);
out geom;"#;

const MAIN_LINE_NAMES: [&str; 6] = [
    "linha do norte",
    "linha do sul",
    "linha da beira alta",
    "linha do minho",
    "linha do leste",
    "linha do oeste",
];

const URBAN_LINE_NAMES: [&str; 2] = ["cascais", "sintra"];

const HIGHLIGHT_EXTRA_WIDTH: u8 = 3;

lazy_static! {
    static ref MAX_SPEED_RE: Regex =
        Regex::new(r"^\s*(\d+)\s*(km/h|kmh|mph)?\s*$").expect("valid maxspeed regex");
}

// ============================================================================
// Overpass Payload
// ============================================================================

#[derive(Debug, Deserialize)]
struct OverpassResponse {
    #[serde(default)]
    elements: Vec<OverpassElement>,
}

#[derive(Debug, Deserialize)]
struct OverpassElement {
    #[serde(rename = "type")]
    kind: String,
    id: u64,
    #[serde(default)]
    tags: HashMap<String, String>,
    #[serde(default)]
    geometry: Option<Vec<OverpassNode>>,
}

#[derive(Debug, Deserialize)]
struct OverpassNode {
    lat: f64,
    lon: f64,
}

// ============================================================================
// Tag Interpretation
// ============================================================================

fn tag<'a>(tags: &'a HashMap<String, String>, key: &str) -> &'a str {
    tags.get(key).map(String::as_str).unwrap_or("")
}

/// Line type from OSM tags, or `None` for ways that are not passenger or freight train lines.
pub fn classify_line_type(tags: &HashMap<String, String>) -> Option<LineType> {
    let railway = tags.get("railway").map(String::as_str).unwrap_or("rail");
    let usage = tag(tags, "usage");
    let service = tag(tags, "service");
    let name = tag(tags, "name").to_lowercase();
    let operator = tag(tags, "operator").to_lowercase();

    if railway != "rail" {
        return None;
    }
    if matches!(usage, "industrial" | "military") || matches!(service, "siding" | "yard" | "crossover") {
        return None;
    }

    if MAIN_LINE_NAMES.iter().any(|k| name.contains(k))
        || usage == "main"
        || operator.contains("infraestruturas de portugal")
    {
        return Some(LineType::Main);
    }

    let suburban_branch = matches!(usage, "branch" | "regional")
        && (name.contains("urbano") || name.contains("suburbano"));
    if URBAN_LINE_NAMES.iter().any(|k| name.contains(k)) || suburban_branch {
        return Some(LineType::Urban);
    }

    if usage == "freight" || service == "freight" {
        return Some(LineType::Freight);
    }

    Some(LineType::Regional)
}

/// Portugal's network is Iberian gauge unless tagged otherwise.
pub fn determine_gauge(tags: &HashMap<String, String>) -> Gauge {
    let gauge = tag(tags, "gauge");
    if gauge.contains("1668") {
        Gauge::Iberian
    } else if gauge.contains("1000") {
        Gauge::Metric
    } else if gauge.contains("1435") {
        Gauge::Standard
    } else {
        Gauge::Iberian
    }
}

/// Max speed in km/h from an OSM `maxspeed` value.
pub fn parse_max_speed(maxspeed: Option<&str>) -> Option<u32> {
    let caps = MAX_SPEED_RE.captures(maxspeed?)?;
    let value = caps[1].parse::<u32>().ok()?;
    match caps.get(2).map(|m| m.as_str()) {
        Some("mph") => Some((f64::from(value) * 1.609_344).round() as u32),
        _ => Some(value),
    }
}

pub fn is_electrified(tags: &HashMap<String, String>) -> bool {
    matches!(tag(tags, "electrified"), "yes" | "contact_line")
}

// ============================================================================
// Parsing and Fetching
// ============================================================================

/// Railway lines from an Overpass `out geom` response. Colors are not assigned yet.
pub fn parse_overpass(body: &str) -> Result<Vec<RailwayLine>> {
    let response: OverpassResponse = serde_json::from_str(body)
        .map_err(|e| CPMError::UpstreamError(format!("Invalid Overpass response: {}", e)))?;

    let lines = response
        .elements
        .into_iter()
        .filter(|element| element.kind == "way")
        .filter_map(|element| {
            let coordinates: Vec<(f64, f64)> = element
                .geometry?
                .iter()
                .map(|node| (node.lon, node.lat))
                .collect();
            if coordinates.len() < 2 {
                return None;
            }

            let Some(line_type) = classify_line_type(&element.tags) else {
                debug!("Skipping non-passenger way {}", element.id);
                return None;
            };

            Some(RailwayLine {
                id: format!("osm_{}", element.id),
                name: element
                    .tags
                    .get("name")
                    .cloned()
                    .unwrap_or_else(|| format!("Railway Line {}", element.id)),
                line_type,
                coordinates,
                assigned_color: String::new(),
                operator: element
                    .tags
                    .get("operator")
                    .cloned()
                    .unwrap_or_else(|| "CP".to_string()),
                electrified: is_electrified(&element.tags),
                gauge: determine_gauge(&element.tags),
                max_speed: parse_max_speed(element.tags.get("maxspeed").map(String::as_str)),
                tags: element.tags.into_iter().collect(),
            })
        })
        .collect();

    Ok(lines)
}

/// Fetches Portugal's railway lines and assigns their colors.
pub async fn fetch_railway_lines(client: &CPMClient) -> Result<Vec<RailwayLine>> {
    let body = client.fetch_overpass(OVERPASS_QUERY).await?;
    let mut lines = parse_overpass(&body)?;
    assign_line_colors(&mut lines);
    info!("Fetched {} railway lines", lines.len());
    Ok(lines)
}

pub fn line_by_id<'a>(lines: &'a [RailwayLine], line_id: &str) -> Option<&'a RailwayLine> {
    lines.iter().find(|line| line.id == line_id)
}

pub fn lines_by_type(lines: &[RailwayLine]) -> BTreeMap<LineType, Vec<&RailwayLine>> {
    let mut grouped: BTreeMap<LineType, Vec<&RailwayLine>> = BTreeMap::new();
    for line in lines {
        grouped.entry(line.line_type).or_default().push(line);
    }
    grouped
}

// ============================================================================
// GeoJSON Export
// ============================================================================

fn line_to_feature(line: &RailwayLine) -> Feature {
    let style = line_style(line.line_type);
    let path: Vec<Vec<f64>> = line
        .coordinates
        .iter()
        .map(|(lon, lat)| vec![*lon, *lat])
        .collect();

    let mut properties = JsonObject::new();
    properties.insert("name".to_string(), json!(line.name));
    properties.insert("type".to_string(), json!(line.line_type.as_str()));
    properties.insert("color".to_string(), json!(line.assigned_color));
    properties.insert(
        "style".to_string(),
        json!({
            "color": line.assigned_color,
            "width": style.width,
            "priority": style.priority,
        }),
    );
    properties.insert("operator".to_string(), json!(line.operator));
    properties.insert("electrified".to_string(), json!(line.electrified));
    properties.insert("gauge".to_string(), json!(line.gauge));
    properties.insert("max_speed".to_string(), json!(line.max_speed));
    properties.insert("tags".to_string(), json!(line.tags));

    Feature {
        bbox: None,
        geometry: Some(Geometry::new(Value::LineString(path))),
        id: Some(geojson::feature::Id::String(line.id.clone())),
        properties: Some(properties),
        foreign_members: None,
    }
}

/// A single line drawn on top of the layer, wider than its base style.
pub fn highlight_line(line: &RailwayLine) -> Feature {
    let mut feature = line_to_feature(line);
    let style = line_style(line.line_type);
    if let Some(properties) = feature.properties.as_mut() {
        properties.insert(
            "style".to_string(),
            json!({
                "color": line.assigned_color,
                "width": style.width + HIGHLIGHT_EXTRA_WIDTH,
                "priority": style.priority,
            }),
        );
        properties.insert("highlighted".to_string(), json!(true));
    }
    feature
}

pub fn lines_to_geojson(lines: &[RailwayLine]) -> FeatureCollection {
    FeatureCollection {
        bbox: None,
        features: lines.iter().map(line_to_feature).collect(),
        foreign_members: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    const OVERPASS_JSON: &str = r#"{
        "version": 0.6,
        "elements": [
            {"type": "way", "id": 101,
             "tags": {"railway": "rail", "name": "Linha do Norte", "electrified": "contact_line",
                      "gauge": "1668", "maxspeed": "220", "operator": "Infraestruturas de Portugal"},
             "geometry": [{"lat": 38.77, "lon": -9.10}, {"lat": 38.80, "lon": -9.05}]},
            {"type": "way", "id": 102,
             "tags": {"railway": "rail", "service": "siding"},
             "geometry": [{"lat": 38.7, "lon": -9.1}, {"lat": 38.71, "lon": -9.11}]},
            {"type": "way", "id": 103,
             "tags": {"railway": "rail"},
             "geometry": [{"lat": 41.0, "lon": -8.6}]},
            {"type": "way", "id": 104,
             "tags": {"railway": "rail", "gauge": "1000", "maxspeed": "60 mph"},
             "geometry": [{"lat": 41.2, "lon": -8.3}, {"lat": 41.25, "lon": -8.2},
                          {"lat": 41.3, "lon": -8.1}]},
            {"type": "node", "id": 105, "lat": 41.0, "lon": -8.0}
        ]
    }"#;

    #[test]
    fn classifies_lines_from_tags() {
        assert_eq!(
            classify_line_type(&tags(&[("name", "Linha do Minho")])),
            Some(LineType::Main)
        );
        assert_eq!(
            classify_line_type(&tags(&[("name", "Linha de Cascais")])),
            Some(LineType::Urban)
        );
        assert_eq!(
            classify_line_type(&tags(&[("usage", "branch"), ("name", "Ramal Suburbano")])),
            Some(LineType::Urban)
        );
        assert_eq!(
            classify_line_type(&tags(&[("usage", "freight")])),
            Some(LineType::Freight)
        );
        assert_eq!(
            classify_line_type(&tags(&[("usage", "branch"), ("name", "Ramal de Braga")])),
            Some(LineType::Regional)
        );
        assert_eq!(classify_line_type(&tags(&[("railway", "tram")])), None);
        assert_eq!(classify_line_type(&tags(&[("usage", "military")])), None);
        assert_eq!(classify_line_type(&tags(&[("service", "crossover")])), None);
    }

    #[test]
    fn reads_gauge_speed_and_electrification() {
        assert_eq!(determine_gauge(&tags(&[("gauge", "1000")])), Gauge::Metric);
        assert_eq!(determine_gauge(&tags(&[("gauge", "1435;1668")])), Gauge::Iberian);
        assert_eq!(determine_gauge(&tags(&[])), Gauge::Iberian);

        assert_eq!(parse_max_speed(Some("120")), Some(120));
        assert_eq!(parse_max_speed(Some("90 km/h")), Some(90));
        assert_eq!(parse_max_speed(Some("50 mph")), Some(80));
        assert_eq!(parse_max_speed(Some("signals")), None);
        assert_eq!(parse_max_speed(None), None);

        assert!(is_electrified(&tags(&[("electrified", "yes")])));
        assert!(!is_electrified(&tags(&[("electrified", "no")])));
    }

    #[test]
    fn parses_overpass_ways() {
        let lines = parse_overpass(OVERPASS_JSON).unwrap();
        assert_eq!(lines.len(), 2);

        let norte = &lines[0];
        assert_eq!(norte.id, "osm_101");
        assert_eq!(norte.line_type, LineType::Main);
        assert!(norte.electrified);
        assert_eq!(norte.max_speed, Some(220));
        assert_eq!(norte.coordinates[0], (-9.10, 38.77));

        let unnamed = &lines[1];
        assert_eq!(unnamed.name, "Railway Line 104");
        assert_eq!(unnamed.operator, "CP");
        assert_eq!(unnamed.gauge, Gauge::Metric);
        assert_eq!(unnamed.line_type, LineType::Regional);
    }

    #[test]
    fn malformed_overpass_is_an_upstream_error() {
        assert!(matches!(
            parse_overpass("rate limited"),
            Err(CPMError::UpstreamError(_))
        ));
    }

    #[test]
    fn geojson_carries_color_and_style() {
        let mut lines = parse_overpass(OVERPASS_JSON).unwrap();
        assign_line_colors(&mut lines);

        let collection = lines_to_geojson(&lines);
        assert_eq!(collection.features.len(), 2);

        let props = collection.features[0].properties.as_ref().unwrap();
        assert_eq!(props["color"], json!("#1B5E20"));
        assert_eq!(props["style"]["width"], json!(5));
        assert_eq!(props["type"], json!("main"));
        assert_eq!(props["gauge"], json!("iberian"));
        assert_eq!(props["tags"]["electrified"], json!("contact_line"));
        assert_eq!(props["tags"]["operator"], json!("Infraestruturas de Portugal"));

        let geometry = collection.features[1].geometry.as_ref().unwrap();
        assert!(matches!(&geometry.value, Value::LineString(path) if path.len() == 3));
    }

    #[test]
    fn finds_and_highlights_a_line_by_id() {
        let mut lines = parse_overpass(OVERPASS_JSON).unwrap();
        assign_line_colors(&mut lines);

        let norte = line_by_id(&lines, "osm_101").unwrap();
        assert_eq!(norte.name, "Linha do Norte");
        assert_eq!(norte.tags.get("gauge").map(String::as_str), Some("1668"));
        assert!(line_by_id(&lines, "osm_102").is_none());

        let feature = highlight_line(norte);
        let props = feature.properties.as_ref().unwrap();
        assert_eq!(props["highlighted"], json!(true));
        assert_eq!(props["style"]["width"], json!(8));
        assert_eq!(props["style"]["color"], json!("#1B5E20"));
    }

    #[test]
    fn groups_lines_by_type() {
        let lines = parse_overpass(OVERPASS_JSON).unwrap();
        let grouped = lines_by_type(&lines);
        assert_eq!(grouped[&LineType::Main].len(), 1);
        assert_eq!(grouped[&LineType::Regional].len(), 1);
        assert!(!grouped.contains_key(&LineType::Freight));
    }
}

// Data models for the CP (Comboios de Portugal) live departures feed
// Official website: https://www.cp.pt/
//
// API Endpoints (base https://www.cp.pt/sites/spring):
// - Station index: /station-index
// - Trains at a station: /station/trains?stationId=<id>
// - Train detail and stops: /station/trains/train?trainId=<id>

use chrono::{DateTime, NaiveTime, Utc};
use chrono_tz::Europe::Lisbon;
use geo::Intersects;
use geo_types::{Coord, Rect, coord};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum CPMError {
    UpstreamTimeout(String),
    UpstreamError(String),
    InvalidCoordinate(String),
    StaleSelection(String),
}

impl std::fmt::Display for CPMError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CPMError::UpstreamTimeout(e) => write!(f, "Upstream timeout: {}", e),
            CPMError::UpstreamError(e) => write!(f, "Upstream error: {}", e),
            CPMError::InvalidCoordinate(e) => write!(f, "Invalid coordinate: {}", e),
            CPMError::StaleSelection(e) => write!(f, "Stale selection: {}", e),
        }
    }
}

impl std::error::Error for CPMError {}

pub type Result<T> = std::result::Result<T, CPMError>;

// ============================================================================
// Coordinates
// ============================================================================

/// Mainland Portugal, inclusive on every edge.
const PORTUGAL_MIN: Coord<f64> = coord! { x: -10.0, y: 36.0 };
const PORTUGAL_MAX: Coord<f64> = coord! { x: -6.0, y: 42.5 };

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    /// Validates a position against Portugal's bounding region.
    pub fn in_portugal(latitude: f64, longitude: f64) -> Result<Self> {
        let bounds = Rect::new(PORTUGAL_MIN, PORTUGAL_MAX);
        let position = coord! { x: longitude, y: latitude };

        if latitude.is_finite() && longitude.is_finite() && bounds.intersects(&position) {
            Ok(Coordinate { latitude, longitude })
        } else {
            Err(CPMError::InvalidCoordinate(format!(
                "({:.5}, {:.5}) is outside Portugal",
                latitude, longitude
            )))
        }
    }

    pub fn from_parts(latitude: Option<f64>, longitude: Option<f64>) -> Result<Self> {
        match (latitude, longitude) {
            (Some(lat), Some(lon)) => Self::in_portugal(lat, lon),
            _ => Err(CPMError::InvalidCoordinate("missing or non-numeric position".to_string())),
        }
    }

    /// GeoJSON / map-library ordering.
    pub fn lon_lat(&self) -> [f64; 2] {
        [self.longitude, self.latitude]
    }
}

// ============================================================================
// Data Structures
// ============================================================================

/// Station name -> opaque station id, as served by `/station-index`.
pub type StationIndex = HashMap<String, String>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationRef {
    pub id: String,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainSnapshot {
    pub train_id: String,
    pub train_number: u32,
    pub service_code: String,
    pub service_name: String,
    pub origin_name: String,
    pub destination_name: String,
    pub scheduled_arrival: Option<String>,
    pub scheduled_departure: Option<String>,
    pub estimated_arrival: Option<String>,
    pub estimated_departure: Option<String>,
    pub delay_minutes: i32,
    pub platform: Option<String>,
    pub occupancy: Option<String>,
    pub status: Option<String>,
}

impl TrainSnapshot {
    pub fn scheduled_time(&self) -> Option<&str> {
        self.scheduled_departure
            .as_deref()
            .or(self.scheduled_arrival.as_deref())
    }

    pub fn estimated_time(&self) -> Option<&str> {
        self.estimated_departure
            .as_deref()
            .or(self.estimated_arrival.as_deref())
    }

    /// Time shown on the board: etd, eta, departure, arrival, first present wins.
    pub fn display_time(&self) -> Option<&str> {
        self.estimated_time().or(self.scheduled_time())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopInfo {
    pub station_code: Option<String>,
    pub station_name: String,
    pub scheduled_arrival: Option<String>,
    pub scheduled_departure: Option<String>,
    pub estimated_arrival: Option<String>,
    pub estimated_departure: Option<String>,
    pub platform: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl StopInfo {
    pub fn position(&self) -> Result<Coordinate> {
        Coordinate::from_parts(self.latitude, self.longitude)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainDetail {
    pub train_id: String,
    pub train_number: Option<u32>,
    pub service_code: Option<String>,
    pub delay_minutes: i32,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub status: String,
    pub occupancy: Option<String>,
    pub stops: Vec<StopInfo>,
}

impl TrainDetail {
    pub fn position(&self) -> Result<Coordinate> {
        Coordinate::from_parts(self.latitude, self.longitude)
    }
}

/// A train as placed on the live map: board summary joined with its detail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapTrain {
    pub train_id: String,
    pub train_number: u32,
    pub service_code: String,
    pub service_name: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub status: String,
    pub delay_minutes: i32,
    pub origin_name: String,
    pub destination_name: String,
    pub platform: Option<String>,
    pub occupancy: Option<String>,
    pub estimated_arrival: Option<String>,
    pub estimated_departure: Option<String>,
    pub source_station: String,
    pub stops: Vec<StopInfo>,
}

impl MapTrain {
    pub fn assemble(summary: &TrainSnapshot, detail: &TrainDetail, source_station: &str) -> Self {
        MapTrain {
            train_id: summary.train_id.clone(),
            train_number: summary.train_number,
            service_code: summary.service_code.clone(),
            service_name: summary.service_name.clone(),
            latitude: detail.latitude,
            longitude: detail.longitude,
            status: detail.status.clone(),
            delay_minutes: summary.delay_minutes,
            origin_name: summary.origin_name.clone(),
            destination_name: summary.destination_name.clone(),
            platform: summary.platform.clone(),
            occupancy: summary.occupancy.clone().or_else(|| detail.occupancy.clone()),
            estimated_arrival: summary.estimated_arrival.clone(),
            estimated_departure: summary.estimated_departure.clone(),
            source_station: source_station.to_string(),
            stops: detail.stops.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationMarker {
    pub station: StationRef,
    pub has_trains: bool,
    pub train_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineType {
    Main,
    Regional,
    Urban,
    Freight,
}

impl LineType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineType::Main => "main",
            LineType::Regional => "regional",
            LineType::Urban => "urban",
            LineType::Freight => "freight",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gauge {
    Iberian,
    Metric,
    Standard,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RailwayLine {
    pub id: String,
    pub name: String,
    pub line_type: LineType,
    /// (lon, lat) pairs in drawing order
    pub coordinates: Vec<(f64, f64)>,
    pub assigned_color: String,
    pub operator: String,
    pub electrified: bool,
    pub gauge: Gauge,
    pub max_speed: Option<u32>,
    /// Raw OSM tags of the way
    pub tags: BTreeMap<String, String>,
}

// ============================================================================
// Wire Payloads
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
struct CodeDesignation {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    designation: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrainSummaryPayload {
    #[serde(default)]
    delay: Option<i32>,
    #[serde(default)]
    train_origin: Option<CodeDesignation>,
    #[serde(default)]
    train_destination: Option<CodeDesignation>,
    #[serde(default)]
    departure_time: Option<String>,
    #[serde(default)]
    arrival_time: Option<String>,
    #[serde(default, deserialize_with = "de_opt_u32")]
    train_number: Option<u32>,
    #[serde(default)]
    train_service: Option<CodeDesignation>,
    #[serde(default, deserialize_with = "de_opt_scalar_string")]
    platform: Option<String>,
    #[serde(default, deserialize_with = "de_opt_scalar_string")]
    occupancy: Option<String>,
    #[serde(default)]
    eta: Option<String>,
    #[serde(default)]
    etd: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrainStopPayload {
    #[serde(default)]
    station: Option<CodeDesignation>,
    #[serde(default)]
    designation: Option<String>,
    #[serde(default)]
    arrival_time: Option<String>,
    #[serde(default)]
    departure_time: Option<String>,
    #[serde(default)]
    eta: Option<String>,
    #[serde(default)]
    etd: Option<String>,
    #[serde(default, deserialize_with = "de_opt_scalar_string")]
    platform: Option<String>,
    #[serde(default, deserialize_with = "de_opt_coordinate")]
    latitude: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_coordinate")]
    longitude: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrainDetailPayload {
    #[serde(default, deserialize_with = "de_opt_u32")]
    train_number: Option<u32>,
    #[serde(default, deserialize_with = "de_service_code")]
    service_code: Option<String>,
    #[serde(default)]
    delay: Option<i32>,
    #[serde(default, deserialize_with = "de_opt_coordinate")]
    latitude: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_coordinate")]
    longitude: Option<f64>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default, deserialize_with = "de_opt_scalar_string")]
    occupancy: Option<String>,
    #[serde(default)]
    train_stops: Option<Vec<TrainStopPayload>>,
}

/// Decimal degrees arrive as strings; anything non-numeric becomes `None`.
fn de_opt_coordinate<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<f64>, D::Error> {
    let value = Option::<Value>::deserialize(d)?;
    Ok(match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|v| v.is_finite()))
}

fn de_opt_u32<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<u32>, D::Error> {
    let value = Option::<Value>::deserialize(d)?;
    Ok(match value {
        Some(Value::Number(n)) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Some(Value::String(s)) => s.trim().parse::<u32>().ok(),
        _ => None,
    })
}

fn de_opt_scalar_string<'de, D: Deserializer<'de>>(
    d: D,
) -> std::result::Result<Option<String>, D::Error> {
    let value = Option::<Value>::deserialize(d)?;
    Ok(match value {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        _ => None,
    })
}

/// `serviceCode` is either a bare code or a `{code, designation}` object.
fn de_service_code<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<String>, D::Error> {
    let value = Option::<Value>::deserialize(d)?;
    Ok(match value {
        Some(Value::String(s)) => Some(s),
        Some(Value::Object(map)) => map.get("code").and_then(Value::as_str).map(String::from),
        _ => None,
    })
}

// ============================================================================
// Parsing
// ============================================================================

pub fn parse_station_index(body: &str) -> Result<StationIndex> {
    serde_json::from_str::<StationIndex>(body)
        .map_err(|e| CPMError::UpstreamError(format!("Invalid station index: {}", e)))
}

/// Summaries without a train number have no identity and are skipped.
pub fn parse_station_trains(body: &str) -> Result<Vec<TrainSnapshot>> {
    let payloads: Vec<TrainSummaryPayload> = serde_json::from_str(body)
        .map_err(|e| CPMError::UpstreamError(format!("Invalid train list: {}", e)))?;

    Ok(payloads
        .into_iter()
        .filter_map(|p| {
            let train_number = p.train_number?;
            let service = p.train_service.unwrap_or_default();
            Some(TrainSnapshot {
                train_id: train_number.to_string(),
                train_number,
                service_code: service.code.unwrap_or_else(|| "T".to_string()),
                service_name: service.designation.unwrap_or_else(|| "Train".to_string()),
                origin_name: p
                    .train_origin
                    .and_then(|o| o.designation)
                    .unwrap_or_else(|| "Unknown".to_string()),
                destination_name: p
                    .train_destination
                    .and_then(|d| d.designation)
                    .unwrap_or_else(|| "Unknown".to_string()),
                scheduled_arrival: p.arrival_time,
                scheduled_departure: p.departure_time,
                estimated_arrival: p.eta,
                estimated_departure: p.etd,
                delay_minutes: p.delay.unwrap_or(0),
                platform: p.platform,
                occupancy: p.occupancy,
                status: p.status,
            })
        })
        .collect())
}

pub fn parse_train_detail(train_id: &str, body: &str) -> Result<TrainDetail> {
    let payload: TrainDetailPayload = serde_json::from_str(body)
        .map_err(|e| CPMError::UpstreamError(format!("Invalid detail for train {}: {}", train_id, e)))?;

    let stops = payload
        .train_stops
        .unwrap_or_default()
        .into_iter()
        .map(|s| {
            let station = s.station.unwrap_or_default();
            StopInfo {
                station_code: station.code,
                station_name: station
                    .designation
                    .or(s.designation)
                    .unwrap_or_else(|| "Unknown".to_string()),
                scheduled_arrival: s.arrival_time,
                scheduled_departure: s.departure_time,
                estimated_arrival: s.eta,
                estimated_departure: s.etd,
                platform: s.platform,
                latitude: s.latitude,
                longitude: s.longitude,
            }
        })
        .collect();

    Ok(TrainDetail {
        train_id: train_id.to_string(),
        train_number: payload.train_number,
        service_code: payload.service_code,
        delay_minutes: payload.delay.unwrap_or(0),
        latitude: payload.latitude,
        longitude: payload.longitude,
        status: payload.status.unwrap_or_else(|| "UNKNOWN".to_string()),
        occupancy: payload.occupancy,
        stops,
    })
}

// ============================================================================
// Formatting Helpers
// ============================================================================

lazy_static! {
    static ref CLOCK_RE: Regex = Regex::new(r"^\s*(\d{1,2}):(\d{2})").expect("valid clock regex");
}

pub struct CPMModels;

impl CPMModels {
    pub fn format_delay(delay_minutes: i32) -> String {
        if delay_minutes > 0 {
            format!("+{} min", delay_minutes)
        } else {
            "On Time".to_string()
        }
    }

    pub fn is_severe_delay(delay_minutes: i32) -> bool {
        delay_minutes > 5
    }

    pub fn capitalize_words(text: &str) -> String {
        text.split_whitespace()
            .map(|word| {
                let mut chars = word.chars();
                match chars.next() {
                    Some(first) => first
                        .to_uppercase()
                        .chain(chars.flat_map(char::to_lowercase))
                        .collect(),
                    None => String::new(),
                }
            })
            .collect::<Vec<String>>()
            .join(" ")
    }

    /// Parses the feed's `HH:MM` clock strings.
    pub fn parse_clock(text: &str) -> Option<NaiveTime> {
        let caps = CLOCK_RE.captures(text)?;
        let hours = caps[1].parse::<u32>().ok()?;
        let minutes = caps[2].parse::<u32>().ok()?;
        NaiveTime::from_hms_opt(hours, minutes, 0)
    }

    pub fn format_local_time(at: DateTime<Utc>) -> String {
        at.with_timezone(&Lisbon).format("%H:%M:%S").to_string()
    }

    /// `#RRGGBB` or `RRGGBB`; grey for anything else.
    pub fn parse_hex_color(hex_color: &str) -> (u8, u8, u8) {
        let hex = hex_color.trim_start_matches('#');
        if hex.len() != 6 || !hex.is_ascii() {
            return (128, 128, 128);
        }
        let r = u8::from_str_radix(&hex[0..2], 16).unwrap_or(128);
        let g = u8::from_str_radix(&hex[2..4], 16).unwrap_or(128);
        let b = u8::from_str_radix(&hex[4..6], 16).unwrap_or(128);
        (r, g, b)
    }
}

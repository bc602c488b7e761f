// Command line and environment configuration
use crate::cpm_models::StationRef;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_API_BASE_URL: &str = "https://www.cp.pt/sites/spring";
pub const DEFAULT_OVERPASS_URL: &str = "https://overpass-api.de/api/interpreter";
pub const DEFAULT_STATION_ID: &str = "94-31039";

/// Stations polled by the live map, with their known positions.
const MAJOR_STATIONS: &[(&str, &str, f64, f64)] = &[
    ("94-31039", "Lisboa Oriente", 38.7681, -9.0978),
    ("94-2006", "Porto Campanha", 41.1496, -8.5856),
    ("94-73007", "Faro", 37.0194, -7.9304),
    ("94-36004", "Coimbra-B", 40.2033, -8.4103),
    ("94-30007", "Lisboa Santa Apolonia", 38.7223, -9.1255),
    ("94-1008", "Porto Sao Bento", 41.1456, -8.6109),
    ("94-29157", "Braga", 41.5479, -8.4347),
    ("94-83006", "Evora", 38.5667, -7.9067),
];

#[derive(Debug, Parser)]
#[command(name = "cpm", version, about = "Live CP train departures and train map")]
pub struct Cli {
    /// Base URL of the CP data feed
    #[arg(long, env = "CPM_API_BASE_URL", default_value = DEFAULT_API_BASE_URL)]
    pub api_base_url: String,

    /// Overpass API endpoint used for the railway line layer
    #[arg(long, env = "CPM_OVERPASS_URL", default_value = DEFAULT_OVERPASS_URL)]
    pub overpass_url: String,

    #[arg(long, env = "CPM_REQUEST_TIMEOUT_SECS", default_value_t = 10)]
    pub request_timeout_secs: u64,

    #[arg(long, env = "CPM_BOARD_INTERVAL_SECS", default_value_t = 30)]
    pub board_interval_secs: u64,

    #[arg(long, env = "CPM_MAP_INTERVAL_SECS", default_value_t = 10)]
    pub map_interval_secs: u64,

    /// How long a fetched train detail is reused by the map
    #[arg(long, env = "CPM_DETAIL_TTL_SECS", default_value_t = 300)]
    pub detail_ttl_secs: u64,

    /// Print events as JSON lines instead of formatted text
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Live departure board for one station
    Board {
        /// Station name or id
        #[arg(long, env = "DEFAULT_STATION_ID", default_value = DEFAULT_STATION_ID)]
        station: String,

        /// Only show these service designations (repeatable)
        #[arg(long = "service")]
        services: Vec<String>,

        /// Only show trains whose number contains this text
        #[arg(long)]
        train_number: Option<String>,
    },
    /// Live train map events
    Map,
    /// Route of a single train
    Route { train_id: String },
    /// Export the railway line layer as GeoJSON
    Lines {
        #[arg(long)]
        output: Option<PathBuf>,

        /// Show and highlight one line by id (e.g. osm_123456)
        #[arg(long)]
        line: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct CPMConfig {
    pub api_base_url: String,
    pub overpass_url: String,
    pub request_timeout: Duration,
    pub board_interval: Duration,
    pub map_interval: Duration,
    pub detail_ttl: Duration,
    pub major_stations: Vec<StationRef>,
}

impl CPMConfig {
    pub fn from_cli(cli: &Cli) -> Self {
        CPMConfig {
            api_base_url: cli.api_base_url.trim_end_matches('/').to_string(),
            overpass_url: cli.overpass_url.clone(),
            request_timeout: Duration::from_secs(cli.request_timeout_secs.max(1)),
            board_interval: Duration::from_secs(cli.board_interval_secs.max(1)),
            map_interval: Duration::from_secs(cli.map_interval_secs.max(1)),
            detail_ttl: Duration::from_secs(cli.detail_ttl_secs),
            major_stations: Self::major_stations(),
        }
    }

    pub fn major_stations() -> Vec<StationRef> {
        MAJOR_STATIONS
            .iter()
            .map(|(id, name, lat, lon)| StationRef {
                id: id.to_string(),
                name: name.to_string(),
                latitude: *lat,
                longitude: *lon,
            })
            .collect()
    }
}

impl Default for CPMConfig {
    fn default() -> Self {
        CPMConfig {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            overpass_url: DEFAULT_OVERPASS_URL.to_string(),
            request_timeout: Duration::from_secs(10),
            board_interval: Duration::from_secs(30),
            map_interval: Duration::from_secs(10),
            detail_ttl: Duration::from_secs(300),
            major_stations: Self::major_stations(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_match_config_defaults() {
        let cli = Cli::try_parse_from(["cpm", "map"]).unwrap();
        let config = CPMConfig::from_cli(&cli);
        let defaults = CPMConfig::default();

        assert_eq!(config.board_interval, defaults.board_interval);
        assert_eq!(config.map_interval, defaults.map_interval);
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(config.major_stations.len(), 8);
    }

    #[test]
    fn parses_board_filters() {
        let cli = Cli::try_parse_from([
            "cpm",
            "--json",
            "board",
            "--station",
            "Faro",
            "--service",
            "Intercidades",
            "--service",
            "Regional",
        ])
        .unwrap();

        assert!(cli.json);
        match cli.command {
            Command::Board { station, services, train_number } => {
                assert_eq!(station, "Faro");
                assert_eq!(services, vec!["Intercidades", "Regional"]);
                assert_eq!(train_number, None);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}

// Terminal views for the CP departure board and train map
use crate::cpm_controllers::BoardFilter;
use crate::cpm_models::{CPMModels, Coordinate, LineType, MapTrain, RailwayLine, StationRef, TrainDetail, TrainSnapshot};
use crate::cpm_reconciler::{LayerKind, MapEvent};
use chrono::{DateTime, Utc};
use log::error;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::Path;

pub struct CPMViews;

impl CPMViews {
    fn banner(title: &str) {
        println!("\n{}", "═".repeat(70));
        println!("  ╔═══════════════════════════════════════════════════════════╗");
        println!("  ║{:^59}║", title);
        println!("  ║               Comboios de Portugal - Live Data            ║");
        println!("  ╚═══════════════════════════════════════════════════════════╝");
        println!("{}", "═".repeat(70));
    }

    pub fn board_welcome() {
        Self::banner("🚆 CP LIVE DEPARTURES");
        println!("\n  📡 Departure board refreshes automatically");
        println!("  🌐 Data source: https://www.cp.pt/");
        println!("  ⌨️  Press Ctrl-C to quit");
        println!("{}", "═".repeat(70));
    }

    pub fn map_welcome(stations: &[StationRef]) {
        Self::banner("🗺️  CP LIVE TRAIN MAP");
        println!("\n  📍 Watching {} major stations:", stations.len());
        for station in stations {
            println!("     • {} ({:.4}, {:.4})", station.name, station.latitude, station.longitude);
        }
        println!("\n  ⌨️  Press Ctrl-C to quit");
        println!("{}", "═".repeat(70));
    }

    /// Board for one station, already filtered and ordered.
    pub fn show_board(
        station_name: &str,
        trains: &[TrainSnapshot],
        filter: &BoardFilter,
        services: &[String],
        fetched_at: DateTime<Utc>,
    ) {
        println!("\n{}", "═".repeat(70));
        println!("🚉 DEPARTURES AT: {}", CPMModels::capitalize_words(station_name));
        println!("🕐 Updated at {}", CPMModels::format_local_time(fetched_at));
        if filter.is_active() {
            let numbers = filter.train_number.as_deref().unwrap_or("any");
            let shown = if filter.services.is_empty() {
                "all".to_string()
            } else {
                filter.services.join(", ")
            };
            println!("   Filtered by service: {} | train number: {}", shown, numbers);
        }
        if !services.is_empty() {
            println!("   Services today: {}", services.join(", "));
        }
        println!("{}", "═".repeat(70));

        if trains.is_empty() {
            println!("\n⚠️  No trains found");
            println!("\n💡 Suggestions:");
            println!("  • Clear the service or train number filter");
            println!("  • Try again in a few moments");
            return;
        }

        for (i, train) in trains.iter().enumerate() {
            Self::display_train(train);
            if i + 1 < trains.len() {
                println!("{}", "  ┄".repeat(23));
            }
        }
        println!("{}", "─".repeat(70));
    }

    fn display_train(train: &TrainSnapshot) {
        println!(
            "\n  {} {}  {} → {}",
            Self::colorize(&train.service_code, Self::service_color(&train.service_code)),
            train.train_number,
            CPMModels::capitalize_words(&train.origin_name),
            CPMModels::capitalize_words(&train.destination_name),
        );

        let time = train.display_time().unwrap_or("--:--");
        match train.scheduled_time() {
            Some(scheduled) if scheduled != time => {
                println!("     ⏰ {} (scheduled {})", time, scheduled)
            }
            _ => println!("     ⏰ {}", time),
        }

        print!("     ");
        if train.delay_minutes <= 0 {
            print!("🟢 {}", CPMModels::format_delay(train.delay_minutes));
        } else if CPMModels::is_severe_delay(train.delay_minutes) {
            print!("🔴 {}", CPMModels::format_delay(train.delay_minutes));
        } else {
            print!("🟡 {}", CPMModels::format_delay(train.delay_minutes));
        }
        if let Some(platform) = &train.platform {
            print!("  |  🛤️  Platform {}", platform);
        }
        if let Some(occupancy) = &train.occupancy {
            print!("  |  👥 Occupancy {}", occupancy);
        }
        println!();
    }

    pub fn refresh_failed(what: &str, age: Option<chrono::Duration>) {
        eprintln!("⚠️  Refreshing the {} failed", what);
        match age {
            Some(age) => println!("   Showing data from {}s ago, will retry next cycle...", age.num_seconds()),
            None => println!("   No data yet, will retry next cycle..."),
        }
    }

    pub fn show_map_event(event: &MapEvent) {
        match event {
            MapEvent::MarkerAdded { layer, marker } => println!(
                "  ➕ {} {} at ({:.4}, {:.4})",
                Self::layer_icon(*layer),
                marker.label,
                marker.position.latitude,
                marker.position.longitude
            ),
            MapEvent::MarkerUpdated { layer, marker } => println!(
                "  🔄 {} {} at ({:.4}, {:.4})",
                Self::layer_icon(*layer),
                marker.label,
                marker.position.latitude,
                marker.position.longitude
            ),
            MapEvent::MarkerRemoved { layer, id } => {
                println!("  ➖ {} {} left the map", Self::layer_icon(*layer), id)
            }
            MapEvent::RouteCleared { train_id } => println!("  🧹 Route of train {} cleared", train_id),
            MapEvent::RouteRequested { train_id } => {
                println!("  🔎 Looking up route of train {}...", train_id)
            }
            MapEvent::RouteDrawn { train_id, path } => {
                println!("  🛤️  Route of train {} drawn through {} points", train_id, path.len())
            }
        }
    }

    fn layer_icon(layer: LayerKind) -> &'static str {
        match layer {
            LayerKind::Trains => "🚆",
            LayerKind::Stations => "🚉",
        }
    }

    pub fn map_summary(trains: &[MapTrain]) {
        let delayed = trains.iter().filter(|t| t.delay_minutes > 0).count();
        let severe = trains
            .iter()
            .filter(|t| CPMModels::is_severe_delay(t.delay_minutes))
            .count();

        println!("\n{}", "─".repeat(70));
        println!(
            "📊 {} trains on the map | 🟡 {} delayed | 🔴 {} over 5 min late",
            trains.len(),
            delayed,
            severe
        );
        println!("{}", "─".repeat(70));
    }

    pub fn show_route(detail: &TrainDetail, path: &[Coordinate]) {
        println!("\n{}", "═".repeat(70));
        match (&detail.service_code, detail.train_number) {
            (Some(code), Some(number)) => println!(
                "🚆 ROUTE OF {} {}",
                Self::colorize(code, Self::service_color(code)),
                number
            ),
            _ => println!("🚆 ROUTE OF TRAIN {}", detail.train_id),
        }
        println!("   Status: {} | {}", detail.status, CPMModels::format_delay(detail.delay_minutes));
        match detail.position() {
            Ok(position) => println!("   📍 Position: ({:.4}, {:.4})", position.latitude, position.longitude),
            Err(_) => println!("   📍 Position: not available"),
        }
        println!("{}", "═".repeat(70));

        for (i, stop) in detail.stops.iter().enumerate() {
            let arrival = stop
                .estimated_arrival
                .as_deref()
                .or(stop.scheduled_arrival.as_deref())
                .unwrap_or("--:--");
            let departure = stop
                .estimated_departure
                .as_deref()
                .or(stop.scheduled_departure.as_deref())
                .unwrap_or("--:--");
            print!(
                "  {:>2}. {:<28} arr {}  dep {}",
                i + 1,
                CPMModels::capitalize_words(&stop.station_name),
                arrival,
                departure
            );
            if let Some(platform) = &stop.platform {
                print!("  (platform {})", platform);
            }
            println!();
        }

        println!("{}", "─".repeat(70));
        if path.len() >= 2 {
            println!("🛤️  Route drawn through {} positioned stops", path.len());
        } else {
            println!("⚠️  Not enough positioned stops to draw this route");
        }
    }

    pub fn station_not_found(input: &str, suggestions: &[(String, String)]) {
        println!("\n{}", "─".repeat(60));
        println!("✗ Station '{}' not found", input);
        if suggestions.is_empty() {
            println!("\n💡 Tips:");
            println!("  • Check the spelling");
            println!("  • Try a partial name (e.g., 'Oriente' for 'Lisboa Oriente')");
        } else {
            println!("\n💡 Did you mean one of these stations?");
            for (name, id) in suggestions {
                println!("  • {} (ID: {})", name, id);
            }
        }
        println!("{}", "─".repeat(60));
    }

    pub fn show_lines_summary(grouped: &BTreeMap<LineType, Vec<&RailwayLine>>, output: Option<&Path>) {
        let total: usize = grouped.values().map(Vec::len).sum();
        println!("\n{}", "═".repeat(70));
        println!("🛤️  RAILWAY LINES IN PORTUGAL ({} segments)", total);
        println!("{}", "═".repeat(70));

        for (line_type, lines) in grouped {
            println!("\n  {} lines ({}):", CPMModels::capitalize_words(line_type.as_str()), lines.len());
            let mut names: Vec<(&str, &str)> = lines
                .iter()
                .map(|line| (line.name.as_str(), line.assigned_color.as_str()))
                .collect();
            names.sort();
            names.dedup_by(|a, b| a.0 == b.0);
            for (name, color) in names.iter().take(15) {
                println!("     {} {}", Self::colorize("  ", color), name);
            }
            if names.len() > 15 {
                println!("     ... and {} more", names.len() - 15);
            }
        }

        if let Some(path) = output {
            println!("\n✓ GeoJSON written to {}", path.display());
        }
        println!("\n{}", "═".repeat(70));
    }

    pub fn show_line(line: &RailwayLine) {
        println!("\n{}", "═".repeat(70));
        println!("🛤️  {} {}", Self::colorize("  ", &line.assigned_color), line.name);
        println!("{}", "═".repeat(70));
        println!("   ID: {}", line.id);
        println!("   Type: {} | Operator: {}", CPMModels::capitalize_words(line.line_type.as_str()), line.operator);
        println!(
            "   Gauge: {:?} | Electrified: {}",
            line.gauge,
            if line.electrified { "yes" } else { "no" }
        );
        match line.max_speed {
            Some(speed) => println!("   Max speed: {} km/h", speed),
            None => println!("   Max speed: unknown"),
        }
        println!("   Drawn through {} points", line.coordinates.len());
        if !line.tags.is_empty() {
            println!("\n   OSM tags:");
            for (key, value) in &line.tags {
                println!("     {} = {}", key, value);
            }
        }
        println!("{}", "─".repeat(70));
    }

    pub fn line_not_found(line_id: &str) {
        println!("\n{}", "─".repeat(60));
        println!("✗ Railway line '{}' not found", line_id);
        println!("\n💡 Line ids look like 'osm_123456'; export the layer with --output to browse them");
        println!("{}", "─".repeat(60));
    }

    /// Network error message
    pub fn network_error(error: &str) {
        println!("\n{}", "═".repeat(60));
        println!("❌ NETWORK ERROR");
        println!("{}", "═".repeat(60));
        println!("\n{}", error);
        println!("\n💡 Troubleshooting:");
        println!("  • Check your internet connection");
        println!("  • The CP API might be temporarily unavailable");
        println!("  • Try again in a few moments");
        println!("  • Visit https://www.cp.pt/ for service status");
        println!("\n{}", "═".repeat(60));
    }

    pub fn show_loading(message: &str) {
        print!("\r🔄 {}...", message);
        let _ = io::stdout().flush();
    }

    pub fn clear_loading() {
        print!("\r{}\r", " ".repeat(60));
        let _ = io::stdout().flush();
    }

    pub fn goodbye_message() {
        println!("\n{}", "═".repeat(60));
        println!("       👋 Thank you for using CP Live!");
        println!("           Boa viagem!");
        println!("{}", "═".repeat(60));
        println!();
    }

    /// One JSON document per line.
    pub fn print_json<T: Serialize>(value: &T) {
        match serde_json::to_string(value) {
            Ok(line) => println!("{}", line),
            Err(e) => error!("Failed to serialize output: {}", e),
        }
    }

    fn service_color(service_code: &str) -> &'static str {
        match service_code.to_ascii_uppercase().as_str() {
            "AP" => "#1B5E20",
            "IC" => "#0D47A1",
            "IR" => "#6A1B9A",
            "R" => "#1565C0",
            "U" => "#E65100",
            _ => "#607D8B",
        }
    }

    /// Label on a truecolor background, with black or white text for contrast
    fn colorize(label: &str, hex_color: &str) -> String {
        let (r, g, b) = CPMModels::parse_hex_color(hex_color);
        let luminance = (0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32) / 255.0;
        let text_color = if luminance > 0.5 { "30" } else { "97" };

        format!(
            "\x1b[48;2;{};{};{}m\x1b[{}m {} \x1b[0m",
            r, g, b, text_color, label
        )
    }
}

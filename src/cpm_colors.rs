// Railway line colors and styles
use crate::cpm_models::{LineType, RailwayLine};
use lazy_static::lazy_static;
use serde::Serialize;
use std::collections::{HashMap, HashSet};

lazy_static! {
    /// Hand-picked colors for the busiest lines, keyed by lowercase name.
    static ref CURATED_LINE_COLORS: HashMap<&'static str, &'static str> = HashMap::from([
        ("linha do norte", "#1B5E20"),
        ("linha do sul", "#0D47A1"),
        ("linha da beira alta", "#B71C1C"),
        ("linha do minho", "#F57F17"),
        ("linha de cascais", "#6A1B9A"),
        ("linha de sintra", "#00838F"),
        ("linha do douro", "#4E342E"),
        ("linha da beira baixa", "#AD1457"),
        ("linha do oeste", "#283593"),
        ("linha do leste", "#558B2F"),
        ("linha do algarve", "#EF6C00"),
        ("linha de cintura", "#37474F"),
    ]);
}

/// Fallback palette, spread around the hue circle.
pub const PALETTE: [&str; 20] = [
    "#E6194B", "#3CB44B", "#FFE119", "#4363D8", "#F58231", "#911EB4", "#46F0F0", "#F032E6",
    "#BCF60C", "#FABEBE", "#008080", "#E6BEFF", "#9A6324", "#800000", "#AAFFC3", "#808000",
    "#000075", "#FF7F50", "#2E8B57", "#DC143C",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LineStyle {
    pub color: &'static str,
    pub width: u8,
    pub priority: u8,
}

pub fn line_style(line_type: LineType) -> LineStyle {
    match line_type {
        LineType::Main => LineStyle { color: "#1B5E20", width: 5, priority: 1 },
        LineType::Regional => LineStyle { color: "#1565C0", width: 3, priority: 2 },
        LineType::Urban => LineStyle { color: "#6A1B9A", width: 3, priority: 3 },
        LineType::Freight => LineStyle { color: "#E65100", width: 2, priority: 4 },
    }
}

fn normalize(name: &str) -> String {
    name.trim().to_lowercase()
}

pub fn curated_color(name: &str) -> Option<&'static str> {
    CURATED_LINE_COLORS.get(normalize(name).as_str()).copied()
}

/// Stable across runs and platforms.
pub fn palette_index(name: &str) -> usize {
    (seahash::hash(normalize(name).as_bytes()) % PALETTE.len() as u64) as usize
}

/// Color for a line name: curated when known, otherwise picked from the palette by hash.
pub fn line_color(name: &str) -> &'static str {
    curated_color(name).unwrap_or(PALETTE[palette_index(name)])
}

/// Assigns colors to the lines visible together. Curated colors are fixed;
/// a hashed color already used by another line of the same type moves forward
/// through the palette. Lines are visited in name order so the outcome only
/// depends on the visible set. Segments sharing a name share a color.
pub fn assign_line_colors(lines: &mut [RailwayLine]) {
    let mut order: Vec<usize> = (0..lines.len()).collect();
    order.sort_by(|&a, &b| {
        normalize(&lines[a].name)
            .cmp(&normalize(&lines[b].name))
            .then_with(|| lines[a].id.cmp(&lines[b].id))
    });

    let mut assigned: HashMap<(LineType, String), &'static str> = HashMap::new();
    let mut taken: HashMap<LineType, HashSet<&'static str>> = HashMap::new();

    for line in lines.iter() {
        if let Some(color) = curated_color(&line.name) {
            assigned.insert((line.line_type, normalize(&line.name)), color);
            taken.entry(line.line_type).or_default().insert(color);
        }
    }

    for index in order {
        let key = (lines[index].line_type, normalize(&lines[index].name));
        let color = match assigned.get(&key).copied() {
            Some(color) => color,
            None => {
                let used = taken.entry(key.0).or_default();
                let start = palette_index(&lines[index].name);
                let color = (0..PALETTE.len())
                    .map(|step| PALETTE[(start + step) % PALETTE.len()])
                    .find(|candidate| !used.contains(candidate))
                    .unwrap_or(PALETTE[start]);
                used.insert(color);
                assigned.insert(key, color);
                color
            }
        };
        lines[index].assigned_color = color.to_string();
    }
}

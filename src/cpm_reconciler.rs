// Incremental map marker reconciliation
use crate::cpm_models::{Coordinate, MapTrain, Result, StationMarker};
use log::debug;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;

/// Anything that can be drawn as a marker on the map.
pub trait MapEntity: Serialize {
    fn marker_id(&self) -> &str;
    fn position(&self) -> Result<Coordinate>;
    fn label(&self) -> String;
}

impl MapEntity for MapTrain {
    fn marker_id(&self) -> &str {
        &self.train_id
    }

    fn position(&self) -> Result<Coordinate> {
        Coordinate::from_parts(self.latitude, self.longitude)
    }

    fn label(&self) -> String {
        format!("{} {}", self.service_code, self.train_number)
    }
}

impl MapEntity for StationMarker {
    fn marker_id(&self) -> &str {
        &self.station.id
    }

    fn position(&self) -> Result<Coordinate> {
        Coordinate::in_portugal(self.station.latitude, self.station.longitude)
    }

    fn label(&self) -> String {
        self.station.name.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerKind {
    Trains,
    Stations,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarkerView {
    pub id: String,
    pub position: Coordinate,
    pub label: String,
    /// Full entity, for popups
    pub detail: Value,
}

/// Instructions for the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MapEvent {
    MarkerRemoved { layer: LayerKind, id: String },
    MarkerAdded { layer: LayerKind, marker: MarkerView },
    MarkerUpdated { layer: LayerKind, marker: MarkerView },
    RouteCleared { train_id: String },
    RouteRequested { train_id: String },
    RouteDrawn { train_id: String, path: Vec<Coordinate> },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub to_add: HashSet<String>,
    pub to_update: HashSet<String>,
    pub to_remove: HashSet<String>,
}

impl Reconciliation {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_update.is_empty() && self.to_remove.is_empty()
    }
}

/// Diffs the previously active ids against a new snapshot in O(|previous| + |snapshot|).
/// Ids present on both sides are always updates. A repeated id counts once.
pub fn reconcile<E: MapEntity>(previous: &HashSet<String>, snapshot: &[E]) -> Reconciliation {
    let mut plan = Reconciliation::default();
    let mut current: HashSet<&str> = HashSet::with_capacity(snapshot.len());

    for entity in snapshot {
        let id = entity.marker_id();
        if !current.insert(id) {
            continue;
        }
        if previous.contains(id) {
            plan.to_update.insert(id.to_string());
        } else {
            plan.to_add.insert(id.to_string());
        }
    }

    plan.to_remove = previous
        .iter()
        .filter(|id| !current.contains(id.as_str()))
        .cloned()
        .collect();

    plan
}

/// One marker layer on the map surface and the ids it currently shows.
#[derive(Debug)]
pub struct MarkerLayer<E> {
    kind: LayerKind,
    active: HashSet<String>,
    gesture_active: bool,
    deferred: Option<Vec<E>>,
}

impl<E: MapEntity> MarkerLayer<E> {
    pub fn new(kind: LayerKind) -> Self {
        MarkerLayer {
            kind,
            active: HashSet::new(),
            gesture_active: false,
            deferred: None,
        }
    }

    pub fn kind(&self) -> LayerKind {
        self.kind
    }

    pub fn active_ids(&self) -> &HashSet<String> {
        &self.active
    }

    pub fn has_deferred(&self) -> bool {
        self.deferred.is_some()
    }

    /// Brings the layer up to date with `snapshot`, or holds it until the
    /// current pan/zoom gesture ends. Only the latest held snapshot is kept.
    pub fn apply(&mut self, snapshot: Vec<E>) -> Vec<MapEvent> {
        if self.gesture_active {
            self.deferred = Some(snapshot);
            return Vec::new();
        }
        self.render(snapshot)
    }

    pub fn begin_gesture(&mut self) {
        self.gesture_active = true;
    }

    pub fn end_gesture(&mut self) -> Vec<MapEvent> {
        self.gesture_active = false;
        match self.deferred.take() {
            Some(snapshot) => self.render(snapshot),
            None => Vec::new(),
        }
    }

    /// Removes every marker, e.g. when the view is torn down. Any gesture in progress ends with it.
    pub fn clear(&mut self) -> Vec<MapEvent> {
        self.gesture_active = false;
        self.deferred = None;
        let mut ids: Vec<String> = self.active.drain().collect();
        ids.sort();
        ids.into_iter()
            .map(|id| MapEvent::MarkerRemoved { layer: self.kind, id })
            .collect()
    }

    fn render(&mut self, snapshot: Vec<E>) -> Vec<MapEvent> {
        let renderable: Vec<(E, Coordinate)> = snapshot
            .into_iter()
            .filter_map(|entity| match entity.position() {
                Ok(position) => Some((entity, position)),
                Err(e) => {
                    debug!("Dropping {:?} marker {}: {}", self.kind, entity.marker_id(), e);
                    None
                }
            })
            .collect();

        let entities: Vec<&E> = renderable.iter().map(|(entity, _)| entity).collect();
        let plan = reconcile(&self.active, &entities);

        let mut removed: Vec<&String> = plan.to_remove.iter().collect();
        removed.sort();

        // Removals go first so released markers never coexist with their replacements.
        let mut events: Vec<MapEvent> = removed
            .into_iter()
            .map(|id| MapEvent::MarkerRemoved {
                layer: self.kind,
                id: id.clone(),
            })
            .collect();

        let mut seen: HashSet<&str> = HashSet::with_capacity(renderable.len());
        let mut additions = Vec::new();
        let mut updates = Vec::new();
        for (entity, position) in &renderable {
            let id = entity.marker_id();
            if !seen.insert(id) {
                continue;
            }
            let marker = MarkerView {
                id: id.to_string(),
                position: *position,
                label: entity.label(),
                detail: serde_json::to_value(entity).unwrap_or(Value::Null),
            };
            if plan.to_add.contains(id) {
                additions.push(MapEvent::MarkerAdded { layer: self.kind, marker });
            } else {
                updates.push(MapEvent::MarkerUpdated { layer: self.kind, marker });
            }
        }
        events.extend(additions);
        events.extend(updates);

        self.active = seen.into_iter().map(String::from).collect();
        events
    }
}

impl<E: MapEntity> MapEntity for &E {
    fn marker_id(&self) -> &str {
        (*self).marker_id()
    }

    fn position(&self) -> Result<Coordinate> {
        (*self).position()
    }

    fn label(&self) -> String {
        (*self).label()
    }
}

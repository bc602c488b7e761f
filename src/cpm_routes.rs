// Route highlighting for the selected train
use crate::cpm_models::{CPMError, Coordinate, Result, TrainDetail};
use crate::cpm_reconciler::MapEvent;
use log::{debug, warn};
use uuid::Uuid;

/// Journey-ordered path through the stops that have a usable position.
pub fn route_path(detail: &TrainDetail) -> Vec<Coordinate> {
    detail
        .stops
        .iter()
        .filter_map(|stop| match stop.position() {
            Ok(position) => Some(position),
            Err(e) => {
                debug!("Skipping stop {} of train {}: {}", stop.station_name, detail.train_id, e);
                None
            }
        })
        .collect()
}

/// Identifies one click; only the newest ticket may draw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionTicket {
    id: Uuid,
    train_id: String,
}

impl SelectionTicket {
    pub fn train_id(&self) -> &str {
        &self.train_id
    }
}

/// Keeps at most one highlighted route on the map.
#[derive(Debug, Default)]
pub struct RouteHighlighter {
    pending: Option<Uuid>,
    drawn: Option<String>,
}

impl RouteHighlighter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drawn_route(&self) -> Option<&str> {
        self.drawn.as_deref()
    }

    /// Starts a selection: the previous route is cleared before anything new is requested.
    pub fn select(&mut self, train_id: &str) -> (SelectionTicket, Vec<MapEvent>) {
        let mut events = self.clear();
        let ticket = SelectionTicket {
            id: Uuid::new_v4(),
            train_id: train_id.to_string(),
        };
        self.pending = Some(ticket.id);
        events.push(MapEvent::RouteRequested {
            train_id: train_id.to_string(),
        });
        (ticket, events)
    }

    /// Finishes a selection with the detail lookup outcome.
    pub fn complete(
        &mut self,
        ticket: SelectionTicket,
        outcome: Result<TrainDetail>,
    ) -> Result<Vec<MapEvent>> {
        if self.pending != Some(ticket.id) {
            return Err(CPMError::StaleSelection(format!(
                "route for train {} is no longer selected",
                ticket.train_id
            )));
        }
        self.pending = None;

        let detail = match outcome {
            Ok(detail) => detail,
            Err(e) => {
                warn!("No route for train {}: {}", ticket.train_id, e);
                return Ok(self.clear());
            }
        };

        let path = route_path(&detail);
        if path.len() < 2 {
            debug!("Train {} has {} positioned stops, nothing to draw", ticket.train_id, path.len());
            return Ok(self.clear());
        }

        self.drawn = Some(ticket.train_id.clone());
        Ok(vec![MapEvent::RouteDrawn {
            train_id: ticket.train_id,
            path,
        }])
    }

    pub fn clear(&mut self) -> Vec<MapEvent> {
        self.drawn
            .take()
            .map(|train_id| MapEvent::RouteCleared { train_id })
            .into_iter()
            .collect()
    }

    /// Forgets any pending selection so its result is discarded.
    pub fn cancel(&mut self) {
        self.pending = None;
    }
}

// Controllers for the CP departure board and live train map
use crate::cpm_cache::{DetailCache, Snapshot, SnapshotCache};
use crate::cpm_client::{CPMClient, TrainFeed};
use crate::cpm_config::{CPMConfig, Cli, Command};
use crate::cpm_models::{
    CPMError, CPMModels, Coordinate, MapTrain, Result, StationIndex, StationMarker, StationRef,
    TrainDetail, TrainSnapshot,
};
use crate::cpm_railways::{fetch_railway_lines, highlight_line, line_by_id, lines_by_type, lines_to_geojson};
use crate::cpm_reconciler::{LayerKind, MapEvent, MarkerLayer};
use crate::cpm_routes::RouteHighlighter;
use crate::cpm_scheduler::{PollState, RefreshHandle, RefreshTimer};
use crate::cpm_views::CPMViews;
use anyhow::Context;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::join_all;
use geojson::GeoJson;
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::{broadcast, watch};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

const EVENT_BUFFER: usize = 256;
const MAX_SUGGESTIONS: usize = 5;
const STATION_POPUP_TRAINS: usize = 5;

// ============================================================================
// Board Filtering and Station Lookup
// ============================================================================

/// A freshly published departure board.
#[derive(Debug, Clone, Serialize)]
pub struct BoardUpdate {
    pub station_id: String,
    pub trains: Vec<TrainSnapshot>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoardFilter {
    /// Service designations or codes to keep; empty keeps every service.
    pub services: Vec<String>,
    pub train_number: Option<String>,
}

impl BoardFilter {
    pub fn is_active(&self) -> bool {
        !self.services.is_empty() || self.number_query().is_some()
    }

    fn number_query(&self) -> Option<&str> {
        self.train_number
            .as_deref()
            .map(str::trim)
            .filter(|query| !query.is_empty())
    }

    pub fn matches(&self, train: &TrainSnapshot) -> bool {
        let service_ok = self.services.is_empty()
            || self.services.iter().any(|service| {
                service.eq_ignore_ascii_case(&train.service_name)
                    || service.eq_ignore_ascii_case(&train.service_code)
            });
        let number_ok = self
            .number_query()
            .is_none_or(|query| train.train_number.to_string().contains(query));
        service_ok && number_ok
    }

    /// Matching trains in board order.
    pub fn apply(&self, trains: &[TrainSnapshot]) -> Vec<TrainSnapshot> {
        let mut shown: Vec<TrainSnapshot> = trains.iter().filter(|t| self.matches(t)).cloned().collect();
        sort_board(&mut shown);
        shown
    }
}

/// Orders by the first present of etd, eta, departure, arrival. Trains without a time go last.
pub fn sort_board(trains: &mut [TrainSnapshot]) {
    trains.sort_by_key(|train| {
        let time = train.display_time().and_then(CPMModels::parse_clock);
        (time.is_none(), time, train.train_number)
    });
}

/// Service designations present on a board, for the filter options.
pub fn available_services(trains: &[TrainSnapshot]) -> Vec<String> {
    trains
        .iter()
        .map(|train| train.service_name.clone())
        .collect::<BTreeSet<String>>()
        .into_iter()
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StationLookup {
    Found { id: String, name: String },
    /// (display name, id) pairs; empty when nothing matched
    Suggestions(Vec<(String, String)>),
}

/// Resolves a station id or name against the station index.
pub fn lookup_station(index: &StationIndex, input: &str) -> StationLookup {
    let wanted = input.trim();
    let needle = wanted.to_lowercase();

    let by_id = index
        .iter()
        .filter(|(_, id)| id.as_str() == wanted)
        .min_by(|a, b| a.0.cmp(b.0));
    let by_name = || index.iter().find(|(name, _)| name.to_lowercase() == needle);

    if let Some((name, id)) = by_id.or_else(by_name) {
        return StationLookup::Found {
            id: id.clone(),
            name: CPMModels::capitalize_words(name),
        };
    }

    if needle.is_empty() {
        return StationLookup::Suggestions(Vec::new());
    }

    let mut suggestions: Vec<(String, String)> = index
        .iter()
        .filter(|(name, _)| name.to_lowercase().contains(&needle))
        .map(|(name, id)| (CPMModels::capitalize_words(name), id.clone()))
        .collect();
    suggestions.sort();
    suggestions.truncate(MAX_SUGGESTIONS);
    StationLookup::Suggestions(suggestions)
}

// ============================================================================
// Dashboard Context
// ============================================================================

#[derive(Debug, Clone)]
struct BoardContext {
    tag: Uuid,
    station_id: Option<String>,
}

struct MapView {
    trains: MarkerLayer<MapTrain>,
    stations: MarkerLayer<StationMarker>,
    routes: RouteHighlighter,
}

#[derive(Default)]
struct Timers {
    board: Option<RefreshTimer<usize>>,
    map: Option<RefreshTimer<usize>>,
}

struct MapCycle {
    trains: Vec<MapTrain>,
    stations: Vec<StationMarker>,
}

/// State shared with the refresh tasks. Timers live outside it so no task keeps itself alive.
struct Shared<F> {
    feed: F,
    config: CPMConfig,
    station_index: SnapshotCache<String>,
    board: SnapshotCache<TrainSnapshot>,
    map_trains: SnapshotCache<MapTrain>,
    details: DetailCache,
    board_context: RwLock<BoardContext>,
    map_context: RwLock<Uuid>,
    map_view: Mutex<MapView>,
    map_events: broadcast::Sender<MapEvent>,
    board_updates: broadcast::Sender<BoardUpdate>,
}

impl<F: TrainFeed> Shared<F> {
    fn view(&self) -> MutexGuard<'_, MapView> {
        self.map_view.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, events: &[MapEvent]) {
        for event in events {
            // Nobody listening is fine.
            let _ = self.map_events.send(event.clone());
        }
    }

    fn publish_board(&self, tag: Uuid, station_id: &str, mut trains: Vec<TrainSnapshot>) -> Result<usize> {
        let context = self.board_context.read().unwrap_or_else(PoisonError::into_inner);
        if context.tag != tag {
            return Err(CPMError::StaleSelection(format!(
                "board for station {} is no longer shown",
                station_id
            )));
        }

        sort_board(&mut trains);
        self.board
            .replace(trains.iter().map(|t| (t.train_id.clone(), t.clone())).collect());

        let count = trains.len();
        let _ = self.board_updates.send(BoardUpdate {
            station_id: station_id.to_string(),
            trains,
            fetched_at: Utc::now(),
        });
        info!("Updated board for station {} with {} trains", station_id, count);
        Ok(count)
    }

    async fn train_detail(&self, train_id: &str) -> Result<TrainDetail> {
        if let Some(detail) = self.details.get_fresh(train_id) {
            return Ok(detail);
        }
        let detail = self.feed.fetch_train_detail(train_id).await?;
        self.details.insert(detail.clone());
        Ok(detail)
    }

    /// One map cycle: every major station in parallel, then the details of every train found.
    async fn poll_map(&self) -> Result<MapCycle> {
        let stations = &self.config.major_stations;
        let polls = join_all(
            stations
                .iter()
                .map(|station| self.feed.fetch_station_trains(&station.id)),
        )
        .await;

        let mut failed: HashSet<&str> = HashSet::new();
        let mut last_error = None;
        let mut seen: HashSet<String> = HashSet::new();
        let mut reported: Vec<(TrainSnapshot, &str)> = Vec::new();

        for (station, outcome) in stations.iter().zip(polls) {
            match outcome {
                Ok(trains) => {
                    for train in trains {
                        // First station to report a train owns it.
                        if seen.insert(train.train_id.clone()) {
                            reported.push((train, station.id.as_str()));
                        }
                    }
                }
                Err(e) => {
                    warn!("Failed to fetch trains for station {}: {}", station.name, e);
                    failed.insert(station.id.as_str());
                    last_error = Some(e);
                }
            }
        }

        if failed.len() == stations.len() {
            if let Some(e) = last_error {
                return Err(e);
            }
        }

        let previous = self.map_trains.snapshot();
        let details = join_all(
            reported
                .iter()
                .map(|(summary, _)| self.train_detail(&summary.train_id)),
        )
        .await;

        let mut trains = Vec::with_capacity(reported.len());
        for ((summary, source), detail) in reported.iter().zip(details) {
            let train = match detail {
                Ok(detail) => MapTrain::assemble(summary, &detail, source),
                Err(e) => match previous.get(&summary.train_id) {
                    Some(known) => {
                        debug!("Keeping last known position of train {}: {}", summary.train_id, e);
                        known.clone()
                    }
                    None => {
                        debug!("Skipping train {}: {}", summary.train_id, e);
                        continue;
                    }
                },
            };

            match Coordinate::from_parts(train.latitude, train.longitude) {
                Ok(_) => trains.push(train),
                Err(e) => debug!("Train {} not placed: {}", train.train_id, e),
            }
        }

        // Trains of a station that failed this cycle are presumed still running.
        let mut carried: Vec<MapTrain> = previous
            .values()
            .filter(|train| failed.contains(train.source_station.as_str()))
            .filter(|train| seen.insert(train.train_id.clone()))
            .cloned()
            .collect();
        carried.sort_by(|a, b| a.train_id.cmp(&b.train_id));
        trains.extend(carried);

        let stations = self.station_markers(&trains);
        Ok(MapCycle { trains, stations })
    }

    fn station_markers(&self, trains: &[MapTrain]) -> Vec<StationMarker> {
        let index = self.station_index.snapshot();

        self.config
            .major_stations
            .iter()
            .map(|station| {
                let stops_here = |train: &MapTrain| {
                    train
                        .stops
                        .iter()
                        .any(|stop| stop.station_code.as_deref() == Some(station.id.as_str()))
                };

                let train_ids: Vec<String> = trains
                    .iter()
                    .filter(|train| train.source_station == station.id || stops_here(train))
                    .map(|train| train.train_id.clone())
                    .collect();

                // Positions reported by the feed win over the built-in table.
                let reported = trains
                    .iter()
                    .flat_map(|train| train.stops.iter())
                    .filter(|stop| stop.station_code.as_deref() == Some(station.id.as_str()))
                    .find_map(|stop| stop.position().ok());

                let name = index
                    .entries()
                    .iter()
                    .filter(|(_, id)| **id == station.id)
                    .map(|(name, _)| name)
                    .min()
                    .map(|name| CPMModels::capitalize_words(name))
                    .unwrap_or_else(|| station.name.clone());

                StationMarker {
                    station: StationRef {
                        id: station.id.clone(),
                        name,
                        latitude: reported.map_or(station.latitude, |p| p.latitude),
                        longitude: reported.map_or(station.longitude, |p| p.longitude),
                    },
                    has_trains: !train_ids.is_empty(),
                    train_ids: train_ids.into_iter().take(STATION_POPUP_TRAINS).collect(),
                }
            })
            .collect()
    }

    fn publish_map(&self, tag: Uuid, cycle: MapCycle) -> Result<usize> {
        let context = self.map_context.read().unwrap_or_else(PoisonError::into_inner);
        if *context != tag {
            return Err(CPMError::StaleSelection("map view was torn down".to_string()));
        }

        let count = cycle.trains.len();
        self.map_trains.replace(
            cycle
                .trains
                .iter()
                .map(|train| (train.train_id.clone(), train.clone()))
                .collect(),
        );

        let events = {
            let mut view = self.view();
            let mut events = view.stations.apply(cycle.stations);
            events.extend(view.trains.apply(cycle.trains));
            events
        };
        self.emit(&events);

        info!("Updated data for {} trains", count);
        Ok(count)
    }
}

/// Owns the caches, timers and marker layers of one mounted dashboard.
///
/// `switch_station` and `start_map` mount the board and map, `teardown`
/// unmounts both. Results of polls started for a context that is no longer
/// current are discarded.
pub struct DashboardContext<F: TrainFeed> {
    shared: Arc<Shared<F>>,
    timers: Mutex<Timers>,
}

impl<F: TrainFeed> DashboardContext<F> {
    pub fn new(feed: F, config: CPMConfig) -> Self {
        let (map_events, _) = broadcast::channel(EVENT_BUFFER);
        let (board_updates, _) = broadcast::channel(EVENT_BUFFER);

        let shared = Shared {
            feed,
            details: DetailCache::new(config.detail_ttl),
            config,
            station_index: SnapshotCache::new(),
            board: SnapshotCache::new(),
            map_trains: SnapshotCache::new(),
            board_context: RwLock::new(BoardContext {
                tag: Uuid::new_v4(),
                station_id: None,
            }),
            map_context: RwLock::new(Uuid::new_v4()),
            map_view: Mutex::new(MapView {
                trains: MarkerLayer::new(LayerKind::Trains),
                stations: MarkerLayer::new(LayerKind::Stations),
                routes: RouteHighlighter::new(),
            }),
            map_events,
            board_updates,
        };

        DashboardContext {
            shared: Arc::new(shared),
            timers: Mutex::new(Timers::default()),
        }
    }

    fn timers(&self) -> MutexGuard<'_, Timers> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &CPMConfig {
        &self.shared.config
    }

    /// Mounts the whole dashboard: station index, board and map.
    pub async fn init(&self, station_id: &str) {
        if let Err(e) = self.load_station_index().await {
            warn!("Station index unavailable: {}", e);
        }
        self.switch_station(station_id);
        self.start_map();
    }

    /// Loads the station index once. Later calls reuse it.
    pub async fn load_station_index(&self) -> Result<usize> {
        let cached = self.shared.station_index.snapshot();
        if !cached.is_empty() {
            return Ok(cached.len());
        }

        let index = self.shared.feed.fetch_station_index().await?;
        let count = index.len();
        if self.shared.station_index.replace_if_populated(index) {
            info!("Loaded {} stations", count);
        } else {
            warn!("Station index came back empty");
        }
        Ok(count)
    }

    pub fn station_index(&self) -> Arc<Snapshot<String>> {
        self.shared.station_index.snapshot()
    }

    pub fn lookup_station(&self, input: &str) -> StationLookup {
        lookup_station(self.station_index().entries(), input)
    }

    // ------------------------------------------------------------------------
    // Departure board
    // ------------------------------------------------------------------------

    /// Shows another station: the old board is dropped and its late results ignored.
    pub fn switch_station(&self, station_id: &str) -> watch::Receiver<PollState> {
        let tag = Uuid::new_v4();
        {
            let mut context = self
                .shared
                .board_context
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            *context = BoardContext {
                tag,
                station_id: Some(station_id.to_string()),
            };
            self.shared.board.clear();
        }

        let timer = self.spawn_board_timer(tag, station_id.to_string());
        let state = timer.watch_state();
        self.timers().board = Some(timer);
        info!("Showing departures for station {}", station_id);
        state
    }

    fn spawn_board_timer(&self, tag: Uuid, station_id: String) -> RefreshTimer<usize> {
        let poll_shared = self.shared.clone();
        let publish_shared = self.shared.clone();
        let poll_station = station_id.clone();

        RefreshTimer::spawn(
            "board",
            self.shared.config.board_interval,
            move || {
                let shared = poll_shared.clone();
                let station_id = poll_station.clone();
                async move { shared.feed.fetch_station_trains(&station_id).await }.boxed()
            },
            move |trains: Vec<TrainSnapshot>| publish_shared.publish_board(tag, &station_id, trains),
        )
    }

    pub fn current_station(&self) -> Option<String> {
        self.shared
            .board_context
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .station_id
            .clone()
    }

    /// Polls the current station right away through its timer.
    ///
    /// A switch or teardown before the poll lands yields `StaleSelection`.
    pub async fn refresh_board(&self) -> Result<usize> {
        let handle: RefreshHandle<usize> = self
            .timers()
            .board
            .as_ref()
            .map(RefreshTimer::handle)
            .ok_or_else(|| CPMError::StaleSelection("no station is shown".to_string()))?;
        handle.poll_now().await
    }

    /// Current board in display order.
    pub fn board(&self) -> Vec<TrainSnapshot> {
        let mut trains: Vec<TrainSnapshot> = self.shared.board.snapshot().values().cloned().collect();
        sort_board(&mut trains);
        trains
    }

    pub fn board_age(&self) -> Option<chrono::Duration> {
        self.shared.board.age()
    }

    pub fn subscribe_board(&self) -> broadcast::Receiver<BoardUpdate> {
        self.shared.board_updates.subscribe()
    }

    // ------------------------------------------------------------------------
    // Live map
    // ------------------------------------------------------------------------

    pub fn start_map(&self) -> watch::Receiver<PollState> {
        let tag = *self
            .shared
            .map_context
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let poll_shared = self.shared.clone();
        let publish_shared = self.shared.clone();

        let timer = RefreshTimer::spawn(
            "map",
            self.shared.config.map_interval,
            move || {
                let shared = poll_shared.clone();
                async move { shared.poll_map().await }.boxed()
            },
            move |cycle: MapCycle| publish_shared.publish_map(tag, cycle),
        );
        let state = timer.watch_state();
        self.timers().map = Some(timer);
        state
    }

    /// Runs one map cycle right away through the map timer, mounting the map first if needed.
    pub async fn refresh_map(&self) -> Result<usize> {
        let mounted = self.timers().map.as_ref().map(RefreshTimer::handle);
        let handle = match mounted {
            Some(handle) => handle,
            None => {
                self.start_map();
                self.timers()
                    .map
                    .as_ref()
                    .map(RefreshTimer::handle)
                    .ok_or_else(|| CPMError::StaleSelection("map is not mounted".to_string()))?
            }
        };
        handle.poll_now().await
    }

    pub fn map_trains(&self) -> Vec<MapTrain> {
        let mut trains: Vec<MapTrain> = self.shared.map_trains.snapshot().values().cloned().collect();
        trains.sort_by(|a, b| a.train_id.cmp(&b.train_id));
        trains
    }

    pub fn map_age(&self) -> Option<chrono::Duration> {
        self.shared.map_trains.age()
    }

    pub fn subscribe_map(&self) -> broadcast::Receiver<MapEvent> {
        self.shared.map_events.subscribe()
    }

    pub fn begin_map_gesture(&self) {
        let mut view = self.shared.view();
        view.trains.begin_gesture();
        view.stations.begin_gesture();
    }

    /// Applies whatever arrived during the gesture.
    pub fn end_map_gesture(&self) -> Vec<MapEvent> {
        let events = {
            let mut view = self.shared.view();
            let mut events = view.stations.end_gesture();
            events.extend(view.trains.end_gesture());
            events
        };
        self.shared.emit(&events);
        events
    }

    /// Highlights the route of a clicked train, replacing any previous route.
    ///
    /// Returns every event emitted for this selection. A selection overtaken by
    /// a newer click yields `StaleSelection` and changes nothing.
    pub async fn select_train(&self, train_id: &str) -> Result<Vec<MapEvent>> {
        let (ticket, mut events) = self.shared.view().routes.select(train_id);
        self.shared.emit(&events);

        let outcome = self.shared.feed.fetch_train_detail(train_id).await;
        if let Ok(detail) = &outcome {
            self.shared.details.insert(detail.clone());
        }

        let completed = self.shared.view().routes.complete(ticket, outcome);
        match completed {
            Ok(drawn) => {
                self.shared.emit(&drawn);
                events.extend(drawn);
                Ok(events)
            }
            Err(e) => {
                debug!("Discarding route: {}", e);
                Err(e)
            }
        }
    }

    pub fn cached_detail(&self, train_id: &str) -> Option<TrainDetail> {
        self.shared.details.get_fresh(train_id)
    }

    /// Unmounts the dashboard: timers stop, in-flight results are ignored and every marker is removed.
    pub fn teardown(&self) -> Vec<MapEvent> {
        {
            let mut timers = self.timers();
            timers.board = None;
            timers.map = None;
        }
        {
            let mut context = self
                .shared
                .board_context
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            *context = BoardContext {
                tag: Uuid::new_v4(),
                station_id: None,
            };
            self.shared.board.clear();
        }
        self.shared.map_trains.clear();
        *self
            .shared
            .map_context
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Uuid::new_v4();

        let events = {
            let mut view = self.shared.view();
            view.routes.cancel();
            let mut events = view.routes.clear();
            events.extend(view.trains.clear());
            events.extend(view.stations.clear());
            events
        };
        self.shared.emit(&events);
        debug!("Dashboard torn down");
        events
    }
}

// ============================================================================
// Command Line Front End
// ============================================================================

pub struct CPMControllers;

impl CPMControllers {
    /// Runs the selected command until it finishes or Ctrl-C is pressed.
    pub async fn run(cli: Cli) -> anyhow::Result<()> {
        let config = CPMConfig::from_cli(&cli);
        let client = CPMClient::new(&config)?;
        let json = cli.json;

        match cli.command {
            Command::Board {
                station,
                services,
                train_number,
            } => {
                let filter = BoardFilter {
                    services,
                    train_number,
                };
                Self::run_board(DashboardContext::new(client, config), &station, filter, json).await
            }
            Command::Map => Self::run_map(DashboardContext::new(client, config), json).await,
            Command::Route { train_id } => {
                Self::run_route(DashboardContext::new(client, config), &train_id, json).await
            }
            Command::Lines { output, line } => Self::run_lines(&client, output, line, json).await,
        }
    }

    async fn run_board<F: TrainFeed>(
        context: DashboardContext<F>,
        station: &str,
        filter: BoardFilter,
        json: bool,
    ) -> anyhow::Result<()> {
        if !json {
            CPMViews::board_welcome();
        }

        if let Err(e) = context.load_station_index().await {
            CPMViews::network_error(&e.to_string());
        }

        let (station_id, station_name) = match context.lookup_station(station) {
            StationLookup::Found { id, name } => (id, name),
            // Without an index the input can only be taken as an id.
            StationLookup::Suggestions(_) if context.station_index().is_empty() => {
                (station.trim().to_string(), station.trim().to_string())
            }
            StationLookup::Suggestions(suggestions) => {
                CPMViews::station_not_found(station, &suggestions);
                return Ok(());
            }
        };

        let mut updates = BroadcastStream::new(context.subscribe_board());
        let mut state = context.switch_station(&station_id);

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                Some(update) = updates.next() => match update {
                    Ok(update) => {
                        let shown = filter.apply(&update.trains);
                        if json {
                            CPMViews::print_json(&BoardUpdate { trains: shown, ..update });
                        } else {
                            CPMViews::show_board(
                                &station_name,
                                &shown,
                                &filter,
                                &available_services(&update.trains),
                                update.fetched_at,
                            );
                        }
                    }
                    Err(e) => debug!("Board subscriber fell behind: {}", e),
                },
                Ok(()) = state.changed() => {
                    let current = *state.borrow_and_update();
                    if current == PollState::Failed && !json {
                        CPMViews::refresh_failed("departure board", context.board_age());
                    }
                }
                _ = &mut shutdown => break,
            }
        }

        context.teardown();
        if !json {
            CPMViews::goodbye_message();
        }
        Ok(())
    }

    async fn run_map<F: TrainFeed>(context: DashboardContext<F>, json: bool) -> anyhow::Result<()> {
        if !json {
            CPMViews::map_welcome(&context.config().major_stations);
        }

        if let Err(e) = context.load_station_index().await {
            warn!("Station names unavailable: {}", e);
        }

        let mut events = BroadcastStream::new(context.subscribe_map());
        let mut state = context.start_map();

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                Some(event) = events.next() => match event {
                    Ok(event) if json => CPMViews::print_json(&event),
                    Ok(event) => CPMViews::show_map_event(&event),
                    Err(e) => debug!("Map subscriber fell behind: {}", e),
                },
                Ok(()) = state.changed() => {
                    let current = *state.borrow_and_update();
                    match current {
                        PollState::Idle if !json => CPMViews::map_summary(&context.map_trains()),
                        PollState::Failed if !json => CPMViews::refresh_failed("train map", context.map_age()),
                        _ => {}
                    }
                }
                _ = &mut shutdown => break,
            }
        }

        context.teardown();
        if !json {
            CPMViews::goodbye_message();
        }
        Ok(())
    }

    async fn run_route<F: TrainFeed>(
        context: DashboardContext<F>,
        train_id: &str,
        json: bool,
    ) -> anyhow::Result<()> {
        let events = match context.select_train(train_id).await {
            Ok(events) => events,
            Err(e) => {
                CPMViews::network_error(&e.to_string());
                return Ok(());
            }
        };

        if json {
            for event in &events {
                CPMViews::print_json(event);
            }
            return Ok(());
        }

        let path = events
            .iter()
            .find_map(|event| match event {
                MapEvent::RouteDrawn { path, .. } => Some(path.clone()),
                _ => None,
            })
            .unwrap_or_default();

        match context.cached_detail(train_id) {
            Some(detail) => CPMViews::show_route(&detail, &path),
            None => CPMViews::network_error(&format!("No details available for train {}", train_id)),
        }
        Ok(())
    }

    async fn run_lines(
        client: &CPMClient,
        output: Option<PathBuf>,
        line_id: Option<String>,
        json: bool,
    ) -> anyhow::Result<()> {
        if !json {
            CPMViews::show_loading("Fetching railway lines from OpenStreetMap");
        }

        let lines = match fetch_railway_lines(client).await {
            Ok(lines) => lines,
            Err(e) => {
                CPMViews::clear_loading();
                CPMViews::network_error(&e.to_string());
                return Ok(());
            }
        };
        if !json {
            CPMViews::clear_loading();
        }

        if let Some(line_id) = line_id {
            match line_by_id(&lines, &line_id) {
                Some(line) if json => CPMViews::print_json(&GeoJson::from(highlight_line(line))),
                Some(line) => CPMViews::show_line(line),
                None => CPMViews::line_not_found(&line_id),
            }
            return Ok(());
        }

        let geojson = GeoJson::from(lines_to_geojson(&lines));

        match output {
            Some(path) => {
                let body = serde_json::to_string_pretty(&geojson)
                    .context("Failed to serialize railway lines")?;
                std::fs::write(&path, body)
                    .with_context(|| format!("Failed to write railway lines to {}", path.display()))?;
                if !json {
                    CPMViews::show_lines_summary(&lines_by_type(&lines), Some(&path));
                }
            }
            None if json => println!("{}", serde_json::to_string(&geojson)?),
            None => CPMViews::show_lines_summary(&lines_by_type(&lines), None),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpm_models::StopInfo;
    use crate::cpm_reconciler::MarkerView;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct FakeFeed {
        index: StationIndex,
        boards: Mutex<HashMap<String, Result<Vec<TrainSnapshot>>>>,
        details: Mutex<HashMap<String, Result<TrainDetail>>>,
        latency: Duration,
        detail_calls: AtomicUsize,
    }

    impl FakeFeed {
        fn board(&self, station_id: &str, trains: Result<Vec<TrainSnapshot>>) {
            self.boards.lock().unwrap().insert(station_id.to_string(), trains);
        }

        fn detail(&self, detail: TrainDetail) {
            self.details
                .lock()
                .unwrap()
                .insert(detail.train_id.clone(), Ok(detail));
        }
    }

    impl TrainFeed for FakeFeed {
        async fn fetch_station_index(&self) -> Result<StationIndex> {
            Ok(self.index.clone())
        }

        async fn fetch_station_trains(&self, station_id: &str) -> Result<Vec<TrainSnapshot>> {
            tokio::time::sleep(self.latency).await;
            let boards = self.boards.lock().unwrap();
            boards
                .get(station_id)
                .cloned()
                .unwrap_or_else(|| Err(CPMError::UpstreamError(format!("unknown station {}", station_id))))
        }

        async fn fetch_train_detail(&self, train_id: &str) -> Result<TrainDetail> {
            self.detail_calls.fetch_add(1, Ordering::SeqCst);
            let details = self.details.lock().unwrap();
            details
                .get(train_id)
                .cloned()
                .unwrap_or_else(|| Err(CPMError::UpstreamTimeout(format!("train {}", train_id))))
        }
    }

    fn train(number: u32, service: &str, etd: Option<&str>) -> TrainSnapshot {
        TrainSnapshot {
            train_id: number.to_string(),
            train_number: number,
            service_code: service.chars().next().map(String::from).unwrap_or_default(),
            service_name: service.to_string(),
            origin_name: "PORTO CAMPANHA".to_string(),
            destination_name: "LISBOA ORIENTE".to_string(),
            scheduled_arrival: None,
            scheduled_departure: None,
            estimated_arrival: None,
            estimated_departure: etd.map(String::from),
            delay_minutes: 0,
            platform: None,
            occupancy: None,
            status: None,
        }
    }

    fn stop(code: &str, lat: f64, lon: f64) -> StopInfo {
        StopInfo {
            station_code: Some(code.to_string()),
            station_name: code.to_string(),
            scheduled_arrival: None,
            scheduled_departure: None,
            estimated_arrival: None,
            estimated_departure: None,
            platform: None,
            latitude: Some(lat),
            longitude: Some(lon),
        }
    }

    fn detail(number: u32, lat: f64, lon: f64, stops: Vec<StopInfo>) -> TrainDetail {
        TrainDetail {
            train_id: number.to_string(),
            train_number: Some(number),
            service_code: None,
            delay_minutes: 0,
            latitude: Some(lat),
            longitude: Some(lon),
            status: "IN_TRANSIT".to_string(),
            occupancy: None,
            stops,
        }
    }

    fn station(id: &str, name: &str, lat: f64, lon: f64) -> StationRef {
        StationRef {
            id: id.to_string(),
            name: name.to_string(),
            latitude: lat,
            longitude: lon,
        }
    }

    fn two_station_config() -> CPMConfig {
        CPMConfig {
            major_stations: vec![
                station("94-1", "Lisboa Oriente", 38.7681, -9.0978),
                station("94-2", "Coimbra-B", 40.2033, -8.4103),
            ],
            ..CPMConfig::default()
        }
    }

    /// Station 94-1 reports 100 and 200, station 94-2 reports 200 again and 300.
    fn map_feed() -> FakeFeed {
        let feed = FakeFeed::default();
        feed.board("94-1", Ok(vec![train(100, "Alfa Pendular", None), train(200, "Intercidades", None)]));
        feed.board("94-2", Ok(vec![train(200, "Intercidades", None), train(300, "Regional", None)]));
        feed.detail(detail(
            100,
            39.5,
            -8.7,
            vec![stop("94-1", 38.7681, -9.0978), stop("94-2", 40.21, -8.42)],
        ));
        feed.detail(detail(200, 38.9, -9.0, Vec::new()));
        feed.detail(detail(300, 90.0, 0.0, Vec::new()));
        feed
    }

    fn drain<T: Clone>(receiver: &mut broadcast::Receiver<T>) -> Vec<T> {
        let mut received = Vec::new();
        while let Ok(item) = receiver.try_recv() {
            received.push(item);
        }
        received
    }

    #[test]
    fn board_is_ordered_by_first_known_time() {
        let mut eta_only = train(4, "Regional", None);
        eta_only.estimated_arrival = Some("09:15".to_string());
        let mut scheduled = train(3, "Regional", None);
        scheduled.scheduled_departure = Some("10:00".to_string());

        let mut board = vec![
            train(1, "Alfa Pendular", Some("10:30")),
            train(2, "Urbanos", None),
            eta_only,
            scheduled,
        ];
        sort_board(&mut board);

        let order: Vec<u32> = board.iter().map(|t| t.train_number).collect();
        assert_eq!(order, vec![4, 3, 1, 2]);
    }

    #[test]
    fn board_filter_by_service_and_number() {
        let board = vec![
            train(120, "Alfa Pendular", Some("10:30")),
            train(512, "Intercidades", Some("09:00")),
            train(4012, "Alfa Pendular", Some("08:00")),
        ];

        let by_service = BoardFilter {
            services: vec!["alfa pendular".to_string()],
            train_number: None,
        };
        let numbers: Vec<u32> = by_service.apply(&board).iter().map(|t| t.train_number).collect();
        assert_eq!(numbers, vec![4012, 120]);

        let by_number = BoardFilter {
            services: Vec::new(),
            train_number: Some(" 12 ".to_string()),
        };
        let numbers: Vec<u32> = by_number.apply(&board).iter().map(|t| t.train_number).collect();
        assert_eq!(numbers, vec![4012, 512, 120]);

        assert!(!BoardFilter::default().is_active());
        assert_eq!(
            available_services(&board),
            vec!["Alfa Pendular".to_string(), "Intercidades".to_string()]
        );
    }

    #[test]
    fn station_lookup_prefers_exact_matches() {
        let index: StationIndex = HashMap::from([
            ("LISBOA ORIENTE".to_string(), "94-31039".to_string()),
            ("LISBOA SANTA APOLONIA".to_string(), "94-30007".to_string()),
            ("FARO".to_string(), "94-73007".to_string()),
        ]);

        assert_eq!(
            lookup_station(&index, "faro"),
            StationLookup::Found {
                id: "94-73007".to_string(),
                name: "Faro".to_string()
            }
        );
        assert_eq!(
            lookup_station(&index, "94-31039"),
            StationLookup::Found {
                id: "94-31039".to_string(),
                name: "Lisboa Oriente".to_string()
            }
        );
        assert_eq!(
            lookup_station(&index, "lisboa"),
            StationLookup::Suggestions(vec![
                ("Lisboa Oriente".to_string(), "94-31039".to_string()),
                ("Lisboa Santa Apolonia".to_string(), "94-30007".to_string()),
            ])
        );
        assert_eq!(lookup_station(&index, "Braga"), StationLookup::Suggestions(Vec::new()));
    }

    #[tokio::test]
    async fn map_cycle_dedups_trains_and_marks_stations() {
        let context = DashboardContext::new(map_feed(), two_station_config());
        let mut events = context.subscribe_map();

        assert_eq!(context.refresh_map().await.unwrap(), 2);

        let trains = context.map_trains();
        let ids: Vec<&str> = trains.iter().map(|t| t.train_id.as_str()).collect();
        assert_eq!(ids, vec!["100", "200"]);
        assert!(trains.iter().all(|t| t.source_station == "94-1"));

        let events = drain(&mut events);
        let added_stations: Vec<&MarkerView> = events
            .iter()
            .filter_map(|event| match event {
                MapEvent::MarkerAdded { layer: LayerKind::Stations, marker } => Some(marker),
                _ => None,
            })
            .collect();
        assert_eq!(added_stations.len(), 2);

        let coimbra = added_stations.iter().find(|m| m.id == "94-2").unwrap();
        assert_eq!(coimbra.position.latitude, 40.21);
        assert_eq!(coimbra.detail["has_trains"], serde_json::json!(true));
        assert_eq!(coimbra.detail["train_ids"], serde_json::json!(["100"]));

        let added_trains = events
            .iter()
            .filter(|event| matches!(event, MapEvent::MarkerAdded { layer: LayerKind::Trains, .. }))
            .count();
        assert_eq!(added_trains, 2);
    }

    #[tokio::test]
    async fn failed_station_keeps_its_trains_until_every_station_fails() {
        let feed = map_feed();
        feed.detail(detail(300, 40.5, -8.5, Vec::new()));
        let context = DashboardContext::new(feed, two_station_config());

        assert_eq!(context.refresh_map().await.unwrap(), 3);

        context
            .shared
            .feed
            .board("94-2", Err(CPMError::UpstreamTimeout("station 94-2".to_string())));
        assert_eq!(context.refresh_map().await.unwrap(), 3);
        let carried = context.map_trains().into_iter().find(|t| t.train_id == "300").unwrap();
        assert_eq!(carried.source_station, "94-2");

        context
            .shared
            .feed
            .board("94-1", Err(CPMError::UpstreamError("station 94-1".to_string())));
        assert!(context.refresh_map().await.is_err());
        assert_eq!(context.map_trains().len(), 3);
    }

    #[tokio::test]
    async fn train_details_are_reused_while_fresh() {
        let context = DashboardContext::new(map_feed(), two_station_config());
        context.refresh_map().await.unwrap();
        context.refresh_map().await.unwrap();

        // 100 and 200 are cached; 300 has no usable position but was fetched once and cached too.
        assert_eq!(context.shared.feed.detail_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn board_timer_publishes_sorted_updates() {
        let feed = FakeFeed::default();
        feed.board(
            "94-1",
            Ok(vec![train(2, "Regional", Some("11:00")), train(1, "Regional", Some("10:00"))]),
        );
        let context = DashboardContext::new(feed, two_station_config());
        let mut updates = context.subscribe_board();

        context.switch_station("94-1");
        let update = updates.recv().await.unwrap();

        assert_eq!(update.station_id, "94-1");
        let order: Vec<u32> = update.trains.iter().map(|t| t.train_number).collect();
        assert_eq!(order, vec![1, 2]);
        assert_eq!(context.board().len(), 2);
        assert!(context.board_age().is_some());
        assert_eq!(context.current_station().as_deref(), Some("94-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn switching_station_discards_results_for_the_old_one() {
        let feed = FakeFeed {
            latency: Duration::from_secs(5),
            ..FakeFeed::default()
        };
        feed.board("94-1", Ok(vec![train(100, "Regional", None)]));
        feed.board("94-2", Ok(vec![train(300, "Regional", None)]));
        let context = DashboardContext::new(feed, two_station_config());

        context.switch_station("94-1");
        let (stale, _) = tokio::join!(context.refresh_board(), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            context.switch_station("94-2");
        });

        assert!(matches!(stale, Err(CPMError::StaleSelection(_))));
        assert!(context.board().iter().all(|t| t.train_id != "100"));

        // The 94-2 poll started with the switch at 1s and lands at 6s.
        tokio::time::sleep(Duration::from_secs(6)).await;
        let ids: Vec<String> = context.board().into_iter().map(|t| t.train_id).collect();
        assert_eq!(ids, vec!["300".to_string()]);
    }

    #[tokio::test]
    async fn failed_route_lookup_clears_the_previous_route() {
        let context = DashboardContext::new(map_feed(), two_station_config());
        let mut events = context.subscribe_map();

        let drawn = context.select_train("100").await.unwrap();
        assert!(drawn.iter().any(|e| matches!(e, MapEvent::RouteDrawn { train_id, .. } if train_id == "100")));

        let failed = context.select_train("999").await.unwrap();
        assert_eq!(
            failed,
            vec![
                MapEvent::RouteCleared { train_id: "100".to_string() },
                MapEvent::RouteRequested { train_id: "999".to_string() },
            ]
        );

        let broadcast = drain(&mut events);
        assert!(!broadcast.iter().any(|e| matches!(e, MapEvent::RouteDrawn { train_id, .. } if train_id == "999")));
        assert!(context.cached_detail("100").is_some());
    }

    #[tokio::test]
    async fn gesture_defers_marker_updates() {
        let context = DashboardContext::new(map_feed(), two_station_config());
        let mut events = context.subscribe_map();

        context.begin_map_gesture();
        context.refresh_map().await.unwrap();
        assert!(drain(&mut events).is_empty());

        let applied = context.end_map_gesture();
        assert_eq!(applied.len(), 4);
        assert_eq!(drain(&mut events).len(), 4);
    }

    #[tokio::test]
    async fn teardown_clears_the_map_and_ignores_late_results() {
        let context = DashboardContext::new(map_feed(), two_station_config());
        context.refresh_map().await.unwrap();
        context.select_train("100").await.unwrap();

        let events = context.teardown();
        assert_eq!(events[0], MapEvent::RouteCleared { train_id: "100".to_string() });
        let removed = events
            .iter()
            .filter(|e| matches!(e, MapEvent::MarkerRemoved { .. }))
            .count();
        assert_eq!(removed, 4);
        assert_eq!(context.current_station(), None);
        assert!(context.map_trains().is_empty());
        assert!(context.map_age().is_none());
        assert!(matches!(
            context.refresh_board().await,
            Err(CPMError::StaleSelection(_))
        ));
    }

    #[tokio::test]
    async fn remounted_map_starts_clean_after_teardown_mid_gesture() {
        let feed = map_feed();
        feed.detail(detail(300, 40.5, -8.5, Vec::new()));
        let context = DashboardContext::new(feed, two_station_config());
        assert_eq!(context.refresh_map().await.unwrap(), 3);
        context.begin_map_gesture();
        context.teardown();

        // Station 94-2 is down; nothing of the old map may be carried into the new one.
        context
            .shared
            .feed
            .board("94-2", Err(CPMError::UpstreamTimeout("station 94-2".to_string())));
        let mut events = context.subscribe_map();
        assert_eq!(context.refresh_map().await.unwrap(), 2);

        let added = drain(&mut events)
            .into_iter()
            .filter(|event| matches!(event, MapEvent::MarkerAdded { .. }))
            .count();
        assert_eq!(added, 4);
        let ids: Vec<String> = context.map_trains().into_iter().map(|t| t.train_id).collect();
        assert_eq!(ids, vec!["100".to_string(), "200".to_string()]);
    }

    #[tokio::test]
    async fn station_index_loads_once_and_names_markers() {
        let feed = FakeFeed {
            index: HashMap::from([("COIMBRA B".to_string(), "94-2".to_string())]),
            ..map_feed()
        };
        let context = DashboardContext::new(feed, two_station_config());

        assert_eq!(context.load_station_index().await.unwrap(), 1);
        assert_eq!(context.load_station_index().await.unwrap(), 1);
        assert!(matches!(
            context.lookup_station("coimbra b"),
            StationLookup::Found { ref id, .. } if id == "94-2"
        ));

        let mut events = context.subscribe_map();
        context.refresh_map().await.unwrap();
        let named = drain(&mut events).into_iter().any(|event| {
            matches!(event, MapEvent::MarkerAdded { layer: LayerKind::Stations, marker }
                if marker.id == "94-2" && marker.label == "Coimbra B")
        });
        assert!(named);
    }
}

//! # Guard Engine
//!
//! Ties the geometry modules, the record store and the escalator together.
//!
//! ## Journey lifecycle
//!
//! 1. [`GuardEngine::start_tracking`] opens a journey on a [`TrackingSession`]
//! 2. Every sample goes through [`GuardEngine::record_sample`] (or a
//!    [`GuardEngine::run_monitor`] loop fed from a channel): append, optionally
//!    pick an expected route, check for a deviation, hand deviations to the
//!    escalator on a background task
//! 3. [`GuardEngine::stop_tracking`] closes the journey and runs
//!    [`GuardEngine::analyze_journey`] once, which either strengthens a known
//!    route or learns a new one
//!
//! Route confidence updates are serialised per route id, so two journeys
//! finishing on the same route never lose an update.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{debug, error, info, warn};
use rstar::{RTree, RTreeObject, AABB};
use tokio::sync::{mpsc, watch};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::deviation::detect_deviation;
use crate::error::{OptionExt, RecordKind, Result};
use crate::escalation::{EscalationState, Escalator, ResponseOutcome};
use crate::geo_utils::{haversine_distance, meters_to_degrees, polyline_length};
use crate::matching::route_similarity;
use crate::notify::{LogNotifier, Notifier};
use crate::session::TrackingSession;
use crate::simplify::simplify_trace;
use crate::store::{GuardStore, MemoryStore, NewDeviation, NewRoute};
use crate::{
    now_millis, trace_positions, AlertEvent, AlertSeverity, DeviationEvent, DeviationResponse,
    GeoPoint, GuardConfig, Journey, Route, TracePoint, TransportMode,
};

// ============================================================================
// Outcomes
// ============================================================================

/// Result of matching a finished journey against known routes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchOutcome {
    pub route_id: i64,
    pub is_new_route: bool,
    /// Best similarity score; 0.0 for a newly learned route
    pub similarity: f64,
}

/// What journey analysis did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AnalysisOutcome {
    /// Trace below the minimum points or distance; nothing was changed
    TooShort { point_count: usize, distance: f64 },
    Matched(MatchOutcome),
}

impl AnalysisOutcome {
    pub fn matched(&self) -> Option<&MatchOutcome> {
        match self {
            AnalysisOutcome::Matched(outcome) => Some(outcome),
            AnalysisOutcome::TooShort { .. } => None,
        }
    }
}

/// Returned by [`GuardEngine::stop_tracking`].
#[derive(Debug, Clone, PartialEq)]
pub struct JourneySummary {
    /// The closed journey, after analysis
    pub journey: Journey,
    pub analysis: Option<AnalysisOutcome>,
    /// Set when analysis failed; the journey is closed regardless
    pub analysis_error: Option<String>,
    pub deviation_count: usize,
}

/// Counters from one [`GuardEngine::run_monitor`] loop.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MonitorReport {
    pub samples_processed: usize,
    /// Ids of deviation events raised by this loop
    pub deviations: Vec<i64>,
    /// Samples whose processing failed and were skipped
    pub failures: usize,
    /// Samples still queued when the stop signal fired
    pub discarded: usize,
    /// True when the loop ended on the stop signal rather than a closed stream
    pub stopped: bool,
}

/// Engine statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    pub route_count: usize,
    /// Deviations whose escalation timer may still fire
    pub open_escalations: usize,
}

/// Route start indexed for suggestion lookups.
#[derive(Debug, Clone)]
struct RouteStart {
    route_id: i64,
    lng: f64,
    lat: f64,
}

impl RTreeObject for RouteStart {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point([self.lng, self.lat])
    }
}

// ============================================================================
// Guard Engine
// ============================================================================

/// Route learning, live deviation monitoring and alert escalation.
pub struct GuardEngine {
    store: Arc<dyn GuardStore>,
    escalator: Escalator,
    config: GuardConfig,
    route_locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl GuardEngine {
    /// Create an engine over the given collaborators. Fails on an invalid config.
    pub fn new(
        store: Arc<dyn GuardStore>,
        notifier: Arc<dyn Notifier>,
        config: GuardConfig,
    ) -> Result<Self> {
        config.validate()?;
        let escalator = Escalator::new(store.clone(), notifier, &config);
        info!(
            "[RouteGuard] Engine ready (deviation threshold {} m, escalation timeout {} s)",
            config.deviation_threshold, config.escalation_timeout_secs
        );
        Ok(Self {
            store,
            escalator,
            config,
            route_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Engine backed by a [`MemoryStore`] that only logs notifications.
    pub fn in_memory(config: GuardConfig) -> Result<Self> {
        Self::new(Arc::new(MemoryStore::new()), Arc::new(LogNotifier), config)
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn GuardStore> {
        &self.store
    }

    pub fn escalator(&self) -> &Escalator {
        &self.escalator
    }

    // ========================================================================
    // Journey lifecycle
    // ========================================================================

    /// Open a new journey on `session`.
    pub fn start_tracking(
        &self,
        session: &mut TrackingSession,
        started_at: i64,
        mode: TransportMode,
    ) -> Result<Journey> {
        session.ensure_idle()?;
        let journey = self.store.create_journey(started_at, mode)?;
        session.begin(journey.id)?;
        info!(
            "[RouteGuard] Started journey {} ({})",
            journey.id,
            mode.as_str()
        );
        Ok(journey)
    }

    /// Record a sample for the session's open journey.
    pub async fn record_sample(
        &self,
        session: &mut TrackingSession,
        point: TracePoint,
    ) -> Result<Option<DeviationEvent>> {
        let journey_id = session.open_journey()?;
        let deviation = self.process_sample(journey_id, point).await?;
        session.note_sample();
        Ok(deviation)
    }

    /// Append a sample to a journey and check it against the expected route.
    ///
    /// The sample is stored before the check runs, so the check always sees
    /// the full trace. Samples for a closed journey are ignored. A deviation
    /// is returned as soon as it is persisted; its escalation runs on a
    /// spawned task, so a slow notifier never holds up the next sample.
    pub async fn process_sample(
        &self,
        journey_id: i64,
        point: TracePoint,
    ) -> Result<Option<DeviationEvent>> {
        let mut journey = self
            .store
            .get_journey(journey_id)?
            .ok_or_missing(RecordKind::Journey, journey_id)?;
        if !journey.is_open() {
            debug!(
                "[RouteGuard] Ignoring sample for closed journey {}",
                journey_id
            );
            return Ok(None);
        }

        let stored = self.store.append_journey_point(journey_id, &point)?;
        let trace = trace_positions(&self.store.journey_points(journey_id)?);

        if journey.matched_route_id.is_none() && self.config.auto_assign_route && trace.len() == 1
        {
            if let Some(route) = self.suggest_route(stored.geo())? {
                journey = self.assign_route(journey_id, route.id)?;
            }
        }

        let deviation =
            self.deviation_for_trace(&journey, &trace, stored.geo(), stored.timestamp)?;
        let Some(deviation) = deviation else {
            return Ok(None);
        };

        self.spawn_escalation(&deviation);
        Ok(Some(deviation))
    }

    fn spawn_escalation(&self, deviation: &DeviationEvent) {
        let escalator = self.escalator.clone();
        let severity = self.config.default_severity;
        let deviation = deviation.clone();
        tokio::spawn(async move {
            if let Err(e) = escalator.raise(&deviation, severity).await {
                error!(
                    "[RouteGuard] Escalation of deviation {} failed: {}",
                    deviation.id, e
                );
            }
        });
    }

    /// Serial monitoring loop for one journey.
    ///
    /// Processes samples in arrival order. A failed sample is logged and
    /// skipped. The loop ends when `stop` flips to true (queued samples are
    /// dropped) or when the sample stream closes. Escalations already raised
    /// keep running after the loop ends.
    pub async fn run_monitor(
        &self,
        journey_id: i64,
        mut samples: mpsc::Receiver<TracePoint>,
        mut stop: watch::Receiver<bool>,
    ) -> MonitorReport {
        let mut report = MonitorReport::default();
        let already_stopped = *stop.borrow();

        if !already_stopped {
            loop {
                tokio::select! {
                    biased;

                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            report.stopped = true;
                            break;
                        }
                    }
                    sample = samples.recv() => {
                        let Some(point) = sample else {
                            break;
                        };
                        report.samples_processed += 1;
                        match self.process_sample(journey_id, point).await {
                            Ok(Some(deviation)) => report.deviations.push(deviation.id),
                            Ok(None) => {}
                            Err(e) => {
                                report.failures += 1;
                                warn!(
                                    "[Monitor] Journey {}: sample at {} failed: {}",
                                    journey_id, point.timestamp, e
                                );
                            }
                        }
                    }
                }
            }
        } else {
            report.stopped = true;
        }

        if report.stopped {
            samples.close();
            while samples.try_recv().is_ok() {
                report.discarded += 1;
            }
        }

        info!(
            "[Monitor] Journey {} monitor finished: {} samples, {} deviations, {} failures, {} discarded",
            journey_id,
            report.samples_processed,
            report.deviations.len(),
            report.failures,
            report.discarded
        );
        report
    }

    /// Close the session's journey and analyse it.
    ///
    /// The journey record is closed before the session ends (which stops any
    /// monitor loop), so a failed write leaves the session open for a retry.
    /// An analysis failure is logged and reported in the summary; the journey
    /// stays closed.
    pub async fn stop_tracking(
        &self,
        session: &mut TrackingSession,
        ended_at: i64,
    ) -> Result<JourneySummary> {
        let journey_id = session.open_journey()?;

        let mut journey = self
            .store
            .get_journey(journey_id)?
            .ok_or_missing(RecordKind::Journey, journey_id)?;
        let trace = trace_positions(&self.store.journey_points(journey_id)?);
        journey.end_time = Some(ended_at.max(journey.start_time));
        journey.distance = polyline_length(&trace);
        self.store.update_journey(&journey)?;
        session.end()?;

        info!(
            "[RouteGuard] Stopped journey {} ({} points, {:.0} m)",
            journey_id,
            trace.len(),
            journey.distance
        );

        let (analysis, analysis_error) = match self.analyze_journey(journey_id).await {
            Ok(outcome) => (Some(outcome), None),
            Err(e) => {
                warn!("[RouteGuard] Analysis of journey {} failed: {}", journey_id, e);
                (None, Some(e.to_string()))
            }
        };

        let journey = self.store.get_journey(journey_id)?.unwrap_or(journey);
        let deviation_count = self.store.journey_deviations(journey_id)?.len();

        Ok(JourneySummary {
            journey,
            analysis,
            analysis_error,
            deviation_count,
        })
    }

    // ========================================================================
    // Route matching
    // ========================================================================

    /// Match a journey against every known route, or learn a new route.
    pub async fn analyze_journey(&self, journey_id: i64) -> Result<AnalysisOutcome> {
        let mut journey = self
            .store
            .get_journey(journey_id)?
            .ok_or_missing(RecordKind::Journey, journey_id)?;
        let raw = self.store.journey_points(journey_id)?;
        let trace = trace_positions(&raw);
        let distance = polyline_length(&trace);

        if trace.len() < self.config.min_analysis_points || distance < self.config.min_route_distance
        {
            debug!(
                "[RouteGuard] Journey {} too short to analyse ({} points, {:.0} m)",
                journey_id,
                trace.len(),
                distance
            );
            return Ok(AnalysisOutcome::TooShort {
                point_count: trace.len(),
                distance,
            });
        }

        let duration = journey
            .duration_secs()
            .unwrap_or_else(|| trace_span_secs(&raw));
        let routes = self.store.list_routes()?;

        let best = best_match(&self.score_routes(&trace, &routes));
        let outcome = match best {
            Some((route_id, similarity)) if similarity >= self.config.similarity_threshold => {
                let route = self.apply_match(route_id, duration)?;
                info!(
                    "[RouteGuard] Journey {} matched route {} (similarity {:.3}, confidence {:.2}, traveled {}x)",
                    journey_id, route.id, similarity, route.confidence_score, route.times_traveled
                );
                MatchOutcome {
                    route_id,
                    is_new_route: false,
                    similarity,
                }
            }
            _ => {
                let route = self.learn_route(&trace, duration, routes.len())?;
                info!(
                    "[RouteGuard] Journey {} learned new route {} ({} points)",
                    journey_id,
                    route.id,
                    route.points.len()
                );
                MatchOutcome {
                    route_id: route.id,
                    is_new_route: true,
                    similarity: 0.0,
                }
            }
        };

        journey.matched_route_id = Some(outcome.route_id);
        self.store.update_journey(&journey)?;
        Ok(AnalysisOutcome::Matched(outcome))
    }

    #[cfg(not(feature = "parallel"))]
    fn score_routes(&self, trace: &[GeoPoint], routes: &[Route]) -> Vec<(i64, f64)> {
        routes
            .iter()
            .map(|r| (r.id, route_similarity(trace, &r.points, &self.config)))
            .collect()
    }

    #[cfg(feature = "parallel")]
    fn score_routes(&self, trace: &[GeoPoint], routes: &[Route]) -> Vec<(i64, f64)> {
        routes
            .par_iter()
            .map(|r| (r.id, route_similarity(trace, &r.points, &self.config)))
            .collect()
    }

    fn route_lock(&self, route_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.route_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(route_id).or_default().clone()
    }

    /// Read-modify-write of a matched route under its lock.
    fn apply_match(&self, route_id: i64, duration: f64) -> Result<Route> {
        let lock = self.route_lock(route_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut route = self
            .store
            .get_route(route_id)?
            .ok_or_missing(RecordKind::Route, route_id)?;
        let traveled = route.times_traveled as f64;
        route.confidence_score =
            (route.confidence_score + self.config.confidence_increment).min(self.config.max_confidence);
        route.avg_duration = (route.avg_duration * traveled + duration) / (traveled + 1.0);
        route.times_traveled += 1;
        route.updated_at = now_millis();
        self.store.update_route(&route)?;
        Ok(route)
    }

    fn learn_route(&self, trace: &[GeoPoint], duration: f64, known_routes: usize) -> Result<Route> {
        let first = trace.first().ok_or_internal("cannot learn a route from an empty trace")?;
        let last = trace.last().ok_or_internal("cannot learn a route from an empty trace")?;
        let points = simplify_trace(trace, self.config.simplification_epsilon);

        self.store.create_route(NewRoute {
            name: format!("Route {}", known_routes + 1),
            category: None,
            confidence_score: self.config.initial_confidence,
            start_location: *first,
            end_location: *last,
            avg_duration: duration,
            times_traveled: 1,
            points,
            created_at: now_millis(),
        })
    }

    // ========================================================================
    // Expected route
    // ========================================================================

    /// Best known route starting near `start`: highest confidence, then most
    /// traveled, then oldest.
    pub fn suggest_route(&self, start: GeoPoint) -> Result<Option<Route>> {
        let routes = self.store.list_routes()?;
        if routes.is_empty() {
            return Ok(None);
        }

        let index = RTree::bulk_load(
            routes
                .iter()
                .map(|r| RouteStart {
                    route_id: r.id,
                    lng: r.start_location.longitude,
                    lat: r.start_location.latitude,
                })
                .collect(),
        );

        let radius = self.config.route_suggestion_radius;
        let span = meters_to_degrees(radius, start.latitude);
        let search = AABB::from_corners(
            [start.longitude - span, start.latitude - span],
            [start.longitude + span, start.latitude + span],
        );

        let by_id: HashMap<i64, &Route> = routes.iter().map(|r| (r.id, r)).collect();
        let best = index
            .locate_in_envelope(&search)
            .filter_map(|candidate| by_id.get(&candidate.route_id).copied())
            .filter(|route| haversine_distance(&start, &route.start_location) <= radius)
            .min_by(|a, b| {
                b.confidence_score
                    .total_cmp(&a.confidence_score)
                    .then(b.times_traveled.cmp(&a.times_traveled))
                    .then(a.id.cmp(&b.id))
            });

        Ok(best.cloned())
    }

    /// Set the route a journey is expected to follow.
    pub fn assign_route(&self, journey_id: i64, route_id: i64) -> Result<Journey> {
        self.store
            .get_route(route_id)?
            .ok_or_missing(RecordKind::Route, route_id)?;
        let mut journey = self
            .store
            .get_journey(journey_id)?
            .ok_or_missing(RecordKind::Journey, journey_id)?;
        journey.matched_route_id = Some(route_id);
        self.store.update_journey(&journey)?;
        debug!(
            "[RouteGuard] Journey {} expects route {}",
            journey_id, route_id
        );
        Ok(journey)
    }

    // ========================================================================
    // Deviation detection
    // ========================================================================

    /// Compare `current` with where the journey should be on its route.
    ///
    /// Returns `Ok(None)` when the journey has no route yet or the subject is
    /// within the threshold. A deviation is persisted and the journey is
    /// flagged before the event is returned. No alert is raised here.
    pub fn check_for_deviation(
        &self,
        journey: &Journey,
        current: GeoPoint,
        timestamp: i64,
    ) -> Result<Option<DeviationEvent>> {
        let trace = trace_positions(&self.store.journey_points(journey.id)?);
        self.deviation_for_trace(journey, &trace, current, timestamp)
    }

    fn deviation_for_trace(
        &self,
        journey: &Journey,
        trace: &[GeoPoint],
        current: GeoPoint,
        timestamp: i64,
    ) -> Result<Option<DeviationEvent>> {
        let Some(route_id) = journey.matched_route_id else {
            return Ok(None);
        };
        let Some(route) = self.store.get_route(route_id)? else {
            warn!(
                "[RouteGuard] Journey {} expects missing route {}",
                journey.id, route_id
            );
            return Ok(None);
        };

        let mut live = trace.to_vec();
        if live.last() != Some(&current) {
            live.push(current);
        }

        let Some(check) =
            detect_deviation(&live, &route.points, current, self.config.deviation_threshold)
        else {
            return Ok(None);
        };

        let deviation = self.store.create_deviation(NewDeviation {
            journey_id: journey.id,
            route_id,
            actual: check.actual,
            expected: check.expected,
            timestamp,
            distance: check.distance,
        })?;

        let mut flagged = self
            .store
            .get_journey(journey.id)?
            .ok_or_missing(RecordKind::Journey, journey.id)?;
        if !flagged.has_deviation {
            flagged.has_deviation = true;
            self.store.update_journey(&flagged)?;
        }

        info!(
            "[RouteGuard] Deviation {} on journey {}: {:.0} m from route {} at {:.0}% progress",
            deviation.id,
            journey.id,
            check.distance,
            route_id,
            check.progress * 100.0
        );
        Ok(Some(deviation))
    }

    // ========================================================================
    // Alerts and responses
    // ========================================================================

    /// Start escalation for a deviation with an explicit severity.
    pub async fn raise_alert(
        &self,
        deviation_id: i64,
        severity: AlertSeverity,
    ) -> Result<EscalationState> {
        let deviation = self
            .store
            .get_deviation(deviation_id)?
            .ok_or_missing(RecordKind::Deviation, deviation_id)?;
        self.escalator.raise(&deviation, severity).await
    }

    pub async fn handle_deviation_response(
        &self,
        deviation_id: i64,
        response: DeviationResponse,
    ) -> Result<ResponseOutcome> {
        self.escalator.handle_response(deviation_id, response).await
    }

    /// Callback entry for the notification layer: maps the tapped action
    /// identifier to a response.
    pub async fn handle_notification_action(
        &self,
        deviation_id: i64,
        action_identifier: &str,
    ) -> Result<ResponseOutcome> {
        let response = DeviationResponse::from_action_identifier(action_identifier);
        debug!(
            "[RouteGuard] Action '{}' on deviation {} -> {}",
            action_identifier,
            deviation_id,
            response.as_str()
        );
        self.handle_deviation_response(deviation_id, response).await
    }

    // ========================================================================
    // Route management
    // ========================================================================

    pub fn get_route(&self, route_id: i64) -> Result<Option<Route>> {
        self.store.get_route(route_id)
    }

    pub fn list_routes(&self) -> Result<Vec<Route>> {
        self.store.list_routes()
    }

    pub fn rename_route(&self, route_id: i64, name: &str) -> Result<Route> {
        self.edit_route(route_id, |route| route.name = name.to_string())
    }

    pub fn set_route_category(&self, route_id: i64, category: Option<&str>) -> Result<Route> {
        self.edit_route(route_id, |route| route.category = category.map(str::to_string))
    }

    /// Returns false when the route did not exist.
    pub fn delete_route(&self, route_id: i64) -> Result<bool> {
        let lock = self.route_lock(route_id);
        let deleted = {
            let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
            self.store.delete_route(route_id)?
        };
        self.route_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&route_id);
        if deleted {
            info!("[RouteGuard] Deleted route {}", route_id);
        }
        Ok(deleted)
    }

    fn edit_route(&self, route_id: i64, edit: impl FnOnce(&mut Route)) -> Result<Route> {
        let lock = self.route_lock(route_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut route = self
            .store
            .get_route(route_id)?
            .ok_or_missing(RecordKind::Route, route_id)?;
        edit(&mut route);
        route.updated_at = now_millis();
        self.store.update_route(&route)?;
        Ok(route)
    }

    pub fn journey_deviations(&self, journey_id: i64) -> Result<Vec<DeviationEvent>> {
        self.store.journey_deviations(journey_id)
    }

    pub fn deviation_alerts(&self, deviation_id: i64) -> Result<Vec<AlertEvent>> {
        self.store.deviation_alerts(deviation_id)
    }

    pub fn stats(&self) -> Result<EngineStats> {
        Ok(EngineStats {
            route_count: self.store.list_routes()?.len(),
            open_escalations: self.escalator.pending_count(),
        })
    }
}

/// First route with the strictly highest score.
fn best_match(scores: &[(i64, f64)]) -> Option<(i64, f64)> {
    scores.iter().fold(None, |best, &(id, score)| match best {
        Some((_, best_score)) if best_score >= score => best,
        _ => Some((id, score)),
    })
}

fn trace_span_secs(trace: &[TracePoint]) -> f64 {
    match (trace.first(), trace.last()) {
        (Some(first), Some(last)) => (last.timestamp - first.timestamp).max(0) as f64 / 1000.0,
        _ => 0.0,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::RecordingNotifier;
    use crate::store::NewContact;
    use crate::GuardError;

    /// 12 samples heading east along the equator, ~111 m apart, 30 s apart,
    /// weaving ~33 m north on odd samples so simplification keeps the shape.
    fn commute(start_ms: i64) -> Vec<TracePoint> {
        (0..12)
            .map(|i| {
                let weave = if i % 2 == 1 && i < 11 { 0.0003 } else { 0.0 };
                TracePoint::new(weave, i as f64 * 0.001, start_ms + i as i64 * 30_000)
            })
            .collect()
    }

    async fn settle() {
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
    }

    fn engine() -> (GuardEngine, Arc<MemoryStore>, Arc<RecordingNotifier>) {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let engine =
            GuardEngine::new(store.clone(), notifier.clone(), GuardConfig::default()).unwrap();
        (engine, store, notifier)
    }

    async fn travel(engine: &GuardEngine, trace: &[TracePoint]) -> JourneySummary {
        let mut session = TrackingSession::new();
        let start = trace.first().map(|p| p.timestamp).unwrap_or(0);
        let end = trace.last().map(|p| p.timestamp).unwrap_or(0);
        engine
            .start_tracking(&mut session, start, TransportMode::Walking)
            .unwrap();
        for point in trace {
            engine.record_sample(&mut session, *point).await.unwrap();
        }
        engine.stop_tracking(&mut session, end).await.unwrap()
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = GuardConfig {
            resample_count: 1,
            ..GuardConfig::default()
        };
        assert!(matches!(
            GuardEngine::in_memory(config),
            Err(GuardError::Config { .. })
        ));
    }

    #[tokio::test]
    async fn test_first_journey_learns_route() {
        let (engine, store, _) = engine();
        let summary = travel(&engine, &commute(0)).await;

        let outcome = *summary.analysis.unwrap().matched().unwrap();
        assert!(outcome.is_new_route);
        assert_eq!(outcome.similarity, 0.0);

        let routes = store.list_routes().unwrap();
        assert_eq!(routes.len(), 1);
        let route = &routes[0];
        assert_eq!(route.confidence_score, 0.3);
        assert_eq!(route.times_traveled, 1);
        assert_eq!(route.avg_duration, 330.0);
        // The weave survives simplification
        assert!(route.points.len() >= 5);
        assert_eq!(route.start_location, GeoPoint::new(0.0, 0.0));
        assert_eq!(route.end_location, GeoPoint::new(0.0, 0.011));

        assert_eq!(summary.journey.matched_route_id, Some(route.id));
        assert!(summary.journey.distance > 1_200.0);
        assert!(!summary.journey.is_open());
    }

    #[tokio::test]
    async fn test_repeat_journey_strengthens_route() {
        let (engine, store, _) = engine();
        travel(&engine, &commute(0)).await;

        // Same path, slower
        let mut second: Vec<TracePoint> = commute(1_000_000);
        if let Some(last) = second.last_mut() {
            last.timestamp += 90_000;
        }
        let summary = travel(&engine, &second).await;

        let outcome = *summary.analysis.unwrap().matched().unwrap();
        assert!(!outcome.is_new_route);
        assert!(outcome.similarity > 0.99);

        let route = store.get_route(outcome.route_id).unwrap().unwrap();
        assert_eq!(route.times_traveled, 2);
        assert!((route.confidence_score - 0.4).abs() < 1e-9);
        assert!((route.avg_duration - 375.0).abs() < 1e-9);
        assert_eq!(store.list_routes().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_confidence_caps_at_max() {
        let (engine, store, _) = engine();
        for i in 0..10 {
            travel(&engine, &commute(i * 1_000_000)).await;
        }
        let routes = store.list_routes().unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].times_traveled, 10);
        assert!(routes[0].confidence_score <= 1.0);
        assert!((routes[0].confidence_score - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_short_journey_is_not_analysed() {
        let (engine, store, _) = engine();
        let summary = travel(&engine, &commute(0)[..5]).await;
        assert!(matches!(
            summary.analysis,
            Some(AnalysisOutcome::TooShort { point_count: 5, .. })
        ));
        assert!(store.list_routes().unwrap().is_empty());
        assert_eq!(summary.journey.matched_route_id, None);

        // Enough points, not enough distance
        let dense: Vec<TracePoint> = (0..15)
            .map(|i| TracePoint::new(0.0, i as f64 * 0.0001, i as i64 * 1_000))
            .collect();
        let summary = travel(&engine, &dense).await;
        assert!(matches!(summary.analysis, Some(AnalysisOutcome::TooShort { .. })));
    }

    #[tokio::test]
    async fn test_different_endpoint_learns_second_route() {
        let (engine, store, _) = engine();
        travel(&engine, &commute(0)).await;

        let north: Vec<TracePoint> = (0..12)
            .map(|i| TracePoint::new(i as f64 * 0.001, 0.0, i as i64 * 30_000))
            .collect();
        let summary = travel(&engine, &north).await;
        assert!(summary.analysis.unwrap().matched().unwrap().is_new_route);
        assert_eq!(store.list_routes().unwrap().len(), 2);
        assert_eq!(store.list_routes().unwrap()[1].name, "Route 2");
    }

    #[tokio::test]
    async fn test_check_for_deviation_boundary() {
        let (engine, store, _) = engine();
        travel(&engine, &commute(0)).await;
        let route_id = store.list_routes().unwrap()[0].id;

        let journey = store.create_journey(0, TransportMode::Walking).unwrap();
        // No route yet
        assert!(engine
            .check_for_deviation(&journey, GeoPoint::new(1.0, 1.0), 0)
            .unwrap()
            .is_none());

        let journey = engine.assign_route(journey.id, route_id).unwrap();

        let near = GeoPoint::new(0.0004, 0.0); // ~44 m from the start
        assert!(engine.check_for_deviation(&journey, near, 1).unwrap().is_none());

        let far = GeoPoint::new(0.0, -0.002); // ~222 m west of the start
        let event = engine.check_for_deviation(&journey, far, 2).unwrap().unwrap();
        assert!(event.distance > 200.0 && event.distance < 240.0);
        assert_eq!(event.expected_position(), GeoPoint::new(0.0, 0.0));
        assert_eq!(event.position(), far);
        assert!(store.get_journey(journey.id).unwrap().unwrap().has_deviation);

        // No debouncing: each crossing is a new event
        engine.check_for_deviation(&journey, far, 3).unwrap().unwrap();
        assert_eq!(engine.journey_deviations(journey.id).unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_sample_auto_assigns_route_and_escalates() {
        let (engine, store, notifier) = engine();
        travel(&engine, &commute(0)).await;
        store
            .add_contact(NewContact {
                name: "Ana".to_string(),
                phone: Some("+15550100".to_string()),
                email: None,
                priority: 1,
                is_active: true,
            })
            .unwrap();

        let mut session = TrackingSession::new();
        let journey = engine
            .start_tracking(&mut session, 0, TransportMode::Walking)
            .unwrap();

        let first = engine
            .record_sample(&mut session, TracePoint::new(0.0, 0.0, 0))
            .await
            .unwrap();
        assert!(first.is_none());
        let assigned = store.get_journey(journey.id).unwrap().unwrap();
        assert!(assigned.matched_route_id.is_some());

        let deviation = engine
            .record_sample(&mut session, TracePoint::new(0.0, -0.002, 30_000))
            .await
            .unwrap()
            .unwrap();
        settle().await;
        assert_eq!(
            engine.escalator().state(deviation.id),
            Some(EscalationState::UserNotified {
                awaiting_response: true
            })
        );
        assert_eq!(engine.stats().unwrap().open_escalations, 1);

        // Stopping tracking does not cancel the escalation
        engine.stop_tracking(&mut session, 60_000).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_secs(61)).await;
        tokio::task::yield_now().await;

        assert_eq!(notifier.contact_messages().len(), 1);
        assert_eq!(engine.deviation_alerts(deviation.id).unwrap().len(), 1);
        assert_eq!(engine.stats().unwrap().open_escalations, 0);
        assert_eq!(engine.escalator().settled_count(), 1);
    }

    #[tokio::test]
    async fn test_suggest_route_prefers_confident_nearby_start() {
        let (engine, store, _) = engine();
        travel(&engine, &commute(0)).await;
        travel(&engine, &commute(1_000_000)).await;
        let north: Vec<TracePoint> = (0..12)
            .map(|i| TracePoint::new(i as f64 * 0.001, 0.0, i as i64 * 30_000))
            .collect();
        travel(&engine, &north).await;

        let routes = store.list_routes().unwrap();
        assert_eq!(routes.len(), 2);

        let suggested = engine.suggest_route(GeoPoint::new(0.0005, 0.0)).unwrap().unwrap();
        assert_eq!(suggested.times_traveled, 2);
        assert!(engine.suggest_route(GeoPoint::new(0.1, 0.1)).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_route_management() {
        let (engine, _, _) = engine();
        travel(&engine, &commute(0)).await;
        let route_id = engine.list_routes().unwrap()[0].id;

        let renamed = engine.rename_route(route_id, "To the station").unwrap();
        assert_eq!(renamed.name, "To the station");
        let categorized = engine.set_route_category(route_id, Some("commute")).unwrap();
        assert_eq!(categorized.category.as_deref(), Some("commute"));
        assert_eq!(categorized.name, "To the station");

        assert!(engine.delete_route(route_id).unwrap());
        assert!(!engine.delete_route(route_id).unwrap());
        assert!(matches!(
            engine.rename_route(route_id, "x"),
            Err(GuardError::NotFound {
                kind: RecordKind::Route,
                ..
            })
        ));
        assert_eq!(engine.stats().unwrap().route_count, 0);
    }

    #[tokio::test]
    async fn test_second_start_refused() {
        let (engine, _, _) = engine();
        let mut session = TrackingSession::new();
        let journey = engine
            .start_tracking(&mut session, 0, TransportMode::Cycling)
            .unwrap();
        let again = engine.start_tracking(&mut session, 1, TransportMode::Cycling);
        assert!(matches!(again, Err(GuardError::AlreadyTracking { journey_id }) if journey_id == journey.id));
    }

    #[tokio::test]
    async fn test_monitor_processes_until_stream_closes() {
        let (engine, _, _) = engine();
        let mut session = TrackingSession::new();
        let journey = engine
            .start_tracking(&mut session, 0, TransportMode::Walking)
            .unwrap();

        let (tx, rx) = mpsc::channel(16);
        for point in commute(0) {
            tx.send(point).await.unwrap();
        }
        drop(tx);

        let report = engine.run_monitor(journey.id, rx, session.stop_signal()).await;
        assert_eq!(report.samples_processed, 12);
        assert!(!report.stopped);
        assert_eq!(report.failures, 0);
        assert_eq!(engine.store().journey_points(journey.id).unwrap().len(), 12);
    }

    #[tokio::test]
    async fn test_monitor_drops_queued_samples_after_stop() {
        let (engine, store, _) = engine();
        let mut session = TrackingSession::new();
        let journey = engine
            .start_tracking(&mut session, 0, TransportMode::Walking)
            .unwrap();
        let stop = session.stop_signal();

        let (tx, rx) = mpsc::channel(16);
        for point in commute(0).into_iter().take(3) {
            tx.send(point).await.unwrap();
        }
        engine.stop_tracking(&mut session, 1_000).await.unwrap();

        let report = engine.run_monitor(journey.id, rx, stop).await;
        assert!(report.stopped);
        assert_eq!(report.samples_processed, 0);
        assert_eq!(report.discarded, 3);
        assert!(store.journey_points(journey.id).unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_keeps_going_while_user_alert_hangs() {
        let (engine, _, notifier) = engine();
        travel(&engine, &commute(0)).await;
        notifier.set_stalled(true);

        let mut session = TrackingSession::new();
        let journey = engine
            .start_tracking(&mut session, 0, TransportMode::Walking)
            .unwrap();

        let (tx, rx) = mpsc::channel(8);
        for point in [
            TracePoint::new(0.0, 0.0, 0),
            TracePoint::new(0.0, -0.002, 30_000),
            TracePoint::new(0.0, -0.003, 60_000),
        ] {
            tx.send(point).await.unwrap();
        }
        drop(tx);

        let report = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            engine.run_monitor(journey.id, rx, session.stop_signal()),
        )
        .await
        .expect("monitor blocked on a user alert");
        assert_eq!(report.samples_processed, 3);
        assert_eq!(report.deviations.len(), 2);

        settle().await;
        assert_eq!(engine.stats().unwrap().open_escalations, 2);
        assert_eq!(notifier.user_alerts().len(), 2);

        tokio::time::sleep(std::time::Duration::from_secs(61)).await;
        settle().await;
        assert_eq!(engine.stats().unwrap().open_escalations, 0);
    }

    #[tokio::test]
    async fn test_failed_stop_leaves_session_open() {
        let (engine, _, _) = engine();
        let mut session = TrackingSession::new();
        session.begin(404).unwrap();
        let stop = session.stop_signal();

        let result = engine.stop_tracking(&mut session, 1_000).await;
        assert!(matches!(
            result,
            Err(GuardError::NotFound {
                kind: RecordKind::Journey,
                id: 404
            })
        ));
        assert_eq!(session.journey_id(), Some(404));
        assert!(!*stop.borrow());
    }

    #[test]
    fn test_best_match_keeps_first_of_ties() {
        assert_eq!(best_match(&[]), None);
        assert_eq!(best_match(&[(1, 0.5), (2, 0.9), (3, 0.9)]), Some((2, 0.9)));
    }
}

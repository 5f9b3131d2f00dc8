//! Persistence collaborator.
//!
//! The engine treats storage as a transactional record store keyed by
//! integer ids: Journey 1-N trace points, Journey 1-N deviations,
//! Deviation 1-N alerts, plus routes and emergency contacts. Every method
//! is fail-fast; callers decide whether a failure aborts their operation.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use crate::error::{GuardError, OptionExt, RecordKind, Result};
use crate::{
    AlertEvent, AlertMethod, DeviationEvent, EmergencyContact, GeoPoint, Journey, Route,
    TracePoint, TransportMode,
};

/// Fields of a route before the store assigns its id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRoute {
    pub name: String,
    pub category: Option<String>,
    pub confidence_score: f64,
    pub start_location: GeoPoint,
    pub end_location: GeoPoint,
    pub avg_duration: f64,
    pub times_traveled: u32,
    pub points: Vec<GeoPoint>,
    pub created_at: i64,
}

/// Fields of a deviation event before the store assigns its id.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NewDeviation {
    pub journey_id: i64,
    pub route_id: i64,
    pub actual: GeoPoint,
    pub expected: GeoPoint,
    pub timestamp: i64,
    pub distance: f64,
}

/// Fields of an alert record before the store assigns its id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAlert {
    pub contact_id: i64,
    pub deviation_id: i64,
    pub method: AlertMethod,
    pub timestamp: i64,
    pub message: String,
}

/// Fields of an emergency contact before the store assigns its id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewContact {
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub priority: u32,
    pub is_active: bool,
}

/// Record store used by the engine and the escalator.
pub trait GuardStore: Send + Sync {
    // Journeys

    fn create_journey(&self, start_time: i64, mode: TransportMode) -> Result<Journey>;
    fn get_journey(&self, id: i64) -> Result<Option<Journey>>;
    fn update_journey(&self, journey: &Journey) -> Result<()>;
    /// Append a sample, assigning the next sequence number when absent.
    fn append_journey_point(&self, journey_id: i64, point: &TracePoint) -> Result<TracePoint>;
    /// All samples of a journey in append order.
    fn journey_points(&self, journey_id: i64) -> Result<Vec<TracePoint>>;

    // Routes

    fn create_route(&self, route: NewRoute) -> Result<Route>;
    fn get_route(&self, id: i64) -> Result<Option<Route>>;
    fn list_routes(&self) -> Result<Vec<Route>>;
    fn update_route(&self, route: &Route) -> Result<()>;
    /// Returns false when no such route existed.
    fn delete_route(&self, id: i64) -> Result<bool>;

    // Deviations

    fn create_deviation(&self, deviation: NewDeviation) -> Result<DeviationEvent>;
    fn get_deviation(&self, id: i64) -> Result<Option<DeviationEvent>>;
    fn update_deviation(&self, deviation: &DeviationEvent) -> Result<()>;
    fn journey_deviations(&self, journey_id: i64) -> Result<Vec<DeviationEvent>>;

    // Alerts

    fn record_alert(&self, alert: NewAlert) -> Result<AlertEvent>;
    fn deviation_alerts(&self, deviation_id: i64) -> Result<Vec<AlertEvent>>;

    // Contacts

    fn add_contact(&self, contact: NewContact) -> Result<EmergencyContact>;
    fn update_contact(&self, contact: &EmergencyContact) -> Result<()>;
    /// Active contacts, highest priority (lowest number) first.
    fn active_contacts(&self) -> Result<Vec<EmergencyContact>>;
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    journeys: BTreeMap<i64, Journey>,
    journey_points: HashMap<i64, Vec<TracePoint>>,
    routes: BTreeMap<i64, Route>,
    deviations: BTreeMap<i64, DeviationEvent>,
    alerts: BTreeMap<i64, AlertEvent>,
    contacts: BTreeMap<i64, EmergencyContact>,
}

impl MemoryState {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Store that keeps every record in process memory.
///
/// Ids are assigned from a single counter shared by all record kinds.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| GuardError::persistence("memory store lock poisoned"))
    }
}

impl GuardStore for MemoryStore {
    fn create_journey(&self, start_time: i64, mode: TransportMode) -> Result<Journey> {
        let mut state = self.state()?;
        let id = state.allocate_id();
        let journey = Journey {
            id,
            start_time,
            end_time: None,
            matched_route_id: None,
            distance: 0.0,
            transportation_mode: mode,
            has_deviation: false,
        };
        state.journeys.insert(id, journey.clone());
        Ok(journey)
    }

    fn get_journey(&self, id: i64) -> Result<Option<Journey>> {
        Ok(self.state()?.journeys.get(&id).cloned())
    }

    fn update_journey(&self, journey: &Journey) -> Result<()> {
        let mut state = self.state()?;
        let slot = state
            .journeys
            .get_mut(&journey.id)
            .ok_or_missing(RecordKind::Journey, journey.id)?;
        *slot = journey.clone();
        Ok(())
    }

    fn append_journey_point(&self, journey_id: i64, point: &TracePoint) -> Result<TracePoint> {
        let mut state = self.state()?;
        if !state.journeys.contains_key(&journey_id) {
            return Err(GuardError::NotFound {
                kind: RecordKind::Journey,
                id: journey_id,
            });
        }
        let points = state.journey_points.entry(journey_id).or_default();
        let mut stored = *point;
        if stored.sequence_number.is_none() {
            stored.sequence_number = Some(points.len() as u32);
        }
        points.push(stored);
        Ok(stored)
    }

    fn journey_points(&self, journey_id: i64) -> Result<Vec<TracePoint>> {
        Ok(self
            .state()?
            .journey_points
            .get(&journey_id)
            .cloned()
            .unwrap_or_default())
    }

    fn create_route(&self, route: NewRoute) -> Result<Route> {
        let mut state = self.state()?;
        let id = state.allocate_id();
        let route = Route {
            id,
            name: route.name,
            category: route.category,
            confidence_score: route.confidence_score,
            start_location: route.start_location,
            end_location: route.end_location,
            avg_duration: route.avg_duration,
            times_traveled: route.times_traveled,
            points: route.points,
            created_at: route.created_at,
            updated_at: route.created_at,
        };
        state.routes.insert(id, route.clone());
        Ok(route)
    }

    fn get_route(&self, id: i64) -> Result<Option<Route>> {
        Ok(self.state()?.routes.get(&id).cloned())
    }

    fn list_routes(&self) -> Result<Vec<Route>> {
        Ok(self.state()?.routes.values().cloned().collect())
    }

    fn update_route(&self, route: &Route) -> Result<()> {
        let mut state = self.state()?;
        let slot = state
            .routes
            .get_mut(&route.id)
            .ok_or_missing(RecordKind::Route, route.id)?;
        *slot = route.clone();
        Ok(())
    }

    fn delete_route(&self, id: i64) -> Result<bool> {
        Ok(self.state()?.routes.remove(&id).is_some())
    }

    fn create_deviation(&self, deviation: NewDeviation) -> Result<DeviationEvent> {
        let mut state = self.state()?;
        if !state.journeys.contains_key(&deviation.journey_id) {
            return Err(GuardError::NotFound {
                kind: RecordKind::Journey,
                id: deviation.journey_id,
            });
        }
        let id = state.allocate_id();
        let event = DeviationEvent {
            id,
            journey_id: deviation.journey_id,
            route_id: deviation.route_id,
            latitude: deviation.actual.latitude,
            longitude: deviation.actual.longitude,
            expected_latitude: deviation.expected.latitude,
            expected_longitude: deviation.expected.longitude,
            timestamp: deviation.timestamp,
            distance: deviation.distance,
            alert_sent: false,
            user_response: None,
        };
        state.deviations.insert(id, event.clone());
        Ok(event)
    }

    fn get_deviation(&self, id: i64) -> Result<Option<DeviationEvent>> {
        Ok(self.state()?.deviations.get(&id).cloned())
    }

    fn update_deviation(&self, deviation: &DeviationEvent) -> Result<()> {
        let mut state = self.state()?;
        let slot = state
            .deviations
            .get_mut(&deviation.id)
            .ok_or_missing(RecordKind::Deviation, deviation.id)?;
        *slot = deviation.clone();
        Ok(())
    }

    fn journey_deviations(&self, journey_id: i64) -> Result<Vec<DeviationEvent>> {
        Ok(self
            .state()?
            .deviations
            .values()
            .filter(|d| d.journey_id == journey_id)
            .cloned()
            .collect())
    }

    fn record_alert(&self, alert: NewAlert) -> Result<AlertEvent> {
        let mut state = self.state()?;
        if !state.deviations.contains_key(&alert.deviation_id) {
            return Err(GuardError::NotFound {
                kind: RecordKind::Deviation,
                id: alert.deviation_id,
            });
        }
        let id = state.allocate_id();
        let event = AlertEvent {
            id,
            contact_id: alert.contact_id,
            deviation_id: alert.deviation_id,
            method: alert.method,
            timestamp: alert.timestamp,
            message: alert.message,
        };
        state.alerts.insert(id, event.clone());
        Ok(event)
    }

    fn deviation_alerts(&self, deviation_id: i64) -> Result<Vec<AlertEvent>> {
        Ok(self
            .state()?
            .alerts
            .values()
            .filter(|a| a.deviation_id == deviation_id)
            .cloned()
            .collect())
    }

    fn add_contact(&self, contact: NewContact) -> Result<EmergencyContact> {
        let mut state = self.state()?;
        let id = state.allocate_id();
        let contact = EmergencyContact {
            id,
            name: contact.name,
            phone: contact.phone,
            email: contact.email,
            priority: contact.priority,
            is_active: contact.is_active,
        };
        state.contacts.insert(id, contact.clone());
        Ok(contact)
    }

    fn update_contact(&self, contact: &EmergencyContact) -> Result<()> {
        let mut state = self.state()?;
        let slot = state
            .contacts
            .get_mut(&contact.id)
            .ok_or_missing(RecordKind::Contact, contact.id)?;
        *slot = contact.clone();
        Ok(())
    }

    fn active_contacts(&self) -> Result<Vec<EmergencyContact>> {
        let mut contacts: Vec<EmergencyContact> = self
            .state()?
            .contacts
            .values()
            .filter(|c| c.is_active)
            .cloned()
            .collect();
        contacts.sort_by_key(|c| (c.priority, c.id));
        Ok(contacts)
    }
}

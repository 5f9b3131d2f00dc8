//! # SQLite Store
//!
//! [`GuardStore`] backed by a single SQLite database.
//!
//! ## Layout
//!
//! - `journeys` 1-N `journey_points` (one row per sample, append order)
//! - `journeys` 1-N `deviation_events` 1-N `alert_events`
//! - `routes` keep their simplified points as a MessagePack blob
//! - `emergency_contacts`
//!
//! The connection sits behind a mutex so the store can be shared between
//! the sample pipeline and escalation timers.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use log::info;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{GuardError, RecordKind, Result};
use crate::store::{GuardStore, NewAlert, NewContact, NewDeviation, NewRoute};
use crate::{
    AlertEvent, AlertMethod, DeviationEvent, DeviationResponse, EmergencyContact, GeoPoint,
    Journey, Route, TracePoint, TransportMode,
};

const JOURNEY_COLUMNS: &str =
    "id, start_time, end_time, matched_route_id, distance, transportation_mode, has_deviation";
const ROUTE_COLUMNS: &str = "id, name, category, confidence_score, start_lat, start_lng, \
     end_lat, end_lng, avg_duration, times_traveled, points, created_at, updated_at";
const DEVIATION_COLUMNS: &str = "id, journey_id, route_id, latitude, longitude, \
     expected_latitude, expected_longitude, timestamp, distance, alert_sent, user_response";
const ALERT_COLUMNS: &str = "id, contact_id, deviation_id, method, timestamp, message";
const CONTACT_COLUMNS: &str = "id, name, phone, email, priority, is_active";

/// SQLite-backed record store.
pub struct SqliteStore {
    db: Mutex<Connection>,
    db_path: String,
}

impl SqliteStore {
    /// Open (or create) the database at `db_path`.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_string_lossy().into_owned();
        let db = Connection::open(&db_path)?;
        Self::init_schema(&db)?;
        info!("[SqliteStore] Opened {}", db_path);

        Ok(Self {
            db: Mutex::new(db),
            db_path,
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    pub fn path(&self) -> &str {
        &self.db_path
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS journeys (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                start_time INTEGER NOT NULL,
                end_time INTEGER,
                matched_route_id INTEGER,
                distance REAL NOT NULL DEFAULT 0,
                transportation_mode TEXT NOT NULL,
                has_deviation INTEGER NOT NULL DEFAULT 0
            );

            -- Raw samples, one row each
            CREATE TABLE IF NOT EXISTS journey_points (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                journey_id INTEGER NOT NULL,
                sequence_number INTEGER NOT NULL,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                timestamp INTEGER NOT NULL,
                accuracy REAL,
                altitude REAL,
                speed REAL,
                FOREIGN KEY (journey_id) REFERENCES journeys(id) ON DELETE CASCADE
            );

            -- Learned routes, simplified points as MessagePack
            CREATE TABLE IF NOT EXISTS routes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                category TEXT,
                confidence_score REAL NOT NULL,
                start_lat REAL NOT NULL,
                start_lng REAL NOT NULL,
                end_lat REAL NOT NULL,
                end_lng REAL NOT NULL,
                avg_duration REAL NOT NULL,
                times_traveled INTEGER NOT NULL,
                points BLOB NOT NULL,
                point_count INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS deviation_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                journey_id INTEGER NOT NULL,
                route_id INTEGER NOT NULL,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                expected_latitude REAL NOT NULL,
                expected_longitude REAL NOT NULL,
                timestamp INTEGER NOT NULL,
                distance REAL NOT NULL,
                alert_sent INTEGER NOT NULL DEFAULT 0,
                user_response TEXT,
                FOREIGN KEY (journey_id) REFERENCES journeys(id) ON DELETE CASCADE
            );

            -- Append-only audit of contact notifications
            CREATE TABLE IF NOT EXISTS alert_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                contact_id INTEGER NOT NULL,
                deviation_id INTEGER NOT NULL,
                method TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                message TEXT NOT NULL,
                FOREIGN KEY (deviation_id) REFERENCES deviation_events(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS emergency_contacts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                phone TEXT,
                email TEXT,
                priority INTEGER NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1
            );

            -- Indexes
            CREATE INDEX IF NOT EXISTS idx_journey_points_journey ON journey_points(journey_id);
            CREATE INDEX IF NOT EXISTS idx_deviations_journey ON deviation_events(journey_id);
            CREATE INDEX IF NOT EXISTS idx_alerts_deviation ON alert_events(deviation_id);
            CREATE INDEX IF NOT EXISTS idx_contacts_priority ON emergency_contacts(is_active, priority);
        "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|_| GuardError::persistence("sqlite connection lock poisoned"))
    }

    fn exists(conn: &Connection, table: &str, id: i64) -> Result<bool> {
        let sql = format!("SELECT EXISTS(SELECT 1 FROM {} WHERE id = ?)", table);
        Ok(conn.query_row(&sql, params![id], |row| row.get(0))?)
    }

    fn require(conn: &Connection, table: &str, kind: RecordKind, id: i64) -> Result<()> {
        if Self::exists(conn, table, id)? {
            Ok(())
        } else {
            Err(GuardError::NotFound { kind, id })
        }
    }
}

// ============================================================================
// Row mapping
// ============================================================================

fn journey_from_row(row: &Row<'_>) -> rusqlite::Result<Journey> {
    let mode: String = row.get(5)?;
    Ok(Journey {
        id: row.get(0)?,
        start_time: row.get(1)?,
        end_time: row.get(2)?,
        matched_route_id: row.get(3)?,
        distance: row.get(4)?,
        transportation_mode: TransportMode::parse(&mode),
        has_deviation: row.get(6)?,
    })
}

fn trace_point_from_row(row: &Row<'_>) -> rusqlite::Result<TracePoint> {
    Ok(TracePoint {
        sequence_number: Some(row.get(0)?),
        latitude: row.get(1)?,
        longitude: row.get(2)?,
        timestamp: row.get(3)?,
        accuracy: row.get(4)?,
        altitude: row.get(5)?,
        speed: row.get(6)?,
    })
}

/// Route fields with the points blob still encoded.
fn route_from_row(row: &Row<'_>) -> rusqlite::Result<(Route, Vec<u8>)> {
    let route = Route {
        id: row.get(0)?,
        name: row.get(1)?,
        category: row.get(2)?,
        confidence_score: row.get(3)?,
        start_location: GeoPoint::new(row.get(4)?, row.get(5)?),
        end_location: GeoPoint::new(row.get(6)?, row.get(7)?),
        avg_duration: row.get(8)?,
        times_traveled: row.get(9)?,
        points: Vec::new(),
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    };
    Ok((route, row.get(10)?))
}

fn decode_route((mut route, blob): (Route, Vec<u8>)) -> Result<Route> {
    route.points = rmp_serde::from_slice(&blob)?;
    Ok(route)
}

fn deviation_from_row(row: &Row<'_>) -> rusqlite::Result<DeviationEvent> {
    let response: Option<String> = row.get(10)?;
    Ok(DeviationEvent {
        id: row.get(0)?,
        journey_id: row.get(1)?,
        route_id: row.get(2)?,
        latitude: row.get(3)?,
        longitude: row.get(4)?,
        expected_latitude: row.get(5)?,
        expected_longitude: row.get(6)?,
        timestamp: row.get(7)?,
        distance: row.get(8)?,
        alert_sent: row.get(9)?,
        user_response: response.as_deref().map(DeviationResponse::parse),
    })
}

fn alert_from_row(row: &Row<'_>) -> rusqlite::Result<AlertEvent> {
    let method: String = row.get(3)?;
    let method = AlertMethod::parse(&method)
        .ok_or_else(|| rusqlite::Error::InvalidColumnType(3, "method".to_string(), Type::Text))?;
    Ok(AlertEvent {
        id: row.get(0)?,
        contact_id: row.get(1)?,
        deviation_id: row.get(2)?,
        method,
        timestamp: row.get(4)?,
        message: row.get(5)?,
    })
}

fn contact_from_row(row: &Row<'_>) -> rusqlite::Result<EmergencyContact> {
    Ok(EmergencyContact {
        id: row.get(0)?,
        name: row.get(1)?,
        phone: row.get(2)?,
        email: row.get(3)?,
        priority: row.get(4)?,
        is_active: row.get(5)?,
    })
}

fn not_found_if_unchanged(changed: usize, kind: RecordKind, id: i64) -> Result<()> {
    if changed == 0 {
        Err(GuardError::NotFound { kind, id })
    } else {
        Ok(())
    }
}

// ============================================================================
// GuardStore
// ============================================================================

impl GuardStore for SqliteStore {
    fn create_journey(&self, start_time: i64, mode: TransportMode) -> Result<Journey> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO journeys (start_time, transportation_mode) VALUES (?, ?)",
            params![start_time, mode.as_str()],
        )?;
        Ok(Journey {
            id: conn.last_insert_rowid(),
            start_time,
            end_time: None,
            matched_route_id: None,
            distance: 0.0,
            transportation_mode: mode,
            has_deviation: false,
        })
    }

    fn get_journey(&self, id: i64) -> Result<Option<Journey>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM journeys WHERE id = ?", JOURNEY_COLUMNS);
        Ok(conn
            .query_row(&sql, params![id], journey_from_row)
            .optional()?)
    }

    fn update_journey(&self, journey: &Journey) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE journeys SET start_time = ?, end_time = ?, matched_route_id = ?, distance = ?,
                 transportation_mode = ?, has_deviation = ?
             WHERE id = ?",
            params![
                journey.start_time,
                journey.end_time,
                journey.matched_route_id,
                journey.distance,
                journey.transportation_mode.as_str(),
                journey.has_deviation,
                journey.id,
            ],
        )?;
        not_found_if_unchanged(changed, RecordKind::Journey, journey.id)
    }

    fn append_journey_point(&self, journey_id: i64, point: &TracePoint) -> Result<TracePoint> {
        let conn = self.conn()?;
        Self::require(&conn, "journeys", RecordKind::Journey, journey_id)?;

        let mut stored = *point;
        if stored.sequence_number.is_none() {
            let count: u32 = conn.query_row(
                "SELECT COUNT(*) FROM journey_points WHERE journey_id = ?",
                params![journey_id],
                |row| row.get(0),
            )?;
            stored.sequence_number = Some(count);
        }

        conn.execute(
            "INSERT INTO journey_points
                (journey_id, sequence_number, latitude, longitude, timestamp, accuracy, altitude, speed)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                journey_id,
                stored.sequence_number,
                stored.latitude,
                stored.longitude,
                stored.timestamp,
                stored.accuracy,
                stored.altitude,
                stored.speed,
            ],
        )?;
        Ok(stored)
    }

    fn journey_points(&self, journey_id: i64) -> Result<Vec<TracePoint>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT sequence_number, latitude, longitude, timestamp, accuracy, altitude, speed
             FROM journey_points WHERE journey_id = ? ORDER BY id",
        )?;
        let points = stmt
            .query_map(params![journey_id], trace_point_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(points)
    }

    fn create_route(&self, route: NewRoute) -> Result<Route> {
        let blob = rmp_serde::to_vec(&route.points)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO routes
                (name, category, confidence_score, start_lat, start_lng, end_lat, end_lng,
                 avg_duration, times_traveled, points, point_count, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                route.name,
                route.category,
                route.confidence_score,
                route.start_location.latitude,
                route.start_location.longitude,
                route.end_location.latitude,
                route.end_location.longitude,
                route.avg_duration,
                route.times_traveled,
                blob,
                route.points.len() as i64,
                route.created_at,
                route.created_at,
            ],
        )?;

        Ok(Route {
            id: conn.last_insert_rowid(),
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
        })
    }

    fn get_route(&self, id: i64) -> Result<Option<Route>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM routes WHERE id = ?", ROUTE_COLUMNS);
        conn.query_row(&sql, params![id], route_from_row)
            .optional()?
            .map(decode_route)
            .transpose()
    }

    fn list_routes(&self) -> Result<Vec<Route>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM routes ORDER BY id", ROUTE_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], route_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(decode_route).collect()
    }

    fn update_route(&self, route: &Route) -> Result<()> {
        let blob = rmp_serde::to_vec(&route.points)?;
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE routes SET name = ?, category = ?, confidence_score = ?, start_lat = ?,
                 start_lng = ?, end_lat = ?, end_lng = ?, avg_duration = ?, times_traveled = ?,
                 points = ?, point_count = ?, created_at = ?, updated_at = ?
             WHERE id = ?",
            params![
                route.name,
                route.category,
                route.confidence_score,
                route.start_location.latitude,
                route.start_location.longitude,
                route.end_location.latitude,
                route.end_location.longitude,
                route.avg_duration,
                route.times_traveled,
                blob,
                route.points.len() as i64,
                route.created_at,
                route.updated_at,
                route.id,
            ],
        )?;
        not_found_if_unchanged(changed, RecordKind::Route, route.id)
    }

    fn delete_route(&self, id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute("DELETE FROM routes WHERE id = ?", params![id])?;
        Ok(changed > 0)
    }

    fn create_deviation(&self, deviation: NewDeviation) -> Result<DeviationEvent> {
        let conn = self.conn()?;
        Self::require(&conn, "journeys", RecordKind::Journey, deviation.journey_id)?;
        conn.execute(
            "INSERT INTO deviation_events
                (journey_id, route_id, latitude, longitude, expected_latitude,
                 expected_longitude, timestamp, distance)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                deviation.journey_id,
                deviation.route_id,
                deviation.actual.latitude,
                deviation.actual.longitude,
                deviation.expected.latitude,
                deviation.expected.longitude,
                deviation.timestamp,
                deviation.distance,
            ],
        )?;

        Ok(DeviationEvent {
            id: conn.last_insert_rowid(),
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
        })
    }

    fn get_deviation(&self, id: i64) -> Result<Option<DeviationEvent>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM deviation_events WHERE id = ?", DEVIATION_COLUMNS);
        Ok(conn
            .query_row(&sql, params![id], deviation_from_row)
            .optional()?)
    }

    fn update_deviation(&self, deviation: &DeviationEvent) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE deviation_events SET alert_sent = ?, user_response = ?, distance = ?
             WHERE id = ?",
            params![
                deviation.alert_sent,
                deviation.user_response.map(|r| r.as_str()),
                deviation.distance,
                deviation.id,
            ],
        )?;
        not_found_if_unchanged(changed, RecordKind::Deviation, deviation.id)
    }

    fn journey_deviations(&self, journey_id: i64) -> Result<Vec<DeviationEvent>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM deviation_events WHERE journey_id = ? ORDER BY id",
            DEVIATION_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let events = stmt
            .query_map(params![journey_id], deviation_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    fn record_alert(&self, alert: NewAlert) -> Result<AlertEvent> {
        let conn = self.conn()?;
        Self::require(
            &conn,
            "deviation_events",
            RecordKind::Deviation,
            alert.deviation_id,
        )?;
        conn.execute(
            "INSERT INTO alert_events (contact_id, deviation_id, method, timestamp, message)
             VALUES (?, ?, ?, ?, ?)",
            params![
                alert.contact_id,
                alert.deviation_id,
                alert.method.as_str(),
                alert.timestamp,
                alert.message,
            ],
        )?;

        Ok(AlertEvent {
            id: conn.last_insert_rowid(),
            contact_id: alert.contact_id,
            deviation_id: alert.deviation_id,
            method: alert.method,
            timestamp: alert.timestamp,
            message: alert.message,
        })
    }

    fn deviation_alerts(&self, deviation_id: i64) -> Result<Vec<AlertEvent>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM alert_events WHERE deviation_id = ? ORDER BY id",
            ALERT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let alerts = stmt
            .query_map(params![deviation_id], alert_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(alerts)
    }

    fn add_contact(&self, contact: NewContact) -> Result<EmergencyContact> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO emergency_contacts (name, phone, email, priority, is_active)
             VALUES (?, ?, ?, ?, ?)",
            params![
                contact.name,
                contact.phone,
                contact.email,
                contact.priority,
                contact.is_active,
            ],
        )?;

        Ok(EmergencyContact {
            id: conn.last_insert_rowid(),
            name: contact.name,
            phone: contact.phone,
            email: contact.email,
            priority: contact.priority,
            is_active: contact.is_active,
        })
    }

    fn update_contact(&self, contact: &EmergencyContact) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE emergency_contacts SET name = ?, phone = ?, email = ?, priority = ?, is_active = ?
             WHERE id = ?",
            params![
                contact.name,
                contact.phone,
                contact.email,
                contact.priority,
                contact.is_active,
                contact.id,
            ],
        )?;
        not_found_if_unchanged(changed, RecordKind::Contact, contact.id)
    }

    fn active_contacts(&self) -> Result<Vec<EmergencyContact>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM emergency_contacts WHERE is_active = 1 ORDER BY priority, id",
            CONTACT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let contacts = stmt
            .query_map([], contact_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(contacts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_route() -> NewRoute {
        NewRoute {
            name: "Home to work".to_string(),
            category: Some("commute".to_string()),
            confidence_score: 0.3,
            start_location: GeoPoint::new(51.5074, -0.1278),
            end_location: GeoPoint::new(51.5174, -0.1178),
            avg_duration: 900.0,
            times_traveled: 1,
            points: vec![
                GeoPoint::new(51.5074, -0.1278),
                GeoPoint::new(51.5124, -0.1228),
                GeoPoint::new(51.5174, -0.1178),
            ],
            created_at: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_create_store() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(store.list_routes().unwrap().is_empty());
        assert_eq!(store.path(), ":memory:");
    }

    #[test]
    fn test_route_points_round_trip_through_blob() {
        let store = SqliteStore::in_memory().unwrap();
        let created = store.create_route(sample_route()).unwrap();
        let loaded = store.get_route(created.id).unwrap().unwrap();
        assert_eq!(loaded, created);
        assert_eq!(loaded.points.len(), 3);
    }

    #[test]
    fn test_journey_points_keep_append_order() {
        let store = SqliteStore::in_memory().unwrap();
        let journey = store.create_journey(0, TransportMode::Running).unwrap();
        for i in 0..4 {
            store
                .append_journey_point(journey.id, &TracePoint::new(51.5, -0.12 + i as f64 * 0.001, i))
                .unwrap();
        }
        let points = store.journey_points(journey.id).unwrap();
        let sequence: Vec<Option<u32>> = points.iter().map(|p| p.sequence_number).collect();
        assert_eq!(sequence, vec![Some(0), Some(1), Some(2), Some(3)]);
        assert_eq!(
            store.get_journey(journey.id).unwrap().unwrap().transportation_mode,
            TransportMode::Running
        );
    }

    #[test]
    fn test_missing_records() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(store.get_journey(5).unwrap().is_none());
        assert!(matches!(
            store.append_journey_point(5, &TracePoint::new(0.0, 0.0, 0)),
            Err(GuardError::NotFound { .. })
        ));
        assert!(!store.delete_route(5).unwrap());
    }
}

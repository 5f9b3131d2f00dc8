//! # Route Guard
//!
//! Route learning and real-time deviation detection for personal safety tracking.
//!
//! This library provides:
//! - Trace simplification (Ramer-Douglas-Peucker in meters)
//! - Route similarity scoring (endpoint proximity + resampled path closeness)
//! - Route learning with monotonic confidence accumulation
//! - Live progress estimation and deviation detection against a matched route
//! - A timed alert escalation state machine for user and emergency-contact alerts
//!
//! ## Features
//!
//! - **`parallel`** - Score journeys against known routes with rayon
//! - **`persistence`** - SQLite-backed [`GuardStore`] implementation
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use route_guard::{GeoPoint, GuardConfig, route_similarity};
//!
//! let trace: Vec<GeoPoint> = (0..12)
//!     .map(|i| GeoPoint::new(51.5074 + i as f64 * 0.001, -0.1278))
//!     .collect();
//!
//! let score = route_similarity(&trace, &trace, &GuardConfig::default());
//! assert!(score > 0.99);
//! ```

use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{GuardError, OptionExt, RecordKind, Result};

// Geographic utilities (haversine distance, lengths, interpolation)
pub mod geo_utils;

// Ramer-Douglas-Peucker trace simplification
pub mod simplify;
pub use simplify::simplify_trace;

// Route similarity scoring
pub mod matching;
pub use matching::{point_similarity, resample_route, route_similarity};

// Progress along a matched route
pub mod progress;
pub use progress::{estimate_progress, expected_position, interpolate_position};

// Distance-based deviation detection
pub mod deviation;
pub use deviation::{detect_deviation, DeviationCheck};

// Persistence collaborator
pub mod store;
pub use store::{GuardStore, MemoryStore, NewAlert, NewContact, NewDeviation, NewRoute};

#[cfg(feature = "persistence")]
pub mod persistence;
#[cfg(feature = "persistence")]
pub use persistence::SqliteStore;

// Notification collaborator
pub mod notify;
pub use notify::{
    Delivery, LogNotifier, Notifier, RecordingNotifier, ResponseAction, UserAlert,
};

// Alert escalation state machine
pub mod escalation;
pub use escalation::{EscalationState, Escalator, ResponseOutcome, SETTLED_RETENTION};

// Tracking session owned by the location collaborator
pub mod session;
pub use session::TrackingSession;

// Stateful engine tying everything together
pub mod engine;
pub use engine::{
    AnalysisOutcome, EngineStats, GuardEngine, JourneySummary, MatchOutcome, MonitorReport,
};

// ============================================================================
// Core Types
// ============================================================================

/// A GPS coordinate with latitude and longitude in degrees.
///
/// # Example
/// ```
/// use route_guard::GeoPoint;
/// let point = GeoPoint::new(37.7749, -122.4194); // San Francisco
/// assert!(point.is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    /// Create a new point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

/// A single position sample captured during a journey.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TracePoint {
    pub latitude: f64,
    pub longitude: f64,
    /// Wall-clock time in milliseconds since the Unix epoch
    pub timestamp: i64,
    /// Horizontal accuracy in meters, if reported
    pub accuracy: Option<f64>,
    pub altitude: Option<f64>,
    /// Speed in m/s, if reported
    pub speed: Option<f64>,
    /// Position within the journey; assigned by the store when absent
    pub sequence_number: Option<u32>,
}

impl TracePoint {
    /// Create a sample with only position and time.
    pub fn new(latitude: f64, longitude: f64, timestamp: i64) -> Self {
        Self {
            latitude,
            longitude,
            timestamp,
            accuracy: None,
            altitude: None,
            speed: None,
            sequence_number: None,
        }
    }

    /// The horizontal position of this sample.
    pub fn geo(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }
}

/// Project a trace onto its horizontal positions.
pub fn trace_positions(trace: &[TracePoint]) -> Vec<GeoPoint> {
    trace.iter().map(TracePoint::geo).collect()
}

/// How the subject is travelling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    Walking,
    Running,
    Cycling,
    Driving,
    Transit,
    #[default]
    Unknown,
}

impl TransportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportMode::Walking => "walking",
            TransportMode::Running => "running",
            TransportMode::Cycling => "cycling",
            TransportMode::Driving => "driving",
            TransportMode::Transit => "transit",
            TransportMode::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "walking" => TransportMode::Walking,
            "running" => TransportMode::Running,
            "cycling" => TransportMode::Cycling,
            "driving" => TransportMode::Driving,
            "transit" => TransportMode::Transit,
            _ => TransportMode::Unknown,
        }
    }
}

/// One continuous tracked travel session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Journey {
    pub id: i64,
    /// Milliseconds since the Unix epoch
    pub start_time: i64,
    /// Set when tracking stops
    pub end_time: Option<i64>,
    pub matched_route_id: Option<i64>,
    /// Total path length in meters, computed at close
    pub distance: f64,
    pub transportation_mode: TransportMode,
    pub has_deviation: bool,
}

impl Journey {
    /// Whether tracking is still in progress.
    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }

    /// Duration in seconds, if the journey has been closed.
    pub fn duration_secs(&self) -> Option<f64> {
        self.end_time
            .map(|end| (end - self.start_time).max(0) as f64 / 1000.0)
    }
}

/// A learned path the subject travels repeatedly.
///
/// `points` is always a simplified trace with at least two entries,
/// ordered start to end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub id: i64,
    pub name: String,
    pub category: Option<String>,
    /// How established the route is, in [0, 1]. Never decreases.
    pub confidence_score: f64,
    pub start_location: GeoPoint,
    pub end_location: GeoPoint,
    /// Running mean journey duration in seconds
    pub avg_duration: f64,
    pub times_traveled: u32,
    pub points: Vec<GeoPoint>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Severity chosen for a deviation alert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    /// Notify the user only
    Low,
    /// Ask the user to respond; escalate to contacts on timeout
    #[default]
    Medium,
    /// Notify the user and all contacts immediately
    High,
}

/// The subject's answer to a deviation alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviationResponse {
    /// "I'm fine"
    Dismiss,
    /// "I need help"
    Confirm,
    /// "Ask me later"
    Snooze,
    /// No answer before the escalation timeout
    AutoEscalated,
    /// The user tapped the notification body
    AppOpened,
    Unknown,
}

impl DeviationResponse {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviationResponse::Dismiss => "dismiss",
            DeviationResponse::Confirm => "confirm",
            DeviationResponse::Snooze => "snooze",
            DeviationResponse::AutoEscalated => "auto_escalated",
            DeviationResponse::AppOpened => "app_opened",
            DeviationResponse::Unknown => "unknown",
        }
    }

    /// Parse a stored response string.
    pub fn parse(value: &str) -> Self {
        match value {
            "dismiss" => DeviationResponse::Dismiss,
            "confirm" => DeviationResponse::Confirm,
            "snooze" => DeviationResponse::Snooze,
            "auto_escalated" => DeviationResponse::AutoEscalated,
            "app_opened" => DeviationResponse::AppOpened,
            _ => DeviationResponse::Unknown,
        }
    }

    /// Map a notification action identifier delivered by the dispatch layer.
    ///
    /// Tapping the notification body arrives as one of the platform default
    /// identifiers and counts as opening the app.
    pub fn from_action_identifier(identifier: &str) -> Self {
        match identifier {
            "dismiss" => DeviationResponse::Dismiss,
            "confirm" => DeviationResponse::Confirm,
            "snooze" => DeviationResponse::Snooze,
            "default" | "open" | "com.apple.UNNotificationDefaultActionIdentifier" => {
                DeviationResponse::AppOpened
            }
            _ => DeviationResponse::Unknown,
        }
    }
}

/// A recorded departure from the expected route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviationEvent {
    pub id: i64,
    pub journey_id: i64,
    pub route_id: i64,
    /// Actual position
    pub latitude: f64,
    pub longitude: f64,
    /// Position expected at the same progress along the route
    pub expected_latitude: f64,
    pub expected_longitude: f64,
    pub timestamp: i64,
    /// Meters between actual and expected position
    pub distance: f64,
    /// Set once emergency contacts have been alerted
    pub alert_sent: bool,
    pub user_response: Option<DeviationResponse>,
}

impl DeviationEvent {
    pub fn position(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }

    pub fn expected_position(&self) -> GeoPoint {
        GeoPoint::new(self.expected_latitude, self.expected_longitude)
    }
}

/// Channel an emergency contact was alerted through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertMethod {
    Sms,
    Email,
}

impl AlertMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertMethod::Sms => "sms",
            AlertMethod::Email => "email",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sms" => Some(AlertMethod::Sms),
            "email" => Some(AlertMethod::Email),
            _ => None,
        }
    }
}

/// Audit record of one contact notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub id: i64,
    pub contact_id: i64,
    pub deviation_id: i64,
    pub method: AlertMethod,
    pub timestamp: i64,
    pub message: String,
}

/// Someone to alert when a deviation escalates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyContact {
    pub id: i64,
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    /// 1 = highest
    pub priority: u32,
    pub is_active: bool,
}

impl EmergencyContact {
    /// Phone beats email; `None` when the contact cannot be reached.
    pub fn preferred_method(&self) -> Option<AlertMethod> {
        let has = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        if has(&self.phone) {
            Some(AlertMethod::Sms)
        } else if has(&self.email) {
            Some(AlertMethod::Email)
        } else {
            None
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Tunables for route learning, deviation detection and escalation.
///
/// Every field has a default, so partial JSON overrides are accepted:
///
/// ```
/// use route_guard::GuardConfig;
/// let config = GuardConfig::from_json(r#"{"deviation_threshold": 150.0}"#).unwrap();
/// assert_eq!(config.deviation_threshold, 150.0);
/// assert_eq!(config.min_analysis_points, 10);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Minimum trace points before a finished journey is analysed.
    /// Default: 10
    pub min_analysis_points: usize,

    /// Minimum trace length in meters before a finished journey is analysed.
    /// Default: 500.0
    pub min_route_distance: f64,

    /// Similarity score a known route must reach to count as a match.
    /// Default: 0.8
    pub similarity_threshold: f64,

    /// Meters from the expected position beyond which a sample is a deviation.
    /// Default: 100.0
    pub deviation_threshold: f64,

    /// Confidence assigned to a newly learned route. Default: 0.3
    pub initial_confidence: f64,

    /// Confidence added on every successful match. Default: 0.1
    pub confidence_increment: f64,

    /// Confidence cap. Default: 1.0
    pub max_confidence: f64,

    /// Seconds a medium-severity alert waits for a response. Default: 60
    pub escalation_timeout_secs: u64,

    /// Douglas-Peucker tolerance in meters. Default: 20.0
    pub simplification_epsilon: f64,

    /// Points both traces are resampled to for path comparison. Default: 20
    pub resample_count: usize,

    /// Traces shorter than this never score above zero. Default: 5
    pub min_similarity_points: usize,

    /// Point similarity falls linearly to zero at this distance in meters.
    /// Default: 200.0
    pub endpoint_similarity_radius: f64,

    /// Start and end similarity must both reach this or the score is zero.
    /// Default: 0.7
    pub endpoint_similarity_min: f64,

    /// How far a route's start may be from a journey's first sample for it
    /// to be suggested as the expected route. Default: 200.0
    pub route_suggestion_radius: f64,

    /// Assign the best suggested route on a journey's first sample.
    /// Default: true
    pub auto_assign_route: bool,

    /// Severity used when live monitoring raises an alert. Default: medium
    pub default_severity: AlertSeverity,

    /// Name used in contact messages.
    pub subject_name: String,

    /// Prefix of the map link appended to contact messages; receives "lat,lng".
    pub map_link_base: String,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            min_analysis_points: 10,
            min_route_distance: 500.0,
            similarity_threshold: 0.8,
            deviation_threshold: 100.0,
            initial_confidence: 0.3,
            confidence_increment: 0.1,
            max_confidence: 1.0,
            escalation_timeout_secs: 60,
            simplification_epsilon: 20.0,
            resample_count: 20,
            min_similarity_points: 5,
            endpoint_similarity_radius: 200.0,
            endpoint_similarity_min: 0.7,
            route_suggestion_radius: 200.0,
            auto_assign_route: true,
            default_severity: AlertSeverity::Medium,
            subject_name: "Your contact".to_string(),
            map_link_base: "https://maps.google.com/?q=".to_string(),
        }
    }
}

impl GuardConfig {
    /// Parse a (possibly partial) JSON override and validate it.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: GuardConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the algorithms cannot work with.
    pub fn validate(&self) -> Result<()> {
        let fail = |message: &str| {
            Err(GuardError::Config {
                message: message.to_string(),
            })
        };

        if !(self.min_route_distance >= 0.0) {
            return fail("min_route_distance must be non-negative");
        }
        if !(self.similarity_threshold > 0.0 && self.similarity_threshold <= 1.0) {
            return fail("similarity_threshold must be in (0, 1]");
        }
        if !(self.deviation_threshold > 0.0) {
            return fail("deviation_threshold must be positive");
        }
        if !(self.max_confidence > 0.0 && self.max_confidence <= 1.0) {
            return fail("max_confidence must be in (0, 1]");
        }
        if !(self.initial_confidence >= 0.0 && self.initial_confidence <= self.max_confidence) {
            return fail("initial_confidence must be in [0, max_confidence]");
        }
        if !(self.confidence_increment >= 0.0 && self.confidence_increment <= 1.0) {
            return fail("confidence_increment must be in [0, 1]");
        }
        if !(self.simplification_epsilon >= 0.0) {
            return fail("simplification_epsilon must be non-negative");
        }
        if self.resample_count < 2 {
            return fail("resample_count must be at least 2");
        }
        if !(self.endpoint_similarity_radius > 0.0) {
            return fail("endpoint_similarity_radius must be positive");
        }
        if !(self.endpoint_similarity_min >= 0.0 && self.endpoint_similarity_min <= 1.0) {
            return fail("endpoint_similarity_min must be in [0, 1]");
        }
        Ok(())
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ============================================================================
// Tests
// ============================================================================

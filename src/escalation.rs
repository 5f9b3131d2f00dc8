//! # Alert Escalation
//!
//! Turns a deviation into user and emergency-contact notifications.
//!
//! ## States (per deviation)
//!
//! ```text
//! Detected ──► UserNotified ──► Acknowledged
//!     │             │
//!     └─────────────┴─────────► Escalated
//! ```
//!
//! - **low**: passive user alert, no timer.
//! - **medium**: user alert with dismiss/confirm/snooze actions and a
//!   single-fire timer. The timer escalates only if no response has been
//!   recorded by the time it fires.
//! - **high**: passive user alert and immediate contact notification.
//!
//! The timer and a response arriving at nearly the same moment both go
//! through one resolution check on the tracked state; whichever gets there
//! first wins and the other becomes a no-op. A `confirm` response notifies
//! contacts whenever it arrives, including after the window has closed.
//!
//! The medium timer is armed before the user alert goes out. Once a
//! deviation leaves the pending states it is kept only as a settled entry;
//! the most recent [`SETTLED_RETENTION`] of those are remembered and older
//! ones are forgotten.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::FutureExt;
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;

use crate::error::{OptionExt, RecordKind, Result};
use crate::notify::{Notifier, ResponseAction, UserAlert};
use crate::store::{GuardStore, NewAlert};
use crate::{now_millis, AlertEvent, AlertSeverity, DeviationEvent, DeviationResponse, GuardConfig};

/// Where a deviation is in the escalation protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationState {
    Detected,
    UserNotified { awaiting_response: bool },
    Acknowledged,
    Escalated,
}

impl EscalationState {
    /// Whether a timer may still escalate this deviation.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            EscalationState::Detected
                | EscalationState::UserNotified {
                    awaiting_response: true
                }
        )
    }
}

/// Result of handling a user response.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseOutcome {
    /// The deviation as persisted with the response
    pub deviation: DeviationEvent,
    /// True when this response settled a pending escalation before its timer
    pub resolved_pending: bool,
    /// Contact alerts produced by a confirmation
    pub alerts: Vec<AlertEvent>,
}

/// Settled deviations remembered for state queries and duplicate raises.
pub const SETTLED_RETENTION: usize = 512;

#[derive(Debug)]
struct Tracked {
    state: EscalationState,
    severity: AlertSeverity,
    timer: Option<JoinHandle<()>>,
}

#[derive(Debug, Default)]
struct Registry {
    entries: HashMap<i64, Tracked>,
    // Settled ids, oldest first
    settled: VecDeque<i64>,
}

impl Registry {
    /// Move a deviation to `next`. Leaving the pending states drops the timer
    /// handle and queues the entry for eviction.
    fn transition(&mut self, id: i64, next: EscalationState) {
        let Some(tracked) = self.entries.get_mut(&id) else {
            return;
        };
        let was_pending = tracked.state.is_pending();
        tracked.state = next;
        if !was_pending || next.is_pending() {
            return;
        }

        tracked.timer = None;
        self.settled.push_back(id);
        while self.settled.len() > SETTLED_RETENTION {
            if let Some(oldest) = self.settled.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }
}

/// Escalation state machine for deviation alerts.
///
/// Cheap to clone; clones share tracked state, so a timer task holds a clone
/// of the escalator that raised it.
#[derive(Clone)]
pub struct Escalator {
    store: Arc<dyn GuardStore>,
    notifier: Arc<dyn Notifier>,
    timeout: Duration,
    subject_name: Arc<str>,
    map_link_base: Arc<str>,
    tracked: Arc<Mutex<Registry>>,
    // Serialises read-modify-write of deviation records
    record_lock: Arc<Mutex<()>>,
}

impl Escalator {
    pub fn new(
        store: Arc<dyn GuardStore>,
        notifier: Arc<dyn Notifier>,
        config: &GuardConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            timeout: Duration::from_secs(config.escalation_timeout_secs),
            subject_name: Arc::from(config.subject_name.as_str()),
            map_link_base: Arc::from(config.map_link_base.as_str()),
            tracked: Arc::new(Mutex::new(Registry::default())),
            record_lock: Arc::new(Mutex::new(())),
        }
    }

    fn tracked(&self) -> MutexGuard<'_, Registry> {
        self.tracked.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current state of a deviation raised through this escalator.
    ///
    /// `None` for deviations never raised here, and for settled ones that
    /// have aged out of the retention window.
    pub fn state(&self, deviation_id: i64) -> Option<EscalationState> {
        self.tracked().entries.get(&deviation_id).map(|t| t.state)
    }

    /// Severity a deviation was raised with.
    pub fn severity(&self, deviation_id: i64) -> Option<AlertSeverity> {
        self.tracked().entries.get(&deviation_id).map(|t| t.severity)
    }

    /// Number of deviations whose escalation timer may still fire.
    pub fn pending_count(&self) -> usize {
        let tracked = self.tracked();
        tracked.entries.len().saturating_sub(tracked.settled.len())
    }

    /// Settled deviations still remembered, at most [`SETTLED_RETENTION`].
    pub fn settled_count(&self) -> usize {
        self.tracked().settled.len()
    }

    // ========================================================================
    // Entry points
    // ========================================================================

    /// Start the escalation protocol for a freshly detected deviation.
    ///
    /// Raising the same deviation twice is a no-op that returns its current
    /// state.
    pub async fn raise(
        &self,
        deviation: &DeviationEvent,
        severity: AlertSeverity,
    ) -> Result<EscalationState> {
        let id = deviation.id;
        {
            let mut tracked = self.tracked();
            if let Some(existing) = tracked.entries.get(&id) {
                warn!("[Escalator] Deviation {} already raised", id);
                return Ok(existing.state);
            }
            tracked.entries.insert(
                id,
                Tracked {
                    state: EscalationState::Detected,
                    severity,
                    timer: None,
                },
            );
        }

        info!(
            "[Escalator] Deviation {} ({:.0} m) raised with {:?} severity",
            id, deviation.distance, severity
        );

        match severity {
            AlertSeverity::Low => {
                let state = self.advance(id, EscalationState::UserNotified {
                    awaiting_response: false,
                });
                self.deliver_user_alert(self.user_alert(deviation, false)).await;
                Ok(state)
            }
            AlertSeverity::Medium => {
                let state = self.advance(id, EscalationState::UserNotified {
                    awaiting_response: true,
                });
                if state.is_pending() {
                    self.arm_timer(id);
                }
                self.deliver_user_alert(self.user_alert(deviation, true)).await;
                Ok(state)
            }
            AlertSeverity::High => {
                self.set_state(id, EscalationState::Escalated);
                self.deliver_user_alert(self.user_alert(deviation, false)).await;
                self.notify_contacts(id).await?;
                Ok(EscalationState::Escalated)
            }
        }
    }

    /// Record the user's answer to a deviation alert.
    ///
    /// Any response settles a pending escalation if it gets there before the
    /// timer. `Confirm` additionally notifies all active contacts, even when
    /// it arrives after the timer has already escalated; calling this twice
    /// with `Confirm` notifies contacts twice.
    pub async fn handle_response(
        &self,
        deviation_id: i64,
        response: DeviationResponse,
    ) -> Result<ResponseOutcome> {
        // Fail before touching the state machine if the deviation is unknown
        self.store
            .get_deviation(deviation_id)?
            .ok_or_missing(RecordKind::Deviation, deviation_id)?;

        let resolved_pending = self.resolve_on_response(deviation_id);
        let deviation = self.update_deviation(deviation_id, |d| {
            d.user_response = Some(response);
        })?;

        info!(
            "[Escalator] Deviation {} response {} (settled pending: {})",
            deviation_id,
            response.as_str(),
            resolved_pending
        );

        let alerts = if response == DeviationResponse::Confirm {
            self.notify_contacts(deviation_id).await?
        } else {
            Vec::new()
        };

        let deviation = if alerts.is_empty() {
            deviation
        } else {
            self.store
                .get_deviation(deviation_id)?
                .ok_or_missing(RecordKind::Deviation, deviation_id)?
        };

        Ok(ResponseOutcome {
            deviation,
            resolved_pending,
            alerts,
        })
    }

    /// Alert every active contact about a deviation, highest priority first.
    ///
    /// One alert record is written per reachable contact (SMS when a phone
    /// number is known, otherwise email); contacts with neither are skipped.
    /// Record writes are fail-fast, deliveries are best-effort.
    pub async fn notify_contacts(&self, deviation_id: i64) -> Result<Vec<AlertEvent>> {
        let deviation = self
            .store
            .get_deviation(deviation_id)?
            .ok_or_missing(RecordKind::Deviation, deviation_id)?;
        let contacts = self.store.active_contacts()?;
        let message = self.contact_message(&deviation);

        let mut alerts = Vec::with_capacity(contacts.len());
        for contact in &contacts {
            let Some(method) = contact.preferred_method() else {
                debug!(
                    "[Escalator] Contact {} has no phone or email, skipping",
                    contact.id
                );
                continue;
            };

            let alert = self.store.record_alert(NewAlert {
                contact_id: contact.id,
                deviation_id,
                method,
                timestamp: now_millis(),
                message: message.clone(),
            })?;

            if let Err(e) = self.notifier.send_to_contact(contact, &alert).await {
                warn!(
                    "[Escalator] Failed to deliver {} to contact {}: {}",
                    method.as_str(),
                    contact.id,
                    e
                );
            }
            alerts.push(alert);
        }

        if !alerts.is_empty() {
            self.update_deviation(deviation_id, |d| d.alert_sent = true)?;
        }

        info!(
            "[Escalator] Deviation {}: alerted {} of {} active contacts",
            deviation_id,
            alerts.len(),
            contacts.len()
        );
        Ok(alerts)
    }

    // ========================================================================
    // Messages
    // ========================================================================

    /// Text sent to emergency contacts, with a map link to the deviation.
    pub fn contact_message(&self, deviation: &DeviationEvent) -> String {
        format!(
            "EMERGENCY ALERT: {} has gone off their usual route and may need help. \
             Last known location: {}{:.6},{:.6}",
            self.subject_name, self.map_link_base, deviation.latitude, deviation.longitude
        )
    }

    fn user_alert(&self, deviation: &DeviationEvent, requires_response: bool) -> UserAlert {
        let (title, body, actions) = if requires_response {
            (
                "Are you OK?".to_string(),
                format!(
                    "You are {:.0} m from your usual route. Your emergency contacts \
                     will be alerted in {} seconds unless you respond.",
                    deviation.distance,
                    self.timeout.as_secs()
                ),
                ResponseAction::ALL.to_vec(),
            )
        } else {
            (
                "Route deviation detected".to_string(),
                format!(
                    "You are {:.0} m from your usual route.",
                    deviation.distance
                ),
                Vec::new(),
            )
        };

        UserAlert {
            deviation_id: deviation.id,
            title,
            body,
            actions,
            requires_response,
        }
    }

    async fn deliver_user_alert(&self, alert: UserAlert) {
        let deviation_id = alert.deviation_id;
        if let Err(e) = self.notifier.notify_user(alert).await {
            warn!(
                "[Escalator] Failed to notify user about deviation {}: {}",
                deviation_id, e
            );
        }
    }

    // ========================================================================
    // State transitions
    // ========================================================================

    fn set_state(&self, id: i64, state: EscalationState) {
        self.tracked().transition(id, state);
    }

    /// Move out of `Detected`; a response that arrived meanwhile is kept.
    fn advance(&self, id: i64, next: EscalationState) -> EscalationState {
        let mut tracked = self.tracked();
        match tracked.entries.get(&id).map(|t| t.state) {
            Some(EscalationState::Detected) => {
                tracked.transition(id, next);
                next
            }
            Some(state) => state,
            None => next,
        }
    }

    /// Settle the state for an incoming response. Returns true when a pending
    /// escalation was cancelled by it.
    fn resolve_on_response(&self, id: i64) -> bool {
        let mut tracked = self.tracked();
        let Some(t) = tracked.entries.get_mut(&id) else {
            return false;
        };

        let state = t.state;
        match state {
            _ if state.is_pending() => {
                if let Some(timer) = t.timer.take() {
                    timer.abort();
                }
                tracked.transition(id, EscalationState::Acknowledged);
                true
            }
            EscalationState::UserNotified {
                awaiting_response: false,
            } => {
                tracked.transition(id, EscalationState::Acknowledged);
                false
            }
            _ => false,
        }
    }

    /// Claim a pending deviation for the timer. Returns false when a
    /// response got there first.
    fn resolve_on_timeout(&self, id: i64) -> bool {
        let mut tracked = self.tracked();
        match tracked.entries.get(&id) {
            Some(t) if t.state.is_pending() => {
                // Dropping our own handle detaches it; never abort the running task
                tracked.transition(id, EscalationState::Escalated);
                true
            }
            _ => false,
        }
    }

    fn arm_timer(&self, id: i64) {
        let escalator = self.clone();
        let handle = tokio::spawn(async move { escalator.run_timer(id).await });

        let mut tracked = self.tracked();
        match tracked.entries.get_mut(&id) {
            Some(t) if t.state.is_pending() => t.timer = Some(handle),
            _ => handle.abort(),
        }
    }

    async fn run_timer(self, id: i64) {
        tokio::time::sleep(self.timeout).await;

        match AssertUnwindSafe(self.fire_timeout(id)).catch_unwind().await {
            Ok(Ok(true)) => info!("[Escalator] Deviation {} auto-escalated", id),
            Ok(Ok(false)) => debug!("[Escalator] Deviation {} already settled", id),
            Ok(Err(e)) => error!("[Escalator] Auto-escalation of deviation {} failed: {}", id, e),
            Err(_) => error!("[Escalator] Auto-escalation of deviation {} panicked", id),
        }
    }

    async fn fire_timeout(&self, id: i64) -> Result<bool> {
        if !self.resolve_on_timeout(id) {
            return Ok(false);
        }
        self.update_deviation(id, |d| {
            d.user_response = Some(DeviationResponse::AutoEscalated);
        })?;
        self.notify_contacts(id).await?;
        Ok(true)
    }

    fn update_deviation(
        &self,
        id: i64,
        apply: impl FnOnce(&mut DeviationEvent),
    ) -> Result<DeviationEvent> {
        let _guard = self.record_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut deviation = self
            .store
            .get_deviation(id)?
            .ok_or_missing(RecordKind::Deviation, id)?;
        apply(&mut deviation);
        self.store.update_deviation(&deviation)?;
        Ok(deviation)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::RecordingNotifier;
    use crate::store::{MemoryStore, NewContact, NewDeviation};
    use crate::{GeoPoint, TransportMode};

    struct Fixture {
        store: Arc<MemoryStore>,
        notifier: Arc<RecordingNotifier>,
        escalator: Escalator,
        deviation: DeviationEvent,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let escalator = Escalator::new(store.clone(), notifier.clone(), &GuardConfig::default());

        let journey = store.create_journey(0, TransportMode::Walking).unwrap();
        let deviation = store
            .create_deviation(NewDeviation {
                journey_id: journey.id,
                route_id: 1,
                actual: GeoPoint::new(0.0, 0.002),
                expected: GeoPoint::new(0.0, 0.0),
                timestamp: 10,
                distance: 222.4,
            })
            .unwrap();

        store
            .add_contact(NewContact {
                name: "Second".to_string(),
                phone: None,
                email: Some("second@example.com".to_string()),
                priority: 2,
                is_active: true,
            })
            .unwrap();
        store
            .add_contact(NewContact {
                name: "First".to_string(),
                phone: Some("+15550100".to_string()),
                email: None,
                priority: 1,
                is_active: true,
            })
            .unwrap();
        store
            .add_contact(NewContact {
                name: "Unreachable".to_string(),
                phone: None,
                email: None,
                priority: 3,
                is_active: true,
            })
            .unwrap();

        Fixture {
            store,
            notifier,
            escalator,
            deviation,
        }
    }

    async fn wait_past_timeout() {
        tokio::time::sleep(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_severity_notifies_user_only() {
        let f = fixture();
        let state = f.escalator.raise(&f.deviation, AlertSeverity::Low).await.unwrap();
        assert_eq!(
            state,
            EscalationState::UserNotified {
                awaiting_response: false
            }
        );

        wait_past_timeout().await;

        let alerts = f.notifier.user_alerts();
        assert_eq!(alerts.len(), 1);
        assert!(!alerts[0].requires_response);
        assert!(alerts[0].actions.is_empty());
        assert!(f.notifier.contact_messages().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_medium_timeout_auto_escalates_once() {
        let f = fixture();
        let state = f
            .escalator
            .raise(&f.deviation, AlertSeverity::Medium)
            .await
            .unwrap();
        assert!(state.is_pending());
        assert_eq!(f.escalator.pending_count(), 1);

        let alert = &f.notifier.user_alerts()[0];
        assert!(alert.requires_response);
        assert_eq!(alert.actions, ResponseAction::ALL.to_vec());

        wait_past_timeout().await;

        assert_eq!(f.escalator.state(f.deviation.id), Some(EscalationState::Escalated));
        let messages = f.notifier.contact_messages();
        assert_eq!(messages.len(), 2);
        // Highest priority first, unreachable contact skipped
        assert_eq!(messages[0].method, crate::AlertMethod::Sms);
        assert_eq!(messages[1].method, crate::AlertMethod::Email);

        let stored = f.store.get_deviation(f.deviation.id).unwrap().unwrap();
        assert_eq!(stored.user_response, Some(DeviationResponse::AutoEscalated));
        assert!(stored.alert_sent);

        // Nothing else fires later
        wait_past_timeout().await;
        assert_eq!(f.notifier.contact_messages().len(), 2);
        assert_eq!(f.store.deviation_alerts(f.deviation.id).unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_medium_dismiss_never_alerts_contacts() {
        let f = fixture();
        f.escalator
            .raise(&f.deviation, AlertSeverity::Medium)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(30)).await;
        let outcome = f
            .escalator
            .handle_response(f.deviation.id, DeviationResponse::Dismiss)
            .await
            .unwrap();
        assert!(outcome.resolved_pending);
        assert!(outcome.alerts.is_empty());
        assert_eq!(outcome.deviation.user_response, Some(DeviationResponse::Dismiss));

        wait_past_timeout().await;
        assert_eq!(f.escalator.state(f.deviation.id), Some(EscalationState::Acknowledged));
        assert!(f.notifier.contact_messages().is_empty());
        assert_eq!(f.escalator.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_medium_confirm_alerts_immediately_and_timer_stays_quiet() {
        let f = fixture();
        f.escalator
            .raise(&f.deviation, AlertSeverity::Medium)
            .await
            .unwrap();

        let outcome = f
            .escalator
            .handle_response(f.deviation.id, DeviationResponse::Confirm)
            .await
            .unwrap();
        assert!(outcome.resolved_pending);
        assert_eq!(outcome.alerts.len(), 2);
        assert!(outcome.deviation.alert_sent);
        assert_eq!(f.notifier.contact_messages().len(), 2);

        wait_past_timeout().await;
        assert_eq!(f.notifier.contact_messages().len(), 2);
        let stored = f.store.get_deviation(f.deviation.id).unwrap().unwrap();
        assert_eq!(stored.user_response, Some(DeviationResponse::Confirm));
    }

    #[tokio::test(start_paused = true)]
    async fn test_medium_snooze_records_without_alerting() {
        let f = fixture();
        f.escalator
            .raise(&f.deviation, AlertSeverity::Medium)
            .await
            .unwrap();
        let outcome = f
            .escalator
            .handle_response(f.deviation.id, DeviationResponse::Snooze)
            .await
            .unwrap();
        assert!(outcome.alerts.is_empty());

        wait_past_timeout().await;
        assert!(f.notifier.contact_messages().is_empty());
        let stored = f.store.get_deviation(f.deviation.id).unwrap().unwrap();
        assert_eq!(stored.user_response, Some(DeviationResponse::Snooze));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_confirm_still_escalates() {
        let f = fixture();
        f.escalator
            .raise(&f.deviation, AlertSeverity::Medium)
            .await
            .unwrap();
        wait_past_timeout().await;
        assert_eq!(f.notifier.contact_messages().len(), 2);

        let outcome = f
            .escalator
            .handle_response(f.deviation.id, DeviationResponse::Confirm)
            .await
            .unwrap();
        assert!(!outcome.resolved_pending);
        assert_eq!(outcome.alerts.len(), 2);
        assert_eq!(f.notifier.contact_messages().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_high_severity_alerts_contacts_without_timer() {
        let f = fixture();
        let state = f
            .escalator
            .raise(&f.deviation, AlertSeverity::High)
            .await
            .unwrap();
        assert_eq!(state, EscalationState::Escalated);
        assert_eq!(f.notifier.contact_messages().len(), 2);
        assert_eq!(f.escalator.pending_count(), 0);

        // A later dismissal does not undo anything and nothing else fires
        f.escalator
            .handle_response(f.deviation.id, DeviationResponse::Dismiss)
            .await
            .unwrap();
        wait_past_timeout().await;
        assert_eq!(f.notifier.contact_messages().len(), 2);
        assert_eq!(f.escalator.state(f.deviation.id), Some(EscalationState::Escalated));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_failures_do_not_block_escalation() {
        let f = fixture();
        f.notifier.set_failing(true);
        f.escalator
            .raise(&f.deviation, AlertSeverity::Medium)
            .await
            .unwrap();
        wait_past_timeout().await;

        // Records are written even though every delivery failed
        assert_eq!(f.store.deviation_alerts(f.deviation.id).unwrap().len(), 2);
        assert_eq!(f.escalator.state(f.deviation.id), Some(EscalationState::Escalated));
    }

    #[tokio::test(start_paused = true)]
    async fn test_raise_twice_is_noop() {
        let f = fixture();
        f.escalator
            .raise(&f.deviation, AlertSeverity::Medium)
            .await
            .unwrap();
        let state = f
            .escalator
            .raise(&f.deviation, AlertSeverity::High)
            .await
            .unwrap();
        assert!(state.is_pending());
        assert_eq!(f.notifier.user_alerts().len(), 1);
        assert_eq!(f.escalator.severity(f.deviation.id), Some(AlertSeverity::Medium));

        wait_past_timeout().await;
        assert_eq!(f.notifier.contact_messages().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_user_alert_does_not_hold_back_the_timer() {
        let f = fixture();
        f.notifier.set_stalled(true);

        let escalator = f.escalator.clone();
        let deviation = f.deviation.clone();
        let raising =
            tokio::spawn(async move { escalator.raise(&deviation, AlertSeverity::Medium).await });
        tokio::task::yield_now().await;
        assert_eq!(
            f.escalator.state(f.deviation.id),
            Some(EscalationState::UserNotified {
                awaiting_response: true
            })
        );

        wait_past_timeout().await;
        assert_eq!(f.escalator.state(f.deviation.id), Some(EscalationState::Escalated));
        assert_eq!(f.notifier.contact_messages().len(), 2);
        // The push itself never completed
        assert!(!raising.is_finished());
        raising.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_settled_escalations_are_forgotten_oldest_first() {
        let f = fixture();
        let mut oldest = None;
        for i in 0..SETTLED_RETENTION + 10 {
            let deviation = f
                .store
                .create_deviation(NewDeviation {
                    journey_id: f.deviation.journey_id,
                    route_id: 1,
                    actual: GeoPoint::new(0.0, 0.002),
                    expected: GeoPoint::new(0.0, 0.0),
                    timestamp: i as i64,
                    distance: 222.4,
                })
                .unwrap();
            oldest.get_or_insert(deviation.id);
            f.escalator
                .raise(&deviation, AlertSeverity::Medium)
                .await
                .unwrap();
            f.escalator
                .handle_response(deviation.id, DeviationResponse::Dismiss)
                .await
                .unwrap();
        }

        assert_eq!(f.escalator.pending_count(), 0);
        assert_eq!(f.escalator.settled_count(), SETTLED_RETENTION);
        assert_eq!(f.escalator.state(oldest.unwrap()), None);

        wait_past_timeout().await;
        assert!(f.notifier.contact_messages().is_empty());
    }

    #[tokio::test]
    async fn test_response_for_unknown_deviation_fails() {
        let f = fixture();
        let result = f
            .escalator
            .handle_response(9_999, DeviationResponse::Confirm)
            .await;
        assert!(matches!(
            result,
            Err(crate::GuardError::NotFound {
                kind: RecordKind::Deviation,
                ..
            })
        ));
    }

    #[test]
    fn test_contact_message_has_map_link() {
        let f = fixture();
        let message = f.escalator.contact_message(&f.deviation);
        assert!(message.contains("Your contact"));
        assert!(message.contains("https://maps.google.com/?q=0.000000,0.002000"));
    }
}

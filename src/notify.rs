//! Notification dispatch collaborator.
//!
//! The engine decides *what* to tell the user and contacts; a [`Notifier`]
//! delivers it. Delivery is best-effort: the escalator logs a failed
//! delivery and carries on, and the records already written stay written.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use futures::future::{self, BoxFuture};
use log::info;

use crate::error::{GuardError, Result};
use crate::{AlertEvent, EmergencyContact};

/// Action buttons attached to a response-required alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseAction {
    Dismiss,
    Confirm,
    Snooze,
}

impl ResponseAction {
    pub const ALL: [ResponseAction; 3] = [
        ResponseAction::Dismiss,
        ResponseAction::Confirm,
        ResponseAction::Snooze,
    ];

    /// Identifier echoed back by the dispatch layer when tapped.
    pub fn identifier(&self) -> &'static str {
        match self {
            ResponseAction::Dismiss => "dismiss",
            ResponseAction::Confirm => "confirm",
            ResponseAction::Snooze => "snooze",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ResponseAction::Dismiss => "I'm OK",
            ResponseAction::Confirm => "I need help",
            ResponseAction::Snooze => "Remind me later",
        }
    }
}

/// A user-facing alert about a deviation.
#[derive(Debug, Clone, PartialEq)]
pub struct UserAlert {
    pub deviation_id: i64,
    pub title: String,
    pub body: String,
    /// Empty for passive alerts
    pub actions: Vec<ResponseAction>,
    pub requires_response: bool,
}

/// Delivers alerts to the user and messages to emergency contacts.
pub trait Notifier: Send + Sync {
    fn notify_user(&self, alert: UserAlert) -> BoxFuture<'_, Result<()>>;

    fn send_to_contact<'a>(
        &'a self,
        contact: &'a EmergencyContact,
        alert: &'a AlertEvent,
    ) -> BoxFuture<'a, Result<()>>;
}

/// Notifier that only writes to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify_user(&self, alert: UserAlert) -> BoxFuture<'_, Result<()>> {
        info!(
            "[Notifier] User alert for deviation {}: {} (response required: {})",
            alert.deviation_id, alert.title, alert.requires_response
        );
        Box::pin(future::ready(Ok(())))
    }

    fn send_to_contact<'a>(
        &'a self,
        contact: &'a EmergencyContact,
        alert: &'a AlertEvent,
    ) -> BoxFuture<'a, Result<()>> {
        info!(
            "[Notifier] {} to {} for deviation {}",
            alert.method.as_str(),
            contact.name,
            alert.deviation_id
        );
        Box::pin(future::ready(Ok(())))
    }
}

/// One delivery captured by [`RecordingNotifier`].
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    User(UserAlert),
    Contact { contact_id: i64, alert: AlertEvent },
}

/// Notifier that records every delivery, for hosts' tests and dry runs.
///
/// With [`set_failing(true)`](RecordingNotifier::set_failing) every delivery
/// is still recorded but reported as failed. With
/// [`set_stalled(true)`](RecordingNotifier::set_stalled) user alerts are
/// recorded and then never complete, like a push transport that hangs.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    deliveries: Mutex<Vec<Delivery>>,
    failing: AtomicBool,
    stalled: AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default()
    }

    pub fn user_alerts(&self) -> Vec<UserAlert> {
        self.deliveries()
            .into_iter()
            .filter_map(|d| match d {
                Delivery::User(alert) => Some(alert),
                Delivery::Contact { .. } => None,
            })
            .collect()
    }

    pub fn contact_messages(&self) -> Vec<AlertEvent> {
        self.deliveries()
            .into_iter()
            .filter_map(|d| match d {
                Delivery::Contact { alert, .. } => Some(alert),
                Delivery::User(_) => None,
            })
            .collect()
    }

    fn record(&self, delivery: Delivery) -> Result<()> {
        if let Ok(mut deliveries) = self.deliveries.lock() {
            deliveries.push(delivery);
        }
        if self.failing.load(Ordering::SeqCst) {
            Err(GuardError::delivery("recording notifier set to fail"))
        } else {
            Ok(())
        }
    }
}

impl Notifier for RecordingNotifier {
    fn notify_user(&self, alert: UserAlert) -> BoxFuture<'_, Result<()>> {
        let result = self.record(Delivery::User(alert));
        if self.stalled.load(Ordering::SeqCst) {
            return Box::pin(future::pending());
        }
        Box::pin(future::ready(result))
    }

    fn send_to_contact<'a>(
        &'a self,
        contact: &'a EmergencyContact,
        alert: &'a AlertEvent,
    ) -> BoxFuture<'a, Result<()>> {
        let result = self.record(Delivery::Contact {
            contact_id: contact.id,
            alert: alert.clone(),
        });
        Box::pin(future::ready(result))
    }
}

//! Tracking session state.
//!
//! The location-capture side owns a [`TrackingSession`] and hands it to the
//! engine on every call, so the engine itself holds no "current journey".
//! At most one journey is open per session.

use tokio::sync::watch;

use crate::error::{GuardError, Result};

/// The open journey of one tracked subject, plus the stop signal for its
/// live monitoring loop.
#[derive(Debug)]
pub struct TrackingSession {
    journey_id: Option<i64>,
    samples_recorded: u64,
    stop_tx: watch::Sender<bool>,
}

impl Default for TrackingSession {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackingSession {
    pub fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            journey_id: None,
            samples_recorded: 0,
            stop_tx,
        }
    }

    /// Id of the open journey, if tracking.
    pub fn journey_id(&self) -> Option<i64> {
        self.journey_id
    }

    pub fn is_tracking(&self) -> bool {
        self.journey_id.is_some()
    }

    /// Samples accepted for the open journey.
    pub fn samples_recorded(&self) -> u64 {
        self.samples_recorded
    }

    /// Receiver that flips to `true` when the current journey stops.
    ///
    /// Each journey gets a fresh channel, so a receiver taken for one journey
    /// never observes the next one starting.
    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    pub(crate) fn open_journey(&self) -> Result<i64> {
        self.journey_id.ok_or(GuardError::NotTracking)
    }

    pub(crate) fn ensure_idle(&self) -> Result<()> {
        match self.journey_id {
            Some(journey_id) => Err(GuardError::AlreadyTracking { journey_id }),
            None => Ok(()),
        }
    }

    pub(crate) fn begin(&mut self, journey_id: i64) -> Result<()> {
        self.ensure_idle()?;
        let (stop_tx, _) = watch::channel(false);
        self.stop_tx = stop_tx;
        self.journey_id = Some(journey_id);
        self.samples_recorded = 0;
        Ok(())
    }

    pub(crate) fn note_sample(&mut self) {
        self.samples_recorded += 1;
    }

    /// Close the session and signal any monitor loop to stop.
    pub(crate) fn end(&mut self) -> Result<i64> {
        let journey_id = self.open_journey()?;
        // Nobody listening is fine
        let _ = self.stop_tx.send(true);
        self.journey_id = None;
        Ok(journey_id)
    }
}

use crate::model::{Attendance, Clock, TesterSnapshot};
use crate::registry::{EndpointRegistry, EndpointView, RegistryError, ServerEndpoint};
use crate::roster::{PollSettings, RosterPoller};
use crate::tracker::{self, Notifier, StateTracker, TesterMap};
use std::sync::{Arc, Mutex};
use std::{fmt, time::Duration};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    AlreadyActive,
    NotActive,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyActive => write!(f, "a tracking session is already active"),
            Self::NotActive => write!(f, "no tracking session is active"),
        }
    }
}

impl std::error::Error for SessionError {}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub poll: PollSettings,
    pub tracker_interval: Duration,
    pub queue_capacity: usize,
    pub stop_grace: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            poll: PollSettings::default(),
            tracker_interval: Duration::from_millis(500),
            queue_capacity: 256,
            stop_grace: Duration::from_secs(6),
        }
    }
}

struct ActiveSession {
    id: Uuid,
    stop_tx: watch::Sender<bool>,
    poller: JoinHandle<()>,
    tracker: JoinHandle<StateTracker>,
}

/// Operations the chat front end drives: endpoint registration and the
/// start/stop lifecycle of one tracking session at a time.
pub struct PresenceService {
    registry: Arc<Mutex<EndpointRegistry>>,
    // Serializes registry writers so each one persists on top of the last.
    registry_writer: tokio::sync::Mutex<()>,
    testers: TesterMap,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    settings: SessionSettings,
    active: tokio::sync::Mutex<Option<ActiveSession>>,
}

impl PresenceService {
    pub fn new(
        registry: EndpointRegistry,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            registry: Arc::new(Mutex::new(registry)),
            registry_writer: tokio::sync::Mutex::new(()),
            testers: TesterMap::default(),
            clock,
            notifier,
            settings,
            active: tokio::sync::Mutex::new(None),
        }
    }

    /// Adds or replaces an endpoint and persists the registry. Returns true
    /// when an existing entry with the same address and port was replaced.
    /// Nothing changes in memory unless the write succeeds.
    pub async fn register_endpoint(&self, endpoint: ServerEndpoint) -> Result<bool, RegistryError> {
        let _writer = self.registry_writer.lock().await;
        let key = endpoint.key();
        let mut candidate = self.registry.lock().unwrap().clone();
        let replaced = candidate.register(endpoint).is_some();
        let candidate = candidate.persist().await?;
        *self.registry.lock().unwrap() = candidate;
        tracing::info!(endpoint = %key, replaced, "endpoint registered");
        Ok(replaced)
    }

    /// Returns false when no such endpoint was registered.
    pub async fn unregister_endpoint(&self, address: &str, port: u16) -> Result<bool, RegistryError> {
        let _writer = self.registry_writer.lock().await;
        let mut candidate = self.registry.lock().unwrap().clone();
        if candidate.unregister(address, port).is_none() {
            return Ok(false);
        }
        let candidate = candidate.persist().await?;
        *self.registry.lock().unwrap() = candidate;
        tracing::info!(endpoint = %crate::registry::endpoint_key(address, port), "endpoint removed");
        Ok(true)
    }

    pub fn list_endpoints(&self) -> Vec<EndpointView> {
        self.registry.lock().unwrap().list()
    }

    pub fn current_roster_snapshot(&self) -> Vec<TesterSnapshot> {
        tracker::snapshot(&self.testers, self.clock.now())
    }

    pub async fn is_active(&self) -> bool {
        self.active.lock().await.is_some()
    }

    pub async fn start_session(&self) -> Result<Uuid, SessionError> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(SessionError::AlreadyActive);
        }

        self.testers.lock().unwrap().clear();

        let (event_tx, event_rx) = mpsc::channel(self.settings.queue_capacity);
        let (stop_tx, stop_rx) = watch::channel(false);

        let poller = RosterPoller::new(
            self.registry.clone(),
            self.testers.clone(),
            event_tx,
            self.clock.clone(),
            self.settings.poll.clone(),
        );
        let tracker = StateTracker::new(self.testers.clone(), event_rx, self.notifier.clone());

        let poller = tokio::spawn(poller.run(stop_rx.clone()));
        let tracker = tokio::spawn(tracker.run(self.settings.tracker_interval, stop_rx));

        let id = Uuid::new_v4();
        tracing::info!(session_id = %id, "tracking session started");
        *active = Some(ActiveSession {
            id,
            stop_tx,
            poller,
            tracker,
        });
        Ok(id)
    }

    /// Stops polling, waits for the in-flight tick, finalizes attendance and
    /// discards events that were still queued. The session slot stays locked
    /// until finalization is done, so a concurrent start waits for it.
    pub async fn stop_session(&self) -> Result<Vec<Attendance>, SessionError> {
        let mut active = self.active.lock().await;
        let session = active.take().ok_or(SessionError::NotActive)?;

        let _ = session.stop_tx.send(true);

        let mut poller = session.poller;
        match tokio::time::timeout(self.settings.stop_grace, &mut poller).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::warn!(session_id = %session.id, error = %err, "roster poller ended abnormally");
            }
            Err(_) => {
                tracing::warn!(
                    session_id = %session.id,
                    grace_ms = self.settings.stop_grace.as_millis() as u64,
                    "roster poller did not stop in time; aborting it"
                );
                poller.abort();
            }
        }

        let tracker = match session.tracker.await {
            Ok(tracker) => Some(tracker),
            Err(err) => {
                tracing::warn!(session_id = %session.id, error = %err, "state tracker ended abnormally");
                None
            }
        };

        let attendance = tracker::finalize(&self.testers, self.clock.now());

        if let Some(mut tracker) = tracker {
            let discarded = tracker.discard_pending();
            if discarded > 0 {
                tracing::debug!(session_id = %session.id, discarded, "discarded queued events at stop");
            }
        }

        tracing::info!(
            session_id = %session.id,
            testers = attendance.len(),
            "tracking session stopped"
        );
        drop(active);
        Ok(attendance)
    }
}

use crate::model::{Attendance, PlayerStatusEvent, TesterRecord, TesterSnapshot, TesterStatus};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

pub type TesterMap = Arc<Mutex<HashMap<String, TesterRecord>>>;

/// Sink for announcement text. Implementations must not block.
pub trait Notifier: Send + Sync {
    fn notify(&self, text: String);
}

#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, text: String) {
        for line in text.lines() {
            tracing::info!("{}", line);
        }
    }
}

/// Posts announcements to a chat webhook (`{"content": ...}`). One delivery
/// task sends them in the order they were raised.
pub struct WebhookNotifier {
    outbox: mpsc::UnboundedSender<String>,
}

impl WebhookNotifier {
    /// Must be called inside a tokio runtime; spawns the delivery task.
    pub fn new(url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        let url = url.into();
        let (outbox, mut pending) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            while let Some(text) = pending.recv().await {
                deliver(&http, &url, text).await;
            }
        });
        Ok(Self { outbox })
    }
}

async fn deliver(http: &reqwest::Client, url: &str, text: String) {
    let body = serde_json::json!({ "content": text });
    match http.post(url).json(&body).send().await {
        Ok(resp) if !resp.status().is_success() => {
            tracing::warn!(status = %resp.status(), "webhook rejected notification");
        }
        Ok(_) => {}
        Err(err) => tracing::warn!(error = %err, "webhook notification failed"),
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, text: String) {
        if self.outbox.send(text).is_err() {
            tracing::warn!("webhook delivery task is gone; notification dropped");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Joined,
    Rejoined,
    Left,
}

/// Applies one event to the tester map. Returns the transition that
/// happened, or `None` when the event matched the current state.
pub fn apply_event(
    testers: &mut HashMap<String, TesterRecord>,
    event: &PlayerStatusEvent,
) -> Option<Transition> {
    match event.status {
        TesterStatus::Connected => match testers.get_mut(&event.network_id) {
            None => {
                testers.insert(
                    event.network_id.clone(),
                    TesterRecord {
                        network_id: event.network_id.clone(),
                        name: event.name.clone(),
                        join_time: event.observed_at,
                        end_time: None,
                        status: TesterStatus::Connected,
                    },
                );
                Some(Transition::Joined)
            }
            Some(record) if record.status == TesterStatus::Disconnected => {
                record.status = TesterStatus::Connected;
                record.end_time = None;
                Some(Transition::Rejoined)
            }
            Some(_) => None,
        },
        TesterStatus::Disconnected => match testers.get_mut(&event.network_id) {
            Some(record) if record.status == TesterStatus::Connected => {
                record.status = TesterStatus::Disconnected;
                record.end_time = Some(event.observed_at);
                Some(Transition::Left)
            }
            _ => None,
        },
    }
}

fn announcement(name: &str, transition: Transition) -> String {
    match transition {
        Transition::Joined => format!("{name} joined the test."),
        Transition::Rejoined => format!("{name} rejoined the test."),
        Transition::Left => format!("{name} left the test."),
    }
}

/// Single consumer of the poller's events and the only writer of the
/// tester map while a session runs.
pub struct StateTracker {
    testers: TesterMap,
    events: mpsc::Receiver<PlayerStatusEvent>,
    notifier: Arc<dyn Notifier>,
}

impl StateTracker {
    pub fn new(
        testers: TesterMap,
        events: mpsc::Receiver<PlayerStatusEvent>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            testers,
            events,
            notifier,
        }
    }

    /// Applies every queued event without waiting and sends at most one
    /// combined notification. Returns the number of transitions.
    pub fn drain(&mut self) -> usize {
        let mut lines = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            let transition = {
                let mut testers = self.testers.lock().unwrap();
                apply_event(&mut testers, &event)
            };
            if let Some(transition) = transition {
                tracing::info!(
                    network_id = %event.network_id,
                    name = %event.name,
                    ?transition,
                    "tester status changed"
                );
                lines.push(announcement(&event.name, transition));
            }
        }

        let count = lines.len();
        if count > 0 {
            self.notifier.notify(lines.join("\n"));
        }
        count
    }

    /// Drains once per `interval` until `stop` flips. Returns the tracker so
    /// the caller can finalize and discard what is still queued.
    pub async fn run(mut self, interval: Duration, mut stop: watch::Receiver<bool>) -> Self {
        let mut ticker = tokio::time::interval(interval);
        loop {
            if *stop.borrow() {
                break;
            }
            tokio::select! {
                biased;
                _ = stop.changed() => break,
                _ = ticker.tick() => {
                    self.drain();
                }
            }
        }
        self
    }

    /// Drops every event still queued without applying it.
    pub fn discard_pending(&mut self) -> usize {
        self.events.close();
        let mut discarded = 0;
        while self.events.try_recv().is_ok() {
            discarded += 1;
        }
        discarded
    }
}

/// Stamps testers still connected with `now`, reports attendance ordered by
/// join time and clears the map.
pub fn finalize(testers: &TesterMap, now: u64) -> Vec<Attendance> {
    let mut testers = testers.lock().unwrap();
    let mut records: Vec<TesterRecord> = testers.drain().map(|(_, record)| record).collect();
    records.sort_by(|a, b| {
        a.join_time
            .cmp(&b.join_time)
            .then_with(|| a.network_id.cmp(&b.network_id))
    });

    records
        .into_iter()
        .map(|mut record| {
            if record.status == TesterStatus::Connected {
                record.end_time = Some(now);
                record.status = TesterStatus::Disconnected;
            }
            Attendance {
                elapsed_secs: record.elapsed_secs(now),
                network_id: record.network_id,
                name: record.name,
            }
        })
        .collect()
}

pub fn snapshot(testers: &TesterMap, now: u64) -> Vec<TesterSnapshot> {
    let testers = testers.lock().unwrap();
    let mut out: Vec<TesterSnapshot> = testers
        .values()
        .map(|record| TesterSnapshot {
            network_id: record.network_id.clone(),
            name: record.name.clone(),
            status: record.status,
            join_time: record.join_time,
            end_time: record.end_time,
            elapsed_secs: record.elapsed_secs(now),
        })
        .collect();
    out.sort_by(|a, b| {
        a.join_time
            .cmp(&b.join_time)
            .then_with(|| a.network_id.cmp(&b.network_id))
    });
    out
}

#[cfg(test)]
pub(crate) mod testing {
    use super::Notifier;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    pub struct RecordingNotifier {
        pub messages: Mutex<Vec<String>>,
    }

    impl RecordingNotifier {
        pub fn messages(&self) -> Vec<String> {
            self.messages.lock().unwrap().clone()
        }
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, text: String) {
            self.messages.lock().unwrap().push(text);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingNotifier;
    use super::*;

    fn event(id: &str, name: &str, status: TesterStatus, at: u64) -> PlayerStatusEvent {
        PlayerStatusEvent {
            network_id: id.to_string(),
            name: name.to_string(),
            status,
            observed_at: at,
        }
    }

    fn tracker() -> (
        StateTracker,
        mpsc::Sender<PlayerStatusEvent>,
        TesterMap,
        Arc<RecordingNotifier>,
    ) {
        let (tx, rx) = mpsc::channel(32);
        let testers = TesterMap::default();
        let notifier = Arc::new(RecordingNotifier::default());
        let tracker = StateTracker::new(testers.clone(), rx, notifier.clone());
        (tracker, tx, testers, notifier)
    }

    #[tokio::test]
    async fn duplicate_connect_is_a_noop() {
        let (mut tracker, tx, testers, notifier) = tracker();
        tx.send(event("[U:1:1]", "Alice", TesterStatus::Connected, 100))
            .await
            .unwrap();
        tx.send(event("[U:1:1]", "Alice", TesterStatus::Connected, 105))
            .await
            .unwrap();

        assert_eq!(tracker.drain(), 1);
        let record = testers.lock().unwrap().get("[U:1:1]").cloned().unwrap();
        assert_eq!(record.join_time, 100);
        assert_eq!(record.end_time, None);
        assert_eq!(notifier.messages(), vec!["Alice joined the test.".to_string()]);
    }

    #[tokio::test]
    async fn one_notification_per_drain() {
        let (mut tracker, tx, _testers, notifier) = tracker();
        tx.send(event("[U:1:1]", "Alice", TesterStatus::Connected, 100))
            .await
            .unwrap();
        tx.send(event("[U:1:2]", "Bob", TesterStatus::Connected, 100))
            .await
            .unwrap();
        tx.send(event("[U:1:1]", "Alice", TesterStatus::Disconnected, 110))
            .await
            .unwrap();

        assert_eq!(tracker.drain(), 3);
        assert_eq!(tracker.drain(), 0);
        assert_eq!(
            notifier.messages(),
            vec!["Alice joined the test.\nBob joined the test.\nAlice left the test.".to_string()]
        );
    }

    #[test]
    fn disconnect_sets_end_time_once_and_reconnect_clears_it() {
        let mut testers = HashMap::new();
        apply_event(&mut testers, &event("[U:1:1]", "Alice", TesterStatus::Connected, 100));
        assert_eq!(
            apply_event(&mut testers, &event("[U:1:1]", "Alice", TesterStatus::Disconnected, 130)),
            Some(Transition::Left)
        );
        assert_eq!(
            apply_event(&mut testers, &event("[U:1:1]", "Alice", TesterStatus::Disconnected, 140)),
            None
        );
        assert_eq!(testers["[U:1:1]"].end_time, Some(130));

        assert_eq!(
            apply_event(&mut testers, &event("[U:1:1]", "Alice", TesterStatus::Connected, 150)),
            Some(Transition::Rejoined)
        );
        assert_eq!(testers["[U:1:1]"].end_time, None);
        assert_eq!(testers["[U:1:1]"].join_time, 100);
    }

    #[test]
    fn disconnect_of_unknown_player_is_ignored() {
        let mut testers = HashMap::new();
        assert_eq!(
            apply_event(&mut testers, &event("[U:1:9]", "Ghost", TesterStatus::Disconnected, 1)),
            None
        );
        assert!(testers.is_empty());
    }

    #[test]
    fn finalize_stamps_connected_testers_and_clears_map() {
        let testers = TesterMap::default();
        {
            let mut map = testers.lock().unwrap();
            apply_event(&mut map, &event("[U:1:2]", "Bob", TesterStatus::Connected, 200));
            apply_event(&mut map, &event("[U:1:1]", "Alice", TesterStatus::Connected, 100));
            apply_event(&mut map, &event("[U:1:1]", "Alice", TesterStatus::Disconnected, 160));
        }

        let attendance = finalize(&testers, 500);
        assert_eq!(
            attendance,
            vec![
                Attendance {
                    network_id: "[U:1:1]".to_string(),
                    name: "Alice".to_string(),
                    elapsed_secs: 60,
                },
                Attendance {
                    network_id: "[U:1:2]".to_string(),
                    name: "Bob".to_string(),
                    elapsed_secs: 300,
                },
            ]
        );
        assert!(testers.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn discard_pending_drops_queued_events() {
        let (mut tracker, tx, testers, notifier) = tracker();
        tx.send(event("[U:1:1]", "Alice", TesterStatus::Connected, 100))
            .await
            .unwrap();
        assert_eq!(tracker.discard_pending(), 1);
        assert!(testers.lock().unwrap().is_empty());
        assert!(notifier.messages().is_empty());
        assert!(tx.send(event("[U:1:2]", "Bob", TesterStatus::Connected, 1)).await.is_err());
    }

    #[tokio::test]
    async fn run_returns_tracker_when_stopped() {
        let (tracker, tx, testers, _notifier) = tracker();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(tracker.run(Duration::from_millis(10), stop_rx));

        tx.send(event("[U:1:1]", "Alice", TesterStatus::Connected, 100))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        stop_tx.send(true).unwrap();
        let _tracker = handle.await.unwrap();
        assert!(testers.lock().unwrap().contains_key("[U:1:1]"));
    }

    #[tokio::test]
    async fn webhook_delivers_in_order_even_when_first_post_is_slow() {
        use axum::{extract::State, routing::post, Json, Router};

        type Received = Arc<Mutex<Vec<String>>>;

        async fn record(
            State(received): State<Received>,
            Json(body): Json<serde_json::Value>,
        ) -> &'static str {
            let text = body["content"].as_str().unwrap_or_default().to_string();
            if text.contains("joined") {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            received.lock().unwrap().push(text);
            "ok"
        }

        let received = Received::default();
        let app = Router::new()
            .route("/hook", post(record))
            .with_state(received.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let notifier = WebhookNotifier::new(format!("http://{addr}/hook")).unwrap();
        notifier.notify("Alice joined the test.".to_string());
        notifier.notify("Alice left the test.".to_string());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while received.lock().unwrap().len() < 2 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(
            *received.lock().unwrap(),
            vec![
                "Alice joined the test.".to_string(),
                "Alice left the test.".to_string()
            ]
        );
    }
}

use crate::model::{Clock, PlayerStatusEvent};
use crate::rcon;
use crate::reconcile::reconcile;
use crate::registry::{EndpointRegistry, ServerEndpoint};
use crate::tracker::TesterMap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterEntry {
    pub network_id: String,
    pub name: String,
}

/// Parses a `player_info` style listing: `<network id> <user id> <name>`.
/// Lines whose id lacks `id_prefix` (bots) or that do not parse are skipped.
pub fn parse_player_info(text: &str, id_prefix: &str) -> Vec<RosterEntry> {
    text.lines().filter_map(|line| parse_line(line, id_prefix)).collect()
}

fn parse_line(line: &str, id_prefix: &str) -> Option<RosterEntry> {
    let mut tokens = line.split_whitespace();
    let network_id = tokens.next()?;
    if !network_id.starts_with(id_prefix) {
        return None;
    }
    let user_token = tokens.next()?;
    user_token.parse::<u32>().ok()?;

    let rest = line.trim_start();
    let rest = rest[network_id.len()..].trim_start();
    let name = rest[user_token.len()..].trim();
    let name = if name.is_empty() { network_id } else { name };

    Some(RosterEntry {
        network_id: network_id.to_string(),
        name: name.to_string(),
    })
}

#[derive(Debug, Clone)]
pub struct PollSettings {
    pub interval: Duration,
    pub io_timeout: Duration,
    pub command: String,
    pub id_prefix: String,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1000),
            io_timeout: Duration::from_millis(5000),
            command: "player_info".to_string(),
            id_prefix: "[U:".to_string(),
        }
    }
}

/// Queries every registered endpoint once per tick and feeds the diff of the
/// merged roster to the tracker queue.
pub struct RosterPoller {
    registry: Arc<Mutex<EndpointRegistry>>,
    testers: TesterMap,
    events: mpsc::Sender<PlayerStatusEvent>,
    clock: Arc<dyn Clock>,
    settings: PollSettings,
}

impl RosterPoller {
    pub fn new(
        registry: Arc<Mutex<EndpointRegistry>>,
        testers: TesterMap,
        events: mpsc::Sender<PlayerStatusEvent>,
        clock: Arc<dyn Clock>,
        settings: PollSettings,
    ) -> Self {
        Self {
            registry,
            testers,
            events,
            clock,
            settings,
        }
    }

    /// Polls until `stop` flips to true. A tick in progress always completes.
    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            if *stop.borrow() {
                break;
            }
            tokio::select! {
                biased;
                _ = stop.changed() => break,
                _ = ticker.tick() => {}
            }
            if self.tick().await.is_err() {
                tracing::debug!("tracker queue closed; poller exiting");
                break;
            }
        }
        tracing::debug!("roster poller stopped");
    }

    pub async fn tick(&self) -> Result<usize, mpsc::error::SendError<PlayerStatusEvent>> {
        let endpoints = self.registry.lock().unwrap().snapshot();
        let roster = self.collect(endpoints).await;
        let observed_at = self.clock.now();

        let events = {
            let testers = self.testers.lock().unwrap();
            reconcile(&roster, &testers, observed_at)
        };

        let count = events.len();
        for event in events {
            self.events.send(event).await?;
        }
        Ok(count)
    }

    /// Union of all endpoint rosters. Unreachable endpoints contribute nothing.
    pub async fn collect(&self, endpoints: Vec<ServerEndpoint>) -> HashMap<String, RosterEntry> {
        let mut workers = JoinSet::new();
        for endpoint in endpoints {
            let command = self.settings.command.clone();
            let id_prefix = self.settings.id_prefix.clone();
            let io_timeout = self.settings.io_timeout;
            workers.spawn(async move {
                let body = rcon::query(&endpoint, &command, io_timeout).await;
                parse_player_info(&body, &id_prefix)
            });
        }

        let mut roster = HashMap::new();
        while let Some(result) = workers.join_next().await {
            match result {
                Ok(entries) => {
                    for entry in entries {
                        roster.insert(entry.network_id.clone(), entry);
                    }
                }
                Err(err) => tracing::warn!(error = %err, "endpoint worker failed"),
            }
        }
        roster
    }
}

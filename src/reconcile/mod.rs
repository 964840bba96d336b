use crate::model::{PlayerStatusEvent, TesterRecord, TesterStatus};
use crate::roster::RosterEntry;
use std::collections::HashMap;

/// Diffs the merged roster of one tick against the known testers.
///
/// Must only be given the union of every endpoint's roster: a tester is
/// judged gone when no endpoint reports them.
pub fn reconcile(
    roster: &HashMap<String, RosterEntry>,
    testers: &HashMap<String, TesterRecord>,
    observed_at: u64,
) -> Vec<PlayerStatusEvent> {
    let mut left: Vec<PlayerStatusEvent> = testers
        .values()
        .filter(|t| t.status == TesterStatus::Connected && !roster.contains_key(&t.network_id))
        .map(|t| PlayerStatusEvent {
            network_id: t.network_id.clone(),
            name: t.name.clone(),
            status: TesterStatus::Disconnected,
            observed_at,
        })
        .collect();

    let mut joined: Vec<PlayerStatusEvent> = roster
        .values()
        .filter(|entry| {
            testers
                .get(&entry.network_id)
                .map_or(true, |t| t.status == TesterStatus::Disconnected)
        })
        .map(|entry| PlayerStatusEvent {
            network_id: entry.network_id.clone(),
            name: entry.name.clone(),
            status: TesterStatus::Connected,
            observed_at,
        })
        .collect();

    left.sort_by(|a, b| a.network_id.cmp(&b.network_id));
    joined.sort_by(|a, b| a.network_id.cmp(&b.network_id));
    left.append(&mut joined);
    left
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, name: &str) -> RosterEntry {
        RosterEntry {
            network_id: id.to_string(),
            name: name.to_string(),
        }
    }

    fn tester(id: &str, name: &str, status: TesterStatus) -> TesterRecord {
        TesterRecord {
            network_id: id.to_string(),
            name: name.to_string(),
            join_time: 100,
            end_time: match status {
                TesterStatus::Connected => None,
                TesterStatus::Disconnected => Some(150),
            },
            status,
        }
    }

    fn roster(entries: &[RosterEntry]) -> HashMap<String, RosterEntry> {
        entries
            .iter()
            .map(|e| (e.network_id.clone(), e.clone()))
            .collect()
    }

    fn testers(records: &[TesterRecord]) -> HashMap<String, TesterRecord> {
        records
            .iter()
            .map(|t| (t.network_id.clone(), t.clone()))
            .collect()
    }

    #[test]
    fn unknown_player_connects() {
        let events = reconcile(&roster(&[entry("[U:1:111]", "Alice")]), &HashMap::new(), 200);
        assert_eq!(
            events,
            vec![PlayerStatusEvent {
                network_id: "[U:1:111]".to_string(),
                name: "Alice".to_string(),
                status: TesterStatus::Connected,
                observed_at: 200,
            }]
        );
    }

    #[test]
    fn matching_state_produces_no_events() {
        let events = reconcile(
            &roster(&[entry("[U:1:111]", "Alice")]),
            &testers(&[
                tester("[U:1:111]", "Alice", TesterStatus::Connected),
                tester("[U:1:222]", "Bob", TesterStatus::Disconnected),
            ]),
            200,
        );
        assert!(events.is_empty());
    }

    #[test]
    fn absent_connected_tester_disconnects_and_returning_tester_reconnects() {
        let events = reconcile(
            &roster(&[entry("[U:1:222]", "Bob")]),
            &testers(&[
                tester("[U:1:111]", "Alice", TesterStatus::Connected),
                tester("[U:1:222]", "Bob", TesterStatus::Disconnected),
            ]),
            300,
        );
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].network_id, "[U:1:111]");
        assert_eq!(events[0].status, TesterStatus::Disconnected);
        assert_eq!(events[0].observed_at, 300);
        assert_eq!(events[1].network_id, "[U:1:222]");
        assert_eq!(events[1].status, TesterStatus::Connected);
    }
}

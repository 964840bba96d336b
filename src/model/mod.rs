use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TesterStatus {
    Connected,
    Disconnected,
}

/// Attendance record for one player, keyed by network id in the tester map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TesterRecord {
    pub network_id: String,
    pub name: String,
    pub join_time: u64,
    /// `None` while the player is still active.
    pub end_time: Option<u64>,
    pub status: TesterStatus,
}

impl TesterRecord {
    pub fn elapsed_secs(&self, now: u64) -> u64 {
        self.end_time.unwrap_or(now).saturating_sub(self.join_time)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerStatusEvent {
    pub network_id: String,
    pub name: String,
    pub status: TesterStatus,
    /// Unix seconds of the poll tick that produced the event.
    pub observed_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attendance {
    pub network_id: String,
    pub name: String,
    pub elapsed_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TesterSnapshot {
    pub network_id: String,
    pub name: String,
    pub status: TesterStatus,
    pub join_time: u64,
    pub end_time: Option<u64>,
    pub elapsed_secs: u64,
}

pub trait Clock: Send + Sync {
    /// Unix time in seconds.
    fn now(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::Clock;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Debug, Default)]
    pub struct ManualClock(AtomicU64);

    impl ManualClock {
        pub fn new(start: u64) -> Self {
            Self(AtomicU64::new(start))
        }

        pub fn set(&self, now: u64) {
            self.0.store(now, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }
}

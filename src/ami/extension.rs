use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtensionStatus {
    Available,
    Inuse,
    Busy,
    Unavailable,
    Ringing,
    OnHold,
    Unknown,
}

impl ExtensionStatus {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => ExtensionStatus::Available,
            1 => ExtensionStatus::Inuse,
            2 => ExtensionStatus::Busy,
            4 => ExtensionStatus::Unavailable,
            8 => ExtensionStatus::Ringing,
            16 => ExtensionStatus::OnHold,
            _ => ExtensionStatus::Unknown,
        }
    }

    /// Parse the raw `Status` field; unparsable values map to `Unknown`.
    pub fn from_field(value: Option<&str>) -> (Self, i32) {
        match value.and_then(|v| v.trim().parse::<i32>().ok()) {
            Some(code) => (Self::from_code(code), code),
            None => (ExtensionStatus::Unknown, -1),
        }
    }
}

impl std::fmt::Display for ExtensionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ExtensionStatus::Available => "available",
            ExtensionStatus::Inuse => "inuse",
            ExtensionStatus::Busy => "busy",
            ExtensionStatus::Unavailable => "unavailable",
            ExtensionStatus::Ringing => "ringing",
            ExtensionStatus::OnHold => "on_hold",
            ExtensionStatus::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ExtensionState {
    pub extension: String,
    pub status: ExtensionStatus,
    pub code: i32,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    refreshed: Instant,
}

impl ExtensionState {
    pub fn new(extension: &str, code: i32) -> Self {
        Self {
            extension: extension.to_string(),
            status: ExtensionStatus::from_code(code),
            code,
            updated_at: Utc::now(),
            refreshed: Instant::now(),
        }
    }

    pub fn age(&self) -> Duration {
        self.refreshed.elapsed()
    }
}

/// Short-lived presence cache. Entries older than `ttl` are not served.
pub struct ExtensionTracker {
    ttl: Duration,
    entries: RwLock<HashMap<String, ExtensionState>>,
}

impl ExtensionTracker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn update(&self, extension: &str, code: i32) -> ExtensionState {
        let state = ExtensionState::new(extension, code);
        self.entries
            .write()
            .unwrap()
            .insert(extension.to_string(), state.clone());
        state
    }

    pub fn get_fresh(&self, extension: &str) -> Option<ExtensionState> {
        self.entries
            .read()
            .unwrap()
            .get(extension)
            .filter(|state| state.age() < self.ttl)
            .cloned()
    }

    pub fn count(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn list(&self) -> Vec<ExtensionState> {
        let mut entries: Vec<_> = self.entries.read().unwrap().values().cloned().collect();
        entries.sort_by(|a, b| a.extension.cmp(&b.extension));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_table() {
        assert_eq!(ExtensionStatus::from_code(0), ExtensionStatus::Available);
        assert_eq!(ExtensionStatus::from_code(1), ExtensionStatus::Inuse);
        assert_eq!(ExtensionStatus::from_code(2), ExtensionStatus::Busy);
        assert_eq!(ExtensionStatus::from_code(4), ExtensionStatus::Unavailable);
        assert_eq!(ExtensionStatus::from_code(8), ExtensionStatus::Ringing);
        assert_eq!(ExtensionStatus::from_code(16), ExtensionStatus::OnHold);
        assert_eq!(ExtensionStatus::from_code(99), ExtensionStatus::Unknown);
        assert_eq!(ExtensionStatus::from_code(-1), ExtensionStatus::Unknown);
        assert_eq!(ExtensionStatus::OnHold.to_string(), "on_hold");
    }

    #[test]
    fn test_status_from_field() {
        assert_eq!(
            ExtensionStatus::from_field(Some("8")),
            (ExtensionStatus::Ringing, 8)
        );
        assert_eq!(
            ExtensionStatus::from_field(Some("bogus")),
            (ExtensionStatus::Unknown, -1)
        );
        assert_eq!(
            ExtensionStatus::from_field(None),
            (ExtensionStatus::Unknown, -1)
        );
    }

    #[test]
    fn test_stale_entries_not_served() {
        let tracker = ExtensionTracker::new(Duration::from_millis(20));
        tracker.update("100", 1);
        assert_eq!(
            tracker.get_fresh("100").map(|s| s.status),
            Some(ExtensionStatus::Inuse)
        );
        std::thread::sleep(Duration::from_millis(40));
        assert!(tracker.get_fresh("100").is_none());
        assert_eq!(tracker.count(), 1);
    }
}

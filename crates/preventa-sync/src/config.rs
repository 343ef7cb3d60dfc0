//! Configuration for sync sessions.

use std::time::Duration;

use serde::Deserialize;

/// Configuration for sync behavior.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Wall-clock budget for the push phase of one session, in milliseconds.
    pub session_budget_ms: u64,
    /// Maximum number of record lanes applied concurrently.
    pub max_parallel_lanes: usize,
    /// Records fetched per ledger read during the pull phase.
    pub pull_page_size: usize,
    /// Maximum records pulled per entity kind in one session (`None` = all).
    pub max_pull_records_per_kind: Option<usize>,
    /// Maximum client changes accepted in one request, all kinds together.
    pub max_changes_per_request: usize,
}

impl SyncConfig {
    pub fn session_budget(&self) -> Duration {
        Duration::from_millis(self.session_budget_ms)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            session_budget_ms: 30_000,
            max_parallel_lanes: 8,
            pull_page_size: 200,
            max_pull_records_per_kind: None,
            max_changes_per_request: 1000,
        }
    }
}

//! Ledger configuration.

use serde::Deserialize;

/// Configuration shared by the ledger backends.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Server id handed to the first record ever created.
    pub first_server_id: i64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self { first_server_id: 1 }
    }
}

//! The singular configuration record: active session, known sessions,
//! settings and category lists.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Session label used when nothing has been configured yet.
pub const DEFAULT_SESSION: &str = "2024-2025";

/// Row id of the configuration record in the remote `config` table.
pub const CONFIG_ROW_ID: &str = "main";

/// School-wide configuration. Not lifecycle-managed: it is never soft-deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchoolConfig {
    pub current_session: String,
    #[serde(default)]
    pub sessions: Vec<String>,
    #[serde(default)]
    pub settings: Map<String, Value>,
    #[serde(default)]
    pub fee_categories: Vec<String>,
    #[serde(default)]
    pub expense_categories: Vec<String>,
}

impl SchoolConfig {
    pub fn with_session(session: impl Into<String>) -> Self {
        let session = session.into();
        Self {
            sessions: vec![session.clone()],
            current_session: session,
            settings: Map::new(),
            fee_categories: Vec::new(),
            expense_categories: Vec::new(),
        }
    }
}

impl Default for SchoolConfig {
    fn default() -> Self {
        Self::with_session(DEFAULT_SESSION)
    }
}

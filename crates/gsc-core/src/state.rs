//! Managed process lifecycle states.
//!
//! The supervisor walks `Stopped -> Starting -> Running -> Stopping ->
//! Stopped`; an unexpected process exit drives `Running -> Stopped`
//! directly. The `Display` rendering carries the status words remote
//! clients match on (`"running"` / `"not running"`).

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl ServerState {
    /// Whether a process is (or is about to be) alive in this state.
    pub fn is_active(&self) -> bool {
        matches!(self, ServerState::Starting | ServerState::Running)
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerState::Stopped => write!(f, "not running"),
            ServerState::Starting => write!(f, "starting"),
            ServerState::Running => write!(f, "running"),
            ServerState::Stopping => write!(f, "stopping"),
        }
    }
}

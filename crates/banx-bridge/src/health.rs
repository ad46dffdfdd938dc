//! Health status reported by the server.

use serde::{Deserialize, Serialize};

use crate::worker::{WorkerState, WorkerStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Health {
    /// Worker subprocess not yet confirmed running
    Starting,
    /// Worker running; requests are accepted
    Ready,
    /// Worker exited and is being replaced
    Unhealthy,
    /// Shutdown requested
    ShuttingDown,
}

impl Health {
    pub fn from_worker(status: &WorkerStatus, shutting_down: bool) -> Self {
        if shutting_down {
            return Health::ShuttingDown;
        }
        match status.state {
            WorkerState::Starting => Health::Starting,
            WorkerState::Running => Health::Ready,
            WorkerState::Exited => Health::Unhealthy,
        }
    }
}

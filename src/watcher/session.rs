//! Per-project session records.

use std::borrow::Borrow;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::WatchEventError;

/// Opaque identifier of a watched project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(String);

impl ProjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProjectId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ProjectId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&ProjectId> for ProjectId {
    fn from(id: &ProjectId) -> Self {
        id.clone()
    }
}

impl AsRef<str> for ProjectId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for ProjectId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Lifecycle of a watch session.
///
/// ```text
/// (none) --start--> Starting --ready--> Active
///   Starting | Active --error--> Failed (informational)
///   any --stop--> Stopped (removed from the registry)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Starting,
    Active,
    Stopped,
    Failed,
}

impl LifecycleState {
    /// A live session still owns its primitive and may receive events.
    pub fn is_live(self) -> bool {
        !matches!(self, LifecycleState::Stopped)
    }
}

/// Snapshot of one project's watch session.
///
/// The native handle stays with the supervisor; snapshots are plain values
/// and never alias internal state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WatchSession {
    pub project_id: ProjectId,
    pub project_path: PathBuf,
    pub state: LifecycleState,
    pub started_at: DateTime<Utc>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub event_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<WatchEventError>,
}

impl WatchSession {
    pub(crate) fn starting(project_id: ProjectId, project_path: PathBuf) -> Self {
        Self {
            project_id,
            project_path,
            state: LifecycleState::Starting,
            started_at: Utc::now(),
            last_event_at: None,
            event_count: 0,
            last_error: None,
        }
    }

    pub(crate) fn record_change(&mut self, at: DateTime<Utc>) {
        self.last_event_at = Some(at);
        self.event_count += 1;
    }

    /// Initial scan finished. A session that reported an error before its
    /// scan completed still becomes active.
    pub(crate) fn mark_ready(&mut self) {
        if matches!(self.state, LifecycleState::Starting | LifecycleState::Failed) {
            self.state = LifecycleState::Active;
        }
    }

    pub(crate) fn mark_failed(&mut self, error: WatchEventError) {
        if self.state.is_live() {
            self.state = LifecycleState::Failed;
        }
        self.last_error = Some(error);
    }
}

//! Error types for the project watch subsystem.

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use super::session::ProjectId;

/// Errors from supervisor and primitive operations.
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("Project {project_id}: path {path} is not accessible: {source}")]
    PathNotFound {
        project_id: ProjectId,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Project {project_id}: path {path} is not a directory")]
    NotADirectory { project_id: ProjectId, path: PathBuf },

    #[error("Project {project_id}: failed to initialize watcher: {reason}")]
    InitFailed {
        project_id: ProjectId,
        reason: String,
    },

    #[error("Project {project_id}: failed to close watcher: {reason}")]
    StopFailed {
        project_id: ProjectId,
        reason: String,
    },

    #[error("{} project(s) failed to stop: {}", failures.len(), summarize(failures))]
    StopAll { failures: Vec<WatchError> },

    #[error("Supervisor has been shut down")]
    ShutDown,

    #[error("Invalid watch configuration: {reason}")]
    Config { reason: String },
}

impl WatchError {
    /// True for the creation-time path errors a caller can fix by
    /// choosing another folder.
    pub fn is_path_error(&self) -> bool {
        matches!(
            self,
            WatchError::PathNotFound { .. } | WatchError::NotADirectory { .. }
        )
    }
}

fn summarize(failures: &[WatchError]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// A non-fatal error reported by a running watch.
///
/// Carried as data on the change stream rather than returned to a caller.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("{message}")]
pub struct WatchEventError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl WatchEventError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            path: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }
}

impl From<notify::Error> for WatchEventError {
    fn from(e: notify::Error) -> Self {
        let message = match &e.kind {
            notify::ErrorKind::Generic(msg) => msg.clone(),
            notify::ErrorKind::Io(err) => err.to_string(),
            other => format!("{other:?}"),
        };
        WatchEventError {
            message,
            path: e.paths.first().cloned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_all_message_lists_every_failure() {
        let err = WatchError::StopAll {
            failures: vec![
                WatchError::StopFailed {
                    project_id: ProjectId::from("a"),
                    reason: "busy".to_string(),
                },
                WatchError::StopFailed {
                    project_id: ProjectId::from("b"),
                    reason: "gone".to_string(),
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.starts_with("2 project(s) failed to stop"));
        assert!(msg.contains("Project a"));
        assert!(msg.contains("Project b"));
    }

    #[test]
    fn test_notify_error_conversion_keeps_path() {
        let err = notify::Error::path_not_found().add_path(PathBuf::from("/p/x.txt"));
        let event_err = WatchEventError::from(err);
        assert_eq!(event_err.message, "PathNotFound");
        assert_eq!(event_err.path, Some(PathBuf::from("/p/x.txt")));
    }
}

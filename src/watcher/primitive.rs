//! Platform watch primitive seam.
//!
//! A primitive turns a root directory plus [`WatchOptions`] into a stream of
//! [`RawEvent`]s delivered through a [`RawEventSink`], and hands back a
//! [`WatchHandle`] that releases the native resources when closed.

use std::path::{Path, PathBuf};
use std::sync::Weak;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use super::error::{WatchError, WatchEventError};
use super::policy::WatchOptions;
use super::session::ProjectId;
use super::supervisor::Shared;

/// Stat metadata attached to add/change events when available.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileStats {
    pub is_dir: bool,
    pub len: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
}

impl From<&std::fs::Metadata> for FileStats {
    fn from(meta: &std::fs::Metadata) -> Self {
        Self {
            is_dir: meta.is_dir(),
            len: meta.len(),
            modified: meta.modified().ok().map(DateTime::<Utc>::from),
        }
    }
}

impl FileStats {
    /// Stat a path without following a final symlink.
    pub fn read(path: &Path) -> Option<Self> {
        std::fs::symlink_metadata(path)
            .ok()
            .map(|meta| FileStats::from(&meta))
    }
}

/// Events a primitive reports, one variant per kind.
#[derive(Debug, Clone, PartialEq)]
pub enum RawEvent {
    Add {
        path: PathBuf,
        stats: Option<FileStats>,
    },
    Change {
        path: PathBuf,
        stats: Option<FileStats>,
    },
    Unlink {
        path: PathBuf,
    },
    AddDir {
        path: PathBuf,
        stats: Option<FileStats>,
    },
    UnlinkDir {
        path: PathBuf,
    },
    /// Initial scan finished.
    Ready,
    Error(WatchEventError),
}

impl RawEvent {
    /// File-system changes, as opposed to `Ready` and `Error` notices.
    pub fn is_change(&self) -> bool {
        !matches!(self, RawEvent::Ready | RawEvent::Error(_))
    }
}

/// Where a primitive delivers its events.
///
/// Cheap to clone. Delivery never fails: once the receiving session is gone
/// (stopped, replaced by a newer session for the same project, or the
/// supervisor dropped) events are discarded.
#[derive(Clone)]
pub struct RawEventSink {
    target: SinkTarget,
}

#[derive(Clone)]
enum SinkTarget {
    Session {
        shared: Weak<Shared>,
        project_id: ProjectId,
        generation: u64,
    },
    Channel(mpsc::UnboundedSender<RawEvent>),
}

impl std::fmt::Debug for RawEventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.target {
            SinkTarget::Session {
                project_id,
                generation,
                ..
            } => f
                .debug_struct("RawEventSink")
                .field("project_id", project_id)
                .field("generation", generation)
                .finish(),
            SinkTarget::Channel(_) => f.debug_struct("RawEventSink").finish_non_exhaustive(),
        }
    }
}

impl RawEventSink {
    pub(crate) fn for_session(shared: Weak<Shared>, project_id: ProjectId, generation: u64) -> Self {
        Self {
            target: SinkTarget::Session {
                shared,
                project_id,
                generation,
            },
        }
    }

    /// A sink feeding a plain channel, for driving a primitive without a
    /// supervisor.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RawEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                target: SinkTarget::Channel(tx),
            },
            rx,
        )
    }

    /// Deliver one event.
    pub fn emit(&self, event: RawEvent) {
        match &self.target {
            SinkTarget::Session {
                shared,
                project_id,
                generation,
            } => match shared.upgrade() {
                Some(shared) => shared.handle_raw_event(project_id, *generation, event),
                None => crate::debug_event!("sink", "dropped", "supervisor gone for {project_id}"),
            },
            SinkTarget::Channel(tx) => {
                let _ = tx.send(event);
            }
        }
    }

    /// False once nothing can receive events any more.
    pub fn is_connected(&self) -> bool {
        match &self.target {
            SinkTarget::Session {
                shared,
                project_id,
                generation,
            } => shared
                .upgrade()
                .is_some_and(|s| s.registry.is_current(project_id.as_str(), *generation)),
            SinkTarget::Channel(tx) => !tx.is_closed(),
        }
    }
}

/// Factory for native watches.
#[async_trait]
pub trait WatchPrimitive: Send + Sync {
    /// Short name for logging.
    fn name(&self) -> &str;

    /// Start watching `root`. Events may be emitted through `sink` before
    /// this returns.
    async fn watch(
        &self,
        root: &Path,
        options: WatchOptions,
        sink: RawEventSink,
    ) -> Result<Box<dyn WatchHandle>, WatchError>;
}

/// Exclusive owner of one native watch.
#[async_trait]
pub trait WatchHandle: Send {
    /// Release the watch. Consumes the handle so it is released once.
    async fn close(self: Box<Self>) -> Result<(), WatchError>;
}

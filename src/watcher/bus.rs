//! Change event bus.
//!
//! One publish point for every project's normalized events. Listeners are
//! plain callbacks held in an explicit list; each subscription returns a
//! [`Subscription`] that removes exactly that listener.
//!
//! Delivery is live only: nothing is buffered for late subscribers.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;

use super::error::WatchEventError;
use super::primitive::{FileStats, RawEvent};
use super::session::ProjectId;

/// Normalized kind of a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
    DirCreated,
    DirDeleted,
    Ready,
    Error,
}

/// Application-level change notification. Immutable once published.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub project_id: ProjectId,
    pub kind: ChangeKind,
    pub path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<FileStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WatchEventError>,
}

impl ChangeEvent {
    /// Normalize a raw primitive event. `Ready` is reported against the
    /// project root, as is an `Error` that carries no path.
    pub fn from_raw(project_id: ProjectId, project_root: &Path, raw: RawEvent) -> Self {
        let (kind, path, stats, error) = match raw {
            RawEvent::Add { path, stats } => (ChangeKind::Created, path, stats, None),
            RawEvent::Change { path, stats } => (ChangeKind::Modified, path, stats, None),
            RawEvent::Unlink { path } => (ChangeKind::Deleted, path, None, None),
            RawEvent::AddDir { path, stats } => (ChangeKind::DirCreated, path, stats, None),
            RawEvent::UnlinkDir { path } => (ChangeKind::DirDeleted, path, None, None),
            RawEvent::Ready => (ChangeKind::Ready, project_root.to_path_buf(), None, None),
            RawEvent::Error(err) => {
                let path = err
                    .path
                    .clone()
                    .unwrap_or_else(|| project_root.to_path_buf());
                (ChangeKind::Error, path, None, Some(err))
            }
        };

        Self {
            project_id,
            kind,
            path,
            stats,
            error,
        }
    }
}

type Listener = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

#[derive(Default)]
struct BusInner {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(u64, Listener)>>,
}

/// Multiplexed publish point for change events. Clones share listeners.
#[derive(Clone, Default)]
pub struct ChangeEventBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for ChangeEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeEventBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl ChangeEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Keep the returned subscription to remove it.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.write().push((id, Arc::new(listener)));
        crate::debug_event!("bus", "subscribed", "listener #{id}");
        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Subscribe through an unbounded channel instead of a callback.
    pub fn subscribe_channel(&self) -> (Subscription, mpsc::UnboundedReceiver<ChangeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(move |event| {
            let _ = tx.send(event.clone());
        });
        (subscription, rx)
    }

    /// Deliver an event to every current listener, in subscription order.
    pub fn publish(&self, event: &ChangeEvent) {
        // Snapshot so listeners may subscribe or unsubscribe while handling
        let listeners: Vec<Listener> = self
            .inner
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        if listeners.is_empty() {
            crate::debug_event!("bus", "dropped", "no listeners for {:?}", event.kind);
            return;
        }

        for listener in &listeners {
            listener(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.read().len()
    }

    /// Remove every listener.
    pub fn clear(&self) {
        self.inner.listeners.write().clear();
    }
}

/// Capability to remove one listener from a [`ChangeEventBus`].
///
/// Dropping it leaves the listener registered.
#[must_use = "dropping a Subscription keeps the listener registered forever"]
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    bus: Weak<BusInner>,
}

impl Subscription {
    /// Remove the listener. Returns false if it was already gone.
    pub fn unsubscribe(self) -> bool {
        let Some(bus) = self.bus.upgrade() else {
            return false;
        };
        let mut listeners = bus.listeners.write();
        let before = listeners.len();
        listeners.retain(|(id, _)| *id != self.id);
        let removed = listeners.len() != before;
        if removed {
            crate::debug_event!("bus", "unsubscribed", "listener #{}", self.id);
        }
        removed
    }

    pub fn is_active(&self) -> bool {
        self.bus
            .upgrade()
            .is_some_and(|bus| bus.listeners.read().iter().any(|(id, _)| *id == self.id))
    }
}

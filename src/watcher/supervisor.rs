//! Project watch supervisor.
//!
//! Owns one [`WatchSession`] per project, acquires a platform primitive for
//! each, folds the primitive's raw events into session state and republishes
//! them on the [`ChangeEventBus`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;

use super::bus::{ChangeEvent, ChangeEventBus, ChangeKind, Subscription};
use super::error::WatchError;
use super::policy::WatchPolicy;
use super::primitive::{RawEvent, RawEventSink, WatchHandle, WatchPrimitive};
use super::registry::{Reservation, SessionEntry, WatchRegistry};
use super::session::{LifecycleState, ProjectId, WatchSession};

/// State reachable from primitive callbacks.
pub(crate) struct Shared {
    pub(crate) registry: WatchRegistry,
    bus: ChangeEventBus,
    shut_down: AtomicBool,
    /// Number of `start_watching` calls that have not returned yet.
    starts_in_flight: watch::Sender<usize>,
}

impl Shared {
    /// Apply one raw event to its session and publish the normalized event.
    ///
    /// The session update happens in a single locked step; publishing happens
    /// after the lock is released so listeners may call back into the
    /// supervisor. Events for a session that no longer exists are dropped.
    pub(crate) fn handle_raw_event(&self, project_id: &ProjectId, generation: u64, raw: RawEvent) {
        let published = self.registry.update(project_id.as_str(), generation, |session| {
            match &raw {
                event if event.is_change() => session.record_change(chrono::Utc::now()),
                RawEvent::Ready => session.mark_ready(),
                RawEvent::Error(err) => session.mark_failed(err.clone()),
                _ => {}
            }
            let state = session.state;
            let event = ChangeEvent::from_raw(session.project_id.clone(), &session.project_path, raw);
            (state, event)
        });

        let Some((state, event)) = published else {
            crate::debug_event!("supervisor", "late event", "{project_id} gen {generation}");
            return;
        };

        match event.kind {
            ChangeKind::Ready => {
                crate::log_event!("supervisor", "active", "{project_id} ({state:?})");
            }
            ChangeKind::Error => {
                let message = event.error.as_ref().map(|e| e.message.as_str()).unwrap_or("");
                tracing::warn!(
                    "[supervisor] {project_id}: watch error at {}: {message}",
                    event.path.display()
                );
            }
            kind => {
                crate::debug_event!("supervisor", "event", "{project_id} {kind:?} {}", event.path.display());
            }
        }

        self.bus.publish(&event);
    }
}

/// Supervises file watches for any number of projects.
///
/// Construct one per process and pass clones to whatever needs it; clones
/// share all state.
#[derive(Clone)]
pub struct ProjectWatchSupervisor {
    shared: Arc<Shared>,
    primitive: Arc<dyn WatchPrimitive>,
    policy: Arc<WatchPolicy>,
}

impl std::fmt::Debug for ProjectWatchSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectWatchSupervisor")
            .field("primitive", &self.primitive.name())
            .field("sessions", &self.shared.registry.len())
            .field("bus", &self.shared.bus)
            .finish()
    }
}

impl ProjectWatchSupervisor {
    pub fn new(primitive: Arc<dyn WatchPrimitive>, policy: WatchPolicy) -> Self {
        Self::with_bus(primitive, policy, ChangeEventBus::new())
    }

    /// Publish onto an existing bus, e.g. one shared with other producers.
    pub fn with_bus(primitive: Arc<dyn WatchPrimitive>, policy: WatchPolicy, bus: ChangeEventBus) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry: WatchRegistry::new(),
                bus,
                shut_down: AtomicBool::new(false),
                starts_in_flight: watch::Sender::new(0),
            }),
            primitive,
            policy: Arc::new(policy),
        }
    }

    /// Start watching a project folder.
    ///
    /// A no-op if the project already has a session. The path must exist and
    /// be a directory; otherwise nothing is created and the path error is
    /// returned. On success the session is `Starting` until the primitive
    /// reports its initial scan is done.
    pub async fn start_watching(
        &self,
        project_id: impl Into<ProjectId>,
        project_path: impl AsRef<Path>,
    ) -> Result<(), WatchError> {
        let project_id = project_id.into();
        // Counted before the shutdown check so destroy() waits for this call
        let _in_flight = StartInFlight::enter(&self.shared.starts_in_flight);
        if self.is_shut_down() {
            return Err(WatchError::ShutDown);
        }
        if self.shared.registry.contains(project_id.as_str()) {
            crate::debug_event!("supervisor", "already watching", "{project_id}");
            return Ok(());
        }

        let path = validate_project_path(&project_id, project_path.as_ref()).await?;

        // Re-checked under the lock: another start may have won while we validated
        let generation = match self.shared.registry.reserve(&project_id, path.clone()) {
            Reservation::Existing => {
                crate::debug_event!("supervisor", "already watching", "{project_id}");
                return Ok(());
            }
            Reservation::Reserved(generation) => generation,
        };

        let options = self.policy.build_watch_options(&project_id, &path);
        let sink = RawEventSink::for_session(Arc::downgrade(&self.shared), project_id.clone(), generation);

        let handle = match self.primitive.watch(&path, options, sink).await {
            Ok(handle) => handle,
            Err(e) => {
                self.shared.registry.release(project_id.as_str(), generation);
                tracing::error!("[supervisor] {project_id}: failed to start: {e}");
                return Err(e);
            }
        };

        if let Err(orphan) = self.shared.registry.attach(project_id.as_str(), generation, handle) {
            // Stopped while the primitive was being acquired
            crate::debug_event!("supervisor", "closing orphaned watch", "{project_id}");
            if let Err(e) = close_handle(&project_id, orphan).await {
                tracing::warn!("[supervisor] {e}");
            }
            if self.is_shut_down() {
                return Err(WatchError::ShutDown);
            }
            return Ok(());
        }

        crate::log_event!("supervisor", "started", "{project_id} at {}", path.display());
        Ok(())
    }

    /// Stop watching a project. A no-op if it is not watched.
    ///
    /// The session leaves the registry before the primitive is closed, so a
    /// failing close still cleans up; its error is returned afterwards.
    pub async fn stop_watching(&self, project_id: impl AsRef<str>) -> Result<(), WatchError> {
        let Some(entry) = self.shared.registry.remove(project_id.as_ref()) else {
            return Ok(());
        };
        let SessionEntry {
            mut session,
            handle,
            ..
        } = entry;
        session.state = LifecycleState::Stopped;

        // No handle yet: start_watching closes it when acquisition finishes
        let result = match handle {
            Some(handle) => close_handle(&session.project_id, handle).await,
            None => Ok(()),
        };

        match &result {
            Ok(()) => crate::log_event!(
                "supervisor",
                "stopped",
                "{} after {} events",
                session.project_id,
                session.event_count
            ),
            Err(e) => tracing::error!("[supervisor] {e}"),
        }
        result
    }

    /// Stop every project concurrently. Failures are collected, not
    /// short-circuited; every session is removed either way.
    pub async fn stop_all(&self) -> Result<(), WatchError> {
        let stops: Vec<_> = self
            .shared
            .registry
            .project_ids()
            .into_iter()
            .map(|project_id| {
                let supervisor = self.clone();
                let id = project_id.clone();
                (
                    project_id,
                    tokio::spawn(async move { supervisor.stop_watching(&id).await }),
                )
            })
            .collect();

        let mut failures = Vec::new();
        for (project_id, stop) in stops {
            match stop.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => failures.push(e),
                Err(join_err) => failures.push(WatchError::StopFailed {
                    project_id,
                    reason: join_err.to_string(),
                }),
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(WatchError::StopAll { failures })
        }
    }

    /// Process teardown: refuse new starts, stop everything, drop listeners.
    ///
    /// Starts still acquiring their primitive are waited for, so every
    /// native watch is closed when this returns.
    pub async fn destroy(&self) -> Result<(), WatchError> {
        self.shared.shut_down.store(true, Ordering::SeqCst);
        let mut failures = stop_failures(self.stop_all().await);

        let mut in_flight = self.shared.starts_in_flight.subscribe();
        if *in_flight.borrow() > 0 {
            crate::debug_event!("supervisor", "waiting for starts", "{}", *in_flight.borrow());
        }
        // The sender lives in `shared`, so this only returns once the count is 0
        let _ = in_flight.wait_for(|count| *count == 0).await;

        // Starts that reserved a slot after the first sweep
        failures.extend(stop_failures(self.stop_all().await));

        self.shared.bus.clear();
        crate::log_event!("supervisor", "destroyed");
        if failures.is_empty() {
            Ok(())
        } else {
            Err(WatchError::StopAll { failures })
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shut_down.load(Ordering::SeqCst)
    }

    pub fn get_watch_state(&self, project_id: impl AsRef<str>) -> Option<WatchSession> {
        self.shared.registry.get(project_id.as_ref())
    }

    /// Detached copies of every session, ordered by project id.
    pub fn get_all_watch_states(&self) -> Vec<WatchSession> {
        self.shared.registry.snapshot()
    }

    /// True only while the session is `Active`: its initial scan has
    /// completed and no error has been reported since.
    ///
    /// An error event leaves the session `Failed` (still watching, still
    /// publishing) until the primitive reports `Ready` again. The notify
    /// backend reports `Ready` once per watch, so after an error this stays
    /// false until the project is stopped and started again.
    pub fn is_watching(&self, project_id: impl AsRef<str>) -> bool {
        self.shared.registry.is_active(project_id.as_ref())
    }

    pub fn watched_count(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.shared.bus.subscribe(listener)
    }

    pub fn bus(&self) -> &ChangeEventBus {
        &self.shared.bus
    }
}

/// Keeps `starts_in_flight` raised for the lifetime of one start call.
struct StartInFlight<'a>(&'a watch::Sender<usize>);

impl<'a> StartInFlight<'a> {
    fn enter(counter: &'a watch::Sender<usize>) -> Self {
        counter.send_modify(|count| *count += 1);
        Self(counter)
    }
}

impl Drop for StartInFlight<'_> {
    fn drop(&mut self) {
        self.0.send_modify(|count| *count -= 1);
    }
}

fn stop_failures(result: Result<(), WatchError>) -> Vec<WatchError> {
    match result {
        Ok(()) => Vec::new(),
        Err(WatchError::StopAll { failures }) => failures,
        Err(e) => vec![e],
    }
}

/// Canonical directory path, or the creation-time error for it.
async fn validate_project_path(project_id: &ProjectId, path: &Path) -> Result<PathBuf, WatchError> {
    let not_found = |source: std::io::Error| WatchError::PathNotFound {
        project_id: project_id.clone(),
        path: path.to_path_buf(),
        source,
    };

    let metadata = tokio::fs::metadata(path).await.map_err(not_found)?;
    if !metadata.is_dir() {
        return Err(WatchError::NotADirectory {
            project_id: project_id.clone(),
            path: path.to_path_buf(),
        });
    }

    tokio::fs::canonicalize(path).await.map_err(not_found)
}

/// Close a handle on its own task so a panicking primitive surfaces as a
/// stop error instead of unwinding through the caller.
async fn close_handle(project_id: &ProjectId, handle: Box<dyn WatchHandle>) -> Result<(), WatchError> {
    let stop_failed = |reason: String| WatchError::StopFailed {
        project_id: project_id.clone(),
        reason,
    };

    match tokio::spawn(handle.close()).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e @ WatchError::StopFailed { .. })) => Err(e),
        Ok(Err(e)) => Err(stop_failed(e.to_string())),
        Err(join_err) => Err(stop_failed(join_err.to_string())),
    }
}

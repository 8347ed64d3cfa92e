//! Registry of watch sessions keyed by project id.
//!
//! Every method takes the lock, does its work and releases it before
//! returning, so no caller can hold it across an `.await`. Each session gets
//! a fresh generation number; events and late handle attachments carrying
//! an older generation are ignored.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::primitive::WatchHandle;
use super::session::{LifecycleState, ProjectId, WatchSession};

pub(crate) struct SessionEntry {
    pub(crate) session: WatchSession,
    pub(crate) generation: u64,
    /// `None` while the primitive is still being acquired.
    pub(crate) handle: Option<Box<dyn WatchHandle>>,
}

/// Outcome of trying to claim a registry slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reservation {
    Existing,
    Reserved(u64),
}

#[derive(Default)]
pub(crate) struct WatchRegistry {
    sessions: Mutex<HashMap<ProjectId, SessionEntry>>,
    next_generation: AtomicU64,
}

impl WatchRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get(&self, project_id: &str) -> Option<WatchSession> {
        self.sessions
            .lock()
            .get(project_id)
            .map(|entry| entry.session.clone())
    }

    /// Copies of every session, ordered by project id.
    pub(crate) fn snapshot(&self) -> Vec<WatchSession> {
        let mut sessions: Vec<WatchSession> = self
            .sessions
            .lock()
            .values()
            .map(|entry| entry.session.clone())
            .collect();
        sessions.sort_by(|a, b| a.project_id.cmp(&b.project_id));
        sessions
    }

    pub(crate) fn contains(&self, project_id: &str) -> bool {
        self.sessions.lock().contains_key(project_id)
    }

    pub(crate) fn is_active(&self, project_id: &str) -> bool {
        self.sessions
            .lock()
            .get(project_id)
            .is_some_and(|entry| entry.session.state == LifecycleState::Active)
    }

    pub(crate) fn is_current(&self, project_id: &str, generation: u64) -> bool {
        self.sessions
            .lock()
            .get(project_id)
            .is_some_and(|entry| entry.generation == generation)
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub(crate) fn project_ids(&self) -> Vec<ProjectId> {
        let mut ids: Vec<ProjectId> = self.sessions.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Claim the slot for `project_id` with a new `Starting` session, unless
    /// one already exists.
    pub(crate) fn reserve(&self, project_id: &ProjectId, project_path: PathBuf) -> Reservation {
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(project_id) {
            return Reservation::Existing;
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        sessions.insert(
            project_id.clone(),
            SessionEntry {
                session: WatchSession::starting(project_id.clone(), project_path),
                generation,
                handle: None,
            },
        );
        Reservation::Reserved(generation)
    }

    /// Hand the primitive handle to its session. Gives the handle back if
    /// the session was removed or replaced in the meantime.
    pub(crate) fn attach(
        &self,
        project_id: &str,
        generation: u64,
        handle: Box<dyn WatchHandle>,
    ) -> Result<(), Box<dyn WatchHandle>> {
        let mut sessions = self.sessions.lock();
        match sessions.get_mut(project_id) {
            Some(entry) if entry.generation == generation => {
                entry.handle = Some(handle);
                Ok(())
            }
            _ => Err(handle),
        }
    }

    /// Remove the session only if it is still the given generation.
    pub(crate) fn release(&self, project_id: &str, generation: u64) -> Option<SessionEntry> {
        let mut sessions = self.sessions.lock();
        if sessions
            .get(project_id)
            .is_some_and(|entry| entry.generation == generation)
        {
            sessions.remove(project_id)
        } else {
            None
        }
    }

    pub(crate) fn remove(&self, project_id: &str) -> Option<SessionEntry> {
        self.sessions.lock().remove(project_id)
    }

    /// Mutate the session of the given generation in one locked step.
    pub(crate) fn update<R>(
        &self,
        project_id: &str,
        generation: u64,
        f: impl FnOnce(&mut WatchSession) -> R,
    ) -> Option<R> {
        let mut sessions = self.sessions.lock();
        match sessions.get_mut(project_id) {
            Some(entry) if entry.generation == generation => Some(f(&mut entry.session)),
            _ => None,
        }
    }
}

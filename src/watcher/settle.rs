//! Settled-write tracking for raw notify events.
//!
//! Writes are held until a path has been quiet for the stability window, so
//! a burst of writes (editor save, copy in progress) becomes one event. With
//! atomic detection on, an unlink is held briefly and a re-create of the same
//! path inside that window turns into a single change.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Window in which delete-then-recreate counts as one atomic write.
pub const ATOMIC_WINDOW: Duration = Duration::from_millis(100);

/// A path whose pending event is ready to report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settled {
    Add(PathBuf),
    Change(PathBuf),
    Unlink(PathBuf),
}

#[derive(Debug, Clone, Copy)]
struct PendingWrite {
    /// Not yet reported as existing, so it settles as an add.
    created: bool,
    last_change: Instant,
}

#[derive(Debug)]
pub struct SettleTracker {
    writes: HashMap<PathBuf, PendingWrite>,
    unlinks: HashMap<PathBuf, Instant>,
    stability: Duration,
    atomic_window: Option<Duration>,
}

impl SettleTracker {
    pub fn new(stability: Duration, atomic: bool) -> Self {
        Self {
            writes: HashMap::new(),
            unlinks: HashMap::new(),
            stability,
            atomic_window: atomic.then_some(ATOMIC_WINDOW),
        }
    }

    /// Record a write. Resets the stability timer for this path.
    pub fn record_write(&mut self, path: PathBuf, created: bool, now: Instant) {
        // Recreated inside the atomic window: the file never really went away
        let created = created && self.unlinks.remove(&path).is_none();

        self.writes
            .entry(path)
            .and_modify(|pending| pending.last_change = now)
            .or_insert(PendingWrite {
                created,
                last_change: now,
            });
    }

    /// Record a removal.
    ///
    /// Returns the unlink when it should be reported right away. A file
    /// created and removed before it ever settled produces nothing.
    pub fn record_unlink(&mut self, path: PathBuf, now: Instant) -> Option<Settled> {
        if let Some(pending) = self.writes.remove(&path) {
            if pending.created {
                return None;
            }
        }

        match self.atomic_window {
            Some(_) => {
                self.unlinks.insert(path, now);
                None
            }
            None => Some(Settled::Unlink(path)),
        }
    }

    /// Drop everything pending at or below `dir`.
    pub fn forget_under(&mut self, dir: &Path) {
        self.writes.retain(|path, _| !path.starts_with(dir));
        self.unlinks.retain(|path, _| !path.starts_with(dir));
    }

    /// Take all events that are ready at `now`. Unlinks come first.
    pub fn take_ready(&mut self, now: Instant) -> Vec<Settled> {
        let mut ready = Vec::new();

        if let Some(window) = self.atomic_window {
            let mut unlinked: Vec<PathBuf> = Vec::new();
            self.unlinks.retain(|path, at| {
                if now.duration_since(*at) >= window {
                    unlinked.push(path.clone());
                    false
                } else {
                    true
                }
            });
            unlinked.sort();
            ready.extend(unlinked.into_iter().map(Settled::Unlink));
        }

        let mut written: Vec<(PathBuf, bool)> = Vec::new();
        self.writes.retain(|path, pending| {
            if now.duration_since(pending.last_change) >= self.stability {
                written.push((path.clone(), pending.created));
                false
            } else {
                true
            }
        });
        written.sort();
        ready.extend(written.into_iter().map(|(path, created)| {
            if created {
                Settled::Add(path)
            } else {
                Settled::Change(path)
            }
        }));

        ready
    }

    pub fn has_pending(&self) -> bool {
        !self.writes.is_empty() || !self.unlinks.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.writes.len() + self.unlinks.len()
    }
}

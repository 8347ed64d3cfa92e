//! Production watch primitive backed by `notify`.
//!
//! One recursive `notify::RecommendedWatcher` per project root. A pump task
//! performs the initial scan, then turns notify events into [`RawEvent`]s,
//! holding file writes in a [`SettleTracker`] until they are stable.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use walkdir::{DirEntry, WalkDir};

use super::error::{WatchError, WatchEventError};
use super::policy::WatchOptions;
use super::primitive::{FileStats, RawEvent, RawEventSink, WatchHandle, WatchPrimitive};
use super::session::ProjectId;
use super::settle::{SettleTracker, Settled};

/// Watches project roots with the platform's recommended notify backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct NotifyPrimitive;

impl NotifyPrimitive {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl WatchPrimitive for NotifyPrimitive {
    fn name(&self) -> &str {
        "notify"
    }

    async fn watch(
        &self,
        root: &Path,
        options: WatchOptions,
        sink: RawEventSink,
    ) -> Result<Box<dyn WatchHandle>, WatchError> {
        let project_id = options.project_id.clone();
        let init_failed = |e: notify::Error| WatchError::InitFailed {
            project_id: project_id.clone(),
            reason: e.to_string(),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = tx.send(res);
        })
        .map_err(init_failed)?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(init_failed)?;

        crate::debug_event!("notify", "watching", "{}", root.display());

        let cancel = CancellationToken::new();
        let pump = Pump::new(options, sink);
        let task = tokio::spawn(pump.run(rx, cancel.clone()));

        Ok(Box::new(NotifyHandle {
            project_id,
            watcher: Some(watcher),
            cancel,
            task,
        }))
    }
}

struct NotifyHandle {
    project_id: ProjectId,
    watcher: Option<notify::RecommendedWatcher>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[async_trait]
impl WatchHandle for NotifyHandle {
    async fn close(mut self: Box<Self>) -> Result<(), WatchError> {
        self.cancel.cancel();
        // Dropping the watcher releases the OS watch descriptors
        drop(self.watcher.take());

        let NotifyHandle {
            project_id, task, ..
        } = *self;
        task.await.map_err(|e| WatchError::StopFailed {
            project_id,
            reason: format!("pump task failed: {e}"),
        })
    }
}

/// Per-project event loop state.
struct Pump {
    options: WatchOptions,
    sink: RawEventSink,
    settle: SettleTracker,
    known_dirs: HashSet<PathBuf>,
    known_files: HashSet<PathBuf>,
}

impl Pump {
    fn new(options: WatchOptions, sink: RawEventSink) -> Self {
        let settle = SettleTracker::new(options.stability.stability_threshold, options.atomic);
        Self {
            options,
            sink,
            settle,
            known_dirs: HashSet::new(),
            known_files: HashSet::new(),
        }
    }

    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
        cancel: CancellationToken,
    ) {
        let options = self.options.clone();
        let sink = self.sink.clone();
        let scan_cancel = cancel.clone();
        // Awaited even when cancelled: the walk checks the token per entry,
        // and nothing may be emitted once close() has returned
        let scanned =
            tokio::task::spawn_blocking(move || initial_scan(&options, &sink, &scan_cancel)).await;
        if cancel.is_cancelled() {
            return;
        }
        match scanned {
            Ok(tree) => {
                self.known_dirs = tree.dirs;
                self.known_files = tree.files;
            }
            Err(e) => self.sink.emit(RawEvent::Error(WatchEventError::new(format!(
                "initial scan failed: {e}"
            )))),
        }
        self.sink.emit(RawEvent::Ready);

        let mut ticker = interval(self.options.stability.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                received = rx.recv() => match received {
                    Some(Ok(event)) => self.handle_event(event, Instant::now()),
                    Some(Err(e)) => self.sink.emit(RawEvent::Error(e.into())),
                    None => break,
                },

                _ = ticker.tick() => {
                    if self.settle.has_pending() {
                        self.flush_settled(Instant::now());
                    }
                }
            }
        }

        crate::debug_event!(
            "notify",
            "pump stopped",
            "{} ({} pending dropped)",
            self.options.project_id,
            self.settle.pending_count()
        );
    }

    fn handle_event(&mut self, event: Event, now: Instant) {
        match event.kind {
            EventKind::Create(kind) => {
                for path in event.paths {
                    self.on_created(path, matches!(kind, CreateKind::Folder), now);
                }
            }
            EventKind::Modify(ModifyKind::Name(mode)) => self.on_renamed(mode, event.paths, now),
            // Permission and timestamp changes are not content changes
            EventKind::Modify(ModifyKind::Metadata(_)) => {}
            EventKind::Modify(_) => {
                for path in event.paths {
                    self.on_modified(path, now);
                }
            }
            EventKind::Remove(kind) => {
                for path in event.paths {
                    self.on_removed(path, matches!(kind, RemoveKind::Folder), now);
                }
            }
            EventKind::Access(_) | EventKind::Any | EventKind::Other => {}
        }
    }

    fn on_renamed(&mut self, mode: RenameMode, paths: Vec<PathBuf>, now: Instant) {
        match mode {
            RenameMode::Both if paths.len() == 2 => {
                let mut paths = paths.into_iter();
                if let (Some(from), Some(to)) = (paths.next(), paths.next()) {
                    self.on_removed(from, false, now);
                    self.on_created(to, false, now);
                }
            }
            RenameMode::From => {
                for path in paths {
                    self.on_removed(path, false, now);
                }
            }
            RenameMode::To => {
                for path in paths {
                    self.on_created(path, false, now);
                }
            }
            // Backend could not tell which side this is
            _ => {
                for path in paths {
                    if path.exists() {
                        self.on_created(path, false, now);
                    } else {
                        self.on_removed(path, false, now);
                    }
                }
            }
        }
    }

    fn accepts(&self, path: &Path) -> bool {
        path != self.options.project_path && self.options.within_depth(path)
    }

    fn on_created(&mut self, path: PathBuf, folder_hint: bool, now: Instant) {
        if !self.accepts(&path) {
            return;
        }
        // Gone again before we looked: the removal event will follow
        let Some(stats) = FileStats::read(&path) else {
            return;
        };
        if self.options.is_ignored(&path, Some(&stats)) {
            return;
        }

        if stats.is_dir || folder_hint {
            if self.known_dirs.insert(path.clone()) {
                self.sink.emit(RawEvent::AddDir {
                    path: path.clone(),
                    stats: Some(stats),
                });
                self.scan_new_dir(&path, now);
            }
        } else {
            let created = !self.known_files.contains(&path);
            self.settle.record_write(path, created, now);
        }
    }

    /// Report what already sits inside a directory that just appeared.
    ///
    /// Entries created (or moved in) before the recursive watch reached the
    /// new directory produce no notify events of their own.
    fn scan_new_dir(&mut self, dir: &Path, now: Instant) {
        let mut found = 0usize;
        for entry in walk_tree(&self.options, dir) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    self.sink.emit(RawEvent::Error(walk_error(e)));
                    continue;
                }
            };
            if entry.depth() == 0 {
                continue;
            }

            let stats = entry.metadata().ok().map(|m| FileStats::from(&m));
            let path = entry.into_path();
            if stats.as_ref().is_some_and(|s| s.is_dir) {
                if self.known_dirs.insert(path.clone()) {
                    found += 1;
                    self.sink.emit(RawEvent::AddDir { path, stats });
                }
            } else if !self.known_files.contains(&path) {
                found += 1;
                self.settle.record_write(path, true, now);
            }
        }

        if found > 0 {
            crate::debug_event!("notify", "new subtree", "{}: {found} entries", dir.display());
        }
    }

    fn on_modified(&mut self, path: PathBuf, now: Instant) {
        if !self.accepts(&path) || self.known_dirs.contains(&path) {
            return;
        }
        let stats = FileStats::read(&path);
        if stats.as_ref().is_some_and(|s| s.is_dir) {
            return;
        }
        if self.options.is_ignored(&path, stats.as_ref()) {
            return;
        }
        let created = !self.known_files.contains(&path);
        self.settle.record_write(path, created, now);
    }

    fn on_removed(&mut self, path: PathBuf, folder_hint: bool, now: Instant) {
        if !self.accepts(&path) {
            return;
        }

        if self.known_dirs.remove(&path) || folder_hint {
            self.known_dirs.retain(|p| !p.starts_with(&path));
            self.known_files.retain(|p| !p.starts_with(&path));
            self.settle.forget_under(&path);
            self.sink.emit(RawEvent::UnlinkDir { path });
            return;
        }

        if self.options.is_ignored(&path, None) {
            return;
        }

        self.known_files.remove(&path);
        if let Some(Settled::Unlink(path)) = self.settle.record_unlink(path, now) {
            self.sink.emit(RawEvent::Unlink { path });
        }
    }

    fn flush_settled(&mut self, now: Instant) {
        for settled in self.settle.take_ready(now) {
            match settled {
                Settled::Add(path) | Settled::Change(path) if self.known_dirs.contains(&path) => {}
                Settled::Add(path) => {
                    if let Some(stats) = FileStats::read(&path).filter(|s| !s.is_dir) {
                        self.known_files.insert(path.clone());
                        self.sink.emit(RawEvent::Add {
                            path,
                            stats: Some(stats),
                        });
                    }
                }
                Settled::Change(path) => {
                    if let Some(stats) = FileStats::read(&path).filter(|s| !s.is_dir) {
                        self.known_files.insert(path.clone());
                        self.sink.emit(RawEvent::Change {
                            path,
                            stats: Some(stats),
                        });
                    }
                }
                Settled::Unlink(path) => {
                    self.sink.emit(RawEvent::Unlink { path });
                }
            }
        }
    }
}

/// Tree known after the initial scan.
#[derive(Debug, Default)]
struct ScannedTree {
    dirs: HashSet<PathBuf>,
    files: HashSet<PathBuf>,
}

/// Walk `dir` (the project root or a directory below it) down to the
/// project's depth limit, pruning ignored subtrees.
fn walk_tree<'a>(
    options: &'a WatchOptions,
    dir: &Path,
) -> impl Iterator<Item = walkdir::Result<DirEntry>> + 'a {
    let remaining = (options.max_depth + 1).saturating_sub(options.depth_of(dir));
    WalkDir::new(dir)
        .follow_links(options.follow_symlinks)
        .max_depth(remaining)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(move |entry| {
            if entry.depth() == 0 {
                return true;
            }
            let stats = entry.metadata().ok().map(|m| FileStats::from(&m));
            !options.is_ignored(entry.path(), stats.as_ref())
        })
}

fn walk_error(e: walkdir::Error) -> WatchEventError {
    let mut error = WatchEventError::new(e.to_string());
    error.path = e.path().map(Path::to_path_buf);
    error
}

/// Walk the project tree, reporting it as `AddDir`/`Add` when the options
/// ask for it. Walk errors become `Error` events. Stops early once
/// `cancel` fires.
fn initial_scan(options: &WatchOptions, sink: &RawEventSink, cancel: &CancellationToken) -> ScannedTree {
    let mut tree = ScannedTree::default();

    for entry in walk_tree(options, &options.project_path) {
        if cancel.is_cancelled() {
            crate::debug_event!("notify", "initial scan cancelled", "{}", options.project_id);
            return tree;
        }
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                sink.emit(RawEvent::Error(walk_error(e)));
                continue;
            }
        };
        if entry.depth() == 0 {
            continue;
        }

        let stats = entry.metadata().ok().map(|m| FileStats::from(&m));
        let path = entry.into_path();
        let is_dir = stats.as_ref().is_some_and(|s| s.is_dir);

        if is_dir {
            tree.dirs.insert(path.clone());
            if options.emit_initial {
                sink.emit(RawEvent::AddDir { path, stats });
            }
        } else {
            tree.files.insert(path.clone());
            if options.emit_initial {
                sink.emit(RawEvent::Add { path, stats });
            }
        }
    }

    crate::debug_event!(
        "notify",
        "initial scan",
        "{}: {} dirs, {} files",
        options.project_id,
        tree.dirs.len(),
        tree.files.len()
    );
    tree
}

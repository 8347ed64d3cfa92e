//! Scripted watch primitive for driving the supervisor deterministically.

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use project_watch::watcher::{RawEvent, RawEventSink, WatchHandle, WatchOptions, WatchPrimitive};
use project_watch::{ProjectId, WatchError};
use tokio::sync::Notify;

/// One `watch()` call observed by the primitive.
#[derive(Clone)]
pub struct Opened {
    pub root: PathBuf,
    pub options: WatchOptions,
    pub sink: RawEventSink,
}

#[derive(Default)]
struct State {
    opened: Vec<Opened>,
    closed: Vec<PathBuf>,
    fail_close: HashSet<PathBuf>,
    fail_watch: bool,
}

/// Primitive that records every watch and lets tests inject raw events.
#[derive(Clone, Default)]
pub struct ScriptedPrimitive {
    state: Arc<Mutex<State>>,
    gate: Option<Arc<Notify>>,
}

impl ScriptedPrimitive {
    pub fn new() -> Self {
        Self::default()
    }

    /// `watch()` blocks until the returned gate is notified.
    pub fn gated() -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let primitive = Self {
            state: Arc::default(),
            gate: Some(Arc::clone(&gate)),
        };
        (primitive, gate)
    }

    pub fn fail_close_for(&self, root: &Path) {
        self.state.lock().fail_close.insert(root.to_path_buf());
    }

    pub fn fail_watch(&self) {
        self.state.lock().fail_watch = true;
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().opened.len()
    }

    pub fn closed(&self) -> Vec<PathBuf> {
        self.state.lock().closed.clone()
    }

    pub fn opened(&self, index: usize) -> Opened {
        self.state.lock().opened[index].clone()
    }

    /// Sink of the most recent watch on `root`.
    pub fn sink(&self, root: &Path) -> RawEventSink {
        self.state
            .lock()
            .opened
            .iter()
            .rev()
            .find(|o| o.root == root)
            .map(|o| o.sink.clone())
            .expect("root was never watched")
    }

    pub fn emit(&self, root: &Path, event: RawEvent) {
        self.sink(root).emit(event);
    }
}

#[async_trait]
impl WatchPrimitive for ScriptedPrimitive {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn watch(
        &self,
        root: &Path,
        options: WatchOptions,
        sink: RawEventSink,
    ) -> Result<Box<dyn WatchHandle>, WatchError> {
        let project_id = options.project_id.clone();
        {
            let mut state = self.state.lock();
            if state.fail_watch {
                return Err(WatchError::InitFailed {
                    project_id,
                    reason: "scripted failure".to_string(),
                });
            }
            state.opened.push(Opened {
                root: root.to_path_buf(),
                options,
                sink,
            });
        }

        if let Some(gate) = &self.gate {
            gate.notified().await;
        }

        Ok(Box::new(ScriptedHandle {
            root: root.to_path_buf(),
            project_id,
            state: Arc::clone(&self.state),
        }))
    }
}

struct ScriptedHandle {
    root: PathBuf,
    project_id: ProjectId,
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl WatchHandle for ScriptedHandle {
    async fn close(self: Box<Self>) -> Result<(), WatchError> {
        let mut state = self.state.lock();
        state.closed.push(self.root.clone());
        if state.fail_close.contains(&self.root) {
            return Err(WatchError::StopFailed {
                project_id: self.project_id.clone(),
                reason: "scripted close failure".to_string(),
            });
        }
        Ok(())
    }
}

/// Canonical temp directory holding `n` project folders.
pub fn project_dirs(n: usize) -> (tempfile::TempDir, Vec<PathBuf>) {
    let dir = tempfile::TempDir::new().unwrap();
    let root = dir.path().canonicalize().unwrap();
    let projects = (0..n)
        .map(|i| {
            let path = root.join(format!("proj{}", i + 1));
            std::fs::create_dir(&path).unwrap();
            path
        })
        .collect();
    (dir, projects)
}

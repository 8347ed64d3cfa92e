//! Watch policy: ignore rules and settled-write parameters.
//!
//! Everything here is a pure computation over configuration. The supervisor
//! asks the policy for a [`WatchOptions`] per project and hands it to the
//! platform primitive unchanged.

use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::WatchConfig;

use super::error::WatchError;
use super::primitive::FileStats;
use super::session::ProjectId;

/// Version-control metadata and dependency directories never watched.
const IGNORED_DIRS: &[&str] = &[".git", ".svn", ".hg", "node_modules"];

/// OS bookkeeping files.
const IGNORED_FILES: &[&str] = &[".DS_Store", "Thumbs.db"];

/// Temporary-file suffixes, compared case-insensitively.
const TEMP_SUFFIXES: &[&str] = &[".tmp", ".temp"];

pub const DEFAULT_STABILITY_THRESHOLD: Duration = Duration::from_millis(2000);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_MAX_DEPTH: usize = 32;
pub const DEFAULT_IGNORE_FILE: &str = ".watchignore";

/// Returns true when a path must never produce events.
pub type IgnorePredicate = Arc<dyn Fn(&Path, Option<&FileStats>) -> bool + Send + Sync>;

/// Settled-write parameters requested from the primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StabilityOptions {
    /// A write counts as settled once the file is quiet for this long.
    pub stability_threshold: Duration,
    /// How often pending writes are re-checked.
    pub poll_interval: Duration,
}

impl Default for StabilityOptions {
    fn default() -> Self {
        Self {
            stability_threshold: DEFAULT_STABILITY_THRESHOLD,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Everything a primitive needs to watch one project root.
#[derive(Clone)]
pub struct WatchOptions {
    pub project_id: ProjectId,
    pub project_path: PathBuf,
    /// Applied to project-relative paths.
    pub ignored: IgnorePredicate,
    pub stability: StabilityOptions,
    /// Collapse delete-then-recreate into one change.
    pub atomic: bool,
    pub follow_symlinks: bool,
    /// Directory levels below the root that are traversed.
    pub max_depth: usize,
    /// Report the existing tree as `add`/`addDir` before `ready`.
    pub emit_initial: bool,
}

impl std::fmt::Debug for WatchOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchOptions")
            .field("project_id", &self.project_id)
            .field("project_path", &self.project_path)
            .field("stability", &self.stability)
            .field("atomic", &self.atomic)
            .field("follow_symlinks", &self.follow_symlinks)
            .field("max_depth", &self.max_depth)
            .field("emit_initial", &self.emit_initial)
            .finish_non_exhaustive()
    }
}

impl WatchOptions {
    /// Path relative to the project root, or the path itself when it lies
    /// outside the root.
    pub fn relative<'a>(&self, path: &'a Path) -> &'a Path {
        path.strip_prefix(&self.project_path).unwrap_or(path)
    }

    /// Ignore check for an absolute path inside this project.
    pub fn is_ignored(&self, path: &Path, stats: Option<&FileStats>) -> bool {
        (self.ignored)(self.relative(path), stats)
    }

    /// Depth of a path below the project root; the root itself is 0 and its
    /// direct children are 1.
    pub fn depth_of(&self, path: &Path) -> usize {
        self.relative(path)
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .count()
    }

    /// Whether a path is within the configured recursion depth.
    pub fn within_depth(&self, path: &Path) -> bool {
        self.depth_of(path) <= self.max_depth + 1
    }
}

/// Source of per-project watch options.
#[derive(Debug, Clone)]
pub struct WatchPolicy {
    stability: StabilityOptions,
    atomic: bool,
    follow_symlinks: bool,
    max_depth: usize,
    ignore_file: String,
    patterns: Vec<glob::Pattern>,
}

impl Default for WatchPolicy {
    fn default() -> Self {
        Self {
            stability: StabilityOptions::default(),
            atomic: true,
            follow_symlinks: false,
            max_depth: DEFAULT_MAX_DEPTH,
            ignore_file: DEFAULT_IGNORE_FILE.to_string(),
            patterns: Vec::new(),
        }
    }
}

impl WatchPolicy {
    /// Build a policy from configuration. Fails on an invalid glob pattern.
    pub fn from_config(config: &WatchConfig) -> Result<Self, WatchError> {
        let patterns = config
            .ignore_patterns
            .iter()
            .map(|p| {
                glob::Pattern::new(p).map_err(|e| WatchError::Config {
                    reason: format!("ignore pattern '{p}': {e}"),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            stability: StabilityOptions {
                stability_threshold: Duration::from_millis(config.stability_threshold_ms),
                poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            },
            atomic: config.atomic,
            follow_symlinks: config.follow_symlinks,
            max_depth: config.max_depth,
            ignore_file: config.ignore_file.clone(),
            patterns,
        })
    }

    /// Ignore predicate for this policy.
    ///
    /// Expects project-relative paths: every component is checked, so an
    /// absolute path below a dot-directory would be ignored wholesale.
    pub fn build_ignore_predicate(&self) -> IgnorePredicate {
        let ignore_file = self.ignore_file.clone();
        let patterns = self.patterns.clone();
        Arc::new(move |path: &Path, stats: Option<&FileStats>| {
            is_ignored(path, stats, &ignore_file)
                || patterns.iter().any(|p| p.matches_path(path))
        })
    }

    pub fn build_stability_options(&self) -> StabilityOptions {
        self.stability
    }

    /// Options for one project. Symlinks are never followed unless configured
    /// and the initial scan always reports the existing tree.
    pub fn build_watch_options(
        &self,
        project_id: &ProjectId,
        project_path: &Path,
    ) -> WatchOptions {
        WatchOptions {
            project_id: project_id.clone(),
            project_path: project_path.to_path_buf(),
            ignored: self.build_ignore_predicate(),
            stability: self.build_stability_options(),
            atomic: self.atomic,
            follow_symlinks: self.follow_symlinks,
            max_depth: self.max_depth,
            emit_initial: true,
        }
    }
}

/// Built-in ignore rules.
///
/// `ignore_file` names the one dotfile that is still reported.
pub fn is_ignored(path: &Path, stats: Option<&FileStats>, ignore_file: &str) -> bool {
    let names: Vec<&OsStr> = path
        .components()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(name),
            _ => None,
        })
        .collect();

    let Some((last, parents)) = names.split_last() else {
        return false;
    };

    for name in parents {
        let name = name.to_string_lossy();
        if IGNORED_DIRS.contains(&name.as_ref()) || name.starts_with('.') {
            return true;
        }
    }

    let last = last.to_string_lossy();
    if IGNORED_DIRS.contains(&last.as_ref()) || IGNORED_FILES.contains(&last.as_ref()) {
        return true;
    }
    if last.starts_with('.') && last != ignore_file {
        return true;
    }

    let is_dir = stats.is_some_and(|s| s.is_dir);
    if !is_dir {
        let lower = last.to_ascii_lowercase();
        if TEMP_SUFFIXES.iter().any(|suffix| lower.ends_with(suffix)) {
            return true;
        }
    }

    false
}

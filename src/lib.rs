//! Project file watch management.
//!
//! Supervises live file-system monitoring for any number of project folders
//! and turns raw file events into one application-wide stream of
//! [`ChangeEvent`]s.
//!
//! ```no_run
//! use std::sync::Arc;
//! use project_watch::{NotifyPrimitive, ProjectWatchSupervisor, WatchPolicy};
//!
//! # async fn demo() -> Result<(), project_watch::WatchError> {
//! let supervisor = ProjectWatchSupervisor::new(Arc::new(NotifyPrimitive::new()), WatchPolicy::default());
//! let subscription = supervisor.subscribe(|event| println!("{event:?}"));
//! supervisor.start_watching("thesis", "/home/ada/thesis").await?;
//! // ...
//! subscription.unsubscribe();
//! supervisor.destroy().await
//! # }
//! ```

pub mod config;
pub mod logging;
pub mod watcher;

pub use config::Settings;
pub use watcher::{
    ChangeEvent, ChangeEventBus, ChangeKind, LifecycleState, NotifyPrimitive, ProjectId,
    ProjectWatchSupervisor, RawEvent, RawEventSink, Subscription, WatchError, WatchPolicy,
    WatchPrimitive, WatchSession,
};

//! Supervised file watching for project folders.
//!
//! # Architecture
//!
//! ```text
//! ProjectWatchSupervisor
//!   - WatchRegistry: project id -> WatchSession (+ owned primitive handle)
//!   - WatchPolicy: ignore rules, settled-write window, safety defaults
//!   - WatchPrimitive (NotifyPrimitive in production)
//!         |  RawEvent via RawEventSink
//!         v
//!   handle_raw_event: update session, normalize
//!         |  ChangeEvent
//!         v
//!   ChangeEventBus -> listeners
//! ```

mod bus;
mod error;
mod notify_primitive;
mod policy;
mod primitive;
mod registry;
mod session;
mod settle;
mod supervisor;

pub use bus::{ChangeEvent, ChangeEventBus, ChangeKind, Subscription};
pub use error::{WatchError, WatchEventError};
pub use notify_primitive::NotifyPrimitive;
pub use policy::{
    DEFAULT_IGNORE_FILE, DEFAULT_MAX_DEPTH, DEFAULT_POLL_INTERVAL, DEFAULT_STABILITY_THRESHOLD,
    IgnorePredicate, StabilityOptions, WatchOptions, WatchPolicy, is_ignored,
};
pub use primitive::{FileStats, RawEvent, RawEventSink, WatchHandle, WatchPrimitive};
pub use session::{LifecycleState, ProjectId, WatchSession};
pub use settle::{ATOMIC_WINDOW, SettleTracker, Settled};
pub use supervisor::ProjectWatchSupervisor;

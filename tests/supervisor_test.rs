mod common;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use common::{ScriptedPrimitive, project_dirs};
use parking_lot::Mutex;
use project_watch::watcher::WatchEventError;
use project_watch::{
    ChangeEvent, ChangeKind, LifecycleState, ProjectWatchSupervisor, RawEvent, WatchError,
    WatchPolicy,
};

fn supervisor(primitive: &ScriptedPrimitive) -> ProjectWatchSupervisor {
    ProjectWatchSupervisor::new(Arc::new(primitive.clone()), WatchPolicy::default())
}

fn recorder(sup: &ProjectWatchSupervisor) -> Arc<Mutex<Vec<ChangeEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    // Kept registered for the whole test
    let _subscription = sup.subscribe(move |event| sink.lock().push(event.clone()));
    seen
}

fn add(path: PathBuf) -> RawEvent {
    RawEvent::Add { path, stats: None }
}

#[tokio::test]
async fn test_start_ready_add_scenario() {
    let primitive = ScriptedPrimitive::new();
    let sup = supervisor(&primitive);
    let seen = recorder(&sup);
    let (_dir, projects) = project_dirs(1);
    let root = &projects[0];

    sup.start_watching("p1", root).await.unwrap();
    let state = sup.get_watch_state("p1").unwrap();
    assert_eq!(state.state, LifecycleState::Starting);
    assert_eq!(state.project_path, *root);
    assert!(!sup.is_watching("p1"));

    primitive.emit(root, RawEvent::Ready);
    assert!(sup.is_watching("p1"));

    primitive.emit(root, add(root.join("a.txt")));

    let events = seen.lock().clone();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].kind, ChangeKind::Ready);
    assert_eq!(events[1].project_id.as_str(), "p1");
    assert_eq!(events[1].kind, ChangeKind::Created);
    assert_eq!(events[1].path, root.join("a.txt"));

    let state = sup.get_watch_state("p1").unwrap();
    assert_eq!(state.event_count, 1);
    assert!(state.last_event_at.is_some());
}

#[tokio::test]
async fn test_missing_path_is_rejected_without_session() {
    let primitive = ScriptedPrimitive::new();
    let sup = supervisor(&primitive);

    let err = sup
        .start_watching("p2", "/does/not/exist")
        .await
        .unwrap_err();
    assert!(matches!(err, WatchError::PathNotFound { .. }));
    assert!(err.is_path_error());
    assert!(sup.get_watch_state("p2").is_none());
    assert_eq!(primitive.open_count(), 0);
}

#[tokio::test]
async fn test_file_path_is_rejected() {
    let primitive = ScriptedPrimitive::new();
    let sup = supervisor(&primitive);
    let (_dir, projects) = project_dirs(1);
    let file = projects[0].join("notes.txt");
    std::fs::write(&file, "x").unwrap();

    let err = sup.start_watching("p", &file).await.unwrap_err();
    assert!(matches!(err, WatchError::NotADirectory { .. }));
    assert_eq!(sup.watched_count(), 0);
    assert_eq!(primitive.open_count(), 0);
}

#[tokio::test]
async fn test_start_is_idempotent() {
    let primitive = ScriptedPrimitive::new();
    let sup = supervisor(&primitive);
    let (_dir, projects) = project_dirs(2);

    sup.start_watching("p1", &projects[0]).await.unwrap();
    sup.start_watching("p1", &projects[0]).await.unwrap();
    // Same id, different path: still the original session
    sup.start_watching("p1", &projects[1]).await.unwrap();

    assert_eq!(primitive.open_count(), 1);
    assert_eq!(sup.get_all_watch_states().len(), 1);
    assert_eq!(sup.get_watch_state("p1").unwrap().project_path, projects[0]);
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let primitive = ScriptedPrimitive::new();
    let sup = supervisor(&primitive);
    let (_dir, projects) = project_dirs(1);

    sup.stop_watching("never-started").await.unwrap();

    sup.start_watching("p1", &projects[0]).await.unwrap();
    sup.stop_watching("p1").await.unwrap();
    sup.stop_watching("p1").await.unwrap();

    assert_eq!(primitive.closed(), vec![projects[0].clone()]);
    assert!(sup.get_watch_state("p1").is_none());
}

#[tokio::test]
async fn test_late_event_after_stop_is_ignored() {
    let primitive = ScriptedPrimitive::new();
    let sup = supervisor(&primitive);
    let seen = recorder(&sup);
    let (_dir, projects) = project_dirs(1);
    let root = &projects[0];

    sup.start_watching("p1", root).await.unwrap();
    let sink = primitive.sink(root);
    sup.stop_watching("p1").await.unwrap();

    sink.emit(add(root.join("late.txt")));
    sink.emit(RawEvent::Ready);

    assert!(sup.get_watch_state("p1").is_none());
    assert!(seen.lock().is_empty());
    assert!(!sink.is_connected());
}

#[tokio::test]
async fn test_old_session_events_do_not_touch_restarted_session() {
    let primitive = ScriptedPrimitive::new();
    let sup = supervisor(&primitive);
    let (_dir, projects) = project_dirs(1);
    let root = &projects[0];

    sup.start_watching("p1", root).await.unwrap();
    let old_sink = primitive.sink(root);
    sup.stop_watching("p1").await.unwrap();
    sup.start_watching("p1", root).await.unwrap();

    old_sink.emit(RawEvent::Ready);
    old_sink.emit(add(root.join("stale.txt")));

    let state = sup.get_watch_state("p1").unwrap();
    assert_eq!(state.state, LifecycleState::Starting);
    assert_eq!(state.event_count, 0);
    assert_eq!(primitive.open_count(), 2);
}

#[tokio::test]
async fn test_error_event_is_forwarded_and_session_kept() {
    let primitive = ScriptedPrimitive::new();
    let sup = supervisor(&primitive);
    let seen = recorder(&sup);
    let (_dir, projects) = project_dirs(1);
    let root = &projects[0];

    sup.start_watching("p1", root).await.unwrap();
    primitive.emit(root, RawEvent::Ready);
    primitive.emit(
        root,
        RawEvent::Error(WatchEventError::new("permission denied").with_path(root.join("private"))),
    );

    let state = sup.get_watch_state("p1").unwrap();
    assert_eq!(state.state, LifecycleState::Failed);
    assert_eq!(state.last_error.as_ref().unwrap().message, "permission denied");
    assert!(!sup.is_watching("p1"));

    // Monitoring continues after the error
    primitive.emit(root, add(root.join("b.txt")));
    assert_eq!(sup.get_watch_state("p1").unwrap().event_count, 1);

    let events = seen.lock().clone();
    let error = events.iter().find(|e| e.kind == ChangeKind::Error).unwrap();
    assert_eq!(error.path, root.join("private"));
    assert_eq!(error.error.as_ref().unwrap().message, "permission denied");
    assert_eq!(events.last().unwrap().kind, ChangeKind::Created);

    // A fresh readiness report clears the failure
    primitive.emit(root, RawEvent::Ready);
    assert!(sup.is_watching("p1"));
    assert!(sup.get_watch_state("p1").unwrap().last_error.is_some());

    // Explicit stop still works
    sup.stop_watching("p1").await.unwrap();
    assert_eq!(sup.watched_count(), 0);
}

#[tokio::test]
async fn test_events_delivered_in_emission_order() {
    let primitive = ScriptedPrimitive::new();
    let sup = supervisor(&primitive);
    let (_dir, projects) = project_dirs(2);
    let (sub_a, mut rx_a) = sup.bus().subscribe_channel();
    let (sub_b, mut rx_b) = sup.bus().subscribe_channel();

    sup.start_watching("p1", &projects[0]).await.unwrap();
    sup.start_watching("p2", &projects[1]).await.unwrap();

    let names = ["1.txt", "2.txt", "3.txt", "4.txt"];
    for name in names {
        primitive.emit(&projects[0], add(projects[0].join(name)));
        primitive.emit(&projects[1], add(projects[1].join(name)));
    }

    for rx in [&mut rx_a, &mut rx_b] {
        let mut per_project: Vec<Vec<PathBuf>> = vec![Vec::new(), Vec::new()];
        for _ in 0..names.len() * 2 {
            let event = rx.recv().await.unwrap();
            let slot = if event.project_id.as_str() == "p1" { 0 } else { 1 };
            per_project[slot].push(event.path);
        }
        for (slot, root) in projects.iter().enumerate() {
            let expected: Vec<PathBuf> = names.iter().map(|n| root.join(n)).collect();
            assert_eq!(per_project[slot], expected);
        }
    }

    assert!(sub_a.unsubscribe());
    assert!(sub_b.unsubscribe());
}

#[tokio::test]
async fn test_unsubscribed_listener_stops_receiving() {
    let primitive = ScriptedPrimitive::new();
    let sup = supervisor(&primitive);
    let (_dir, projects) = project_dirs(1);
    let root = &projects[0];
    sup.start_watching("p1", root).await.unwrap();

    let count = Arc::new(Mutex::new(0usize));
    let counter = Arc::clone(&count);
    let subscription = sup.subscribe(move |_| *counter.lock() += 1);

    primitive.emit(root, add(root.join("a")));
    assert!(subscription.unsubscribe());
    primitive.emit(root, add(root.join("b")));

    assert_eq!(*count.lock(), 1);
}

#[tokio::test]
async fn test_stop_removes_session_even_when_close_fails() {
    let primitive = ScriptedPrimitive::new();
    let sup = supervisor(&primitive);
    let (_dir, projects) = project_dirs(1);
    let root = &projects[0];
    primitive.fail_close_for(root);

    sup.start_watching("p1", root).await.unwrap();
    let err = sup.stop_watching("p1").await.unwrap_err();

    assert!(matches!(err, WatchError::StopFailed { .. }));
    assert!(sup.get_watch_state("p1").is_none());
    assert_eq!(primitive.closed(), vec![root.clone()]);
}

#[tokio::test]
async fn test_stop_all_is_resilient_to_one_failure() {
    let primitive = ScriptedPrimitive::new();
    let sup = supervisor(&primitive);
    let (_dir, projects) = project_dirs(3);
    primitive.fail_close_for(&projects[1]);

    for (i, path) in projects.iter().enumerate() {
        sup.start_watching(format!("p{}", i + 1), path).await.unwrap();
    }
    assert_eq!(sup.watched_count(), 3);

    let err = sup.stop_all().await.unwrap_err();
    match err {
        WatchError::StopAll { failures } => {
            assert_eq!(failures.len(), 1);
            assert!(matches!(&failures[0], WatchError::StopFailed { project_id, .. } if project_id.as_str() == "p2"));
        }
        other => panic!("unexpected error: {other}"),
    }

    assert!(sup.get_all_watch_states().is_empty());
    let mut closed = primitive.closed();
    closed.sort();
    assert_eq!(closed, projects);
}

#[tokio::test]
async fn test_failed_primitive_leaves_no_session() {
    let primitive = ScriptedPrimitive::new();
    primitive.fail_watch();
    let sup = supervisor(&primitive);
    let (_dir, projects) = project_dirs(1);

    let err = sup.start_watching("p1", &projects[0]).await.unwrap_err();
    assert!(matches!(err, WatchError::InitFailed { .. }));
    assert!(sup.get_watch_state("p1").is_none());
}

#[tokio::test]
async fn test_stop_during_acquisition_closes_orphaned_handle() {
    let (primitive, gate) = ScriptedPrimitive::gated();
    let sup = supervisor(&primitive);
    let (_dir, projects) = project_dirs(1);
    let root = projects[0].clone();

    let starting = {
        let sup = sup.clone();
        let root = root.clone();
        tokio::spawn(async move { sup.start_watching("p1", &root).await })
    };
    wait_for(|| primitive.open_count() == 1).await;

    // Second start while the first is still acquiring: no second primitive
    sup.start_watching("p1", &root).await.unwrap();
    assert_eq!(sup.get_watch_state("p1").unwrap().state, LifecycleState::Starting);

    sup.stop_watching("p1").await.unwrap();
    assert!(sup.get_watch_state("p1").is_none());

    gate.notify_one();
    starting.await.unwrap().unwrap();

    assert_eq!(primitive.open_count(), 1);
    assert_eq!(primitive.closed(), vec![root]);
    assert!(sup.get_watch_state("p1").is_none());
}

#[tokio::test]
async fn test_interleaved_start_stop_never_duplicates_entries() {
    let primitive = ScriptedPrimitive::new();
    let sup = supervisor(&primitive);
    let (_dir, projects) = project_dirs(3);

    let mut tasks = Vec::new();
    for round in 0..5 {
        for (i, path) in projects.iter().enumerate() {
            let sup = sup.clone();
            let path = path.clone();
            let id = format!("p{i}");
            tasks.push(tokio::spawn(async move {
                if (round + i) % 2 == 0 {
                    sup.start_watching(id.as_str(), &path).await
                } else {
                    sup.stop_watching(&id).await
                }
            }));
        }
    }
    for task in tasks {
        task.await.unwrap().unwrap();
        let states = sup.get_all_watch_states();
        let mut ids: Vec<_> = states.iter().map(|s| s.project_id.clone()).collect();
        ids.dedup();
        assert_eq!(ids.len(), states.len());
    }
}

#[tokio::test]
async fn test_snapshot_does_not_alias_registry() {
    let primitive = ScriptedPrimitive::new();
    let sup = supervisor(&primitive);
    let (_dir, projects) = project_dirs(1);
    sup.start_watching("p1", &projects[0]).await.unwrap();

    let mut states = sup.get_all_watch_states();
    states[0].state = LifecycleState::Stopped;
    states.clear();

    assert_eq!(sup.get_all_watch_states().len(), 1);
    assert_eq!(
        sup.get_watch_state("p1").unwrap().state,
        LifecycleState::Starting
    );
}

#[tokio::test]
async fn test_options_come_from_policy() {
    let primitive = ScriptedPrimitive::new();
    let sup = supervisor(&primitive);
    let (_dir, projects) = project_dirs(1);
    let root = &projects[0];
    sup.start_watching("p1", root).await.unwrap();

    let opened = primitive.opened(0);
    assert_eq!(opened.root, *root);
    assert_eq!(opened.options.project_id.as_str(), "p1");
    assert!(!opened.options.follow_symlinks);
    assert!(opened.options.emit_initial);
    assert_eq!(
        opened.options.stability.stability_threshold,
        Duration::from_millis(2000)
    );
    assert!(opened.options.is_ignored(&root.join("node_modules/x.js"), None));
    assert!(!opened.options.is_ignored(&root.join("src/lib.rs"), None));
}

#[tokio::test]
async fn test_destroy_stops_everything_and_refuses_new_starts() {
    let primitive = ScriptedPrimitive::new();
    let sup = supervisor(&primitive);
    let (_dir, projects) = project_dirs(2);
    let _seen = recorder(&sup);

    sup.start_watching("a", &projects[0]).await.unwrap();
    sup.start_watching("b", &projects[1]).await.unwrap();
    assert_eq!(sup.bus().listener_count(), 1);

    sup.destroy().await.unwrap();

    assert_eq!(sup.watched_count(), 0);
    assert_eq!(primitive.closed().len(), 2);
    assert_eq!(sup.bus().listener_count(), 0);
    assert!(sup.is_shut_down());
    assert!(matches!(
        sup.start_watching("c", &projects[0]).await,
        Err(WatchError::ShutDown)
    ));
}

#[tokio::test]
async fn test_destroy_waits_for_in_flight_start() {
    let (primitive, gate) = ScriptedPrimitive::gated();
    let sup = supervisor(&primitive);
    let (_dir, projects) = project_dirs(1);
    let root = projects[0].clone();

    let starting = {
        let sup = sup.clone();
        let root = root.clone();
        tokio::spawn(async move { sup.start_watching("p1", &root).await })
    };
    wait_for(|| primitive.open_count() == 1).await;

    let destroying = {
        let sup = sup.clone();
        tokio::spawn(async move { sup.destroy().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!destroying.is_finished());
    assert!(primitive.closed().is_empty());

    gate.notify_one();
    destroying.await.unwrap().unwrap();

    // The handle acquired during teardown was closed before destroy returned
    assert_eq!(primitive.closed(), vec![root]);
    assert!(matches!(starting.await.unwrap(), Err(WatchError::ShutDown)));
    assert_eq!(sup.watched_count(), 0);
}

#[tokio::test]
async fn test_events_after_supervisor_dropped_are_harmless() {
    let primitive = ScriptedPrimitive::new();
    let (_dir, projects) = project_dirs(1);
    let root: &Path = &projects[0];
    {
        let sup = supervisor(&primitive);
        sup.start_watching("p1", root).await.unwrap();
    }
    primitive.emit(root, add(root.join("after-drop.txt")));
    assert!(!primitive.sink(root).is_connected());
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition not reached");
}

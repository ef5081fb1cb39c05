//! App task supervisor tests against the fake launcher.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{TestEnv, eventually};
use mbox_log::event::ACTION_APP_TASK_CRASH;
use mbox_taskd::app_tasks::SlotState;
use mbox_taskd::config::SupervisorConfig;
use mbox_taskd::error::Error;
use mbox_taskd::exit::WorkerExit;
use mbox_taskd::lock::PLATFORM_LOCK;
use mbox_taskd::store::{AppStore, InstallationState, RunState};

#[tokio::test]
async fn test_live_workers_never_exceed_concurrency() {
    let env = TestEnv::new().await;
    let supervisor = env.supervisor(3);

    for i in 0..10 {
        supervisor.start(&format!("app-{}", i)).await.unwrap();
        assert!(env.launcher.live_count() <= 3);
    }

    let snapshot = supervisor.snapshot().await.unwrap();
    assert_eq!(snapshot.running, vec!["app-0", "app-1", "app-2"]);
    assert_eq!(snapshot.pending.len(), 7);

    // Finish workers one by one; the bound holds throughout
    for _ in 0..10 {
        let live = env.launcher.live_ids();
        assert!(live.len() <= 3);
        let Some(id) = live.first() else { break };
        assert!(env.launcher.exit(id, WorkerExit::Code(0)));

        let id = id.clone();
        eventually("worker exit handled", || {
            let supervisor = supervisor.clone();
            let id = id.clone();
            async move { !supervisor.snapshot().await.unwrap().running.contains(&id) }
        })
        .await;
        assert!(env.launcher.live_count() <= 3);
    }

    assert!(supervisor.snapshot().await.unwrap().is_idle());
    assert_eq!(env.launcher.launches().len(), 10);
}

#[tokio::test]
async fn test_queued_app_starts_when_slot_frees() {
    let env = TestEnv::new().await;
    let supervisor = env.supervisor(1);

    supervisor.start("a").await.unwrap();
    supervisor.start("b").await.unwrap();

    assert!(matches!(
        supervisor.status("a").await.unwrap(),
        SlotState::Running { .. }
    ));
    assert_eq!(
        supervisor.status("b").await.unwrap(),
        SlotState::Queued { position: 0 }
    );

    env.launcher.exit("a", WorkerExit::Code(0));

    eventually("b promoted", || async { env.launcher.is_live("b") }).await;
    assert!(matches!(
        supervisor.status("b").await.unwrap(),
        SlotState::Running { .. }
    ));
    assert_eq!(supervisor.status("a").await.unwrap(), SlotState::Idle);
}

#[tokio::test]
async fn test_pending_promoted_in_fifo_order() {
    let env = TestEnv::new().await;
    let supervisor = env.supervisor(1);

    for id in ["first", "a", "b", "c"] {
        supervisor.start(id).await.unwrap();
    }
    assert_eq!(
        supervisor.snapshot().await.unwrap().pending,
        vec!["a", "b", "c"]
    );

    for (current, next) in [("first", "a"), ("a", "b"), ("b", "c")] {
        env.launcher.exit(current, WorkerExit::Code(0));
        eventually("next promoted", || async { env.launcher.is_live(next) }).await;
    }

    assert_eq!(env.launcher.launch_order(), vec!["first", "a", "b", "c"]);
}

#[tokio::test]
async fn test_start_of_live_app_is_already_active() {
    let env = TestEnv::new().await;
    let supervisor = env.supervisor(3);

    supervisor.start("a").await.unwrap();
    let err = supervisor.start("a").await.unwrap_err();
    assert!(matches!(err, Error::AlreadyActive(id) if id == "a"));
    assert_eq!(env.launcher.launch_count("a"), 1);
}

#[tokio::test]
async fn test_queued_app_is_queued_once() {
    let env = TestEnv::new().await;
    let supervisor = env.supervisor(1);

    supervisor.start("a").await.unwrap();
    supervisor.start("b").await.unwrap();
    supervisor.start("b").await.unwrap();

    assert_eq!(supervisor.snapshot().await.unwrap().pending, vec!["b"]);
}

#[tokio::test]
async fn test_stop_live_worker_waits_for_exit() {
    let env = TestEnv::new().await;
    env.add_app("a", InstallationState::Installed, RunState::PendingStop)
        .await;
    let supervisor = env.supervisor(3);

    supervisor.start("a").await.unwrap();
    supervisor.stop("a").await.unwrap();

    // stop returns only after the exit was handled
    assert_eq!(supervisor.status("a").await.unwrap(), SlotState::Idle);
    assert!(!env.launcher.is_live("a"));
    assert_eq!(env.locks.holders(PLATFORM_LOCK), 0);

    let app = env.apps.get("a").await.unwrap().unwrap();
    assert_eq!(app.installation_state, InstallationState::Installed);
}

#[tokio::test]
async fn test_stop_queued_app_removes_it_from_queue() {
    let env = TestEnv::new().await;
    let supervisor = env.supervisor(1);

    for id in ["a", "b", "c", "d"] {
        supervisor.start(id).await.unwrap();
    }

    supervisor.stop("c").await.unwrap();
    assert_eq!(supervisor.status("c").await.unwrap(), SlotState::Idle);
    assert_eq!(supervisor.snapshot().await.unwrap().pending, vec!["b", "d"]);

    env.launcher.exit("a", WorkerExit::Code(0));
    eventually("b promoted", || async { env.launcher.is_live("b") }).await;
    env.launcher.exit("b", WorkerExit::Code(0));
    eventually("d promoted", || async { env.launcher.is_live("d") }).await;

    assert_eq!(env.launcher.launch_count("c"), 0);
}

#[tokio::test]
async fn test_stop_idle_app_is_noop() {
    let env = TestEnv::new().await;
    let supervisor = env.supervisor(1);

    supervisor.stop("nothing").await.unwrap();
    assert_eq!(supervisor.status("nothing").await.unwrap(), SlotState::Idle);
}

#[tokio::test]
async fn test_restart_is_sequenced() {
    let env = TestEnv::new().await;
    let supervisor = env.supervisor(1);

    supervisor.start("a").await.unwrap();
    supervisor.restart("a").await.unwrap();

    assert_eq!(env.launcher.launch_count("a"), 2);
    assert!(env.launcher.is_live("a"));
    assert!(matches!(
        supervisor.status("a").await.unwrap(),
        SlotState::Running { .. }
    ));
    assert_eq!(env.locks.holders(PLATFORM_LOCK), 1);
}

#[tokio::test]
async fn test_successful_exit_leaves_app_state_alone() {
    let env = TestEnv::new().await;
    env.add_app("a", InstallationState::PendingInstall, RunState::Running)
        .await;
    let supervisor = env.supervisor(3);

    supervisor.start("a").await.unwrap();
    env.launcher.exit("a", WorkerExit::Code(0));
    supervisor.drain_and_wait().await.unwrap();

    let app = env.apps.get("a").await.unwrap().unwrap();
    assert_eq!(app.installation_state, InstallationState::PendingInstall);
    assert!(env.events(ACTION_APP_TASK_CRASH).await.is_empty());
}

#[tokio::test]
async fn test_crash_forces_error_state() {
    let env = TestEnv::new().await;
    env.add_app("a", InstallationState::PendingUpdate, RunState::Running)
        .await;
    let supervisor = env.supervisor(3);

    supervisor.start("a").await.unwrap();
    env.launcher.exit("a", WorkerExit::Code(1));
    supervisor.drain_and_wait().await.unwrap();

    let app = env.apps.get("a").await.unwrap().unwrap();
    assert_eq!(app.installation_state, InstallationState::Error);
    assert_eq!(
        app.installation_progress,
        "App task crashed with code 1 and signal null"
    );

    let crashes = env.events(ACTION_APP_TASK_CRASH).await;
    assert_eq!(crashes.len(), 1);
    assert_eq!(crashes[0].data["appId"], "a");
    assert_eq!(
        crashes[0].data["crashLogFile"],
        env.paths.app_log_file("a").display().to_string()
    );
}

#[tokio::test]
async fn test_killed_worker_is_a_crash() {
    let env = TestEnv::new().await;
    env.add_app("a", InstallationState::PendingRestore, RunState::Stopped)
        .await;
    let supervisor = env.supervisor(3);

    supervisor.start("a").await.unwrap();
    env.launcher.exit("a", WorkerExit::Signal(9));
    supervisor.drain_and_wait().await.unwrap();

    let app = env.apps.get("a").await.unwrap().unwrap();
    assert_eq!(app.installation_state, InstallationState::Error);
    assert_eq!(
        app.installation_progress,
        "App task crashed with code null and signal SIGKILL"
    );
    assert_eq!(env.events(ACTION_APP_TASK_CRASH).await.len(), 1);
}

#[tokio::test]
async fn test_handled_failure_only_records_event() {
    let env = TestEnv::new().await;
    env.add_app("a", InstallationState::PendingConfigure, RunState::Running)
        .await;
    let supervisor = env.supervisor(3);

    supervisor.start("a").await.unwrap();
    env.launcher.exit("a", WorkerExit::Code(50));
    supervisor.drain_and_wait().await.unwrap();

    let app = env.apps.get("a").await.unwrap().unwrap();
    assert_eq!(app.installation_state, InstallationState::PendingConfigure);
    assert_eq!(env.events(ACTION_APP_TASK_CRASH).await.len(), 1);
}

#[tokio::test]
async fn test_crash_of_unknown_app_still_frees_slot() {
    let env = TestEnv::new().await;
    let supervisor = env.supervisor(1);

    supervisor.start("ghost").await.unwrap();
    supervisor.start("next").await.unwrap();
    env.launcher.exit("ghost", WorkerExit::Code(2));

    eventually("next promoted", || async { env.launcher.is_live("next") }).await;
    assert_eq!(env.events(ACTION_APP_TASK_CRASH).await.len(), 1);
}

#[tokio::test]
async fn test_apps_queue_while_platform_locked() {
    let env = TestEnv::new().await;
    let supervisor = env.supervisor(3);

    env.locks.acquire_exclusive(PLATFORM_LOCK).unwrap();
    supervisor.start("a").await.unwrap();
    supervisor.start("b").await.unwrap();
    assert_eq!(env.launcher.live_count(), 0);
    assert_eq!(supervisor.snapshot().await.unwrap().pending, vec!["a", "b"]);

    env.locks.release(PLATFORM_LOCK);

    eventually("queue drained after release", || async {
        env.launcher.live_count() == 2
    })
    .await;
    assert_eq!(env.locks.holders(PLATFORM_LOCK), 2);
}

#[tokio::test]
async fn test_platform_lock_refused_while_apps_run() {
    let env = TestEnv::new().await;
    let supervisor = env.supervisor(3);

    supervisor.start("a").await.unwrap();
    assert!(env.locks.acquire_exclusive(PLATFORM_LOCK).is_err());

    env.launcher.exit("a", WorkerExit::Code(0));
    supervisor.drain_and_wait().await.unwrap();
    env.locks.acquire_exclusive(PLATFORM_LOCK).unwrap();
}

#[tokio::test]
async fn test_unopenable_log_file_fails_start() {
    let env = TestEnv::new().await;
    // A regular file where the log directory should be
    tokio::fs::write(&env.paths.log_dir, b"not a directory")
        .await
        .unwrap();
    let supervisor = env.supervisor(3);

    let err = supervisor.start("a").await.unwrap_err();
    assert!(matches!(err, Error::Io(_)));
    assert_eq!(supervisor.status("a").await.unwrap(), SlotState::Idle);
    assert_eq!(env.locks.holders(PLATFORM_LOCK), 0);
    assert_eq!(env.launcher.launch_count("a"), 0);
}

#[tokio::test]
async fn test_spawn_failure_releases_lock() {
    let env = TestEnv::new().await;
    let supervisor = env.supervisor(3);

    env.launcher.fail_launches(true);
    assert!(supervisor.start("a").await.is_err());
    assert_eq!(env.locks.holders(PLATFORM_LOCK), 0);

    env.launcher.fail_launches(false);
    supervisor.start("a").await.unwrap();
    assert!(env.launcher.is_live("a"));
}

#[tokio::test]
async fn test_queued_app_that_fails_to_launch_goes_to_error() {
    let env = TestEnv::new().await;
    env.add_app("a", InstallationState::PendingInstall, RunState::Running)
        .await;
    env.add_app("b", InstallationState::PendingInstall, RunState::Running)
        .await;
    let supervisor = env.supervisor(1);

    supervisor.start("a").await.unwrap();
    supervisor.start("b").await.unwrap();

    env.launcher.fail_launches(true);
    env.launcher.exit("a", WorkerExit::Code(0));
    supervisor.drain_and_wait().await.unwrap();

    let app = env.apps.get("b").await.unwrap().unwrap();
    assert_eq!(app.installation_state, InstallationState::Error);
    assert!(app.installation_progress.starts_with("App task failed to start"));

    let crashes = env.events(ACTION_APP_TASK_CRASH).await;
    assert_eq!(crashes.len(), 1);
    assert_eq!(crashes[0].data["appId"], "b");
    assert_eq!(supervisor.status("b").await.unwrap(), SlotState::Idle);
    assert_eq!(env.locks.holders(PLATFORM_LOCK), 0);

    // Nothing else is lost: the app is a regular start candidate again
    env.launcher.fail_launches(false);
    supervisor.start("b").await.unwrap();
    assert!(env.launcher.is_live("b"));
}

#[tokio::test]
async fn test_resume_skips_apps_with_unknown_state() {
    let env = TestEnv::new().await;
    env.add_app("good", InstallationState::PendingInstall, RunState::Running)
        .await;
    env.insert_raw_app("odd", "pending_debug", "running").await;

    let supervisor = env.supervisor_with(
        SupervisorConfig {
            concurrency: 3,
            start_paused: true,
            drain_poll_interval: Duration::from_millis(10),
        },
        Arc::new(env.launcher.clone()),
    );

    supervisor.resume().await.unwrap();

    assert!(env.launcher.is_live("good"));
    assert_eq!(env.launcher.launch_count("odd"), 0);
}

#[tokio::test]
async fn test_pause_drops_queue_and_stops_workers() {
    let env = TestEnv::new().await;
    let supervisor = env.supervisor(2);

    for id in ["a", "b", "c", "d"] {
        supervisor.start(id).await.unwrap();
    }

    supervisor.pause().await.unwrap();

    let snapshot = supervisor.snapshot().await.unwrap();
    assert!(snapshot.paused);
    assert!(snapshot.is_idle());
    assert_eq!(env.launcher.live_count(), 0);
    assert_eq!(env.locks.holders(PLATFORM_LOCK), 0);

    // Starts while paused are queued
    supervisor.start("e").await.unwrap();
    assert_eq!(
        supervisor.status("e").await.unwrap(),
        SlotState::Queued { position: 0 }
    );
    assert_eq!(env.launcher.launch_count("e"), 0);
}

#[tokio::test]
async fn test_resume_reconciles_from_app_state() {
    let env = TestEnv::new().await;
    env.add_app("stable", InstallationState::Installed, RunState::Running)
        .await;
    env.add_app("broken", InstallationState::Error, RunState::Stopped)
        .await;
    env.add_app("installing", InstallationState::PendingInstall, RunState::Running)
        .await;
    env.add_app("starting", InstallationState::Installed, RunState::PendingStart)
        .await;
    env.add_app("removing", InstallationState::PendingUninstall, RunState::Stopped)
        .await;

    let supervisor = env.supervisor_with(
        SupervisorConfig {
            concurrency: 2,
            start_paused: true,
            drain_poll_interval: Duration::from_millis(10),
        },
        Arc::new(env.launcher.clone()),
    );
    assert!(supervisor.snapshot().await.unwrap().paused);

    supervisor.resume().await.unwrap();

    // Apps are reconciled in id order; the third waits for a slot
    let snapshot = supervisor.snapshot().await.unwrap();
    assert!(!snapshot.paused);
    assert_eq!(snapshot.running, vec!["installing", "removing"]);
    assert_eq!(snapshot.pending, vec!["starting"]);

    env.launcher.exit("installing", WorkerExit::Code(0));
    eventually("starting promoted", || async { env.launcher.is_live("starting") }).await;

    assert_eq!(env.launcher.launch_count("stable"), 0);
    assert_eq!(env.launcher.launch_count("broken"), 0);
}

#[tokio::test]
async fn test_pause_then_resume_reruns_unfinished_apps() {
    let env = TestEnv::new().await;
    env.add_app("a", InstallationState::PendingUpdate, RunState::Running)
        .await;
    env.add_app("b", InstallationState::PendingBackup, RunState::Running)
        .await;
    let supervisor = env.supervisor(1);

    supervisor.start("a").await.unwrap();
    supervisor.start("b").await.unwrap();

    supervisor.pause().await.unwrap();
    assert_eq!(env.launcher.launch_count("b"), 0);

    supervisor.resume().await.unwrap();
    assert!(env.launcher.is_live("a"));
    assert_eq!(supervisor.snapshot().await.unwrap().pending, vec!["b"]);

    env.launcher.exit("a", WorkerExit::Code(0));
    eventually("b started after resume", || async { env.launcher.is_live("b") }).await;
    assert_eq!(env.launcher.launch_count("a"), 2);
}

#[tokio::test]
async fn test_stop_all_keeps_supervisor_running() {
    let env = TestEnv::new().await;
    let supervisor = env.supervisor(1);

    supervisor.start("a").await.unwrap();
    supervisor.start("b").await.unwrap();
    supervisor.stop_all().await.unwrap();

    let snapshot = supervisor.snapshot().await.unwrap();
    assert!(snapshot.is_idle());
    assert!(!snapshot.paused);

    supervisor.start("c").await.unwrap();
    assert!(env.launcher.is_live("c"));
}

#[tokio::test]
async fn test_drain_and_wait_blocks_until_idle() {
    let env = TestEnv::new().await;
    let supervisor = env.supervisor(1);

    supervisor.start("a").await.unwrap();
    supervisor.start("b").await.unwrap();

    let drain = tokio::spawn({
        let supervisor = supervisor.clone();
        async move { supervisor.drain_and_wait().await }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!drain.is_finished());

    env.launcher.exit("a", WorkerExit::Code(0));
    eventually("b promoted", || async { env.launcher.is_live("b") }).await;
    env.launcher.exit("b", WorkerExit::Code(0));

    tokio::time::timeout(Duration::from_secs(5), drain)
        .await
        .expect("drain did not finish")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_stop_waits_for_worker_ignoring_sigterm() {
    let env = TestEnv::new().await;
    env.launcher.on_sigterm(None);
    let supervisor = env.supervisor(1);

    supervisor.start("stubborn").await.unwrap();

    // No forced kill: stop keeps waiting
    let stop = tokio::time::timeout(Duration::from_millis(100), supervisor.stop("stubborn")).await;
    assert!(stop.is_err());
    assert!(env.launcher.is_live("stubborn"));

    env.launcher.exit("stubborn", WorkerExit::Code(0));
    supervisor.drain_and_wait().await.unwrap();
}

#[tokio::test]
async fn test_logs_reads_app_log() {
    let env = TestEnv::new().await;
    let supervisor = env.supervisor(1);

    let log_file = env.paths.app_log_file("a");
    tokio::fs::create_dir_all(log_file.parent().unwrap())
        .await
        .unwrap();
    tokio::fs::write(
        &log_file,
        "2024-05-01T10:00:00Z Installing\n2024-05-01T10:00:01Z Done\n",
    )
    .await
    .unwrap();

    let lines = supervisor.logs("a", 1).await.unwrap();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].message, "Done");
    assert_eq!(lines[0].source, "a");
}

#[tokio::test]
async fn test_calls_after_shutdown_fail() {
    let env = TestEnv::new().await;
    let supervisor = env.supervisor(1);

    supervisor.shutdown().await.unwrap();

    eventually("dispatcher gone", || async {
        matches!(supervisor.snapshot().await, Err(Error::Shutdown))
    })
    .await;
    assert!(matches!(
        supervisor.start("a").await.unwrap_err(),
        Error::Shutdown
    ));
}

#![cfg(unix)]

use std::time::{Duration, Instant};

use smokewatch_core::CameraId;
use smokewatch_server::supervisor::NO_OUTPUT_CAPTURED;
use smokewatch_server::{
    LaunchSpec, ProcessSupervisor, StartOutcome, StatusReport, StopOutcome, SupervisorConfig,
};
use tempfile::TempDir;

fn supervisor(grace: Duration, stop_timeout: Duration) -> (ProcessSupervisor, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = ProcessSupervisor::new(SupervisorConfig {
        log_dir: dir.path().join("logs"),
        grace_period: grace,
        stop_timeout,
    });
    (supervisor, dir)
}

fn shell(script: &str) -> LaunchSpec {
    LaunchSpec::new("sh").arg("-c").arg(script)
}

#[test_timeout::tokio_timeout_test(20)]
async fn helper_exiting_during_grace_reports_crash_with_log_tail() {
    let (supervisor, _dir) = supervisor(Duration::from_millis(500), Duration::from_secs(1));
    let spec = shell("echo 'cannot open rtsp source' >&2; exit 3");

    let outcome = supervisor.start(CameraId(1), &spec).await;
    match outcome {
        StartOutcome::Crashed { exit_code, log } => {
            assert_eq!(exit_code, Some(3));
            assert!(log.contains("cannot open rtsp source"), "log was {log:?}");
        }
        other => panic!("expected crash, got {other:?}"),
    }
    assert_eq!(supervisor.status(CameraId(1)).await, StatusReport::NotRunning);
    assert!(supervisor.list().await.is_empty());
}

#[test_timeout::tokio_timeout_test(20)]
async fn silent_crash_reports_placeholder_and_log_is_truncated_per_launch() {
    let (supervisor, _dir) = supervisor(Duration::from_millis(500), Duration::from_secs(1));

    let first = supervisor
        .start(CameraId(2), &shell("echo first-run; exit 1"))
        .await;
    assert!(matches!(first, StartOutcome::Crashed { ref log, .. } if log == "first-run"));

    let second = supervisor.start(CameraId(2), &shell("exit 1")).await;
    match second {
        StartOutcome::Crashed { log, .. } => assert_eq!(log, NO_OUTPUT_CAPTURED),
        other => panic!("expected crash, got {other:?}"),
    }
}

#[test_timeout::tokio_timeout_test(20)]
async fn running_helper_is_reported_and_stopped_gracefully() {
    let (supervisor, _dir) = supervisor(Duration::from_millis(200), Duration::from_secs(5));
    let spec = shell("exec sleep 30");

    let pid = match supervisor.start(CameraId(3), &spec).await {
        StartOutcome::Started { pid } => pid,
        other => panic!("expected start, got {other:?}"),
    };
    assert_eq!(
        supervisor.start(CameraId(3), &spec).await,
        StartOutcome::AlreadyRunning { pid }
    );

    match supervisor.status(CameraId(3)).await {
        StatusReport::Running {
            pid: reported,
            uptime_secs,
            ..
        } => {
            assert_eq!(reported, pid);
            assert!(uptime_secs >= 0.2);
        }
        other => panic!("expected running, got {other:?}"),
    }
    let listed = supervisor.list().await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].camera_id, CameraId(3));

    let started = Instant::now();
    assert_eq!(
        supervisor.stop(CameraId(3)).await,
        StopOutcome::Stopped { forced: false }
    );
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(supervisor.status(CameraId(3)).await, StatusReport::NotRunning);
    assert_eq!(supervisor.stop(CameraId(3)).await, StopOutcome::NotRunning);
}

#[test_timeout::tokio_timeout_test(20)]
async fn helper_ignoring_sigterm_is_killed_after_timeout() {
    let (supervisor, _dir) = supervisor(Duration::from_millis(200), Duration::from_millis(500));
    let spec = shell("trap '' TERM; exec sleep 30");

    assert!(supervisor.start(CameraId(4), &spec).await.is_started());

    let started = Instant::now();
    assert_eq!(
        supervisor.stop(CameraId(4)).await,
        StopOutcome::Stopped { forced: true }
    );
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(500), "stopped after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "stopped after {elapsed:?}");
    assert_eq!(supervisor.status(CameraId(4)).await, StatusReport::NotRunning);
}

#[test_timeout::tokio_timeout_test(20)]
async fn helper_dying_after_start_is_purged_on_status() {
    let (supervisor, _dir) = supervisor(Duration::from_millis(100), Duration::from_secs(1));
    let spec = shell("sleep 0.4; exit 7");

    assert!(supervisor.start(CameraId(5), &spec).await.is_started());
    tokio::time::sleep(Duration::from_millis(900)).await;

    assert_eq!(
        supervisor.status(CameraId(5)).await,
        StatusReport::Crashed { exit_code: Some(7) }
    );
    assert_eq!(supervisor.status(CameraId(5)).await, StatusReport::NotRunning);

    // A fresh start after the crash launches a new helper.
    assert!(supervisor.start(CameraId(5), &spec).await.is_started());
    tokio::time::sleep(Duration::from_millis(900)).await;
    assert_eq!(
        supervisor.stop(CameraId(5)).await,
        StopOutcome::Crashed { exit_code: Some(7) }
    );
}

#[test_timeout::tokio_timeout_test(20)]
async fn missing_executable_is_a_launch_failure() {
    let (supervisor, _dir) = supervisor(Duration::from_millis(100), Duration::from_secs(1));
    let spec = LaunchSpec::new("/nonexistent/smokewatch-helper").arg("--source");

    match supervisor.start(CameraId(6), &spec).await {
        StartOutcome::LaunchFailed { message } => {
            assert!(message.contains("failed to launch"), "message was {message:?}")
        }
        other => panic!("expected launch failure, got {other:?}"),
    }
    assert_eq!(supervisor.status(CameraId(6)).await, StatusReport::NotRunning);
}

#[test_timeout::tokio_timeout_test(secs = 20, flavor = "multi_thread")]
async fn concurrent_starts_for_one_camera_launch_once() {
    let (supervisor, _dir) = supervisor(Duration::from_millis(200), Duration::from_secs(5));
    let spec = shell("exec sleep 30");

    let (a, b) = tokio::join!(
        supervisor.start(CameraId(7), &spec),
        supervisor.start(CameraId(7), &spec)
    );
    let started = [&a, &b].iter().filter(|outcome| outcome.is_started()).count();
    let already = [&a, &b]
        .iter()
        .filter(|outcome| matches!(outcome, StartOutcome::AlreadyRunning { .. }))
        .count();
    assert_eq!((started, already), (1, 1), "outcomes: {a:?} {b:?}");

    supervisor.stop_all().await;
}

#[test_timeout::tokio_timeout_test(secs = 20, flavor = "multi_thread")]
async fn stop_all_stops_every_camera_without_serializing_them() {
    let (supervisor, _dir) = supervisor(Duration::from_millis(200), Duration::from_millis(800));
    let stubborn = shell("trap '' TERM; exec sleep 30");

    assert!(supervisor.start(CameraId(8), &stubborn).await.is_started());
    assert!(supervisor.start(CameraId(9), &stubborn).await.is_started());
    assert_eq!(supervisor.list().await.len(), 2);

    let started = Instant::now();
    let stopped = supervisor.stop_all().await;
    assert_eq!(
        stopped,
        vec![
            (CameraId(8), StopOutcome::Stopped { forced: true }),
            (CameraId(9), StopOutcome::Stopped { forced: true }),
        ]
    );
    // Both stop timeouts run side by side.
    assert!(started.elapsed() < Duration::from_millis(1500));
    assert!(supervisor.list().await.is_empty());
}

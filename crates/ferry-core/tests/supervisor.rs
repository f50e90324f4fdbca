//! Receiver lifecycle against a stand-in receiver script.

#![cfg(unix)]

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{FAKE_RECEIVER, Sandbox, eventually, pid_alive};
use ferry_core::{SessionState, StartError, Supervisor, SupervisorConfig};
use serial_test::serial;

fn supervisor(sandbox: &Sandbox) -> Supervisor {
    let bin = sandbox.script("receiver", FAKE_RECEIVER);
    Supervisor::new(sandbox.supervisor_config(&bin))
}

#[tokio::test]
#[serial]
async fn start_binds_requested_port_and_captures_output() {
    let sandbox = Sandbox::new("bind");
    let supervisor = supervisor(&sandbox);

    let port = supervisor.start(41000, sandbox.out_dir()).await.unwrap();
    assert_eq!(port, 41000);

    let view = supervisor.status();
    assert_eq!(view.state, SessionState::Running);
    assert!(view.is_running);
    assert_eq!(view.port, Some(41000));
    assert_eq!(view.output_dir.as_deref(), Some(sandbox.out_dir().as_path()));
    assert!(view.pid.is_some());
    assert!(view.uptime_seconds.is_some());

    assert!(
        eventually(Duration::from_secs(2), || {
            supervisor
                .logs()
                .iter()
                .any(|e| e.text == "Server listening on UDP 41000")
        })
        .await
    );

    assert!(supervisor.stop().await);
    let view = supervisor.status();
    assert_eq!(view.state, SessionState::Stopped);
    assert!(view.pid.is_none());
    assert!(view.port.is_none());
    assert!(supervisor.logs().is_empty());
}

#[tokio::test]
#[serial]
async fn start_moves_past_busy_ports() {
    let sandbox = Sandbox::new("busy");
    sandbox.mark_busy(41100);
    sandbox.mark_busy(41101);
    let supervisor = supervisor(&sandbox);

    let port = supervisor.start(41100, sandbox.out_dir()).await.unwrap();
    assert_eq!(port, 41102);
    assert_eq!(supervisor.status().port, Some(41102));
    assert_eq!(sandbox.attempts(), vec![41100, 41101, 41102]);

    supervisor.stop().await;
}

#[tokio::test]
#[serial]
async fn start_gives_up_after_port_range() {
    let sandbox = Sandbox::new("exhaust");
    for port in 41200..41210 {
        sandbox.mark_busy(port);
    }
    let supervisor = supervisor(&sandbox);

    let started = Instant::now();
    let err = supervisor.start(41200, sandbox.out_dir()).await.unwrap_err();
    assert!(matches!(
        err,
        StartError::PortsExhausted { first: 41200, last: 41209 }
    ));
    assert_eq!(sandbox.attempts().len(), 10);
    // Early exits short-circuit the settle interval.
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(supervisor.status().state, SessionState::Stopped);
}

#[tokio::test]
#[serial]
async fn non_bind_failure_is_not_retried() {
    let sandbox = Sandbox::new("crash");
    let bin = sandbox.script(
        "receiver",
        "#!/bin/sh\necho run >> \"@ROOT@/attempts\"\necho 'socket failed: Permission denied' >&2\nexit 3\n",
    );
    let supervisor = Supervisor::new(sandbox.supervisor_config(&bin));

    let err = supervisor.start(41300, sandbox.out_dir()).await.unwrap_err();
    match err {
        StartError::Exited { port, diagnostics } => {
            assert_eq!(port, 41300);
            assert!(diagnostics.contains("socket failed: Permission denied"));
        }
        other => panic!("expected Exited, got {:?}", other),
    }
    let runs = std::fs::read_to_string(sandbox.path("attempts")).unwrap();
    assert_eq!(runs.lines().count(), 1);

    let view = supervisor.status();
    assert_eq!(view.state, SessionState::Crashed);
    assert!(view.pid.is_none());

    // The startup stderr stays readable after the failure.
    assert!(
        supervisor
            .logs()
            .iter()
            .any(|e| e.text == "socket failed: Permission denied")
    );

    // stop resets a crashed session without side effects
    assert!(!supervisor.stop().await);
    assert_eq!(supervisor.status().state, SessionState::Stopped);
}

#[tokio::test]
#[serial]
async fn missing_receiver_executable() {
    let sandbox = Sandbox::new("missing");
    let supervisor = Supervisor::new(sandbox.supervisor_config(&sandbox.path("no-such-receiver")));

    let err = supervisor.start(41400, sandbox.out_dir()).await.unwrap_err();
    assert!(matches!(err, StartError::ExecutableMissing(_)));
}

#[tokio::test]
#[serial]
async fn stop_is_idempotent() {
    let sandbox = Sandbox::new("idempotent");
    let supervisor = supervisor(&sandbox);

    assert!(!supervisor.stop().await);
    supervisor.start(41500, sandbox.out_dir()).await.unwrap();
    let pid = supervisor.status().pid.unwrap();

    assert!(supervisor.stop().await);
    assert!(!supervisor.stop().await);
    assert_eq!(supervisor.status().state, SessionState::Stopped);
    assert!(eventually(Duration::from_secs(2), || !pid_alive(pid)).await);
}

#[tokio::test]
#[serial]
async fn status_notices_external_kill() {
    let sandbox = Sandbox::new("external");
    let supervisor = supervisor(&sandbox);

    supervisor.start(41600, sandbox.out_dir()).await.unwrap();
    let pid = supervisor.status().pid.unwrap();
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }

    assert!(
        eventually(Duration::from_secs(3), || {
            supervisor.status().state == SessionState::Stopped
        })
        .await
    );
    let view = supervisor.status();
    assert!(view.pid.is_none());
    assert!(view.port.is_none());
    assert!(view.start_time.is_none());
    assert!(supervisor.live_port().is_none());

    // The dead session is still torn down cleanly.
    supervisor.stop().await;
    assert!(supervisor.logs().is_empty());
}

#[tokio::test]
#[serial]
async fn restart_replaces_running_receiver() {
    let sandbox = Sandbox::new("restart");
    let supervisor = supervisor(&sandbox);

    supervisor.start(41700, sandbox.out_dir()).await.unwrap();
    let first = supervisor.status().pid.unwrap();

    let port = supervisor.start(41700, sandbox.out_dir()).await.unwrap();
    assert_eq!(port, 41700);
    let second = supervisor.status().pid.unwrap();
    assert_ne!(first, second);
    assert!(eventually(Duration::from_secs(2), || !pid_alive(first)).await);
    assert!(pid_alive(second));

    supervisor.stop().await;
}

#[tokio::test]
#[serial]
async fn stubborn_receiver_is_force_killed() {
    let sandbox = Sandbox::new("stubborn");
    let bin = sandbox.script(
        "receiver",
        "#!/bin/sh\ntrap '' TERM\necho 'Server listening'\nwhile :; do sleep 1; done\n",
    );
    let config = SupervisorConfig {
        graceful_timeout: Duration::from_millis(300),
        ..sandbox.supervisor_config(&bin)
    };
    let supervisor = Supervisor::new(config);

    supervisor.start(41800, sandbox.out_dir()).await.unwrap();
    let pid = supervisor.status().pid.unwrap();

    let started = Instant::now();
    assert!(supervisor.stop().await);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(supervisor.status().state, SessionState::Stopped);
    assert!(supervisor.logs().is_empty());
    assert!(eventually(Duration::from_secs(2), || !pid_alive(pid)).await);
}

#[tokio::test]
#[serial]
async fn status_answers_during_start() {
    let sandbox = Sandbox::new("concurrent");
    let bin = sandbox.script("receiver", FAKE_RECEIVER);
    let config = SupervisorConfig {
        settle_interval: Duration::from_secs(1),
        ..sandbox.supervisor_config(&bin)
    };
    let supervisor = Arc::new(Supervisor::new(config));

    let starter = {
        let supervisor = supervisor.clone();
        let out = sandbox.out_dir();
        tokio::spawn(async move { supervisor.start(41900, out).await })
    };

    assert!(
        eventually(Duration::from_millis(800), || {
            supervisor.status().state == SessionState::Starting
        })
        .await
    );
    assert!(supervisor.status().pid.is_some());

    assert_eq!(starter.await.unwrap().unwrap(), 41900);
    assert_eq!(supervisor.status().state, SessionState::Running);
    supervisor.stop().await;
}

#[tokio::test]
#[serial]
async fn ensure_started_reuses_running_receiver() {
    let sandbox = Sandbox::new("ensure_reuse");
    let supervisor = supervisor(&sandbox);

    supervisor.start(41700, sandbox.out_dir()).await.unwrap();
    let pid = supervisor.status().pid;

    let port = supervisor.ensure_started(41750, sandbox.out_dir()).await.unwrap();
    assert_eq!(port, 41700);
    assert_eq!(supervisor.status().pid, pid);
    assert_eq!(sandbox.attempts(), vec![41700]);

    supervisor.stop().await;
}

#[tokio::test]
#[serial]
async fn ensure_started_launches_when_stopped() {
    let sandbox = Sandbox::new("ensure_launch");
    let supervisor = supervisor(&sandbox);

    let port = supervisor.ensure_started(41800, sandbox.out_dir()).await.unwrap();
    assert_eq!(port, 41800);
    assert_eq!(supervisor.status().state, SessionState::Running);

    // Concurrent callers queued behind the launch share it.
    let (a, b) = tokio::join!(
        supervisor.ensure_started(41800, sandbox.out_dir()),
        supervisor.ensure_started(41800, sandbox.out_dir()),
    );
    assert_eq!((a.unwrap(), b.unwrap()), (41800, 41800));
    assert_eq!(sandbox.attempts(), vec![41800]);

    supervisor.stop().await;
}

#[tokio::test]
#[serial]
async fn ensure_started_waits_for_start_in_flight() {
    let sandbox = Sandbox::new("ensure_wait");
    let supervisor = supervisor(&sandbox);

    let (started, ensured) = tokio::join!(
        supervisor.start(41900, sandbox.out_dir()),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            supervisor.ensure_started(41950, sandbox.out_dir()).await
        },
    );
    assert_eq!(started.unwrap(), 41900);
    assert_eq!(ensured.unwrap(), 41900);
    assert_eq!(sandbox.attempts(), vec![41900]);

    supervisor.stop().await;
}

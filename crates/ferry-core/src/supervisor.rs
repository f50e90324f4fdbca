use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SupervisorConfig;
use crate::error::StartError;
use crate::logbuf::{LogBuffer, LogEntry};

/// Upper bound on reading a dead receiver's stderr. A descendant that kept
/// the pipe open must not stall start().
const DIAGNOSTICS_READ_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
}

/// Point-in-time copy of the receiver session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub state: SessionState,
    pub is_running: bool,
    pub port: Option<u16>,
    pub output_dir: Option<PathBuf>,
    pub pid: Option<u32>,
    pub start_time: Option<DateTime<Local>>,
    pub uptime_seconds: Option<f64>,
}

/// Published session record. Always replaced as a whole so no reader can see
/// a pid from one receiver next to the port of another.
#[derive(Debug, Clone)]
struct Session {
    state: SessionState,
    port: Option<u16>,
    output_dir: Option<PathBuf>,
    pid: Option<u32>,
    started_at: Option<DateTime<Local>>,
    exit: Option<watch::Receiver<Option<ExitStatus>>>,
}

impl Session {
    fn idle(state: SessionState) -> Self {
        Self {
            state,
            port: None,
            output_dir: None,
            pid: None,
            started_at: None,
            exit: None,
        }
    }

    fn is_alive(&self) -> bool {
        match (&self.exit, self.pid) {
            (Some(exit), Some(pid)) => !has_exited(exit) && pid_alive(pid),
            _ => false,
        }
    }

    fn view(&self) -> SessionView {
        let uptime_seconds = match (self.state, self.started_at) {
            (SessionState::Running, Some(started)) => {
                Some((Local::now() - started).num_milliseconds() as f64 / 1000.0)
            }
            _ => None,
        };
        SessionView {
            state: self.state,
            is_running: self.state == SessionState::Running,
            port: self.port,
            output_dir: self.output_dir.clone(),
            pid: self.pid,
            start_time: self.started_at,
            uptime_seconds,
        }
    }
}

/// Handle to a launched receiver. The child itself is owned by its monitor
/// task; this side talks to it through channels and the pid.
struct ReceiverProcess {
    pid: u32,
    exit: watch::Receiver<Option<ExitStatus>>,
    kill_tx: mpsc::Sender<()>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    reader: Option<JoinHandle<()>>,
}

impl ReceiverProcess {
    /// Staged teardown: polite signal, then kill, then the whole process group.
    async fn shutdown(mut self, config: &SupervisorConfig) {
        if !has_exited(&self.exit) {
            self.terminate();
            if !wait_for_exit(&mut self.exit, config.graceful_timeout).await {
                warn!(pid = self.pid, "Receiver ignored termination, force killing");
                let _ = self.kill_tx.try_send(());
                if !wait_for_exit(&mut self.exit, config.kill_timeout).await {
                    warn!(pid = self.pid, "Receiver survived kill, terminating process tree");
                    kill_tree(self.pid).await;
                }
            }
        }
        // Never joined: a descendant may still hold the pipes open.
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }

    #[cfg(unix)]
    fn terminate(&self) {
        if let Ok(pid) = libc::pid_t::try_from(self.pid) {
            // SAFETY: plain signal delivery to a pid we spawned and have not reaped.
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
        }
    }

    #[cfg(not(unix))]
    fn terminate(&self) {
        let _ = self.kill_tx.try_send(());
    }
}

enum Launch {
    Bound(ReceiverProcess),
    Exited(String),
}

/// Owns the receiver process and its session record.
///
/// `start` and `stop` are serialized by the lifecycle lock, which is held
/// across the settle and shutdown waits. `status` and `logs` only touch the
/// published record and the log buffer, so they answer immediately even
/// while a start or stop is in flight.
pub struct Supervisor {
    config: SupervisorConfig,
    logs: Arc<LogBuffer>,
    session: Mutex<Session>,
    lifecycle: tokio::sync::Mutex<Option<ReceiverProcess>>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let logs = Arc::new(LogBuffer::new(config.log_capacity));
        Self {
            config,
            logs,
            session: Mutex::new(Session::idle(SessionState::Stopped)),
            lifecycle: tokio::sync::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Start the receiver, moving up from `requested_port` while the receiver
    /// reports the address as taken. Returns the port it actually bound.
    pub async fn start(&self, requested_port: u16, output_dir: impl AsRef<Path>) -> Result<u16, StartError> {
        let mut slot = self.lifecycle.lock().await;
        self.start_locked(&mut slot, requested_port, output_dir.as_ref()).await
    }

    /// Return the port of the live receiver, starting one only if there is none.
    ///
    /// Unlike `start`, an active receiver is never replaced. Callers queued
    /// behind a start in flight see the receiver it launched.
    pub async fn ensure_started(&self, requested_port: u16, output_dir: impl AsRef<Path>) -> Result<u16, StartError> {
        let mut slot = self.lifecycle.lock().await;
        if slot.is_some() {
            if let Some(port) = self.live_port() {
                debug!(port, "Reusing running receiver");
                return Ok(port);
            }
        }
        self.start_locked(&mut slot, requested_port, output_dir.as_ref()).await
    }

    async fn start_locked(
        &self,
        slot: &mut Option<ReceiverProcess>,
        requested_port: u16,
        output_dir: &Path,
    ) -> Result<u16, StartError> {
        let output_dir = output_dir.to_path_buf();
        if slot.is_some() {
            info!("Receiver already active, stopping it before restart");
            self.stop_locked(slot).await;
        }

        tokio::fs::create_dir_all(&output_dir)
            .await
            .map_err(|source| StartError::OutputDir {
                path: output_dir.clone(),
                source,
            })?;

        match tokio::fs::metadata(&self.config.receiver_bin).await {
            Ok(meta) if meta.is_file() => {}
            _ => return Err(StartError::ExecutableMissing(self.config.receiver_bin.clone())),
        }

        self.logs.clear();
        let attempts = self.config.max_port_attempts.max(1);
        let mut last_port = requested_port;

        for attempt in 0..attempts {
            let Some(port) = requested_port.checked_add(attempt) else {
                break;
            };
            last_port = port;
            info!(port, attempt = attempt + 1, attempts, "Starting receiver");

            match self.launch(port, &output_dir).await {
                Ok(Launch::Bound(mut process)) => {
                    process.reader = Some(tokio::spawn(pump_output(
                        process.stdout.take(),
                        process.stderr.take(),
                        self.logs.clone(),
                    )));
                    self.publish(Session {
                        state: SessionState::Running,
                        port: Some(port),
                        output_dir: Some(output_dir.clone()),
                        pid: Some(process.pid),
                        started_at: Some(Local::now()),
                        exit: Some(process.exit.clone()),
                    });
                    *slot = Some(process);
                    if port != requested_port {
                        info!(port, requested_port, "Receiver running on fallback port");
                    } else {
                        info!(port, "Receiver running");
                    }
                    return Ok(port);
                }
                Ok(Launch::Exited(diagnostics)) if is_bind_conflict(&diagnostics) => {
                    warn!(port, "Port in use, trying next: {}", diagnostics.trim());
                    self.record_diagnostics(&diagnostics);
                    self.publish(Session::idle(SessionState::Stopped));
                }
                Ok(Launch::Exited(diagnostics)) => {
                    warn!(port, "Receiver exited during startup: {}", diagnostics.trim());
                    self.record_diagnostics(&diagnostics);
                    self.publish(Session::idle(SessionState::Crashed));
                    return Err(StartError::Exited { port, diagnostics });
                }
                Err(e) => {
                    self.publish(Session::idle(SessionState::Stopped));
                    return Err(e);
                }
            }
        }

        self.publish(Session::idle(SessionState::Stopped));
        Err(StartError::PortsExhausted {
            first: requested_port,
            last: last_port,
        })
    }

    /// Stop the receiver if one is active. Returns whether there was one.
    pub async fn stop(&self) -> bool {
        let mut slot = self.lifecycle.lock().await;
        self.stop_locked(&mut slot).await
    }

    async fn stop_locked(&self, slot: &mut Option<ReceiverProcess>) -> bool {
        let Some(process) = slot.take() else {
            let mut session = self.lock_session();
            if session.state != SessionState::Stopped {
                *session = Session::idle(SessionState::Stopped);
            }
            return false;
        };

        let pid = process.pid;
        {
            let mut session = self.lock_session();
            session.state = SessionState::Stopping;
        }
        info!(pid, "Stopping receiver");

        process.shutdown(&self.config).await;

        self.publish(Session::idle(SessionState::Stopped));
        self.logs.clear();
        info!(pid, "Receiver stopped");
        true
    }

    /// Current session, corrected to Stopped if the receiver died on its own.
    pub fn status(&self) -> SessionView {
        let mut session = self.lock_session();
        if session.state == SessionState::Running && !session.is_alive() {
            warn!(pid = ?session.pid, "Receiver is no longer alive, marking session stopped");
            *session = Session::idle(SessionState::Stopped);
        }
        session.view()
    }

    /// Port of the running receiver, if it is actually alive.
    pub fn live_port(&self) -> Option<u16> {
        let view = self.status();
        if view.is_running { view.port } else { None }
    }

    pub fn logs(&self) -> Vec<LogEntry> {
        self.logs.snapshot()
    }

    async fn launch(&self, port: u16, output_dir: &Path) -> Result<Launch, StartError> {
        let mut cmd = Command::new(&self.config.receiver_bin);
        cmd.arg("--port")
            .arg(port.to_string())
            .arg("--out")
            .arg(output_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group so the last-resort kill reaches descendants too.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                StartError::ExecutableMissing(self.config.receiver_bin.clone())
            }
            _ => StartError::Spawn(e),
        })?;
        let pid = receiver_pid(child.id())?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (kill_tx, kill_rx) = mpsc::channel(4);
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(monitor_child(child, kill_rx, exit_tx));

        self.publish(Session {
            state: SessionState::Starting,
            port: Some(port),
            output_dir: Some(output_dir.to_path_buf()),
            pid: Some(pid),
            started_at: None,
            exit: Some(exit_rx.clone()),
        });

        let mut exit = exit_rx.clone();
        if wait_for_exit(&mut exit, self.config.settle_interval).await {
            let status = *exit.borrow();
            let diagnostics = read_diagnostics(stderr, status).await;
            return Ok(Launch::Exited(diagnostics));
        }

        debug!(pid, port, "Receiver survived settle interval");
        Ok(Launch::Bound(ReceiverProcess {
            pid,
            exit: exit_rx,
            kill_tx,
            stdout,
            stderr,
            reader: None,
        }))
    }

    /// Keep a failed launch's stderr readable through `logs()`.
    fn record_diagnostics(&self, diagnostics: &str) {
        for line in diagnostics.lines().map(str::trim_end).filter(|l| !l.is_empty()) {
            self.logs.append(line);
        }
    }

    fn publish(&self, session: Session) {
        *self.lock_session() = session;
    }

    fn lock_session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Address-in-use detection for the receiver's stderr.
///
/// The receiver gives no structured bind result, so this is the single place
/// where controller behaviour depends on matching child output text. Covers
/// the receiver's own "bind failed" prefix, the Winsock WSAEADDRINUSE code,
/// and the POSIX strerror phrase.
pub fn is_bind_conflict(diagnostics: &str) -> bool {
    diagnostics.contains("bind failed")
        || diagnostics.contains("10048")
        || diagnostics.to_lowercase().contains("address already in use")
}

/// A spawned child always has a pid until it is reaped. Pid 0 would make the
/// signal helpers target our own process group.
fn receiver_pid(id: Option<u32>) -> Result<u32, StartError> {
    match id {
        Some(pid) if pid != 0 => Ok(pid),
        _ => Err(StartError::Spawn(std::io::Error::other(
            "receiver exited before its pid was read",
        ))),
    }
}

async fn monitor_child(
    mut child: Child,
    mut kill_rx: mpsc::Receiver<()>,
    exit_tx: watch::Sender<Option<ExitStatus>>,
) {
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            Some(()) = kill_rx.recv() => {
                if let Err(e) = child.start_kill() {
                    warn!("Failed to kill receiver: {}", e);
                }
            }
        }
    };
    match status {
        Ok(status) => {
            debug!(%status, "Receiver exited");
            let _ = exit_tx.send(Some(status));
        }
        // Dropping exit_tx closes the channel, which waiters treat as exited.
        Err(e) => warn!("Failed to wait on receiver: {}", e),
    }
}

fn has_exited(exit: &watch::Receiver<Option<ExitStatus>>) -> bool {
    exit.borrow().is_some() || exit.has_changed().is_err()
}

/// Wait up to `timeout` for the receiver to exit. True if it did.
async fn wait_for_exit(exit: &mut watch::Receiver<Option<ExitStatus>>, timeout: Duration) -> bool {
    tokio::time::timeout(timeout, exit.wait_for(Option::is_some))
        .await
        .is_ok()
}

async fn read_diagnostics(stderr: Option<ChildStderr>, status: Option<ExitStatus>) -> String {
    let mut text = String::new();
    if let Some(mut stderr) = stderr {
        let read = tokio::time::timeout(DIAGNOSTICS_READ_TIMEOUT, stderr.read_to_string(&mut text)).await;
        if let Ok(Err(e)) = read {
            debug!("Failed to read receiver stderr: {}", e);
        }
    }
    if text.trim().is_empty() {
        match status {
            Some(status) => format!("receiver exited with {}", status),
            None => "Unknown error".to_string(),
        }
    } else {
        text
    }
}

/// Drain receiver stdout and stderr into the log buffer until both close.
async fn pump_output(stdout: Option<ChildStdout>, stderr: Option<ChildStderr>, logs: Arc<LogBuffer>) {
    let mut out = stdout.map(|s| BufReader::new(s).lines());
    let mut err = stderr.map(|s| BufReader::new(s).lines());

    while out.is_some() || err.is_some() {
        tokio::select! {
            line = next_line(&mut out) => {
                if !record_line(line, &logs, "stdout") {
                    out = None;
                }
            }
            line = next_line(&mut err) => {
                if !record_line(line, &logs, "stderr") {
                    err = None;
                }
            }
        }
    }
    debug!("Receiver output closed");
}

async fn next_line<R>(lines: &mut Option<Lines<R>>) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    match lines {
        Some(lines) => lines.next_line().await,
        None => std::future::pending().await,
    }
}

/// Returns false once the stream is finished.
fn record_line(line: std::io::Result<Option<String>>, logs: &LogBuffer, stream: &'static str) -> bool {
    match line {
        Ok(Some(line)) => {
            let line = line.trim_end();
            debug!(target: "ferry_core::receiver", stream, "{}", line);
            logs.append(line);
            true
        }
        Ok(None) => false,
        Err(e) => {
            debug!(stream, "Receiver output read error: {}", e);
            false
        }
    }
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 only checks that the process exists.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}

#[cfg(unix)]
async fn kill_tree(pid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: negative pid targets the process group created at spawn.
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc != 0 {
        debug!(pid, "Process group kill failed: {}", std::io::Error::last_os_error());
    }
}

#[cfg(not(unix))]
async fn kill_tree(pid: u32) {
    let result = Command::new("taskkill")
        .args(["/T", "/F", "/PID", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(e) = result {
        debug!(pid, "taskkill failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_conflict_signatures() {
        assert!(is_bind_conflict("bind failed: Address already in use\n"));
        assert!(is_bind_conflict("bind failed: 10048"));
        assert!(is_bind_conflict("error: ADDRESS ALREADY IN USE"));
        assert!(!is_bind_conflict("socket failed: Permission denied"));
        assert!(!is_bind_conflict("Usage: server [--port 9000]"));
    }

    #[test]
    fn test_receiver_pid_rejects_missing_or_zero() {
        assert_eq!(receiver_pid(Some(4242)).unwrap(), 4242);
        assert!(matches!(receiver_pid(None), Err(StartError::Spawn(_))));
        assert!(matches!(receiver_pid(Some(0)), Err(StartError::Spawn(_))));
    }

    #[test]
    fn test_idle_session_clears_everything() {
        let view = Session::idle(SessionState::Crashed).view();
        assert_eq!(view.state, SessionState::Crashed);
        assert!(!view.is_running);
        assert!(view.port.is_none());
        assert!(view.output_dir.is_none());
        assert!(view.pid.is_none());
        assert!(view.start_time.is_none());
        assert!(view.uptime_seconds.is_none());
    }

    #[tokio::test]
    async fn test_new_supervisor_is_stopped() {
        let supervisor = Supervisor::new(SupervisorConfig::default());
        let view = supervisor.status();
        assert_eq!(view.state, SessionState::Stopped);
        assert!(supervisor.logs().is_empty());
        assert!(supervisor.live_port().is_none());
    }

    #[tokio::test]
    async fn test_stop_without_session_is_noop() {
        let supervisor = Supervisor::new(SupervisorConfig::default());
        assert!(!supervisor.stop().await);
        assert!(!supervisor.stop().await);
        assert_eq!(supervisor.status().state, SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_missing_executable() {
        let config = SupervisorConfig {
            receiver_bin: PathBuf::from("/nonexistent/ferry/receiver"),
            ..SupervisorConfig::default()
        };
        let supervisor = Supervisor::new(config);
        let out = std::env::temp_dir().join(format!("ferry_missing_{}", uuid::Uuid::new_v4()));
        let err = supervisor.start(9000, &out).await.unwrap_err();
        assert!(matches!(err, StartError::ExecutableMissing(_)));
        assert_eq!(supervisor.status().state, SessionState::Stopped);
        std::fs::remove_dir_all(&out).ok();
    }
}

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::TransferConfig;
use crate::error::TransferError;
use crate::supervisor::Supervisor;

/// Link-level tuning handed to the sender. Kept signed so out-of-range input
/// can be echoed back exactly as the caller sent it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferParams {
    pub chunk_size: i64,
    pub window_size: i64,
    pub timeout_ms: i64,
    pub max_retries: i64,
}

impl Default for TransferParams {
    fn default() -> Self {
        Self {
            chunk_size: 1024,
            window_size: 8,
            timeout_ms: 300,
            max_retries: 3,
        }
    }
}

impl TransferParams {
    pub const CHUNK_SIZE: (i64, i64) = (64, 8192);
    pub const WINDOW_SIZE: (i64, i64) = (1, 32);
    pub const TIMEOUT_MS: (i64, i64) = (100, 5000);
    pub const MAX_RETRIES: (i64, i64) = (1, 10);

    /// Check every field against its inclusive range, reporting the first violation.
    pub fn validate(&self) -> Result<(), TransferError> {
        let checks = [
            ("chunk_size", self.chunk_size, Self::CHUNK_SIZE),
            ("window_size", self.window_size, Self::WINDOW_SIZE),
            ("timeout", self.timeout_ms, Self::TIMEOUT_MS),
            ("max_retries", self.max_retries, Self::MAX_RETRIES),
        ];
        for (field, value, (min, max)) in checks {
            if value < min || value > max {
                return Err(TransferError::OutOfRange { field, value, min, max });
            }
        }
        Ok(())
    }
}

/// One inbound transfer: the uploaded payload plus where and how to send it.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub host: String,
    pub file_name: String,
    pub payload: Bytes,
    pub params: TransferParams,
}

#[derive(Debug, Clone)]
pub struct TransferReport {
    pub file_name: String,
    pub host: String,
    pub port: u16,
    pub byte_count: u64,
    pub duration: Duration,
}

impl TransferReport {
    pub fn duration_ms(&self) -> u64 {
        self.duration.as_millis() as u64
    }

    /// KiB per second over the sender's wall-clock run.
    pub fn throughput_kbs(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            self.byte_count as f64 / secs / 1024.0
        } else {
            0.0
        }
    }
}

/// Per-transfer temporary directory, removed when dropped.
///
/// Removal happens on every exit path, including the handler future being
/// cancelled mid-transfer.
struct StagingDir {
    path: PathBuf,
}

impl StagingDir {
    async fn create(root: &Path) -> std::io::Result<Self> {
        let path = root.join(format!("ferry-stage-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&path).await?;
        Ok(Self { path })
    }

    /// Write the payload under its original name and return the full path.
    async fn stage(&self, file_name: &str, payload: &[u8]) -> std::io::Result<PathBuf> {
        let path = self.path.join(file_name);
        tokio::fs::write(&path, payload).await?;
        Ok(path)
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => debug!("Cleaned up staging directory {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to clean up staging directory {}: {}", self.path.display(), e),
        }
    }
}

/// Reduce an uploaded file name to its final path component.
///
/// The receiver names artifacts after the file the sender was given, so the
/// staged copy must keep the caller's name byte for byte.
pub fn staged_file_name(raw: &str) -> Result<&str, TransferError> {
    let name = raw.rsplit(['/', '\\']).next().unwrap_or_default();
    if name.trim().is_empty() || name == "." || name == ".." || name.contains('\0') {
        return Err(TransferError::Malformed { field: "file" });
    }
    Ok(name)
}

/// Runs the sender against the supervised receiver.
///
/// Transfers share nothing but the supervisor handle: each gets its own
/// staging directory and sender process, so they may run concurrently.
pub struct TransferCoordinator {
    supervisor: Arc<Supervisor>,
    config: TransferConfig,
}

impl TransferCoordinator {
    pub fn new(supervisor: Arc<Supervisor>, config: TransferConfig) -> Self {
        Self { supervisor, config }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub async fn transfer(&self, request: TransferRequest) -> Result<TransferReport, TransferError> {
        // Nothing is staged or spawned until the request is known to be valid.
        request.params.validate()?;
        let file_name = staged_file_name(&request.file_name)?;

        match tokio::fs::metadata(&self.config.sender_bin).await {
            Ok(meta) if meta.is_file() => {}
            _ => return Err(TransferError::SenderMissing(self.config.sender_bin.clone())),
        }

        self.ensure_running().await?;

        let staging = StagingDir::create(&self.config.staging_root).await?;
        let source = staging.stage(file_name, &request.payload).await?;
        let byte_count = request.payload.len() as u64;
        let deadline = self.config.deadline.deadline_for(byte_count);
        debug!(
            file = %source.display(),
            bytes = byte_count,
            deadline_secs = deadline.as_secs(),
            "Payload staged"
        );

        // The receiver may have died while we were staging.
        let Some(port) = self.supervisor.live_port() else {
            return Err(TransferError::SessionLost);
        };

        let params = request.params;
        let mut cmd = Command::new(&self.config.sender_bin);
        cmd.arg("--host")
            .arg(&request.host)
            .arg("--port")
            .arg(port.to_string())
            .arg("--file")
            .arg(&source)
            .arg("--chunk")
            .arg(params.chunk_size.to_string())
            .arg("--window")
            .arg(params.window_size.to_string())
            .arg("--timeout")
            .arg(params.timeout_ms.to_string())
            .arg("--max-retries")
            .arg(params.max_retries.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(
            host = %request.host,
            port,
            file = file_name,
            bytes = byte_count,
            chunk = params.chunk_size,
            window = params.window_size,
            "Starting transfer"
        );
        let started = Instant::now();
        // On expiry the output future is dropped, which kills the sender.
        let output = match tokio::time::timeout(deadline, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TransferError::SenderMissing(self.config.sender_bin.clone()));
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                warn!(file = file_name, deadline_secs = deadline.as_secs(), "Transfer timed out");
                return Err(TransferError::Timeout(deadline));
            }
        };
        let duration = started.elapsed();

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let diagnostics = if stderr.is_empty() {
                format!("sender exited with {}", output.status)
            } else {
                stderr
            };
            warn!(file = file_name, status = %output.status, "Transfer failed: {}", diagnostics);
            return Err(TransferError::SenderFailure(diagnostics));
        }

        let report = TransferReport {
            file_name: file_name.to_string(),
            host: request.host.clone(),
            port,
            byte_count,
            duration,
        };
        info!(
            file = file_name,
            bytes = byte_count,
            duration_ms = report.duration_ms(),
            "Transfer complete ({:.1} KB/s)",
            report.throughput_kbs()
        );

        // Give the receiver time to finish writing before anyone lists or downloads.
        tokio::time::sleep(self.config.post_transfer_settle).await;
        Ok(report)
    }

    /// Make sure a receiver is up, starting one at most once for this request.
    async fn ensure_running(&self) -> Result<u16, TransferError> {
        if let Some(port) = self.supervisor.live_port() {
            return Ok(port);
        }
        info!(
            port = self.config.default_port,
            "Receiver not running, starting it for transfer"
        );
        // Concurrent callers queue on the lifecycle lock and share one receiver.
        self.supervisor
            .ensure_started(self.config.default_port, &self.config.default_output_dir)
            .await
            .map_err(TransferError::NotRunning)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_chunk(chunk_size: i64) -> TransferParams {
        TransferParams {
            chunk_size,
            ..TransferParams::default()
        }
    }

    #[test]
    fn test_chunk_size_bounds() {
        for bad in [63, 8193, 0, -1] {
            let err = with_chunk(bad).validate().unwrap_err();
            assert!(matches!(err, TransferError::OutOfRange { field: "chunk_size", .. }));
            assert!(err.is_validation());
        }
        for good in [64, 1024, 8192] {
            assert!(with_chunk(good).validate().is_ok());
        }
    }

    #[test]
    fn test_each_field_reported() {
        let cases = [
            (TransferParams { window_size: 0, ..Default::default() }, "window_size"),
            (TransferParams { window_size: 33, ..Default::default() }, "window_size"),
            (TransferParams { timeout_ms: 99, ..Default::default() }, "timeout"),
            (TransferParams { timeout_ms: 5001, ..Default::default() }, "timeout"),
            (TransferParams { max_retries: 0, ..Default::default() }, "max_retries"),
            (TransferParams { max_retries: 11, ..Default::default() }, "max_retries"),
        ];
        for (params, expected) in cases {
            match params.validate() {
                Err(TransferError::OutOfRange { field, .. }) => assert_eq!(field, expected),
                other => panic!("expected {} rejection, got {:?}", expected, other),
            }
        }
    }

    #[test]
    fn test_out_of_range_message() {
        let err = with_chunk(63).validate().unwrap_err();
        assert_eq!(err.to_string(), "Invalid chunk_size: 63. Must be between 64 and 8192");
    }

    #[test]
    fn test_staged_file_name() {
        assert_eq!(staged_file_name("report.txt").unwrap(), "report.txt");
        assert_eq!(staged_file_name("my file (1).tar.gz").unwrap(), "my file (1).tar.gz");
        assert_eq!(staged_file_name("C:\\Users\\me\\data.bin").unwrap(), "data.bin");
        assert_eq!(staged_file_name("../../etc/passwd").unwrap(), "passwd");
        for bad in ["", "   ", "dir/", "..", "a/.."] {
            assert!(matches!(
                staged_file_name(bad),
                Err(TransferError::Malformed { field: "file" })
            ));
        }
    }

    #[test]
    fn test_throughput() {
        let report = TransferReport {
            file_name: "x".into(),
            host: "127.0.0.1".into(),
            port: 9000,
            byte_count: 2048,
            duration: Duration::from_secs(2),
        };
        assert_eq!(report.duration_ms(), 2000);
        assert!((report.throughput_kbs() - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_staging_dir_removed_on_drop() {
        let staging = StagingDir::create(&std::env::temp_dir()).await.unwrap();
        let path = staging.stage("payload.bin", b"abc").await.unwrap();
        let dir = staging.path.clone();
        assert_eq!(path.file_name().unwrap(), "payload.bin");
        assert_eq!(std::fs::read(&path).unwrap(), b"abc");
        drop(staging);
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_validation_precedes_everything() {
        // Neither executable exists: a validation error must still win.
        let supervisor = Arc::new(Supervisor::new(crate::config::SupervisorConfig {
            receiver_bin: PathBuf::from("/nonexistent/ferry/receiver"),
            ..Default::default()
        }));
        let coordinator = TransferCoordinator::new(
            supervisor.clone(),
            TransferConfig {
                sender_bin: PathBuf::from("/nonexistent/ferry/sender"),
                ..Default::default()
            },
        );
        let err = coordinator
            .transfer(TransferRequest {
                host: "127.0.0.1".into(),
                file_name: "report.txt".into(),
                payload: Bytes::from_static(b"hello"),
                params: with_chunk(8193),
            })
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(supervisor.status().state, crate::supervisor::SessionState::Stopped);
    }
}

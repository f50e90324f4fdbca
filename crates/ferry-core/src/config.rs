use std::path::PathBuf;
use std::time::Duration;

use crate::logbuf::LOG_CAPACITY;

/// Receiver supervision settings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Receiver executable, invoked as `<bin> --port <P> --out <dir>`.
    pub receiver_bin: PathBuf,
    /// How long a fresh receiver must stay up before it counts as bound.
    /// The receiver has no readiness signal, so this is the only way to tell.
    pub settle_interval: Duration,
    /// Consecutive ports tried when the receiver reports address-in-use.
    pub max_port_attempts: u16,
    pub graceful_timeout: Duration,
    pub kill_timeout: Duration,
    pub log_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            receiver_bin: PathBuf::from(format!("./build/bin/server{}", std::env::consts::EXE_SUFFIX)),
            settle_interval: Duration::from_secs(3),
            max_port_attempts: 10,
            graceful_timeout: Duration::from_secs(10),
            kill_timeout: Duration::from_secs(5),
            log_capacity: LOG_CAPACITY,
        }
    }
}

/// Wall-clock budget for a sender run: `max(floor, MB * per_mb + base)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeadlinePolicy {
    pub floor: Duration,
    pub per_mb: Duration,
    pub base: Duration,
}

impl Default for DeadlinePolicy {
    fn default() -> Self {
        Self {
            floor: Duration::from_secs(300),
            per_mb: Duration::from_secs(60),
            base: Duration::from_secs(120),
        }
    }
}

impl DeadlinePolicy {
    pub fn deadline_for(&self, byte_count: u64) -> Duration {
        let mb = byte_count as f64 / (1024.0 * 1024.0);
        let scaled = mb * self.per_mb.as_secs_f64() + self.base.as_secs_f64();
        // Whole seconds when the policy is in whole seconds; sub-second policies keep millis.
        let scaled = if self.per_mb.subsec_nanos() == 0 && self.base.subsec_nanos() == 0 {
            Duration::from_secs(scaled as u64)
        } else {
            Duration::from_millis((scaled * 1000.0) as u64)
        };
        scaled.max(self.floor)
    }
}

/// Sender invocation settings.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Sender executable.
    pub sender_bin: PathBuf,
    /// Port used when a transfer has to bring the receiver up itself.
    pub default_port: u16,
    /// Output directory used for that implicit start.
    pub default_output_dir: PathBuf,
    pub deadline: DeadlinePolicy,
    /// Pause after a successful run so the receiver can finish writing the artifact.
    pub post_transfer_settle: Duration,
    /// Parent directory for per-transfer staging directories.
    pub staging_root: PathBuf,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            sender_bin: PathBuf::from(format!("./build/bin/client{}", std::env::consts::EXE_SUFFIX)),
            default_port: 9000,
            default_output_dir: PathBuf::from("./server_data"),
            deadline: DeadlinePolicy::default(),
            post_transfer_settle: Duration::from_secs(2),
            staging_root: std::env::temp_dir(),
        }
    }
}

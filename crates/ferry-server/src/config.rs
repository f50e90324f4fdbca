use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use ferry_core::{DeadlinePolicy, SupervisorConfig, TransferConfig};

/// Controller settings, read from `FERRY_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub bin_dir: PathBuf,
    pub receiver_bin: PathBuf,
    pub sender_bin: PathBuf,
    /// Artifacts directory: default receiver output and the one the file routes serve.
    pub data_dir: PathBuf,
    /// Receiver port used when a start or transfer request doesn't name one.
    pub receiver_port: u16,
    pub settle_interval: Duration,
    pub post_transfer_settle: Duration,
    pub max_upload_bytes: usize,
    pub ui_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        let bin_dir = default_bin_dir();
        Self {
            host: "0.0.0.0".into(),
            port: 5000,
            receiver_bin: bin_dir.join(exe("server")),
            sender_bin: bin_dir.join(exe("client")),
            bin_dir,
            data_dir: PathBuf::from("./server_data"),
            receiver_port: 9000,
            settle_interval: Duration::from_secs(3),
            post_transfer_settle: Duration::from_secs(2),
            max_upload_bytes: 16 * 1024 * 1024,
            ui_dir: None,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let host = std::env::var("FERRY_HOST").unwrap_or(defaults.host);
        let port: u16 = std::env::var("FERRY_PORT")
            .unwrap_or_else(|_| "5000".into())
            .parse()
            .context("FERRY_PORT")?;
        let bin_dir: PathBuf = std::env::var("FERRY_BIN_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.bin_dir);
        let receiver_bin = std::env::var("FERRY_RECEIVER_BIN")
            .map(PathBuf::from)
            .unwrap_or_else(|_| bin_dir.join(exe("server")));
        let sender_bin = std::env::var("FERRY_SENDER_BIN")
            .map(PathBuf::from)
            .unwrap_or_else(|_| bin_dir.join(exe("client")));
        let data_dir: PathBuf = std::env::var("FERRY_DATA_DIR")
            .unwrap_or_else(|_| "./server_data".into())
            .into();
        let receiver_port: u16 = std::env::var("FERRY_RECEIVER_PORT")
            .unwrap_or_else(|_| "9000".into())
            .parse()
            .context("FERRY_RECEIVER_PORT")?;
        let settle_ms: u64 = std::env::var("FERRY_SETTLE_MS")
            .unwrap_or_else(|_| "3000".into())
            .parse()
            .context("FERRY_SETTLE_MS")?;
        let post_settle_ms: u64 = std::env::var("FERRY_POST_TRANSFER_SETTLE_MS")
            .unwrap_or_else(|_| "2000".into())
            .parse()
            .context("FERRY_POST_TRANSFER_SETTLE_MS")?;
        let max_upload_mb: usize = std::env::var("FERRY_MAX_UPLOAD_MB")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(16);
        let ui_dir = std::env::var("FERRY_UI_DIR")
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        Ok(Self {
            host,
            port,
            bin_dir,
            receiver_bin,
            sender_bin,
            data_dir,
            receiver_port,
            settle_interval: Duration::from_millis(settle_ms),
            post_transfer_settle: Duration::from_millis(post_settle_ms),
            max_upload_bytes: max_upload_mb * 1024 * 1024,
            ui_dir,
        })
    }

    pub fn supervisor(&self) -> SupervisorConfig {
        SupervisorConfig {
            receiver_bin: self.receiver_bin.clone(),
            settle_interval: self.settle_interval,
            ..SupervisorConfig::default()
        }
    }

    pub fn transfer(&self) -> TransferConfig {
        TransferConfig {
            sender_bin: self.sender_bin.clone(),
            default_port: self.receiver_port,
            default_output_dir: self.data_dir.clone(),
            deadline: DeadlinePolicy::default(),
            post_transfer_settle: self.post_transfer_settle,
            staging_root: std::env::temp_dir(),
        }
    }
}

/// Container images ship the executables in /app; local builds use build/bin.
fn default_bin_dir() -> PathBuf {
    let container = Path::new("/app");
    if container.join(exe("server")).exists() {
        container.to_path_buf()
    } else {
        PathBuf::from("./build/bin")
    }
}

fn exe(name: &str) -> String {
    format!("{}{}", name, std::env::consts::EXE_SUFFIX)
}

//! Scratch directories and stand-in receiver/sender executables.

#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ferry_core::{DeadlinePolicy, SupervisorConfig, TransferConfig};

/// Receiver stand-in: refuses ports that have a marker file under `busy/`,
/// otherwise announces itself and sleeps until signalled.
pub const FAKE_RECEIVER: &str = r#"#!/bin/sh
PORT=""
OUT=""
while [ $# -gt 0 ]; do
  case "$1" in
    --port) PORT="$2"; shift 2 ;;
    --out) OUT="$2"; shift 2 ;;
    *) shift ;;
  esac
done
echo "$PORT" >> "@ROOT@/attempts"
if [ -e "@ROOT@/busy/$PORT" ]; then
  echo "bind failed: Address already in use" >&2
  exit 1
fi
echo "Server listening on UDP $PORT"
exec sleep 300
"#;

/// Sender stand-in: copies the file into the artifacts directory using the
/// receiver's naming scheme and records its arguments.
pub const FAKE_SENDER: &str = r#"#!/bin/sh
FILE=""
for arg in "$@"; do
  if [ "$prev" = "--file" ]; then FILE="$arg"; fi
  prev="$arg"
done
name=$(basename "$FILE")
echo "$@" > "@ROOT@/args_$name"
cp "$FILE" "@ROOT@/out/${name}_1700000000_127.0.0.1"
echo "sent $name"
"#;

pub struct Sandbox {
    pub root: PathBuf,
}

impl Sandbox {
    pub fn new(tag: &str) -> Self {
        let root = std::env::temp_dir().join(format!("ferry_it_{}_{}", tag, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(root.join("busy")).unwrap();
        std::fs::create_dir_all(root.join("out")).unwrap();
        std::fs::create_dir_all(root.join("staging")).unwrap();
        Self { root }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn out_dir(&self) -> PathBuf {
        self.path("out")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.path("staging")
    }

    /// Write an executable script; `@ROOT@` expands to the sandbox root.
    pub fn script(&self, name: &str, body: &str) -> PathBuf {
        let path = self.path(name);
        let body = body.replace("@ROOT@", &self.root.display().to_string());
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    pub fn mark_busy(&self, port: u16) {
        std::fs::write(self.path("busy").join(port.to_string()), b"").unwrap();
    }

    /// Ports the fake receiver was launched with, in order.
    pub fn attempts(&self) -> Vec<u16> {
        std::fs::read_to_string(self.path("attempts"))
            .unwrap_or_default()
            .lines()
            .filter_map(|l| l.trim().parse().ok())
            .collect()
    }

    pub fn staging_entries(&self) -> usize {
        std::fs::read_dir(self.staging_dir()).unwrap().count()
    }

    pub fn supervisor_config(&self, receiver_bin: &Path) -> SupervisorConfig {
        SupervisorConfig {
            receiver_bin: receiver_bin.to_path_buf(),
            settle_interval: Duration::from_millis(300),
            graceful_timeout: Duration::from_secs(2),
            kill_timeout: Duration::from_secs(2),
            ..SupervisorConfig::default()
        }
    }

    pub fn transfer_config(&self, sender_bin: &Path, default_port: u16) -> TransferConfig {
        TransferConfig {
            sender_bin: sender_bin.to_path_buf(),
            default_port,
            default_output_dir: self.out_dir(),
            deadline: DeadlinePolicy::default(),
            post_transfer_settle: Duration::from_millis(10),
            staging_root: self.staging_dir(),
        }
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

/// Poll `check` every 50 ms until it holds or `timeout` passes.
pub async fn eventually<F: FnMut() -> bool>(timeout: Duration, mut check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

pub fn pid_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

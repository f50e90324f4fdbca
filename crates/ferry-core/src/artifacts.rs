use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::ArtifactError;

/// Parsed artifact file name, receiver naming contract v1:
/// `<base>_<unix-timestamp>_<source>`.
///
/// The receiver appends the arrival time and the sender's address to the
/// original file name. If the receiver ever changes that format, this type is
/// the one place that must follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArtifactName<'a> {
    pub base: &'a str,
    pub timestamp: u64,
    pub source: &'a str,
}

impl<'a> ArtifactName<'a> {
    pub const CONTRACT_VERSION: u32 = 1;
    pub const SEPARATOR: char = '_';

    /// Split a stored name into its parts; `None` if it does not carry the suffix.
    pub fn parse(stored: &'a str) -> Option<Self> {
        let mut parts = stored.rsplitn(3, Self::SEPARATOR);
        let source = parts.next()?;
        let timestamp = parts.next()?.parse::<u64>().ok()?;
        let base = parts.next()?;
        if base.is_empty() {
            return None;
        }
        Some(Self { base, timestamp, source })
    }

    /// Base name of a stored file, or the stored name itself when it has no suffix.
    pub fn base_of(stored: &str) -> &str {
        ArtifactName::parse(stored).map_or(stored, |n| n.base)
    }
}

/// A file the receiver left in its output directory.
#[derive(Debug, Clone, Serialize)]
pub struct Artifact {
    #[serde(rename = "name")]
    pub stored_name: String,
    pub base_name: String,
    #[serde(rename = "size")]
    pub size_bytes: u64,
    #[serde(rename = "modified")]
    pub modified_at: DateTime<Utc>,
    #[serde(rename = "path")]
    pub full_path: PathBuf,
}

impl Artifact {
    fn from_metadata(stored_name: String, full_path: PathBuf, meta: &std::fs::Metadata) -> Self {
        let modified_at = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        Self {
            base_name: ArtifactName::base_of(&stored_name).to_string(),
            stored_name,
            size_bytes: meta.len(),
            modified_at,
            full_path,
        }
    }
}

/// View over the receiver's output directory.
///
/// Holds no state of its own: the receiver creates files at any moment, so
/// every lookup goes back to the filesystem and tolerates entries vanishing
/// between enumeration and use.
pub struct ArtifactRegistry {
    dir: PathBuf,
}

impl ArtifactRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// All regular files, most recently modified first.
    pub async fn list(&self) -> Result<Vec<Artifact>, ArtifactError> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Artifact directory {} does not exist", self.dir.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let mut artifacts = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            // Files can disappear between read_dir and stat
            let meta = match fs::metadata(entry.path()).await {
                Ok(meta) if meta.is_file() => meta,
                Ok(_) => continue,
                Err(e) => {
                    debug!("Skipping {}: {}", name, e);
                    continue;
                }
            };
            artifacts.push(Artifact::from_metadata(name, entry.path(), &meta));
        }

        // Stable: equal mtimes keep enumeration order
        artifacts.sort_by(|a, b| b.modified_at.cmp(&a.modified_at));
        Ok(artifacts)
    }

    /// Find an artifact by its stored name, or by the base name it was sent under.
    pub async fn resolve(&self, name: &str) -> Result<Artifact, ArtifactError> {
        let name = name.trim();
        if !is_plain_name(name) {
            return Err(ArtifactError::NotFound(name.to_string()));
        }

        let exact = self.dir.join(name);
        if let Ok(meta) = fs::metadata(&exact).await {
            if meta.is_file() {
                return Ok(Artifact::from_metadata(name.to_string(), exact, &meta));
            }
        }

        let prefix = format!("{}{}", name, ArtifactName::SEPARATOR);
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ArtifactError::NotFound(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let Some(stored) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if !stored.starts_with(&prefix) {
                continue;
            }
            if let Ok(meta) = fs::metadata(entry.path()).await {
                if meta.is_file() {
                    debug!("Resolved {} to {}", name, stored);
                    return Ok(Artifact::from_metadata(stored, entry.path(), &meta));
                }
            }
        }

        Err(ArtifactError::NotFound(name.to_string()))
    }

    /// Open an artifact for streaming. Returns the resolved artifact alongside the handle.
    pub async fn open(&self, name: &str) -> Result<(Artifact, fs::File), ArtifactError> {
        let artifact = self.resolve(name).await?;
        match fs::File::open(&artifact.full_path).await {
            Ok(file) => Ok((artifact, file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ArtifactError::NotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn delete(&self, name: &str) -> Result<Artifact, ArtifactError> {
        let artifact = self.resolve(name).await?;
        match fs::remove_file(&artifact.full_path).await {
            Ok(()) => {
                info!("Deleted artifact {}", artifact.stored_name);
                Ok(artifact)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ArtifactError::NotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove every zero-byte file. Returns how many were removed.
    pub async fn purge_empty(&self) -> Result<usize, ArtifactError> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let meta = match fs::metadata(&path).await {
                Ok(meta) => meta,
                Err(_) => continue,
            };
            if !meta.is_file() || meta.len() != 0 {
                continue;
            }
            match fs::remove_file(&path).await {
                Ok(()) => {
                    removed += 1;
                    info!("Cleaned up empty file: {}", entry.file_name().to_string_lossy());
                }
                Err(e) => warn!("Failed to remove empty file {}: {}", path.display(), e),
            }
        }
        Ok(removed)
    }
}

/// A single path component: no separators, no `.`/`..`.
fn is_plain_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
}

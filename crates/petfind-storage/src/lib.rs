//! File-backed snapshot source: one batched read of posts or joined rows per query.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use petfind_core::{JoinedRow, LocationParts, Post};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "petfind-storage";

#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    pub path: PathBuf,
}

impl SnapshotConfig {
    pub fn from_env() -> Self {
        Self {
            path: std::env::var("PETFIND_SNAPSHOT_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./fixtures/posts.json")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotFormat {
    Json,
    Yaml,
}

impl SnapshotFormat {
    pub fn from_path(path: &Path) -> Result<Self, SnapshotError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        match ext.as_str() {
            "json" => Ok(SnapshotFormat::Json),
            "yaml" | "yml" => Ok(SnapshotFormat::Yaml),
            _ => Err(SnapshotError::UnsupportedFormat(path.display().to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("unsupported snapshot file `{0}` (expected .json, .yaml or .yml)")]
    UnsupportedFormat(String),
    #[error("malformed JSON snapshot: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed YAML snapshot: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Snapshot body: pre-aggregated posts, raw join rows, or both.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SnapshotContent {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub posts: Vec<Post>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rows: Vec<JoinedRow>,
    /// Posts whose stored location had only one of lat/lng; set by `parse_snapshot`.
    #[serde(skip)]
    pub partial_location_posts: usize,
}

impl SnapshotContent {
    pub fn is_empty(&self) -> bool {
        self.posts.is_empty() && self.rows.is_empty()
    }

    /// Rows with exactly one coordinate column set; these load as unlocated posts.
    pub fn partial_location_rows(&self) -> usize {
        self.rows
            .iter()
            .filter(|r| r.latitude.is_some() != r.longitude.is_some())
            .count()
    }

    /// Posts and rows that load without a location because one coordinate is missing.
    pub fn partial_locations(&self) -> usize {
        self.partial_location_posts + self.partial_location_rows()
    }
}

#[derive(Deserialize)]
struct LocationScan {
    #[serde(default)]
    posts: Vec<PostLocationScan>,
}

#[derive(Deserialize)]
struct PostLocationScan {
    #[serde(default)]
    location: Option<LocationParts>,
}

impl LocationScan {
    fn partial_posts(&self) -> usize {
        self.posts
            .iter()
            .filter(|p| p.location.is_some_and(|l| l.is_partial()))
            .count()
    }
}

pub fn parse_snapshot(bytes: &[u8], format: SnapshotFormat) -> Result<SnapshotContent, SnapshotError> {
    let (mut content, scan): (SnapshotContent, LocationScan) = match format {
        SnapshotFormat::Json => (serde_json::from_slice(bytes)?, serde_json::from_slice(bytes)?),
        SnapshotFormat::Yaml => (serde_yaml::from_slice(bytes)?, serde_yaml::from_slice(bytes)?),
    };
    content.partial_location_posts = scan.partial_posts();
    Ok(content)
}

#[derive(Debug, Clone)]
pub struct LoadedSnapshot {
    pub path: PathBuf,
    pub fingerprint: String,
    pub loaded_at: DateTime<Utc>,
    pub byte_size: usize,
    pub content: SnapshotContent,
}

#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub path: PathBuf,
    pub fingerprint: String,
    pub byte_size: usize,
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    pub async fn load(&self, path: impl AsRef<Path>) -> anyhow::Result<LoadedSnapshot> {
        let path = self.resolve(path.as_ref());
        let span = info_span!("snapshot_load", path = %path.display());
        Self::load_resolved(path).instrument(span).await
    }

    async fn load_resolved(path: PathBuf) -> anyhow::Result<LoadedSnapshot> {
        let format = SnapshotFormat::from_path(&path)?;
        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("reading snapshot {}", path.display()))?;
        let content = parse_snapshot(&bytes, format)
            .with_context(|| format!("parsing snapshot {}", path.display()))?;

        let partial = content.partial_locations();
        if partial > 0 {
            warn!(
                posts = content.partial_location_posts,
                rows = content.partial_location_rows(),
                "entries with a single coordinate load without location"
            );
        }

        let fingerprint = Self::sha256_hex(&bytes);
        info!(
            posts = content.posts.len(),
            rows = content.rows.len(),
            %fingerprint,
            "loaded snapshot"
        );
        Ok(LoadedSnapshot {
            path,
            fingerprint,
            loaded_at: Utc::now(),
            byte_size: bytes.len(),
            content,
        })
    }

    /// Writes pretty JSON to a temp file in the target directory, then renames it into place.
    pub async fn save(
        &self,
        path: impl AsRef<Path>,
        content: &SnapshotContent,
    ) -> anyhow::Result<StoredSnapshot> {
        let path = self.resolve(path.as_ref());
        let bytes = serde_json::to_vec_pretty(content).context("serializing snapshot")?;
        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating snapshot directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp snapshot file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp snapshot file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp snapshot file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp snapshot {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }

        Ok(StoredSnapshot {
            fingerprint: Self::sha256_hex(&bytes),
            byte_size: bytes.len(),
            path,
        })
    }
}

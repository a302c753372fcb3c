use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use pricewatch_core::{FetchStrategy, ItemId};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct PageSnapshot {
    pub sha256: String,
    /// Relative to the store root.
    pub path: PathBuf,
    pub bytes: usize,
    /// An identical page was already on disk.
    pub reused: bool,
}

/// Content-addressed archive of raw pages from blocked fetches, laid out as
/// `<YYYYMMDD>/<item id>/<strategy>-<sha256>.html`.
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

    pub fn snapshot_path(
        captured_at: DateTime<Utc>,
        item_id: &ItemId,
        strategy: FetchStrategy,
        sha256: &str,
    ) -> PathBuf {
        PathBuf::from(captured_at.format("%Y%m%d").to_string())
            .join(item_id.as_str())
            .join(format!("{strategy}-{sha256}.html"))
    }

    /// Write the page once; later identical pages for the same day, item and
    /// tier resolve to the existing file. Writes go through a temp file and rename.
    pub async fn save_page(
        &self,
        captured_at: DateTime<Utc>,
        item_id: &ItemId,
        strategy: FetchStrategy,
        html: &str,
    ) -> anyhow::Result<PageSnapshot> {
        let sha256 = sha256_hex(html.as_bytes());
        let path = Self::snapshot_path(captured_at, item_id, strategy, &sha256);
        let target = self.root.join(&path);
        let dir = target.parent().unwrap_or(self.root.as_path()).to_path_buf();

        let snapshot = |reused| PageSnapshot {
            sha256: sha256.clone(),
            path: path.clone(),
            bytes: html.len(),
            reused,
        };

        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating snapshot directory {}", dir.display()))?;
        if fs::try_exists(&target).await.unwrap_or(false) {
            return Ok(snapshot(true));
        }

        let temp = dir.join(format!(".{}.partial", Uuid::new_v4()));
        let mut file = fs::File::create(&temp)
            .await
            .with_context(|| format!("creating {}", temp.display()))?;
        file.write_all(html.as_bytes())
            .await
            .with_context(|| format!("writing {}", temp.display()))?;
        file.sync_all().await.context("syncing snapshot")?;
        drop(file);

        if let Err(err) = fs::rename(&temp, &target).await {
            let _ = fs::remove_file(&temp).await;
            if fs::try_exists(&target).await.unwrap_or(false) {
                return Ok(snapshot(true));
            }
            return Err(err).with_context(|| format!("moving snapshot into {}", target.display()));
        }
        Ok(snapshot(false))
    }
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

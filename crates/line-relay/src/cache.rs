// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Disk overflow cache for batches that could not be delivered.
//!
//! Every entry is one JSON document named by the hex SHA-256 of its contents, so storing
//! the same batch twice yields one file. Entries are written to a temporary name and
//! renamed into place, and listings skip temporary names, so the replay loop never sees a
//! partially written entry.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, warn};

use crate::batch::CachedBatch;
use crate::errors::CacheError;

const TEMP_SUFFIX: &str = ".tmp";
/// Subdirectory holding entries whose destination is no longer configured.
pub const ORPHANED_DIR: &str = "orphaned";

#[derive(Debug)]
pub struct OverflowCache {
    directory: PathBuf,
    sequence: AtomicU64,
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> CacheError + '_ {
    move |source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn is_temporary(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.ends_with(TEMP_SUFFIX))
}

impl OverflowCache {
    /// Opens the cache directory, creating it if needed. Temporary files left behind by an
    /// interrupted write are removed.
    pub async fn open(directory: &Path) -> Result<Self, CacheError> {
        fs::create_dir_all(directory)
            .await
            .map_err(io_error(directory))?;

        let mut entries = fs::read_dir(directory).await.map_err(io_error(directory))?;
        while let Some(entry) = entries.next_entry().await.map_err(io_error(directory))? {
            let path = entry.path();
            if is_temporary(&path) {
                debug!("Removing incomplete cache entry {}", path.display());
                if let Err(e) = fs::remove_file(&path).await {
                    warn!("Failed to remove {}: {e}", path.display());
                }
            }
        }

        Ok(Self {
            directory: directory.to_path_buf(),
            sequence: AtomicU64::new(0),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Content key of a serialized entry.
    pub fn key(contents: &[u8]) -> String {
        hex::encode(Sha256::digest(contents))
    }

    /// Persists `batch` and returns its key.
    pub async fn store(&self, batch: &CachedBatch) -> Result<String, CacheError> {
        let contents = serde_json::to_vec(batch).map_err(CacheError::Serialize)?;
        let key = Self::key(&contents);
        let path = self.directory.join(&key);
        if fs::try_exists(&path).await.unwrap_or(false) {
            debug!("Batch {key} is already cached");
            return Ok(key);
        }

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let temp = self
            .directory
            .join(format!("{key}.{sequence}{TEMP_SUFFIX}"));
        fs::write(&temp, &contents).await.map_err(io_error(&temp))?;
        if let Err(source) = fs::rename(&temp, &path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(CacheError::Io { path, source });
        }
        Ok(key)
    }

    /// Up to `limit` complete entries, in directory order.
    pub async fn entries(&self, limit: usize) -> Result<Vec<PathBuf>, CacheError> {
        let mut paths = Vec::new();
        let mut entries = fs::read_dir(&self.directory)
            .await
            .map_err(io_error(&self.directory))?;
        while paths.len() < limit {
            let Some(entry) = entries
                .next_entry()
                .await
                .map_err(io_error(&self.directory))?
            else {
                break;
            };
            let path = entry.path();
            if is_temporary(&path) {
                continue;
            }
            match entry.file_type().await {
                Ok(file_type) if file_type.is_file() => paths.push(path),
                _ => continue,
            }
        }
        Ok(paths)
    }

    pub async fn load(&self, path: &Path) -> Result<CachedBatch, CacheError> {
        let contents = fs::read(path).await.map_err(io_error(path))?;
        serde_json::from_slice(&contents).map_err(|source| CacheError::Deserialize {
            path: path.to_path_buf(),
            source,
        })
    }

    pub async fn remove(&self, path: &Path) -> Result<(), CacheError> {
        fs::remove_file(path).await.map_err(io_error(path))
    }

    /// Moves an entry out of the replay listing into the `orphaned` subdirectory and
    /// returns its new path. Moving it back into the cache directory makes it replayable.
    pub async fn set_aside(&self, path: &Path) -> Result<PathBuf, CacheError> {
        let orphaned = self.directory.join(ORPHANED_DIR);
        fs::create_dir_all(&orphaned)
            .await
            .map_err(io_error(&orphaned))?;
        let target = match path.file_name() {
            Some(name) => orphaned.join(name),
            None => return Err(io_error(path)(std::io::ErrorKind::InvalidInput.into())),
        };
        fs::rename(path, &target).await.map_err(io_error(path))?;
        Ok(target)
    }
}

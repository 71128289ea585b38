// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! The contract this crate requires from durable storage, and a
//! directory-backed implementation of it.

use crate::errors::{InternalError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument, warn};

/// One stored record, as returned by [`PersistenceHandle::read_all`].
#[derive(Debug)]
pub struct DataDescriptor {
    /// Directory the record lives in.
    pub directory: String,
    /// Name of the record within its directory.
    pub name: String,
    /// The stored bytes, or why they could not be read.
    pub content: Result<Vec<u8>>,
}

/// Durable storage of named records grouped into directories.
#[async_trait]
pub trait PersistenceHandle: Send + Sync {
    /// Durably store `data` as `directory/name`. Returns only once the
    /// record is complete on the medium.
    async fn save(&self, data: &[u8], directory: &str, name: &str) -> Result<()>;

    /// Every stored record. A record that cannot be read is returned with an
    /// error `content` rather than failing the whole call.
    async fn read_all(&self) -> Result<Vec<DataDescriptor>>;
}

/// Stores each record as a file under `root/directory/name`.
///
/// Files are written next to their final location and renamed into place,
/// so a crash mid-write never leaves a truncated record behind.
#[derive(Debug, Clone)]
pub struct DiskPersistence {
    root: PathBuf,
}

const TEMP_PREFIX: &str = ".tmp-";

impl DiskPersistence {
    /// Use `root` as the storage directory, creating it if needed.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| io_error("create", &root, e))?;
        Ok(Self { root })
    }

    /// The storage directory.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn io_error(action: &str, path: &Path, error: std::io::Error) -> InternalError {
    InternalError::Persistence(format!("failed to {action} {}: {error}", path.display()))
}

fn check_component(component: &str) -> Result<()> {
    if component.is_empty()
        || component.starts_with('.')
        || component.contains(['/', '\\'])
    {
        return bail!("invalid storage path component {component:?}");
    }
    Ok(())
}

#[async_trait]
impl PersistenceHandle for DiskPersistence {
    #[instrument(skip(self, data), err(Debug))]
    async fn save(&self, data: &[u8], directory: &str, name: &str) -> Result<()> {
        check_component(directory)?;
        check_component(name)?;

        let dir = self.root.join(directory);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error("create", &dir, e))?;

        let temp = dir.join(format!("{TEMP_PREFIX}{name}"));
        let target = dir.join(name);
        tokio::fs::write(&temp, data)
            .await
            .map_err(|e| io_error("write", &temp, e))?;
        let file = tokio::fs::File::open(&temp)
            .await
            .map_err(|e| io_error("open", &temp, e))?;
        file.sync_all()
            .await
            .map_err(|e| io_error("sync", &temp, e))?;
        tokio::fs::rename(&temp, &target)
            .await
            .map_err(|e| io_error("rename", &temp, e))?;
        debug!("Stored {} bytes at {}", data.len(), target.display());
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<DataDescriptor>> {
        let mut descriptors = Vec::new();
        let mut directories = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| io_error("list", &self.root, e))?;

        while let Some(entry) = directories
            .next_entry()
            .await
            .map_err(|e| io_error("list", &self.root, e))?
        {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(directory) = entry.file_name().to_str().map(str::to_owned) else {
                warn!("Skipping non UTF-8 directory {}", path.display());
                continue;
            };

            let mut files = match tokio::fs::read_dir(&path).await {
                Ok(files) => files,
                Err(e) => {
                    warn!("Failed to list {}: {e}", path.display());
                    continue;
                }
            };
            loop {
                let file = match files.next_entry().await {
                    Ok(Some(file)) => file,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Failed to list {}: {e}", path.display());
                        break;
                    }
                };
                let Some(name) = file.file_name().to_str().map(str::to_owned) else {
                    continue;
                };
                if name.starts_with('.') {
                    continue;
                }
                let file_path = file.path();
                let content = tokio::fs::read(&file_path)
                    .await
                    .map_err(|e| io_error("read", &file_path, e));
                descriptors.push(DataDescriptor {
                    directory: directory.clone(),
                    name,
                    content,
                });
            }
        }
        Ok(descriptors)
    }
}

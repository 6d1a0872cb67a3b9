//! Filesystem-backed object store.
//!
//! Attachments land under a root directory using the same
//! `{prefix}/{tenant}/attachments/{uuid}.{ext}` keys an S3-compatible
//! backend would use, so swapping the implementation is a one-line change
//! in the orchestrator.

use std::path::{Path, PathBuf};

use vigia_core::error::AppError;
use vigia_core::traits::ObjectStore;

#[derive(Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn target_for(&self, key: &str) -> Result<PathBuf, AppError> {
        // Keys are service-generated, but reject traversal anyway.
        if key.split('/').any(|part| part == "..") || key.starts_with('/') {
            return Err(AppError::ObjectStoreFailure(format!(
                "refusing suspicious key: {key}"
            )));
        }
        Ok(self.root.join(key))
    }
}

impl ObjectStore for FsObjectStore {
    async fn put_file(&self, local: &Path, key: &str) -> Result<i64, AppError> {
        let target = self.target_for(key)?;

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AppError::ObjectStoreFailure(format!("mkdir {key}: {e}")))?;
        }

        tokio::fs::copy(local, &target)
            .await
            .map_err(|e| AppError::ObjectStoreFailure(format!("store {key}: {e}")))?;

        let size = tokio::fs::metadata(&target)
            .await
            .map_err(|e| AppError::ObjectStoreFailure(format!("stat {key}: {e}")))?
            .len();

        Ok(size as i64)
    }
}

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::layout::{LayoutError, StorageLayout};
use crate::storage::{FsError, StorageRoot};
use crate::store::ExpectedBackupJob;

#[derive(Debug, Error)]
pub enum PromotionError {
    #[error("cannot resolve promotion path: {0}")]
    Layout(#[from] LayoutError),
    #[error("staged artifact missing: {path}")]
    StagedMissing { path: String },
    #[error("not enough space at {path}: need {needed_bytes}, have {available_bytes}")]
    InsufficientDisk {
        path: String,
        needed_bytes: u64,
        available_bytes: u64,
    },
    #[error("promotion copy failed: {0}")]
    Copy(#[from] FsError),
}

/// Copies a validated staged artifact into the permanent tree. Overwrites an
/// earlier promotion of the same name; the staged file stays in place.
#[derive(Debug, Clone)]
pub struct Promoter {
    layout: StorageLayout,
    staging: StorageRoot,
    validated: StorageRoot,
}

impl Promoter {
    pub fn new(layout: StorageLayout, staging: StorageRoot, validated: StorageRoot) -> Self {
        Self {
            layout,
            staging,
            validated,
        }
    }

    pub fn promote(
        &self,
        staged: &Path,
        job: &ExpectedBackupJob,
        staged_file_name: &str,
    ) -> Result<PathBuf, PromotionError> {
        let destination = self.layout.promotion_path(job, staged_file_name)?;

        if !self.staging.exists(staged)? {
            return Err(PromotionError::StagedMissing {
                path: staged.display().to_string(),
            });
        }
        let needed = self.staging.file_size(staged)?;

        let parent = destination
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.layout.validated_root().to_path_buf());
        self.validated.ensure_dir(&parent)?;

        let available = fs2::available_space(&parent).unwrap_or(u64::MAX);
        if available < needed {
            return Err(PromotionError::InsufficientDisk {
                path: parent.display().to_string(),
                needed_bytes: needed,
                available_bytes: available,
            });
        }

        self.validated.copy_in(staged, &destination)?;
        tracing::info!(
            target: "sentinelle",
            event = "artifact_promoted",
            job_id = job.id,
            src = %staged.display(),
            dst = %destination.display(),
        );
        Ok(destination)
    }
}

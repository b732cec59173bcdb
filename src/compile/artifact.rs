use std::{
    io,
    path::{Path, PathBuf},
};

use thiserror::Error;

use crate::compile::models::WorkItemId;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("compiled artifact not found at {0}")]
    Missing(PathBuf),
    #[error("working directory I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// Owns the shared working directory. Concurrent runs never collide because
/// every [`WorkItem`] gets its own file names; there is no locking.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

/// Source and artifact paths for one request.
///
/// Removes its files on drop unless [`ArtifactStore::cleanup`] already ran, so
/// a cancelled or panicking run still leaves the directory clean.
#[derive(Debug)]
pub struct WorkItem {
    pub id: WorkItemId,
    pub source_path: PathBuf,
    pub artifact_path: PathBuf,
    cleaned: bool,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn prepare(&self, source: &str) -> Result<WorkItem, ArtifactError> {
        tokio::fs::create_dir_all(&self.root).await?;

        let id = WorkItemId::generate();
        let item = WorkItem {
            source_path: self.root.join(format!("{id}.cpp")),
            artifact_path: self.root.join(format!("{id}.js")),
            id,
            cleaned: false,
        };
        // On failure `item` drops here and removes any partial write.
        tokio::fs::write(&item.source_path, source.as_bytes()).await?;
        tracing::debug!(work_item = %item.id, "wrote source file");
        Ok(item)
    }

    pub async fn read_artifact(&self, item: &WorkItem) -> Result<String, ArtifactError> {
        match tokio::fs::read(&item.artifact_path).await {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(ArtifactError::Missing(item.artifact_path.clone()))
            }
            Err(err) => Err(ArtifactError::Io(err)),
        }
    }

    /// Removes both files. Missing files are fine; other failures are logged
    /// and swallowed so they never replace the run's real result.
    pub async fn cleanup(&self, item: &mut WorkItem) {
        for path in [&item.source_path, &item.artifact_path] {
            if let Err(err) = tokio::fs::remove_file(path).await {
                if err.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(
                        work_item = %item.id,
                        path = %path.display(),
                        error = %err,
                        "failed to remove temporary file"
                    );
                }
            }
        }
        item.cleaned = true;
    }
}

impl Drop for WorkItem {
    fn drop(&mut self) {
        if self.cleaned {
            return;
        }
        for path in [&self.source_path, &self.artifact_path] {
            let _ = std::fs::remove_file(path);
        }
    }
}

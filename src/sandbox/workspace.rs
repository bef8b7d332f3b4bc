use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

const WORKSPACE_PREFIX: &str = "kodetron-";
const ARTIFACT_NAME: &str = if cfg!(windows) { "main.exe" } else { "main" };

#[derive(thiserror::Error, Debug)]
pub enum WorkspaceError {
    #[error("failed to create workspace under {path}: {source}")]
    Create { path: PathBuf, source: io::Error },
    #[error("failed to write source file {path}: {source}")]
    WriteSource { path: PathBuf, source: io::Error },
    #[error("failed to remove workspace {path}: {source}")]
    Remove { path: PathBuf, source: io::Error },
}

/// Scratch directory owned by exactly one run
///
/// Holds the source file and the compiled artifact. The directory tree is
/// removed either by [`Workspace::release`] or, on any other exit path
/// (early return, panic unwinding), when the value is dropped.
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
    source_path: PathBuf,
    artifact_path: PathBuf,
}

impl Workspace {
    /// Creates a uniquely named directory under `parent`
    pub fn acquire(parent: &Path, source_name: &str) -> Result<Self, WorkspaceError> {
        let dir = tempfile::Builder::new()
            .prefix(WORKSPACE_PREFIX)
            .tempdir_in(parent)
            .map_err(|source| WorkspaceError::Create {
                path: parent.to_path_buf(),
                source,
            })?;

        let source_path = dir.path().join(source_name);
        let artifact_path = dir.path().join(ARTIFACT_NAME);
        log::debug!("Acquired workspace {}", dir.path().display());

        Ok(Self {
            dir,
            source_path,
            artifact_path,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    /// Only meaningful once compilation succeeded
    pub fn artifact_path(&self) -> &Path {
        &self.artifact_path
    }

    /// Writes `text` as the source file, replacing any previous content
    pub async fn write_source(&self, text: &str) -> Result<(), WorkspaceError> {
        tokio::fs::write(&self.source_path, text)
            .await
            .map_err(|source| WorkspaceError::WriteSource {
                path: self.source_path.clone(),
                source,
            })
    }

    /// Recursively removes the workspace
    pub fn release(self) -> Result<(), WorkspaceError> {
        let path = self.dir.path().to_path_buf();
        self.dir
            .close()
            .map_err(|source| WorkspaceError::Remove {
                path: path.clone(),
                source,
            })?;
        log::debug!("Released workspace {}", path.display());
        Ok(())
    }
}

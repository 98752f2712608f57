use crate::harvest::formats::filesystem::FilesystemKind;
use crate::model::ExtractionTask;
use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;

/// Per-file failures. These never cross the task boundary: the scheduler
/// turns them into failed [`TaskResult`](crate::model::TaskResult)s.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Unrecognized filesystem format: {}", path.display())]
    UnrecognizedFormat { path: PathBuf },

    #[error("Invalid APEX container (expected exactly one of apex_payload.img, original_apex): {}", path.display())]
    InvalidApexContainer { path: PathBuf },

    #[error("Unsupported APEX container {}: {reason}", path.display())]
    UnsupportedApexContainer { path: PathBuf, reason: String },

    #[error("No extraction tool for {kind} image: {}", path.display())]
    UnsupportedFilesystem { kind: FilesystemKind, path: PathBuf },

    #[error("Unsupported archive type: {}", path.display())]
    UnsupportedArchive { path: PathBuf },

    #[error("Extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("Conversion failed: {0}")]
    ConversionFailed(String),

    #[error("Tool '{tool}' timed out after {timeout_secs}s")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    #[error("Path traversal attempt rejected: '{attempted}'")]
    PathTraversal { attempted: String },

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Worker panicked: {0}")]
    Panicked(String),
}

/// The work performed for every task of one pipeline stage.
#[async_trait]
pub trait TaskWorker: Send + Sync + 'static {
    /// Data a successful task hands back to the stage (e.g. extracted member names).
    type Output: Send + 'static;

    /// Stage name used in logs and summaries (e.g. "extract-archives").
    fn stage_name(&self) -> &'static str;

    /// Processes a single task. Must not touch paths owned by sibling tasks.
    async fn run(&self, task: ExtractionTask) -> Result<Self::Output, TaskError>;
}

//! Harvest module - firmware archive to class archive pipeline.
//!
//! This module provides the pieces the pipeline is assembled from:
//! - **Formats**: filesystem sniffing, APEX unwrapping, zip member extraction
//! - **Tools**: bounded adapters for `dex2jar`, `fsck.erofs` and `debugfs`
//! - **Stages**: one [`TaskWorker`](crate::traits::TaskWorker) per pipeline stage
//! - **Chunked**: parallel chunk writing with a deterministic merge
//! - **Pipeline**: the orchestrator via [`pipeline::HarvestPipeline`]

pub mod chunked;
pub mod formats;
pub mod pipeline;
pub mod stages;
pub mod tools;

#[cfg(test)]
pub(crate) mod testutil;

pub use chunked::{ChunkedArchiveWriter, MergeSummary};
pub use formats::{
    ApexContainerType, ApexPayloadExtractor, ArchiveExtractor, FilesystemKind, FormatSniffer,
};
pub use pipeline::{
    HarvestPipeline, PipelineError, PipelineOutcome, PipelineReport, ShutdownHandle, Stage,
};
pub use tools::{DexToJarConverter, FilesystemImageExtractor, ResolvedTools, Tool};

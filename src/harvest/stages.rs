//! Per-stage task workers and the directory walks that feed them.

use crate::harvest::formats::apex::ApexPayloadExtractor;
use crate::harvest::formats::archive::{suffix, ArchiveExtractor};
use crate::harvest::tools::{DexToJarConverter, FilesystemImageExtractor};
use crate::model::{staging_name, ArchiveKind, ExtractionTask, SourceArchive};
use crate::traits::{TaskError, TaskWorker};
use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Directory the payload filesystem is dumped into, next to the payload image.
pub const PAYLOAD_DUMP_DIR: &str = "payload";

// ============================================================================
// Discovery
// ============================================================================

/// Lazily walks `roots` for recognized firmware archives.
///
/// Entries are yielded in file-name order within each directory, so two walks
/// over an unchanged tree agree. Roots that do not exist are skipped.
pub fn discover<'a>(
    roots: &'a [PathBuf],
    source_root: &'a Path,
) -> impl Iterator<Item = SourceArchive> + 'a {
    roots
        .iter()
        .filter(|root| root.is_dir())
        .flat_map(|root| sorted_files(root))
        .filter_map(move |path| SourceArchive::new(path, source_root))
}

/// Files below `dir` whose extension matches `extension`, in walk order.
pub fn files_with_extension<'a>(
    dir: &Path,
    extension: &'a str,
) -> impl Iterator<Item = PathBuf> + 'a {
    sorted_files(dir).filter(move |path| {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case(extension))
            .unwrap_or(false)
    })
}

fn sorted_files(dir: &Path) -> impl Iterator<Item = PathBuf> {
    WalkDir::new(dir)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Skipping unreadable path: {}", e);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .map(walkdir::DirEntry::into_path)
}

async fn blocking<T, F>(f: F) -> Result<T, TaskError>
where
    F: FnOnce() -> Result<T, TaskError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| TaskError::Panicked(format!("Task join error: {}", e)))?
}

// ============================================================================
// Stage: extract archives
// ============================================================================

/// Unpacks one discovered source file into its staging directory.
///
/// Jars and apks give up their `.dex` members, bare `.dex` files are copied
/// and APEX containers yield their payload image.
#[derive(Debug, Clone, Default)]
pub struct ArchiveStageWorker;

#[async_trait]
impl TaskWorker for ArchiveStageWorker {
    /// Number of files written to the staging directory
    type Output = usize;

    fn stage_name(&self) -> &'static str {
        "extract-archives"
    }

    async fn run(&self, task: ExtractionTask) -> Result<usize, TaskError> {
        blocking(move || {
            let kind = ArchiveKind::from_path(&task.source).ok_or_else(|| {
                TaskError::UnsupportedArchive {
                    path: task.source.clone(),
                }
            })?;

            match kind {
                ArchiveKind::Jar | ArchiveKind::Apk => {
                    ArchiveExtractor::extract_members(&task.source, &task.destination, suffix(".dex"))
                        .map(|members| members.len())
                }
                ArchiveKind::Dex => {
                    let name = task.source.file_name().ok_or_else(|| {
                        TaskError::UnsupportedArchive {
                            path: task.source.clone(),
                        }
                    })?;
                    fs::create_dir_all(&task.destination)?;
                    fs::copy(&task.source, task.destination.join(name))?;
                    Ok(1)
                }
                ArchiveKind::Apex | ArchiveKind::Capex => {
                    ApexPayloadExtractor::extract_payload(&task.source, &task.destination)
                        .map(|_| 1)
                }
            }
        })
        .await
    }
}

// ============================================================================
// Stage: convert APEX payloads
// ============================================================================

/// Dumps one payload image and recovers the dex code of the jars and apks
/// found inside it.
#[derive(Debug, Clone)]
pub struct ApexPayloadWorker {
    extractor: FilesystemImageExtractor,
    dex_staging: PathBuf,
}

impl ApexPayloadWorker {
    pub fn new(extractor: FilesystemImageExtractor, dex_staging: impl Into<PathBuf>) -> Self {
        Self {
            extractor,
            dex_staging: dex_staging.into(),
        }
    }
}

#[async_trait]
impl TaskWorker for ApexPayloadWorker {
    /// Number of dex files recovered from the dumped tree
    type Output = usize;

    fn stage_name(&self) -> &'static str {
        "convert-apex-payloads"
    }

    async fn run(&self, task: ExtractionTask) -> Result<usize, TaskError> {
        self.extractor.extract(&task.source, &task.destination).await?;

        let apex_name = task
            .source
            .parent()
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let dex_staging = self.dex_staging.clone();
        let dump_dir = task.destination;

        blocking(move || Ok(recover_payload_dex(&dump_dir, &apex_name, &dex_staging))).await
    }
}

/// Extracts `.dex` members of every jar/apk under `dump_dir`; bad zips are
/// skipped with a warning.
fn recover_payload_dex(dump_dir: &Path, apex_name: &str, dex_staging: &Path) -> usize {
    let mut recovered = 0;
    let containers = files_with_extension(dump_dir, "jar").chain(files_with_extension(dump_dir, "apk"));

    for container in containers {
        let relative = container.strip_prefix(dump_dir).unwrap_or(&container);
        let dest = dex_staging.join(format!("{}_{}", apex_name, staging_name(relative)));
        match ArchiveExtractor::extract_members(&container, &dest, suffix(".dex")) {
            Ok(members) => recovered += members.len(),
            Err(e) => warn!(archive = %container.display(), "Skipping payload archive: {}", e),
        }
    }

    debug!(apex = apex_name, dex = recovered, "Recovered payload dex files");
    recovered
}

// ============================================================================
// Stage: dex to jar
// ============================================================================

#[derive(Debug, Clone)]
pub struct DexToJarWorker {
    converter: DexToJarConverter,
}

impl DexToJarWorker {
    pub fn new(converter: DexToJarConverter) -> Self {
        Self { converter }
    }
}

#[async_trait]
impl TaskWorker for DexToJarWorker {
    type Output = ();

    fn stage_name(&self) -> &'static str {
        "convert-dex-to-jar"
    }

    async fn run(&self, task: ExtractionTask) -> Result<(), TaskError> {
        self.converter.convert(&task.source, &task.destination).await
    }
}

// ============================================================================
// Stage: extract classes
// ============================================================================

/// Extracts the `.class` members of one jar into its private directory.
#[derive(Debug, Clone, Default)]
pub struct ClassExtractionWorker;

#[async_trait]
impl TaskWorker for ClassExtractionWorker {
    /// Class member names in archive order
    type Output = Vec<String>;

    fn stage_name(&self) -> &'static str {
        "extract-classes"
    }

    async fn run(&self, task: ExtractionTask) -> Result<Vec<String>, TaskError> {
        blocking(move || {
            ArchiveExtractor::extract_members(&task.source, &task.destination, suffix(".class"))
        })
        .await
    }
}

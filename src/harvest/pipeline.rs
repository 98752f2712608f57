//! Firmware harvest pipeline.
//!
//! [`HarvestPipeline`] drives the linear stage sequence
//! `Validate → Discover → ExtractArchives → ConvertApexPayloads →
//! ConvertDexToJar → ExtractClasses → ChunkAndMerge → (Clean)`:
//! - Each stage after discovery is one [`TaskScheduler`] batch; the next
//!   stage starts only once the batch has drained
//! - File-level failures are collected per stage and never abort the run
//! - Preconditions are checked before anything is written
//! - `Ctrl-C` (or [`ShutdownHandle::trigger`]) interrupts the current batch

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::HarvestConfig;
use crate::executor::{BatchReport, SchedulerError, StageSummary, TaskScheduler};
use crate::harvest::chunked::{ChunkedArchiveWriter, MergeSummary};
use crate::harvest::formats::apex::PAYLOAD_ENTRY;
use crate::harvest::stages::{
    discover, files_with_extension, ApexPayloadWorker, ArchiveStageWorker, ClassExtractionWorker,
    DexToJarWorker, PAYLOAD_DUMP_DIR,
};
use crate::harvest::tools::{
    resolve_tool, DexToJarConverter, FilesystemImageExtractor, ResolvedTools, Tool,
};
use crate::model::{
    staging_name, ArchiveEntry, ClassArchiveIndex, ExtractionTask, OutputLayout, SourceArchive,
};
use crate::traits::TaskWorker;

// ============================================================================
// Pipeline Types
// ============================================================================

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validate,
    Discover,
    ExtractArchives,
    ConvertApexPayloads,
    ConvertDexToJar,
    ExtractClasses,
    ChunkAndMerge,
    Clean,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Stage::Validate => "validate",
            Stage::Discover => "discover",
            Stage::ExtractArchives => "extract-archives",
            Stage::ConvertApexPayloads => "convert-apex-payloads",
            Stage::ConvertDexToJar => "convert-dex-to-jar",
            Stage::ExtractClasses => "extract-classes",
            Stage::ChunkAndMerge => "chunk-and-merge",
            Stage::Clean => "clean",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a finished run went.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineOutcome {
    Complete,
    /// The archive was produced from whatever succeeded
    CompletedWithFailures,
}

/// Summary of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    /// Source files found during discovery
    pub discovered: usize,

    /// One entry per scheduled stage, in execution order
    pub stages: Vec<StageSummary>,

    pub merge: MergeSummary,

    /// Final consolidated class archive
    pub archive: PathBuf,

    /// Side-car jar → classes index
    pub class_index: PathBuf,

    /// Whether the staging directories were removed
    pub cleaned: bool,

    pub total_duration_ms: u64,
}

impl PipelineReport {
    pub fn failure_count(&self) -> usize {
        self.stages.iter().map(|s| s.failures.len()).sum()
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageSummary> {
        self.stages.iter().find(|s| s.stage == stage.name())
    }

    pub fn outcome(&self) -> PipelineOutcome {
        if self.failure_count() == 0 {
            PipelineOutcome::Complete
        } else {
            PipelineOutcome::CompletedWithFailures
        }
    }
}

// ============================================================================
// Pipeline Errors
// ============================================================================

/// Fatal conditions; each aborts the run.
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    /// Missing source directory or unresolvable tool; nothing was written
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// A chunk worker finished without producing its archive
    #[error("{missing} of {total} chunk archive(s) missing, final archive not written")]
    ChunkWriteIncomplete { missing: usize, total: usize },

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to write class index: {0}")]
    Json(#[from] serde_json::Error),
}

// ============================================================================
// Pipeline Executor
// ============================================================================

/// Requests an interrupt of a running pipeline.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

/// Firmware-to-class-archive pipeline.
///
/// # Example
///
/// ```ignore
/// use framework_harvester::{HarvestConfig, HarvestPipeline, Oem};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = HarvestConfig::new("firmware", "out")
///         .with_oem(Oem::Google)
///         .with_cleanup(true);
///
///     let report = HarvestPipeline::new(config).run().await?;
///     println!("{} classes in {}", report.merge.entries_written, report.archive.display());
///     Ok(())
/// }
/// ```
pub struct HarvestPipeline {
    config: HarvestConfig,
    shutdown: Arc<watch::Sender<bool>>,
}

impl HarvestPipeline {
    pub fn new(config: HarvestConfig) -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            config,
            shutdown: Arc::new(tx),
        }
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown),
        }
    }

    /// Checks the source directory and resolves every required tool.
    ///
    /// Touches nothing on disk.
    pub fn validate(&self) -> Result<ResolvedTools, PipelineError> {
        let source = &self.config.source_dir;
        if !source.is_dir() {
            return Err(PipelineError::PreconditionFailed(format!(
                "source directory does not exist or is not a directory: {}",
                source.display()
            )));
        }

        let found = Tool::REQUIRED.map(|tool| {
            let configured = self.config.tools.path(tool);
            (tool, configured, resolve_tool(tool, configured))
        });

        match found {
            [(_, _, Some(dex2jar)), (_, _, Some(fsck_erofs)), (_, _, Some(debugfs))] => {
                Ok(ResolvedTools {
                    dex2jar,
                    fsck_erofs,
                    debugfs,
                })
            }
            found => {
                let missing: Vec<String> = found
                    .iter()
                    .filter(|(_, _, path)| path.is_none())
                    .map(|(tool, configured, _)| match configured {
                        Some(path) => format!("{} ({})", tool, path.display()),
                        None => tool.to_string(),
                    })
                    .collect();
                Err(PipelineError::PreconditionFailed(format!(
                    "required tool(s) not found: {}",
                    missing.join(", ")
                )))
            }
        }
    }

    /// Runs every stage and returns the run report.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] if:
    /// - Validation fails (before anything is written)
    /// - The run is interrupted
    /// - The chunked merge cannot complete (no final archive is left)
    pub async fn run(&self) -> Result<PipelineReport, PipelineError> {
        let started = Instant::now();

        info!(stage = %Stage::Validate, source = %self.config.source_dir.display(), "Checking preconditions");
        let tools = self.validate()?;
        debug!(?tools, "Resolved external tools");

        let interrupt = self.listen_for_interrupt();
        let result = self.run_stages(&tools, started).await;
        interrupt.abort();

        match &result {
            Ok(report) => info!(
                outcome = ?report.outcome(),
                failures = report.failure_count(),
                entries = report.merge.entries_written,
                duration_ms = report.total_duration_ms,
                "Pipeline finished"
            ),
            Err(e) => warn!("Pipeline aborted: {}", e),
        }
        result
    }

    async fn run_stages(
        &self,
        tools: &ResolvedTools,
        started: Instant,
    ) -> Result<PipelineReport, PipelineError> {
        let config = &self.config;
        let layout = OutputLayout::new(&config.output_dir);
        layout.reset()?;

        let workers = config.workers();
        let scheduler = TaskScheduler::new(workers).with_shutdown(self.shutdown.subscribe());
        let mut stages = Vec::new();

        // ====================================================================
        // Discover
        // ====================================================================

        self.ensure_running(Stage::Discover)?;
        let roots = config.search_roots();
        let sources: Vec<_> = discover(&roots, &config.source_dir).collect();
        info!(stage = %Stage::Discover, files = sources.len(), roots = roots.len(), "Discovered source files");

        // ====================================================================
        // Extract archives
        // ====================================================================

        self.ensure_running(Stage::ExtractArchives)?;
        let staging_dirs = staging_dirs(&sources, &layout);
        let tasks = sources
            .iter()
            .zip(&staging_dirs)
            .map(|(source, staging)| ExtractionTask::new(&source.path, staging))
            .collect();
        run_batch(&scheduler, ArchiveStageWorker, tasks, &mut stages).await?;

        // ====================================================================
        // Convert APEX payloads
        // ====================================================================

        self.ensure_running(Stage::ConvertApexPayloads)?;
        let tasks = sources
            .iter()
            .zip(&staging_dirs)
            .filter(|(source, _)| source.kind.is_apex())
            .map(|(_, dir)| dir)
            .filter(|dir| dir.join(PAYLOAD_ENTRY).is_file())
            .map(|dir| ExtractionTask::new(dir.join(PAYLOAD_ENTRY), dir.join(PAYLOAD_DUMP_DIR)))
            .collect();
        let worker = ApexPayloadWorker::new(
            FilesystemImageExtractor::new(tools, config.tool_timeout()),
            &layout.dex_staging,
        );
        run_batch(&scheduler, worker, tasks, &mut stages).await?;

        // ====================================================================
        // Convert dex to jar
        // ====================================================================

        self.ensure_running(Stage::ConvertDexToJar)?;
        let tasks = files_with_extension(&layout.dex_staging, "dex")
            .map(|dex| {
                let jar = DexToJarConverter::output_path(&dex, &layout.jar_staging);
                ExtractionTask::new(dex, jar)
            })
            .collect();
        let worker = DexToJarWorker::new(DexToJarConverter::new(
            &tools.dex2jar,
            config.tool_timeout(),
        ));
        run_batch(&scheduler, worker, tasks, &mut stages).await?;

        // ====================================================================
        // Extract classes
        // ====================================================================

        self.ensure_running(Stage::ExtractClasses)?;
        let mut class_dirs = BTreeMap::new();
        let mut tasks = Vec::new();
        let jars = files_with_extension(&layout.jar_staging, "jar")
            .chain(files_with_extension(&layout.apex_staging, "jar"));
        for jar in jars {
            let relative = jar.strip_prefix(&layout.root).unwrap_or(&jar).to_path_buf();
            let class_dir = layout.class_staging.join(staging_name(&relative));
            class_dirs.insert(jar.display().to_string(), (archive_name(&relative), class_dir.clone()));
            tasks.push(ExtractionTask::new(jar, class_dir));
        }
        let batch = run_batch(&scheduler, ClassExtractionWorker, tasks, &mut stages).await?;

        let mut index = ClassArchiveIndex::new();
        let mut extracted = BTreeMap::new();
        for (task_id, classes) in batch.outputs {
            if let Some((key, class_dir)) = class_dirs.remove(&task_id) {
                index.insert(key.clone(), classes);
                extracted.insert(key, class_dir);
            }
        }
        write_index(&index, &layout.index_path())?;
        info!(
            jars = index.len(),
            classes = index.class_count(),
            index = %layout.index_path().display(),
            "Wrote class index"
        );

        // ====================================================================
        // Chunk and merge
        // ====================================================================

        self.ensure_running(Stage::ChunkAndMerge)?;
        let entries = collect_class_entries(extracted.values());
        let merge = ChunkedArchiveWriter::new(&layout.root)
            .with_manifest(config.write_manifest)
            .write_and_merge(entries, &layout.archive_path(), workers)
            .await?;

        // ====================================================================
        // Clean
        // ====================================================================

        let cleaned = config.clean;
        if cleaned {
            info!(stage = %Stage::Clean, "Removing staging directories");
            for dir in layout.staging_dirs() {
                if let Err(e) = fs::remove_dir_all(dir) {
                    warn!(path = %dir.display(), "Failed to remove staging directory: {}", e);
                }
            }
        }

        Ok(PipelineReport {
            discovered: sources.len(),
            stages,
            merge,
            archive: layout.archive_path(),
            class_index: layout.index_path(),
            cleaned,
            total_duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    fn ensure_running(&self, stage: Stage) -> Result<(), PipelineError> {
        if *self.shutdown.borrow() {
            return Err(SchedulerError::Interrupted {
                stage: stage.to_string(),
                pending: 0,
            }
            .into());
        }
        info!(stage = %stage, "Starting stage");
        Ok(())
    }

    fn listen_for_interrupt(&self) -> JoinHandle<()> {
        let handle = self.shutdown_handle();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Ctrl-C received, stopping");
                handle.trigger();
            }
        })
    }
}

async fn run_batch<W: TaskWorker>(
    scheduler: &TaskScheduler,
    worker: W,
    tasks: Vec<ExtractionTask>,
    summaries: &mut Vec<StageSummary>,
) -> Result<BatchReport<W::Output>, PipelineError> {
    let report = scheduler.run(Arc::new(worker), tasks).await?;
    summaries.push(report.summary());
    Ok(report)
}

/// Staging directory per source, in discovery order.
///
/// APEX containers land under `apex_tmp`, everything else under `dex_tmp`.
/// Distinct sources whose staging names still meet get a `-2`, `-3`, ...
/// suffix so none overwrites another.
fn staging_dirs(sources: &[SourceArchive], layout: &OutputLayout) -> Vec<PathBuf> {
    let mut taken = HashSet::new();
    sources
        .iter()
        .map(|source| {
            let parent = if source.kind.is_apex() {
                &layout.apex_staging
            } else {
                &layout.dex_staging
            };
            let name = source.staging_name();
            let mut dir = parent.join(&name);
            let mut n = 2;
            while !taken.insert(dir.clone()) {
                dir = parent.join(format!("{}-{}", name, n));
                n += 1;
            }
            dir
        })
        .collect()
}

/// `/`-joined form of a relative path, as stored in archives and the index.
fn archive_name(relative: &Path) -> String {
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Every `.class` file under the given per-jar directories, named by its path
/// inside the directory. The first jar providing a name wins.
fn collect_class_entries<'a, I>(class_dirs: I) -> Vec<ArchiveEntry>
where
    I: IntoIterator<Item = &'a PathBuf>,
{
    let mut seen = HashSet::new();
    let mut entries = Vec::new();
    for dir in class_dirs {
        for path in files_with_extension(dir, "class") {
            let name = archive_name(path.strip_prefix(dir).unwrap_or(&path));
            if seen.insert(name.clone()) {
                entries.push(ArchiveEntry::new(path, name));
            } else {
                debug!(class = %name, jar_dir = %dir.display(), "Duplicate class skipped");
            }
        }
    }
    entries
}

fn write_index(index: &ClassArchiveIndex, path: &Path) -> Result<(), PipelineError> {
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, index)?;
    writer.flush()?;
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

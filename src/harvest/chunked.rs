//! Parallel chunked archive writing with a deterministic merge.
//!
//! Entries are split into contiguous chunks, each chunk is compressed into
//! its own temporary archive on a blocking worker, and the temporaries are
//! then copied raw (no recompression) into the final archive in chunk order.

use crate::harvest::pipeline::PipelineError;
use crate::model::ArchiveEntry;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipArchive, ZipWriter};

const MANIFEST_NAME: &str = "META-INF/MANIFEST.MF";
const MANIFEST_BODY: &str = "Manifest-Version: 1.0\r\nCreated-By: framework-harvester\r\n\r\n";

/// Counts reported after a successful merge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeSummary {
    pub entries_written: usize,
    /// Files that could not be read while writing their chunk
    pub entries_skipped: usize,
    pub chunks: usize,
}

struct ChunkOutput {
    archive: TempPath,
    written: usize,
    skipped: usize,
}

#[derive(Debug, Clone)]
pub struct ChunkedArchiveWriter {
    temp_dir: PathBuf,
    compression: CompressionMethod,
    write_manifest: bool,
}

impl ChunkedArchiveWriter {
    /// Temporary chunk archives are created inside `temp_dir`.
    pub fn new(temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            temp_dir: temp_dir.into(),
            compression: CompressionMethod::Deflated,
            write_manifest: false,
        }
    }

    /// Prepends a `META-INF/MANIFEST.MF` to the merged archive.
    pub fn with_manifest(mut self, write_manifest: bool) -> Self {
        self.write_manifest = write_manifest;
        self
    }

    /// Splits `entries` into at most `worker_count` contiguous chunks, writes
    /// each chunk concurrently, then merges them into `final_path`.
    ///
    /// # Errors
    ///
    /// [`PipelineError::ChunkWriteIncomplete`] when any chunk archive is
    /// missing after the workers finish; merge I/O and zip errors otherwise.
    /// On error no final archive is left behind.
    pub async fn write_and_merge(
        &self,
        entries: Vec<ArchiveEntry>,
        final_path: &Path,
        worker_count: usize,
    ) -> Result<MergeSummary, PipelineError> {
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent)?;
        }

        if entries.is_empty() {
            warn!(archive = %final_path.display(), "No entries to archive, writing empty archive");
            let mut writer = ZipWriter::new(BufWriter::new(File::create(final_path)?));
            if self.write_manifest {
                self.add_manifest(&mut writer)?;
            }
            writer.finish()?.flush()?;
            return Ok(MergeSummary::default());
        }

        let chunks = partition(entries, worker_count);
        let chunk_count = chunks.len();
        info!(
            chunks = chunk_count,
            archive = %final_path.display(),
            "Writing chunk archives"
        );

        let mut join_set = JoinSet::new();
        for (index, chunk) in chunks.into_iter().enumerate() {
            let temp_dir = self.temp_dir.clone();
            let compression = self.compression;
            join_set.spawn_blocking(move || {
                (index, write_chunk(index, chunk, &temp_dir, compression))
            });
        }

        let mut outputs: Vec<Option<ChunkOutput>> = (0..chunk_count).map(|_| None).collect();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, Ok(output))) => outputs[index] = Some(output),
                Ok((index, Err(e))) => warn!(chunk = index, "Chunk archive not written: {}", e),
                Err(e) => warn!("Chunk worker crashed: {}", e),
            }
        }

        // Dropping the remaining TempPaths on the error path removes them.
        let written: Vec<ChunkOutput> = outputs.into_iter().flatten().collect();
        let missing = chunk_count - written.iter().filter(|c| c.archive.exists()).count();
        if missing > 0 {
            return Err(PipelineError::ChunkWriteIncomplete {
                missing,
                total: chunk_count,
            });
        }

        let merged = self.merge(&written, final_path);
        cleanup(written.iter().map(|c| &c.archive).collect());

        match merged {
            Ok(entries_written) => {
                let summary = MergeSummary {
                    entries_written,
                    entries_skipped: written.iter().map(|c| c.skipped).sum(),
                    chunks: chunk_count,
                };
                debug_assert_eq!(
                    summary.entries_written,
                    written.iter().map(|c| c.written).sum::<usize>()
                );
                info!(
                    entries = summary.entries_written,
                    skipped = summary.entries_skipped,
                    archive = %final_path.display(),
                    "Created merged archive"
                );
                Ok(summary)
            }
            Err(e) => {
                if let Err(remove) = fs::remove_file(final_path) {
                    if remove.kind() != io::ErrorKind::NotFound {
                        warn!(archive = %final_path.display(), "Failed to remove incomplete archive: {}", remove);
                    }
                }
                Err(e)
            }
        }
    }

    /// Raw-copies every entry of the chunk archives, in chunk order.
    fn merge(&self, chunks: &[ChunkOutput], final_path: &Path) -> Result<usize, PipelineError> {
        let mut writer = ZipWriter::new(BufWriter::new(File::create(final_path)?));
        if self.write_manifest {
            self.add_manifest(&mut writer)?;
        }

        let mut merged = 0;
        for chunk in chunks {
            let mut archive = ZipArchive::new(BufReader::new(File::open(&chunk.archive)?))?;
            for index in 0..archive.len() {
                let entry = archive.by_index_raw(index)?;
                debug!(entry = entry.name(), "Merging entry");
                writer.raw_copy_file(entry)?;
                merged += 1;
            }
        }
        writer.finish()?.flush()?;
        Ok(merged)
    }

    fn add_manifest<W: Write + io::Seek>(&self, writer: &mut ZipWriter<W>) -> Result<(), PipelineError> {
        writer.start_file(MANIFEST_NAME, entry_options(self.compression))?;
        writer.write_all(MANIFEST_BODY.as_bytes())?;
        Ok(())
    }
}

/// Contiguous chunks of `ceil(len / worker_count)` entries; the last may be
/// smaller and no chunk is empty.
fn partition<T>(entries: Vec<T>, worker_count: usize) -> Vec<Vec<T>> {
    let chunk_size = entries.len().div_ceil(worker_count.max(1)).max(1);
    let mut chunks = Vec::with_capacity(entries.len().div_ceil(chunk_size));
    let mut iter = entries.into_iter().peekable();
    while iter.peek().is_some() {
        chunks.push(iter.by_ref().take(chunk_size).collect());
    }
    chunks
}

fn entry_options(compression: CompressionMethod) -> SimpleFileOptions {
    // Fixed timestamps keep the archive reproducible.
    SimpleFileOptions::default()
        .compression_method(compression)
        .last_modified_time(DateTime::default())
}

/// Writes one chunk into a fresh temporary archive owned by this worker.
fn write_chunk(
    index: usize,
    chunk: Vec<ArchiveEntry>,
    temp_dir: &Path,
    compression: CompressionMethod,
) -> io::Result<ChunkOutput> {
    let temp = tempfile::Builder::new()
        .prefix(&format!("chunk-{index:04}-"))
        .suffix(".jar.tmp")
        .tempfile_in(temp_dir)?;

    let options = entry_options(compression);
    let mut writer = ZipWriter::new(temp);
    let (mut written, mut skipped) = (0, 0);

    for entry in chunk {
        match add_file(&mut writer, &entry, options) {
            Ok(()) => written += 1,
            Err(e) => {
                warn!(file = %entry.path.display(), chunk = index, "Skipping file: {}", e);
                skipped += 1;
            }
        }
    }

    let temp = writer.finish().map_err(io::Error::other)?;
    Ok(ChunkOutput {
        archive: temp.into_temp_path(),
        written,
        skipped,
    })
}

fn add_file<W: Write + io::Seek>(
    writer: &mut ZipWriter<W>,
    entry: &ArchiveEntry,
    options: SimpleFileOptions,
) -> io::Result<()> {
    // Open first so an unreadable file never leaves a dangling entry header.
    let mut source = File::open(&entry.path)?;
    writer
        .start_file(entry.name.as_str(), options)
        .map_err(io::Error::other)?;
    if let Err(e) = io::copy(&mut source, writer) {
        // Drop the half-written entry so a skipped file leaves no trace.
        writer.abort_file().map_err(io::Error::other)?;
        return Err(e);
    }
    Ok(())
}

fn cleanup(archives: Vec<&TempPath>) {
    for archive in archives {
        if let Err(e) = fs::remove_file(archive) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %archive.display(), "Failed to delete temporary archive: {}", e);
            }
        } else {
            debug!(path = %archive.display(), "Deleted temporary archive");
        }
    }
}

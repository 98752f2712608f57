//! framework-harvester - consolidate Android framework bytecode
//!
//! Walks a firmware dump, unpacks jars, apks, dex files and APEX payloads,
//! converts dex code to jars and merges every class into one archive.

use anyhow::{Context, Result};
use clap::Parser;
use framework_harvester::{HarvestConfig, HarvestPipeline, Oem, PipelineOutcome};
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

/// Consolidate the Java classes of an Android firmware dump into one jar
#[derive(Parser, Debug)]
#[command(name = "framework-harvester")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON configuration file; flags below override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding the collected firmware files
    #[arg(short, long)]
    source: Option<PathBuf>,

    /// Output root for staging directories and the final archive
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Vendor preset selecting the partitions to search
    #[arg(long)]
    oem: Option<Oem>,

    /// Sub-directory of the source to search (repeatable, overrides --oem)
    #[arg(long = "search-dir")]
    search_dirs: Vec<PathBuf>,

    /// Worker pool size per stage (default: available parallelism)
    #[arg(short = 'j', long)]
    workers: Option<usize>,

    /// Bounded wait for each external tool invocation, in seconds
    #[arg(long)]
    tool_timeout: Option<u64>,

    /// Path to the dex2jar converter
    #[arg(long, env = "DEX2JAR")]
    dex2jar: Option<PathBuf>,

    /// Path to fsck.erofs
    #[arg(long, env = "FSCK_EROFS")]
    fsck_erofs: Option<PathBuf>,

    /// Path to debugfs
    #[arg(long, env = "DEBUGFS")]
    debugfs: Option<PathBuf>,

    /// Remove staging directories after the merge
    #[arg(long)]
    clean: bool,

    /// Prepend META-INF/MANIFEST.MF to the final archive
    #[arg(long)]
    manifest: bool,

    /// Write the run report as JSON to this file
    #[arg(long)]
    report: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn into_config(self) -> Result<(HarvestConfig, Option<PathBuf>)> {
        let mut config = match &self.config {
            Some(path) => HarvestConfig::from_json_file(path)?,
            None => HarvestConfig::default(),
        };

        if let Some(source) = self.source {
            config.source_dir = source;
        }
        if let Some(output) = self.output {
            config.output_dir = output;
        }
        if let Some(oem) = self.oem {
            config = config.with_oem(oem);
        }
        if !self.search_dirs.is_empty() {
            config = config.with_search_dirs(self.search_dirs);
        }
        if let Some(workers) = self.workers {
            config = config.with_workers(workers);
        }
        if let Some(secs) = self.tool_timeout {
            config = config.with_tool_timeout(Duration::from_secs(secs));
        }
        if self.dex2jar.is_some() {
            config.tools.dex2jar = self.dex2jar;
        }
        if self.fsck_erofs.is_some() {
            config.tools.fsck_erofs = self.fsck_erofs;
        }
        if self.debugfs.is_some() {
            config.tools.debugfs = self.debugfs;
        }
        if self.clean {
            config = config.with_cleanup(true);
        }
        if self.manifest {
            config = config.with_manifest(true);
        }

        Ok((config, self.report))
    }
}

/// `RUST_LOG` when set and non-empty, otherwise the level picked by `-v`.
fn log_directives(verbose: u8, rust_log: Option<String>) -> String {
    if let Some(directives) = rust_log.filter(|d| !d.trim().is_empty()) {
        return directives;
    }
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    level.as_str().to_ascii_lowercase()
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_directives(
            cli.verbose,
            std::env::var(EnvFilter::DEFAULT_ENV).ok(),
        )))
        .with_target(false)
        .init();

    match run(cli).await {
        Ok(PipelineOutcome::Complete) => ExitCode::SUCCESS,
        Ok(PipelineOutcome::CompletedWithFailures) => ExitCode::from(2),
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<PipelineOutcome> {
    let (config, report_path) = cli.into_config()?;
    info!(
        source = %config.source_dir.display(),
        output = %config.output_dir.display(),
        "Starting harvest"
    );

    let report = HarvestPipeline::new(config)
        .run()
        .await
        .context("Harvest aborted")?;

    if let Some(path) = report_path {
        let file = File::create(&path)
            .with_context(|| format!("Failed to create report {}", path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), &report)
            .with_context(|| format!("Failed to write report {}", path.display()))?;
    }

    println!(
        "{} classes written to {} ({} file-level failure(s))",
        report.merge.entries_written,
        report.archive.display(),
        report.failure_count()
    );
    for stage in &report.stages {
        for failure in &stage.failures {
            println!("  [{}] {}", stage.stage, failure);
        }
    }

    Ok(report.outcome())
}

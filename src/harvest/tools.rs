//! Adapters around the external binaries the pipeline drives:
//! `dex2jar`, `fsck.erofs` and `debugfs`.
//!
//! Every invocation runs with a bounded wait; an expired wait kills the
//! child and fails only the task that issued it.

use crate::harvest::formats::filesystem::{DumpTool, FilesystemKind, FormatSniffer};
use crate::traits::TaskError;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

/// External tools required before any work is scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    Dex2Jar,
    FsckErofs,
    Debugfs,
}

impl Tool {
    pub const REQUIRED: [Tool; 3] = [Tool::Dex2Jar, Tool::FsckErofs, Tool::Debugfs];

    /// Executable name searched on `PATH` when nothing is configured.
    pub fn default_name(self) -> &'static str {
        match self {
            Tool::Dex2Jar => "d2j-dex2jar",
            Tool::FsckErofs => "fsck.erofs",
            Tool::Debugfs => "debugfs",
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.default_name())
    }
}

/// Finds `tool`: the configured path if it is a file, else the configured
/// file name on `PATH`, else the default name on `PATH`.
pub fn resolve_tool(tool: Tool, configured: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = configured {
        if path.is_file() {
            return Some(path.to_path_buf());
        }
        if let Some(found) = path.file_name().and_then(|name| find_on_path(Path::new(name))) {
            return Some(found);
        }
    }
    find_on_path(Path::new(tool.default_name()))
}

fn find_on_path(name: &Path) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Absolute locations of every required tool, produced by validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTools {
    pub dex2jar: PathBuf,
    pub fsck_erofs: PathBuf,
    pub debugfs: PathBuf,
}

/// Runs one external program with a bounded wait.
#[derive(Debug, Clone)]
pub struct ToolRunner {
    program: PathBuf,
    timeout: Duration,
}

impl ToolRunner {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    /// Runs the program to completion.
    ///
    /// `on_failure` wraps the diagnostic for launch failures and nonzero
    /// exits; an expired wait is reported as [`TaskError::ToolTimeout`].
    pub async fn run<I, S>(
        &self,
        args: I,
        on_failure: fn(String) -> TaskError,
    ) -> Result<(), TaskError>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let args: Vec<OsString> = args.into_iter().map(Into::into).collect();
        let tool = self.program.display().to_string();
        debug!(tool = %tool, ?args, "Invoking external tool");

        let mut command = Command::new(&self.program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = timeout(self.timeout, command.output())
            .await
            .map_err(|_| TaskError::ToolTimeout {
                tool: tool.clone(),
                timeout_secs: self.timeout.as_secs(),
            })?
            .map_err(|e| on_failure(format!("failed to launch {}: {}", tool, e)))?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let captured = [stderr.trim(), stdout.trim()]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n");

        Err(on_failure(format!(
            "{} exited with {}: {}",
            tool,
            output.status,
            if captured.is_empty() { "no output" } else { captured.as_str() }
        )))
    }
}

/// Dumps a filesystem image with the tool matching its detected kind.
#[derive(Debug, Clone)]
pub struct FilesystemImageExtractor {
    erofs: ToolRunner,
    debugfs: ToolRunner,
}

impl FilesystemImageExtractor {
    pub fn new(tools: &ResolvedTools, tool_timeout: Duration) -> Self {
        Self {
            erofs: ToolRunner::new(&tools.fsck_erofs, tool_timeout),
            debugfs: ToolRunner::new(&tools.debugfs, tool_timeout),
        }
    }

    /// Recursively dumps every file of `image` into `dest_dir`.
    pub async fn extract(&self, image: &Path, dest_dir: &Path) -> Result<FilesystemKind, TaskError> {
        let kind = FormatSniffer::classify(image)?;
        let Some(tool) = kind.dump_tool() else {
            return Err(TaskError::UnsupportedFilesystem {
                kind,
                path: image.to_path_buf(),
            });
        };

        tokio::fs::create_dir_all(dest_dir).await?;

        match tool {
            DumpTool::Erofs => {
                let mut extract = OsString::from("--extract=");
                extract.push(dest_dir);
                self.erofs
                    .run(
                        [extract, "--overwrite".into(), image.into()],
                        TaskError::ExtractionFailed,
                    )
                    .await?
            }
            DumpTool::Debugfs => {
                let mut request = OsString::from("rdump ./ ");
                request.push(dest_dir);
                self.debugfs
                    .run(
                        [OsString::from("-R"), request, image.into()],
                        TaskError::ExtractionFailed,
                    )
                    .await?
            }
        }

        debug!(image = %image.display(), %kind, "Dumped filesystem image");
        Ok(kind)
    }
}

/// Converts `.dex` files into jars through the external converter.
#[derive(Debug, Clone)]
pub struct DexToJarConverter {
    runner: ToolRunner,
}

impl DexToJarConverter {
    pub fn new(program: impl Into<PathBuf>, tool_timeout: Duration) -> Self {
        Self {
            runner: ToolRunner::new(program, tool_timeout),
        }
    }

    /// Jar path for `dex_path`: `<parent dir name>_<stem>.jar` in `jar_dir`.
    ///
    /// The parent directory is the per-archive staging directory, so dex
    /// files sharing a base name across archives do not collide.
    pub fn output_path(dex_path: &Path, jar_dir: &Path) -> PathBuf {
        let parent = dex_path
            .parent()
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let stem = dex_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        jar_dir.join(format!("{}_{}.jar", parent, stem))
    }

    pub async fn convert(&self, dex_path: &Path, output_jar: &Path) -> Result<(), TaskError> {
        if let Some(parent) = output_jar.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.runner
            .run(
                [
                    dex_path.as_os_str().to_owned(),
                    "-f".into(),
                    "-o".into(),
                    output_jar.as_os_str().to_owned(),
                ],
                TaskError::ConversionFailed,
            )
            .await
    }
}

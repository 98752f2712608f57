//! Run configuration: source/output roots, tool locations, worker count and
//! vendor search presets.

use crate::harvest::tools::Tool;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default bounded wait for a single external tool invocation.
pub const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 300;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unknown OEM '{0}' (expected one of: vivo, oppo, xiaomi, honor, google)")]
    UnknownOem(String),
}

/// Vendor presets naming the partition directories worth searching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Oem {
    Vivo,
    Oppo,
    Xiaomi,
    Honor,
    Google,
}

impl Oem {
    pub const ALL: [Oem; 5] = [Oem::Vivo, Oem::Oppo, Oem::Xiaomi, Oem::Honor, Oem::Google];

    pub fn name(self) -> &'static str {
        match self {
            Oem::Vivo => "vivo",
            Oem::Oppo => "oppo",
            Oem::Xiaomi => "xiaomi",
            Oem::Honor => "honor",
            Oem::Google => "google",
        }
    }

    /// Directories, relative to the source root, that hold framework code.
    pub fn search_dirs(self) -> &'static [&'static str] {
        match self {
            Oem::Vivo | Oem::Honor | Oem::Google | Oem::Xiaomi => &[
                "system/framework",
                "system/apex",
                "vendor/framework",
                "system_ext/framework",
            ],
            Oem::Oppo => &["system/framework", "system/apex", "system_ext/framework"],
        }
    }
}

impl fmt::Display for Oem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Oem {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|oem| oem.name() == wanted)
            .ok_or_else(|| ConfigError::UnknownOem(s.to_string()))
    }
}

/// Explicit tool locations; `None` falls back to a `PATH` lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    pub dex2jar: Option<PathBuf>,
    pub fsck_erofs: Option<PathBuf>,
    pub debugfs: Option<PathBuf>,
}

impl ToolPaths {
    pub fn path(&self, tool: Tool) -> Option<&Path> {
        match tool {
            Tool::Dex2Jar => self.dex2jar.as_deref(),
            Tool::FsckErofs => self.fsck_erofs.as_deref(),
            Tool::Debugfs => self.debugfs.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    pub source_dir: PathBuf,
    pub output_dir: PathBuf,
    pub tools: ToolPaths,
    /// Pool size per stage; detected parallelism when unset
    pub max_workers: Option<usize>,
    pub tool_timeout_secs: u64,
    /// Remove the staging directories after a successful merge
    pub clean: bool,
    pub oem: Option<Oem>,
    /// Restricts discovery to these sub-directories of `source_dir`
    pub search_dirs: Vec<PathBuf>,
    pub write_manifest: bool,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            source_dir: PathBuf::from("source"),
            output_dir: PathBuf::from("out"),
            tools: ToolPaths::default(),
            max_workers: None,
            tool_timeout_secs: DEFAULT_TOOL_TIMEOUT_SECS,
            clean: false,
            oem: None,
            search_dirs: Vec::new(),
            write_manifest: false,
        }
    }
}

impl HarvestConfig {
    pub fn new(source_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            source_dir: source_dir.into(),
            output_dir: output_dir.into(),
            ..Self::default()
        }
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.max_workers = Some(workers.max(1));
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn with_cleanup(mut self, clean: bool) -> Self {
        self.clean = clean;
        self
    }

    pub fn with_oem(mut self, oem: Oem) -> Self {
        self.oem = Some(oem);
        self
    }

    pub fn with_search_dirs<I, P>(mut self, dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.search_dirs = dirs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_tools(mut self, tools: ToolPaths) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_manifest(mut self, write_manifest: bool) -> Self {
        self.write_manifest = write_manifest;
        self
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    pub fn workers(&self) -> usize {
        self.max_workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    /// Directories walked during discovery.
    ///
    /// Explicit `search_dirs` win over the OEM preset; with neither, the
    /// whole source directory is walked.
    pub fn search_roots(&self) -> Vec<PathBuf> {
        if !self.search_dirs.is_empty() {
            return self
                .search_dirs
                .iter()
                .map(|dir| self.source_dir.join(dir))
                .collect();
        }
        match self.oem {
            Some(oem) => oem
                .search_dirs()
                .iter()
                .map(|dir| self.source_dir.join(dir))
                .collect(),
            None => vec![self.source_dir.clone()],
        }
    }
}

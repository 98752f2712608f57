use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// Name of the consolidated class archive written under the output root.
pub const FINAL_ARCHIVE_NAME: &str = "framework-all.jar";

/// Name of the side-car index mapping intermediate jars to their classes.
pub const CLASS_INDEX_NAME: &str = "class_index.json";

/// Container kinds recognized during discovery, derived from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveKind {
    Jar,
    Apk,
    Apex,
    Capex,
    Dex,
}

impl ArchiveKind {
    pub const ALL: [ArchiveKind; 5] = [
        ArchiveKind::Jar,
        ArchiveKind::Apk,
        ArchiveKind::Apex,
        ArchiveKind::Capex,
        ArchiveKind::Dex,
    ];

    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        Self::ALL.into_iter().find(|kind| kind.extension() == ext)
    }

    pub fn extension(self) -> &'static str {
        match self {
            ArchiveKind::Jar => "jar",
            ArchiveKind::Apk => "apk",
            ArchiveKind::Apex => "apex",
            ArchiveKind::Capex => "capex",
            ArchiveKind::Dex => "dex",
        }
    }

    /// Whether the archive wraps a filesystem payload rather than dex code.
    pub fn is_apex(self) -> bool {
        matches!(self, ArchiveKind::Apex | ArchiveKind::Capex)
    }
}

impl fmt::Display for ArchiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// A firmware file found in the source directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceArchive {
    /// Absolute (or source-rooted) path of the file
    pub path: PathBuf,
    /// Path relative to the source directory
    pub relative: PathBuf,
    pub kind: ArchiveKind,
}

impl SourceArchive {
    /// Builds a source archive when `path` carries a recognized extension.
    pub fn new(path: PathBuf, source_root: &Path) -> Option<Self> {
        let kind = ArchiveKind::from_path(&path)?;
        let relative = path
            .strip_prefix(source_root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| path.file_name().map(PathBuf::from).unwrap_or_default());
        Some(Self {
            path,
            relative,
            kind,
        })
    }

    pub fn staging_name(&self) -> String {
        staging_name(&self.relative)
    }
}

/// Flattens a relative path into a single directory name.
///
/// Components are joined with `_` and the extension is kept, so
/// `system/framework/services.jar` becomes `system_framework_services.jar`
/// and never meets `system/framework/services.apk`.
pub fn staging_name(relative: &Path) -> String {
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("_")
}

/// One independently executable unit of stage work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionTask {
    pub source: PathBuf,
    pub destination: PathBuf,
}

impl ExtractionTask {
    pub fn new(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
        }
    }

    /// The task id reported in results: the source path.
    pub fn id(&self) -> String {
        self.source.display().to_string()
    }
}

/// Outcome of a single task, collected by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub success: bool,
    pub error: Option<String>,
}

impl TaskResult {
    pub fn succeeded(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            success: true,
            error: None,
        }
    }

    pub fn failed(task_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            success: false,
            error: Some(error.into()),
        }
    }
}

impl fmt::Display for TaskResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.success, &self.error) {
            (true, _) => write!(f, "{}", self.task_id),
            (false, Some(error)) => write!(f, "{}: {}", self.task_id, error),
            (false, None) => write!(f, "{}: Unknown error", self.task_id),
        }
    }
}

/// A file to be stored in the merged archive under `name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub path: PathBuf,
    /// Archive-relative name, always `/`-separated
    pub name: String,
}

impl ArchiveEntry {
    pub fn new(path: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
        }
    }
}

/// Intermediate jar -> the `.class` members it contributed.
///
/// Written next to the final archive for traceability only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClassArchiveIndex {
    jars: BTreeMap<String, Vec<String>>,
}

impl ClassArchiveIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, jar: impl Into<String>, classes: Vec<String>) {
        self.jars.entry(jar.into()).or_default().extend(classes);
    }

    pub fn get(&self, jar: &str) -> Option<&[String]> {
        self.jars.get(jar).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.jars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jars.is_empty()
    }

    pub fn class_count(&self) -> usize {
        self.jars.values().map(Vec::len).sum()
    }
}

/// Fixed working layout beneath the configured output root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLayout {
    pub root: PathBuf,
    pub dex_staging: PathBuf,
    pub jar_staging: PathBuf,
    pub apex_staging: PathBuf,
    pub class_staging: PathBuf,
}

impl OutputLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            dex_staging: root.join("dex_tmp"),
            jar_staging: root.join("jar_tmp"),
            apex_staging: root.join("apex_tmp"),
            class_staging: root.join("class_tmp"),
            root,
        }
    }

    pub fn archive_path(&self) -> PathBuf {
        self.root.join(FINAL_ARCHIVE_NAME)
    }

    pub fn index_path(&self) -> PathBuf {
        self.root.join(CLASS_INDEX_NAME)
    }

    pub fn staging_dirs(&self) -> [&Path; 4] {
        [
            &self.dex_staging,
            &self.jar_staging,
            &self.apex_staging,
            &self.class_staging,
        ]
    }

    /// Clears what an earlier run left behind (staging directories, final
    /// archive and index), then recreates the empty layout.
    pub fn reset(&self) -> std::io::Result<()> {
        for dir in self.staging_dirs() {
            match std::fs::remove_dir_all(dir) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e),
                _ => {}
            }
        }
        for file in [self.archive_path(), self.index_path()] {
            match std::fs::remove_file(&file) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e),
                _ => {}
            }
        }
        self.create()
    }

    pub fn create(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        for dir in self.staging_dirs() {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archive_kind_from_extension() {
        assert_eq!(
            ArchiveKind::from_path(Path::new("a/b/services.JAR")),
            Some(ArchiveKind::Jar)
        );
        assert_eq!(
            ArchiveKind::from_path(Path::new("com.android.art.capex")),
            Some(ArchiveKind::Capex)
        );
        assert_eq!(ArchiveKind::from_path(Path::new("boot.art")), None);
        assert_eq!(ArchiveKind::from_path(Path::new("Makefile")), None);
        assert!(ArchiveKind::Capex.is_apex());
        assert!(!ArchiveKind::Dex.is_apex());
    }

    #[test]
    fn test_staging_name_flattens_relative_path() {
        assert_eq!(
            staging_name(Path::new("system/framework/services.jar")),
            "system_framework_services.jar"
        );
        assert_eq!(
            staging_name(Path::new("system/apex/com.android.art.apex")),
            "system_apex_com.android.art.apex"
        );
        assert_eq!(staging_name(Path::new("classes.dex")), "classes.dex");
    }

    #[test]
    fn test_staging_name_keeps_kinds_apart() {
        let jar = staging_name(Path::new("system/framework/x.jar"));
        let apk = staging_name(Path::new("system/framework/x.apk"));
        let apex = staging_name(Path::new("system/apex/x.apex"));
        let capex = staging_name(Path::new("system/apex/x.capex"));
        assert_ne!(jar, apk);
        assert_ne!(apex, capex);
    }

    #[test]
    fn test_source_archive_relative_path() {
        let root = Path::new("/data/source");
        let archive =
            SourceArchive::new(root.join("system/framework/framework.jar"), root).unwrap();
        assert_eq!(archive.kind, ArchiveKind::Jar);
        assert_eq!(archive.relative, Path::new("system/framework/framework.jar"));
        assert_eq!(archive.staging_name(), "system_framework_framework.jar");
        assert!(SourceArchive::new(root.join("build.prop"), root).is_none());
    }

    #[test]
    fn test_task_result_display() {
        assert_eq!(TaskResult::succeeded("a.jar").to_string(), "a.jar");
        assert_eq!(
            TaskResult::failed("b.jar", "bad zip").to_string(),
            "b.jar: bad zip"
        );
        let unknown = TaskResult {
            task_id: "c.jar".into(),
            success: false,
            error: None,
        };
        assert_eq!(unknown.to_string(), "c.jar: Unknown error");
    }

    #[test]
    fn test_class_index_serializes_as_map() {
        let mut index = ClassArchiveIndex::new();
        index.insert("jar_tmp/a.jar", vec!["a/A.class".to_string()]);
        index.insert("jar_tmp/a.jar", vec!["a/B.class".to_string()]);
        index.insert("apex_tmp/x/b.jar", vec![]);

        assert_eq!(index.len(), 2);
        assert_eq!(index.class_count(), 2);

        let json = serde_json::to_value(&index).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "apex_tmp/x/b.jar": [],
                "jar_tmp/a.jar": ["a/A.class", "a/B.class"],
            })
        );
    }

    #[test]
    fn test_output_layout_paths() {
        let layout = OutputLayout::new("/out");
        assert_eq!(layout.dex_staging, Path::new("/out/dex_tmp"));
        assert_eq!(layout.class_staging, Path::new("/out/class_tmp"));
        assert_eq!(layout.archive_path(), Path::new("/out/framework-all.jar"));
        assert_eq!(layout.index_path(), Path::new("/out/class_index.json"));
    }

    #[test]
    fn test_output_layout_reset_clears_previous_run() {
        let dir = tempfile::TempDir::new().unwrap();
        let layout = OutputLayout::new(dir.path().join("out"));
        layout.create().unwrap();
        std::fs::write(layout.dex_staging.join("stale.dex"), b"old").unwrap();
        std::fs::write(layout.archive_path(), b"old").unwrap();
        std::fs::write(layout.index_path(), b"{}").unwrap();
        std::fs::write(layout.root.join("keep.txt"), b"user file").unwrap();

        layout.reset().unwrap();

        for staging in layout.staging_dirs() {
            assert!(staging.is_dir());
            assert_eq!(std::fs::read_dir(staging).unwrap().count(), 0);
        }
        assert!(!layout.archive_path().exists());
        assert!(!layout.index_path().exists());
        assert!(layout.root.join("keep.txt").exists());
    }
}

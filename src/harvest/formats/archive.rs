//! Zip-format member extraction (`.jar`, `.apk`, converted jars).

use crate::traits::TaskError;
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use tracing::debug;
use zip::ZipArchive;

/// Case-insensitive member-name suffix predicate, e.g. `suffix(".dex")`.
pub fn suffix(suffix: &str) -> impl Fn(&str) -> bool {
    let wanted = suffix.to_ascii_lowercase();
    move |name: &str| name.to_ascii_lowercase().ends_with(&wanted)
}

pub struct ArchiveExtractor;

impl ArchiveExtractor {
    /// Extracts every member whose name satisfies `predicate` into
    /// `dest_dir`, keeping the member's path inside the archive.
    ///
    /// Returns the extracted member names in archive order.
    ///
    /// # Errors
    ///
    /// A corrupt or unreadable zip yields [`TaskError::Archive`]; a member
    /// that would land outside `dest_dir` yields [`TaskError::PathTraversal`].
    pub fn extract_members<P>(
        zip_path: &Path,
        dest_dir: &Path,
        predicate: P,
    ) -> Result<Vec<String>, TaskError>
    where
        P: Fn(&str) -> bool,
    {
        let mut archive = ZipArchive::new(BufReader::new(File::open(zip_path)?))?;
        let mut extracted = Vec::new();

        for index in 0..archive.len() {
            let mut member = archive.by_index(index)?;
            if member.is_dir() || !predicate(member.name()) {
                continue;
            }

            let name = member.name().to_owned();
            let relative = member
                .enclosed_name()
                .ok_or_else(|| TaskError::PathTraversal {
                    attempted: name.clone(),
                })?;
            let target = dest_dir.join(relative);

            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut out = File::create(&target)?;
            io::copy(&mut member, &mut out)?;

            extracted.push(name);
        }

        debug!(
            archive = %zip_path.display(),
            members = extracted.len(),
            "Extracted archive members"
        );
        Ok(extracted)
    }

    /// Extracts the single member `entry_name` to the file `target`.
    pub fn extract_entry_to(
        zip_path: &Path,
        entry_name: &str,
        target: &Path,
    ) -> Result<PathBuf, TaskError> {
        let mut archive = ZipArchive::new(BufReader::new(File::open(zip_path)?))?;
        let mut member = archive.by_name(entry_name)?;

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(target)?;
        io::copy(&mut member, &mut out)?;
        Ok(target.to_path_buf())
    }

    /// Member names of the archive, without decompressing anything.
    pub fn member_names(zip_path: &Path) -> Result<Vec<String>, TaskError> {
        let archive = ZipArchive::new(BufReader::new(File::open(zip_path)?))?;
        Ok(archive.file_names().map(str::to_owned).collect())
    }
}

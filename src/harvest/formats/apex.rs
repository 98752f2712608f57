//! APEX container handling: raw vs. compressed detection and payload
//! extraction.

use crate::harvest::formats::archive::ArchiveExtractor;
use crate::traits::TaskError;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Entry holding the filesystem image of an uncompressed APEX.
pub const PAYLOAD_ENTRY: &str = "apex_payload.img";

/// Entry holding the wrapped APEX of a compressed container.
pub const ORIGINAL_APEX_ENTRY: &str = "original_apex";

/// Name given to a decompressed inner APEX inside the destination directory.
pub const DECOMPRESSED_APEX_NAME: &str = "decompressed.apex";

/// How many compressed layers are unwrapped before giving up.
pub const MAX_DECOMPRESSION_DEPTH: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApexContainerType {
    /// Carries `apex_payload.img`
    Uncompressed,
    /// Carries a nested `original_apex`
    Compressed,
    /// Carries both markers or neither
    Invalid,
}

impl ApexContainerType {
    /// Classifies from the presence of the two marker entries.
    pub fn from_entry_names<'a, I>(names: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let (mut has_payload, mut has_original) = (false, false);
        for name in names {
            has_payload |= name == PAYLOAD_ENTRY;
            has_original |= name == ORIGINAL_APEX_ENTRY;
        }
        match (has_payload, has_original) {
            (true, false) => ApexContainerType::Uncompressed,
            (false, true) => ApexContainerType::Compressed,
            _ => ApexContainerType::Invalid,
        }
    }
}

pub struct ApexPayloadExtractor;

impl ApexPayloadExtractor {
    /// Inspects the zip directory only; nothing is decompressed.
    pub fn classify_container(apex_path: &Path) -> Result<ApexContainerType, TaskError> {
        let names = ArchiveExtractor::member_names(apex_path)?;
        Ok(ApexContainerType::from_entry_names(
            names.iter().map(String::as_str),
        ))
    }

    /// Writes the payload image of `apex_path` to `dest_dir/apex_payload.img`,
    /// unwrapping at most [`MAX_DECOMPRESSION_DEPTH`] compressed layers.
    ///
    /// # Errors
    ///
    /// - [`TaskError::InvalidApexContainer`] when the outer container is invalid
    /// - [`TaskError::UnsupportedApexContainer`] when a compressed container
    ///   wraps an invalid one, or wraps another compressed layer
    pub fn extract_payload(apex_path: &Path, dest_dir: &Path) -> Result<PathBuf, TaskError> {
        fs::create_dir_all(dest_dir)?;
        Self::extract_at_depth(apex_path, dest_dir, 0)
    }

    fn extract_at_depth(
        apex_path: &Path,
        dest_dir: &Path,
        depth: usize,
    ) -> Result<PathBuf, TaskError> {
        match Self::classify_container(apex_path)? {
            ApexContainerType::Uncompressed => {
                let payload = ArchiveExtractor::extract_entry_to(
                    apex_path,
                    PAYLOAD_ENTRY,
                    &dest_dir.join(PAYLOAD_ENTRY),
                )?;
                debug!(apex = %apex_path.display(), payload = %payload.display(), "Extracted APEX payload");
                Ok(payload)
            }
            ApexContainerType::Compressed => {
                if depth >= MAX_DECOMPRESSION_DEPTH {
                    return Err(TaskError::UnsupportedApexContainer {
                        path: apex_path.to_path_buf(),
                        reason: format!("more than {MAX_DECOMPRESSION_DEPTH} compressed layer(s)"),
                    });
                }

                let inner = ArchiveExtractor::extract_entry_to(
                    apex_path,
                    ORIGINAL_APEX_ENTRY,
                    &dest_dir.join(DECOMPRESSED_APEX_NAME),
                )?;
                let result = match Self::classify_container(&inner) {
                    Ok(ApexContainerType::Invalid) => Err(TaskError::UnsupportedApexContainer {
                        path: apex_path.to_path_buf(),
                        reason: "nested original_apex is not a valid APEX".to_string(),
                    }),
                    Ok(_) => Self::extract_at_depth(&inner, dest_dir, depth + 1),
                    Err(e) => Err(e),
                };

                if let Err(e) = fs::remove_file(&inner) {
                    warn!(path = %inner.display(), "Failed to remove decompressed APEX: {}", e);
                }
                result
            }
            ApexContainerType::Invalid => Err(TaskError::InvalidApexContainer {
                path: apex_path.to_path_buf(),
            }),
        }
    }
}

//! Filesystem image classification by fixed-offset magic bytes.

use crate::traits::TaskError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

/// Superblocks of every supported filesystem start 1 KiB into the image.
const SUPERBLOCK_OFFSET: u64 = 1024;

/// Filesystems an APEX payload image may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilesystemKind {
    F2fs,
    Ext4,
    Erofs,
    Ext2,
}

/// External dump tool able to unpack a filesystem kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpTool {
    /// `fsck.erofs --extract`
    Erofs,
    /// `debugfs -R rdump`
    Debugfs,
}

impl FilesystemKind {
    pub fn name(self) -> &'static str {
        match self {
            FilesystemKind::F2fs => "f2fs",
            FilesystemKind::Ext4 => "ext4",
            FilesystemKind::Erofs => "erofs",
            FilesystemKind::Ext2 => "ext2",
        }
    }

    /// Tool used to dump an image of this kind; `None` when the pipeline
    /// has no extractor for it.
    pub fn dump_tool(self) -> Option<DumpTool> {
        match self {
            FilesystemKind::Erofs => Some(DumpTool::Erofs),
            FilesystemKind::Ext4 | FilesystemKind::Ext2 => Some(DumpTool::Debugfs),
            FilesystemKind::F2fs => None,
        }
    }
}

impl fmt::Display for FilesystemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A `(kind, offset, magic)` row of the signature table.
#[derive(Debug, Clone, Copy)]
pub struct Signature {
    pub kind: FilesystemKind,
    pub offset: u64,
    pub magic: &'static [u8],
}

/// Signature table, checked in order; the first match wins.
///
/// ext4 and ext2 share the same superblock magic, so ext2 is only reported
/// if the ext4 row is ever removed. Keep the order: tool selection depends
/// on it.
pub const SIGNATURES: [Signature; 4] = [
    Signature {
        kind: FilesystemKind::F2fs,
        offset: SUPERBLOCK_OFFSET,
        magic: &[0x10, 0x20, 0xF5, 0xF2],
    },
    Signature {
        kind: FilesystemKind::Ext4,
        offset: SUPERBLOCK_OFFSET + 0x38,
        magic: &[0x53, 0xEF],
    },
    Signature {
        kind: FilesystemKind::Erofs,
        offset: SUPERBLOCK_OFFSET,
        magic: &[0xE2, 0xE1, 0xF5, 0xE0],
    },
    Signature {
        kind: FilesystemKind::Ext2,
        offset: SUPERBLOCK_OFFSET + 0x38,
        magic: &[0x53, 0xEF],
    },
];

pub struct FormatSniffer;

impl FormatSniffer {
    /// Classifies the image at `path`.
    ///
    /// # Errors
    ///
    /// [`TaskError::UnrecognizedFormat`] when no signature matches,
    /// [`TaskError::Io`] when the file cannot be opened or read.
    pub fn classify(path: &Path) -> Result<FilesystemKind, TaskError> {
        let mut file = File::open(path)?;
        Self::classify_reader(&mut file)?.ok_or_else(|| TaskError::UnrecognizedFormat {
            path: path.to_path_buf(),
        })
    }

    /// Probes `reader` against [`SIGNATURES`]. A signature lying past the
    /// end of the data simply does not match.
    pub fn classify_reader<R: Read + Seek>(reader: &mut R) -> io::Result<Option<FilesystemKind>> {
        let mut buf = [0u8; 8];
        for signature in &SIGNATURES {
            let window = &mut buf[..signature.magic.len()];
            reader.seek(SeekFrom::Start(signature.offset))?;
            match reader.read_exact(window) {
                Ok(()) if *window == *signature.magic => return Ok(Some(signature.kind)),
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {}
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn image_with(offset: u64, magic: &[u8]) -> Vec<u8> {
        let mut data = vec![0u8; 4096];
        let start = offset as usize;
        data[start..start + magic.len()].copy_from_slice(magic);
        data
    }

    #[test]
    fn test_each_signature_is_detected() {
        let cases = [
            (FilesystemKind::F2fs, 1024, &[0x10, 0x20, 0xF5, 0xF2][..]),
            (FilesystemKind::Erofs, 1024, &[0xE2, 0xE1, 0xF5, 0xE0][..]),
            (FilesystemKind::Ext4, 1024 + 0x38, &[0x53, 0xEF][..]),
        ];
        for (kind, offset, magic) in cases {
            let mut cursor = Cursor::new(image_with(offset, magic));
            assert_eq!(
                FormatSniffer::classify_reader(&mut cursor).unwrap(),
                Some(kind)
            );
        }
    }

    #[test]
    fn test_ext2_magic_resolves_to_first_listed_kind() {
        // Same bytes as ext4: table order decides.
        let mut cursor = Cursor::new(image_with(1024 + 0x38, &[0x53, 0xEF]));
        assert_eq!(
            FormatSniffer::classify_reader(&mut cursor).unwrap(),
            Some(FilesystemKind::Ext4)
        );
    }

    #[test]
    fn test_all_zero_image_is_unrecognized() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("zeros.img");
        std::fs::write(&path, vec![0u8; 8192]).unwrap();

        let err = FormatSniffer::classify(&path).unwrap_err();
        assert!(matches!(err, TaskError::UnrecognizedFormat { .. }));
    }

    #[test]
    fn test_short_file_is_unrecognized() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tiny.img");
        std::fs::write(&path, b"tiny").unwrap();

        let err = FormatSniffer::classify(&path).unwrap_err();
        assert!(matches!(err, TaskError::UnrecognizedFormat { .. }));
    }

    #[test]
    fn test_classify_missing_file_is_io_error() {
        let err = FormatSniffer::classify(Path::new("/nonexistent/payload.img")).unwrap_err();
        assert!(matches!(err, TaskError::Io(_)));
    }

    #[test]
    fn test_dump_tool_mapping() {
        assert_eq!(FilesystemKind::Erofs.dump_tool(), Some(DumpTool::Erofs));
        assert_eq!(FilesystemKind::Ext4.dump_tool(), Some(DumpTool::Debugfs));
        assert_eq!(FilesystemKind::Ext2.dump_tool(), Some(DumpTool::Debugfs));
        assert_eq!(FilesystemKind::F2fs.dump_tool(), None);
        assert_eq!(FilesystemKind::Erofs.to_string(), "erofs");
    }
}
